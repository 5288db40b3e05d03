//! Presence and typing module
//!
//! This module handles ephemeral per-conversation presence:
//! - `PresenceHub` - in-process presence channel server (join, publish, leave)
//! - `PresenceMember` - one membership; dropping it leaves the channel
//! - `PresenceTracker` - what a conversation screen uses: announces the
//!   user, emits typing on keystrokes, and tracks peers with a typing timeout
//!
//! Nothing here touches the message store.

use crate::{Error, Result, storage::ConversationKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

const SIGNAL_CAPACITY: usize = 64;

/// A member's announced state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresenceState {
    /// Has the conversation open
    pub online: bool,
    /// Currently typing in the composer
    pub typing: bool,
}

impl PresenceState {
    /// Online, not typing
    pub fn online() -> Self {
        Self {
            online: true,
            typing: false,
        }
    }

    /// Online and typing
    pub fn typing() -> Self {
        Self {
            online: true,
            typing: true,
        }
    }
}

/// A change broadcast on a presence channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceSignal {
    /// Member joined or updated its state
    State {
        /// Member id (profile id)
        member_id: String,
        /// New state
        state: PresenceState,
    },
    /// Member left the channel
    Left {
        /// Member id (profile id)
        member_id: String,
    },
}

impl PresenceSignal {
    /// Member this signal is about
    pub fn member_id(&self) -> &str {
        match self {
            Self::State { member_id, .. } | Self::Left { member_id } => member_id,
        }
    }
}

/// One open view of a member; a profile may hold several
struct Join {
    member_id: String,
    state: PresenceState,
}

struct Channel {
    /// Keyed by join id
    joins: HashMap<String, Join>,
    signals: broadcast::Sender<PresenceSignal>,
}

impl Channel {
    /// Combined state of every join a member holds; `None` once all have left
    fn member_state(&self, member_id: &str) -> Option<PresenceState> {
        self.joins
            .values()
            .filter(|join| join.member_id == member_id)
            .map(|join| join.state)
            .reduce(|a, b| PresenceState {
                online: a.online || b.online,
                typing: a.typing || b.typing,
            })
    }

    fn roster(&self) -> HashMap<String, PresenceState> {
        let mut roster = HashMap::new();
        for join in self.joins.values() {
            if !roster.contains_key(&join.member_id) {
                if let Some(state) = self.member_state(&join.member_id) {
                    roster.insert(join.member_id.clone(), state);
                }
            }
        }
        roster
    }

    fn announce(&self, member_id: &str) {
        let signal = match self.member_state(member_id) {
            Some(state) => PresenceSignal::State {
                member_id: member_id.to_string(),
                state,
            },
            None => PresenceSignal::Left {
                member_id: member_id.to_string(),
            },
        };
        // No receivers is fine
        let _ = self.signals.send(signal);
    }
}

/// In-process presence channel server
///
/// Cloning shares the same channels.
#[derive(Clone, Default)]
pub struct PresenceHub {
    channels: Arc<StdMutex<HashMap<String, Channel>>>,
}

impl PresenceHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StdMutexGuard<'_, HashMap<String, Channel>> {
        // Presence is ephemeral; a poisoned map is still usable
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join a channel, announcing an initial state
    ///
    /// Each call is a separate membership: a member with the same id joined
    /// twice stays present until both memberships leave. The returned member
    /// first yields the current roster, then live signals from other members.
    pub fn join(&self, channel: &str, member_id: &str, state: PresenceState) -> PresenceMember {
        let mut channels = self.lock();
        let entry = channels.entry(channel.to_string()).or_insert_with(|| Channel {
            joins: HashMap::new(),
            signals: broadcast::channel(SIGNAL_CAPACITY).0,
        });

        let roster: VecDeque<PresenceSignal> = entry
            .roster()
            .into_iter()
            .filter(|(id, _)| id.as_str() != member_id)
            .map(|(member_id, state)| PresenceSignal::State { member_id, state })
            .collect();
        let known = roster.iter().map(|s| s.member_id().to_string()).collect();
        let signals = entry.signals.subscribe();
        let join_id = uuid::Uuid::new_v4().to_string();
        entry.joins.insert(
            join_id.clone(),
            Join {
                member_id: member_id.to_string(),
                state,
            },
        );
        entry.announce(member_id);
        debug!("{} joined {} ({} other member(s))", member_id, channel, roster.len());

        PresenceMember {
            handle: PresenceHandle {
                hub: self.clone(),
                channel: channel.to_string(),
                member_id: member_id.to_string(),
                join_id,
            },
            signals,
            backlog: roster,
            known,
        }
    }

    /// Current members of a channel and their combined states
    pub fn members(&self, channel: &str) -> HashMap<String, PresenceState> {
        self.lock()
            .get(channel)
            .map(Channel::roster)
            .unwrap_or_default()
    }

    fn publish(&self, channel: &str, join_id: &str, state: PresenceState) -> Result<()> {
        let mut channels = self.lock();
        let entry = channels
            .get_mut(channel)
            .ok_or_else(|| Error::Presence(format!("no channel {}", channel)))?;
        let join = entry
            .joins
            .get_mut(join_id)
            .ok_or_else(|| Error::Presence(format!("membership {} has left {}", join_id, channel)))?;
        join.state = state;
        let member_id = join.member_id.clone();
        entry.announce(&member_id);
        Ok(())
    }

    fn remove(&self, channel: &str, join_id: &str) {
        let mut channels = self.lock();
        let Some(entry) = channels.get_mut(channel) else {
            return;
        };
        let Some(join) = entry.joins.remove(join_id) else {
            return;
        };
        entry.announce(&join.member_id);
        debug!("{} left {}", join.member_id, channel);
        if entry.joins.is_empty() {
            channels.remove(channel);
        }
    }
}

/// Publishing side of a membership
#[derive(Clone)]
pub struct PresenceHandle {
    hub: PresenceHub,
    channel: String,
    member_id: String,
    join_id: String,
}

impl PresenceHandle {
    /// Announce a new state
    pub fn set_state(&self, state: PresenceState) -> Result<()> {
        self.hub.publish(&self.channel, &self.join_id, state)
    }

    /// Leave the channel; repeated calls are no-ops
    pub fn leave(&self) {
        self.hub.remove(&self.channel, &self.join_id);
    }

    /// Channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Member this membership belongs to
    pub fn member_id(&self) -> &str {
        &self.member_id
    }
}

/// One membership in a presence channel
///
/// Dropping the member leaves the channel.
pub struct PresenceMember {
    handle: PresenceHandle,
    signals: broadcast::Receiver<PresenceSignal>,
    backlog: VecDeque<PresenceSignal>,
    /// Other members reported present and not yet reported gone
    known: HashSet<String>,
}

impl PresenceMember {
    /// Publishing handle for this membership
    pub fn handle(&self) -> PresenceHandle {
        self.handle.clone()
    }

    /// Next signal about another member; `None` once the channel is gone
    ///
    /// After a lag the roster is re-read: members that left meanwhile are
    /// reported as `Left`, the rest with their current state.
    pub async fn recv(&mut self) -> Option<PresenceSignal> {
        loop {
            if let Some(signal) = self.backlog.pop_front() {
                self.observe(&signal);
                return Some(signal);
            }
            match self.signals.recv().await {
                Ok(signal) if signal.member_id() == self.handle.member_id => continue,
                Ok(signal) => {
                    self.observe(&signal);
                    return Some(signal);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Presence on {} lagged by {}; resyncing roster", self.handle.channel, missed);
                    self.resync();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn observe(&mut self, signal: &PresenceSignal) {
        match signal {
            PresenceSignal::State { member_id, .. } => {
                self.known.insert(member_id.clone());
            }
            PresenceSignal::Left { member_id } => {
                self.known.remove(member_id);
            }
        }
    }

    fn resync(&mut self) {
        let mut members = self.handle.hub.members(&self.handle.channel);
        members.remove(&self.handle.member_id);

        self.backlog.clear();
        let mut gone: Vec<String> = self
            .known
            .iter()
            .filter(|id| !members.contains_key(id.as_str()))
            .cloned()
            .collect();
        gone.sort();
        self.backlog
            .extend(gone.into_iter().map(|member_id| PresenceSignal::Left { member_id }));
        self.backlog.extend(
            members
                .into_iter()
                .map(|(member_id, state)| PresenceSignal::State { member_id, state }),
        );
    }
}

impl Drop for PresenceMember {
    fn drop(&mut self) {
        self.handle.leave();
    }
}

/// A peer as seen by the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Peer has the conversation open
    pub online: bool,
    /// Peer typed within the typing timeout
    pub typing: bool,
}

#[derive(Debug, Clone, Copy)]
struct PeerEntry {
    state: PresenceState,
    updated_at: Instant,
}

struct TrackerShared {
    handle: PresenceHandle,
    peers: Mutex<HashMap<String, PeerEntry>>,
    typing_timeout: Duration,
    /// Bumped per keystroke; an idle timer only fires if it still matches
    keystrokes: Mutex<(u64, bool)>,
    revision: watch::Sender<u64>,
}

impl TrackerShared {
    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

/// Presence for one open conversation screen
///
/// # Example
/// ```rust,no_run
/// use marketchat::presence::{PresenceHub, PresenceTracker};
/// use marketchat::storage::ConversationKey;
/// use std::time::Duration;
///
/// # async fn example() -> marketchat::Result<()> {
/// let hub = PresenceHub::new();
/// let key = ConversationKey::booking("booking_1");
/// let tracker = PresenceTracker::join(&hub, &key, "profile_me", Duration::from_secs(4));
///
/// tracker.keystroke().await?;
/// let peer = tracker.peer("profile_them").await;
/// println!("online: {}, typing: {}", peer.online, peer.typing);
///
/// tracker.leave();
/// # Ok(())
/// # }
/// ```
pub struct PresenceTracker {
    shared: Arc<TrackerShared>,
    relay: JoinHandle<()>,
}

impl PresenceTracker {
    /// Join the conversation's presence channel as online
    ///
    /// Must be called within a tokio runtime.
    pub fn join(
        hub: &PresenceHub,
        conversation: &ConversationKey,
        self_profile_id: &str,
        typing_timeout: Duration,
    ) -> Self {
        let member = hub.join(
            &conversation.presence_channel(),
            self_profile_id,
            PresenceState::online(),
        );
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(TrackerShared {
            handle: member.handle(),
            peers: Mutex::new(HashMap::new()),
            typing_timeout,
            keystrokes: Mutex::new((0, false)),
            revision,
        });
        info!("Presence joined {} as {}", conversation, self_profile_id);

        let relay = tokio::spawn(relay(shared.clone(), member));
        Self { shared, relay }
    }

    /// Record a composer keystroke
    ///
    /// Broadcasts `typing` and resets the idle timer; after the typing timeout
    /// without another keystroke the user goes back to idle.
    pub async fn keystroke(&self) -> Result<()> {
        let generation = {
            let mut keystrokes = self.shared.keystrokes.lock().await;
            keystrokes.0 += 1;
            keystrokes.1 = true;
            keystrokes.0
        };
        self.shared.handle.set_state(PresenceState::typing())?;

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.typing_timeout).await;
            let mut keystrokes = shared.keystrokes.lock().await;
            if keystrokes.0 == generation && keystrokes.1 {
                keystrokes.1 = false;
                // Channel may already be left
                let _ = shared.handle.set_state(PresenceState::online());
            }
        });
        Ok(())
    }

    /// Go back to idle immediately (e.g. after sending)
    pub async fn stop_typing(&self) -> Result<()> {
        let mut keystrokes = self.shared.keystrokes.lock().await;
        keystrokes.0 += 1;
        if keystrokes.1 {
            keystrokes.1 = false;
            self.shared.handle.set_state(PresenceState::online())?;
        }
        Ok(())
    }

    /// How a peer currently appears; unknown peers are offline
    ///
    /// A typing flag older than the typing timeout is treated as idle, so an
    /// abrupt disconnect can't leave the indicator stuck.
    pub async fn peer(&self, member_id: &str) -> PeerStatus {
        let peers = self.shared.peers.lock().await;
        peers
            .get(member_id)
            .map(|entry| PeerStatus {
                online: entry.state.online,
                typing: entry.state.online
                    && entry.state.typing
                    && entry.updated_at.elapsed() < self.shared.typing_timeout,
            })
            .unwrap_or_default()
    }

    /// Ids of peers currently online
    pub async fn online_peers(&self) -> Vec<String> {
        let peers = self.shared.peers.lock().await;
        let mut online: Vec<String> = peers
            .iter()
            .filter(|(_, entry)| entry.state.online)
            .map(|(id, _)| id.clone())
            .collect();
        online.sort();
        online
    }

    /// Revision counter bumped on every peer change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Leave the channel so peers see this user offline
    pub fn leave(self) {
        info!("Presence leaving {}", self.shared.handle.channel());
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.shared.handle.leave();
        self.relay.abort();
    }
}

async fn relay(shared: Arc<TrackerShared>, mut member: PresenceMember) {
    while let Some(signal) = member.recv().await {
        {
            let mut peers = shared.peers.lock().await;
            match signal {
                PresenceSignal::State { member_id, state } => {
                    peers.insert(
                        member_id,
                        PeerEntry {
                            state,
                            updated_at: Instant::now(),
                        },
                    );
                }
                PresenceSignal::Left { member_id } => {
                    peers.remove(&member_id);
                }
            }
        }
        shared.bump();
    }
}
