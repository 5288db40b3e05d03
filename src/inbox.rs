//! Conversation list module
//!
//! This module builds a user's conversation list (last-message preview and
//! unread count per conversation) and keeps it current by re-deriving the
//! whole list whenever a message involving the user changes.

use crate::{
    Error, Result,
    messaging::ChatSession,
    presence::{PresenceHub, PresenceTracker},
    storage::{ConversationKey, Message, Profile, Role},
    store::{ChangeFilter, ChatContext, LinkState, Subscription, bounded, resubscribe},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One row in the conversation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Booking or inquiry conversation
    pub conversation: ConversationKey,
    /// Counterpart's profile id
    pub counterpart_profile_id: String,
    /// Counterpart's display name
    pub counterpart_name: String,
    /// Whether new messages are allowed
    pub send_allowed: bool,
    /// Most recent message, for the preview line
    pub last_message: Option<Message>,
    /// Messages addressed to the user that are still unread
    pub unread: usize,
}

/// The whole conversation list
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InboxSnapshot {
    /// Conversations, most recently active first
    pub conversations: Vec<ConversationSummary>,
}

impl InboxSnapshot {
    /// Sum of unread counts across conversations
    pub fn total_unread(&self) -> usize {
        self.conversations.iter().map(|c| c.unread).sum()
    }

    /// Look up a conversation's row
    pub fn get(&self, conversation: &ConversationKey) -> Option<&ConversationSummary> {
        self.conversations.iter().find(|c| &c.conversation == conversation)
    }
}

struct Candidate {
    conversation: ConversationKey,
    counterpart_account_id: String,
    send_allowed: bool,
}

struct InboxShared {
    ctx: ChatContext,
    role: Role,
    profile: Profile,
    snapshot: Mutex<InboxSnapshot>,
    revision: watch::Sender<u64>,
    link: watch::Sender<LinkState>,
}

impl InboxShared {
    async fn candidates(&self) -> Result<Vec<Candidate>> {
        let ctx = &self.ctx;
        let limit = ctx.settings.store_timeout();
        let account_id = ctx.auth.account_id.as_str();
        let mut candidates = Vec::new();

        match self.role {
            Role::Provider => {
                let provider = bounded(limit, "provider lookup", ctx.directory.provider_for_account(account_id))
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("provider for account {}", account_id)))?;

                let bookings = bounded(
                    limit,
                    "booking list",
                    ctx.directory
                        .bookings_for_provider(&provider.id, &ctx.settings.active_booking_statuses),
                )
                .await?;
                for booking in bookings {
                    candidates.push(Candidate {
                        send_allowed: !booking.status.is_read_only(),
                        conversation: ConversationKey::Booking(booking.id),
                        counterpart_account_id: booking.customer_account_id,
                    });
                }

                let inquiries = bounded(limit, "inquiry list", ctx.directory.inquiries_for_provider(&provider.id)).await?;
                for inquiry in inquiries.into_iter().filter(|i| !i.is_read_only()) {
                    candidates.push(Candidate {
                        conversation: ConversationKey::Inquiry(inquiry.id),
                        counterpart_account_id: inquiry.customer_account_id,
                        send_allowed: true,
                    });
                }
            }
            Role::Customer => {
                let bookings = bounded(
                    limit,
                    "booking list",
                    ctx.directory
                        .bookings_for_customer(account_id, &ctx.settings.active_booking_statuses),
                )
                .await?;
                for booking in bookings {
                    let Some(provider) = bounded(limit, "provider lookup", ctx.directory.provider(&booking.provider_id)).await? else {
                        warn!("Booking {} references missing provider {}", booking.id, booking.provider_id);
                        continue;
                    };
                    candidates.push(Candidate {
                        send_allowed: !booking.status.is_read_only(),
                        conversation: ConversationKey::Booking(booking.id),
                        counterpart_account_id: provider.owner_account_id,
                    });
                }

                let inquiries = bounded(limit, "inquiry list", ctx.directory.inquiries_for_customer(account_id)).await?;
                for inquiry in inquiries.into_iter().filter(|i| !i.is_read_only()) {
                    let Some(provider) = bounded(limit, "provider lookup", ctx.directory.provider(&inquiry.provider_id)).await? else {
                        warn!("Inquiry {} references missing provider {}", inquiry.id, inquiry.provider_id);
                        continue;
                    };
                    candidates.push(Candidate {
                        conversation: ConversationKey::Inquiry(inquiry.id),
                        counterpart_account_id: provider.owner_account_id,
                        send_allowed: true,
                    });
                }
            }
        }

        Ok(candidates)
    }

    /// Re-derive the whole list from the store
    async fn collect(&self) -> Result<InboxSnapshot> {
        let ctx = &self.ctx;
        let limit = ctx.settings.store_timeout();
        let me = self.profile.id.as_str();
        let mut conversations = Vec::new();

        for candidate in self.candidates().await? {
            let Some(counterpart) = bounded(
                limit,
                "profile lookup",
                ctx.directory.profile_for_account(&candidate.counterpart_account_id),
            )
            .await?
            else {
                warn!(
                    "Skipping {}: no profile for counterpart account {}",
                    candidate.conversation, candidate.counterpart_account_id
                );
                continue;
            };

            if ctx.settings.acknowledge_delivery {
                if let Err(e) = bounded(limit, "mark delivered", ctx.store.mark_delivered(&candidate.conversation, me)).await {
                    warn!("Delivery acknowledgement for {} failed: {}", candidate.conversation, e);
                }
            }

            let last_message = bounded(limit, "latest message", ctx.store.latest(&candidate.conversation)).await?;
            let unread = bounded(limit, "unread count", ctx.store.unread_count(&candidate.conversation, me)).await?;

            conversations.push(ConversationSummary {
                conversation: candidate.conversation,
                counterpart_profile_id: counterpart.id,
                counterpart_name: counterpart.display_name,
                send_allowed: candidate.send_allowed,
                last_message,
                unread,
            });
        }

        conversations.sort_by(|a, b| {
            let a_at = a.last_message.as_ref().map(|m| m.created_at);
            let b_at = b.last_message.as_ref().map(|m| m.created_at);
            b_at.cmp(&a_at)
                .then_with(|| a.conversation.to_string().cmp(&b.conversation.to_string()))
        });

        Ok(InboxSnapshot { conversations })
    }

    async fn refresh(&self) -> Result<InboxSnapshot> {
        let snapshot = self.collect().await?;
        *self.snapshot.lock().await = snapshot.clone();
        self.revision.send_modify(|revision| *revision += 1);
        debug!(
            "Inbox for {} refreshed: {} conversation(s), {} unread",
            self.profile.id,
            snapshot.conversations.len(),
            snapshot.total_unread()
        );
        Ok(snapshot)
    }
}

/// Live conversation list for the signed-in user
///
/// # Example
/// ```rust,no_run
/// use marketchat::inbox::Inbox;
/// use marketchat::presence::PresenceHub;
/// use marketchat::storage::{ChatSettings, Role, SqliteStore};
/// use marketchat::store::{AuthContext, ChatContext};
/// use std::sync::Arc;
///
/// # async fn example() -> marketchat::Result<()> {
/// let backend = Arc::new(SqliteStore::new("chat.db")?);
/// let ctx = ChatContext::with_backend(backend, AuthContext::new("acct_provider"), ChatSettings::default());
/// let hub = PresenceHub::new();
///
/// let inbox = Inbox::open(ctx, Role::Provider).await?;
/// let snapshot = inbox.snapshot().await;
/// println!("{} unread", snapshot.total_unread());
///
/// if let Some(first) = snapshot.conversations.first() {
///     let active = inbox.select(first.conversation.clone(), &hub).await?;
///     active.send("See you on Saturday").await?;
///     active.close();
/// }
/// # Ok(())
/// # }
/// ```
pub struct Inbox {
    shared: Arc<InboxShared>,
    listener: JoinHandle<()>,
}

impl Inbox {
    /// Build the list and subscribe to changes involving the user
    ///
    /// The subscription is filtered to messages the user sends or receives,
    /// so unrelated conversations don't trigger refreshes.
    pub async fn open(ctx: ChatContext, role: Role) -> Result<Self> {
        let limit = ctx.settings.store_timeout();
        let profile = bounded(limit, "profile lookup", ctx.directory.profile_for_account(&ctx.auth.account_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("profile for account {}", ctx.auth.account_id)))?;
        let subscription = bounded(
            limit,
            "subscribe",
            ctx.store.subscribe(ChangeFilter::Participant(profile.id.clone())),
        )
        .await?;

        let (revision, _) = watch::channel(0);
        let (link, _) = watch::channel(LinkState::Live);
        let shared = Arc::new(InboxShared {
            ctx,
            role,
            profile,
            snapshot: Mutex::new(InboxSnapshot::default()),
            revision,
            link,
        });
        let snapshot = shared.refresh().await?;
        info!(
            "Inbox opened for {} as {:?}: {} conversation(s)",
            shared.profile.id,
            role,
            snapshot.conversations.len()
        );

        let listener = tokio::spawn(listen(shared.clone(), subscription));
        Ok(Self { shared, listener })
    }

    /// Role the list was built for
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Current list
    pub async fn snapshot(&self) -> InboxSnapshot {
        self.shared.snapshot.lock().await.clone()
    }

    /// Re-derive the list now
    pub async fn refresh(&self) -> Result<InboxSnapshot> {
        self.shared.refresh().await
    }

    /// Revision counter bumped on every refresh
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Current live-feed health
    pub fn link_state(&self) -> LinkState {
        *self.shared.link.borrow()
    }

    /// Open a conversation from the list together with its presence channel
    pub async fn select(&self, conversation: ConversationKey, hub: &PresenceHub) -> Result<ActiveConversation> {
        let session = ChatSession::open(self.shared.ctx.clone(), conversation).await?;
        let presence = PresenceTracker::join(
            hub,
            session.conversation(),
            session.self_profile_id(),
            self.shared.ctx.settings.typing_timeout(),
        );
        Ok(ActiveConversation { session, presence })
    }

    /// Stop listening for changes
    pub fn close(self) {
        info!("Closing inbox for {}", self.shared.profile.id);
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// A selected conversation: its session plus its presence channel
///
/// Dropping it releases both.
pub struct ActiveConversation {
    /// Message sync session
    pub session: ChatSession,
    /// Presence for the same conversation
    pub presence: PresenceTracker,
}

impl ActiveConversation {
    /// Record a composer keystroke
    pub async fn keystroke(&self) -> Result<()> {
        self.presence.keystroke().await
    }

    /// Send a message and clear the typing state
    pub async fn send(&self, text: &str) -> Result<String> {
        if let Err(e) = self.presence.stop_typing().await {
            debug!("Clearing typing state failed: {}", e);
        }
        self.session.send(text).await
    }

    /// Release the subscription and leave the presence channel
    pub fn close(self) {
        let Self { session, presence } = self;
        presence.leave();
        session.close();
    }
}

async fn listen(shared: Arc<InboxShared>, mut subscription: Subscription) {
    loop {
        match subscription.recv().await {
            Ok(Some(event)) => {
                debug!("Inbox change {:?} on {}", event.kind, event.message.conversation);
                if let Err(e) = shared.refresh().await {
                    warn!("Inbox refresh failed: {}", e);
                }
                continue;
            }
            Ok(None) => warn!("Inbox change feed closed"),
            Err(e) => warn!("Inbox change feed failed: {}", e),
        }

        let filter = subscription.filter().clone();
        drop(subscription);

        let settings = shared.ctx.settings.clone();
        match resubscribe(
            shared.ctx.store.as_ref(),
            &filter,
            &settings.reconnect,
            settings.store_timeout(),
            &shared.link,
        )
        .await
        {
            Some(reopened) => {
                subscription = reopened;
                if let Err(e) = shared.refresh().await {
                    warn!("Inbox refresh after reconnect failed: {}", e);
                }
            }
            None => return,
        }
    }
}
