//! High-level messaging module
//!
//! This module provides [`ChatSession`], the single source of truth for one
//! open conversation. A session:
//! - loads a bounded page of history and pages backward on demand
//! - holds exactly one live change subscription, reconnecting with backoff
//!   and refetching once after every reconnect
//! - appends optimistic pending entries on send and reconciles them against
//!   confirmed rows
//! - marks incoming messages read in the background
//!
//! Dropping or closing the session releases its subscription.

use crate::{
    Error, Result,
    queue::{PendingMessage, PendingQueue, PendingStatus},
    resolver::{ConversationResolver, Permission},
    storage::{ConversationKey, DeliveryStatus, Message, NewMessage, SyncMode, validate_body},
    store::{
        ChangeEvent, ChangeFilter, ChangeKind, ChatContext, HistoryPage, LinkState, Subscription,
        bounded, resubscribe,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Whether the composer accepts input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComposerState {
    /// Sending is allowed
    Enabled,
    /// Conversation is read-only; render an explicit disabled composer
    Disabled {
        /// Human-readable reason, e.g. "booking is completed"
        reason: String,
    },
}

/// Snapshot of everything a conversation screen renders
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    /// Conversation shown
    pub conversation: ConversationKey,
    /// Current user's profile id
    pub self_profile_id: String,
    /// Confirmed messages, ascending by `created_at`
    pub messages: Vec<Message>,
    /// Outstanding optimistic sends, in send order
    pub pending: Vec<PendingMessage>,
    /// Composer enabled/disabled
    pub composer: ComposerState,
    /// Live-feed health
    pub link: LinkState,
    /// Whether older history can be loaded
    pub has_more_history: bool,
}

/// Visual status of a rendered bubble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BubbleStatus {
    /// Message from the counterpart
    Incoming,
    /// Pending, insert in flight (muted, clock)
    Sending,
    /// Stored (single check)
    Sent,
    /// Fetched by the receiver (double check)
    Delivered,
    /// Viewed by the receiver
    Read,
    /// Send failed (error styling, manual resend)
    Failed,
}

/// Identifies a bubble across re-renders
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BubbleId {
    /// Confirmed message id
    Confirmed(String),
    /// Pending local id
    Pending(String),
}

/// One rendered chat bubble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bubble {
    /// Stable identity
    pub id: BubbleId,
    /// Message text
    pub body: String,
    /// Sent by the current user
    pub mine: bool,
    /// Visual status
    pub status: BubbleStatus,
    /// Server timestamp; `None` while pending
    pub created_at: Option<DateTime<Utc>>,
    /// Status glyph
    pub indicator: String,
}

impl ConversationView {
    /// Flatten into bubbles: confirmed messages first, then pending entries in send order
    pub fn bubbles(&self) -> Vec<Bubble> {
        let confirmed = self.messages.iter().map(|m| {
            let mine = m.sender_id == self.self_profile_id;
            let status = if !mine {
                BubbleStatus::Incoming
            } else {
                match (m.delivery_status, m.read) {
                    (Some(DeliveryStatus::Read), _) | (None, true) => BubbleStatus::Read,
                    (Some(DeliveryStatus::Delivered), _) => BubbleStatus::Delivered,
                    _ => BubbleStatus::Sent,
                }
            };
            Bubble {
                id: BubbleId::Confirmed(m.id.clone()),
                body: m.body.clone(),
                mine,
                status,
                created_at: Some(m.created_at),
                indicator: if mine { m.status_indicator().to_string() } else { String::new() },
            }
        });

        let pending = self.pending.iter().map(|p| Bubble {
            id: BubbleId::Pending(p.local_id.clone()),
            body: p.body.clone(),
            mine: true,
            status: match p.status {
                PendingStatus::Sending => BubbleStatus::Sending,
                PendingStatus::Sent => BubbleStatus::Sent,
                PendingStatus::Failed => BubbleStatus::Failed,
            },
            created_at: None,
            indicator: p.status_indicator().to_string(),
        });

        confirmed.chain(pending).collect()
    }
}

struct SessionState {
    messages: Vec<Message>,
    pending: PendingQueue,
    permission: Permission,
    has_more_history: bool,
    /// Ids with a mark-read update in flight
    marking: HashSet<String>,
}

impl SessionState {
    /// Replace the newest part of the window with a refetched page
    ///
    /// Rows older than the page are kept; rows already read stay read.
    fn merge_window(&mut self, page: Vec<Message>) {
        let Some(cutoff) = page.first().map(|m| m.created_at) else {
            return;
        };

        let mut kept = Vec::with_capacity(self.messages.len() + page.len());
        let mut replaced = HashMap::new();
        for message in self.messages.drain(..) {
            if message.created_at < cutoff {
                kept.push(message);
            } else {
                replaced.insert(message.id.clone(), message);
            }
        }
        for message in page {
            match replaced.remove(&message.id) {
                Some(mut previous) => {
                    previous.merge_from(&message);
                    kept.push(previous);
                }
                None => kept.push(message),
            }
        }
        self.messages = kept;
    }

    /// Insert or update a single row, keeping ascending order
    ///
    /// Unknown rows older than the loaded window are left to `load_older`,
    /// otherwise the window would skip the rows between them.
    fn upsert(&mut self, message: Message) {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            existing.merge_from(&message);
            return;
        }
        if self.has_more_history
            && self
                .messages
                .first()
                .is_some_and(|first| message.created_at < first.created_at)
        {
            return;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
    }

    /// Prepend an older page, skipping rows already loaded
    fn prepend(&mut self, page: Vec<Message>) -> usize {
        let known: HashSet<&str> = self.messages.iter().map(|m| m.id.as_str()).collect();
        let older: Vec<Message> = page
            .into_iter()
            .filter(|m| !known.contains(m.id.as_str()))
            .collect();
        let added = older.len();
        self.messages.splice(0..0, older);
        added
    }
}

struct SessionShared {
    ctx: ChatContext,
    resolver: ConversationResolver,
    conversation: ConversationKey,
    self_profile_id: String,
    state: Mutex<SessionState>,
    revision: watch::Sender<u64>,
    link: watch::Sender<LinkState>,
}

impl SessionShared {
    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn page_size(&self) -> usize {
        self.ctx.settings.history_page_size.max(1)
    }

    async fn fetch(&self, page: HistoryPage) -> Result<Vec<Message>> {
        bounded(
            self.ctx.settings.store_timeout(),
            "history fetch",
            self.ctx.store.list(&self.conversation, page),
        )
        .await
    }

    /// Re-list the loaded window and reconcile pending entries by token
    async fn refresh(&self) -> Result<()> {
        let window = {
            let state = self.state.lock().await;
            state.messages.len().max(self.page_size())
        };
        let page = self.fetch(HistoryPage::latest(window)).await?;

        let mut state = self.state.lock().await;
        state.merge_window(page);
        let SessionState { messages, pending, .. } = &mut *state;
        let cleared = pending.reconcile_history(messages, &self.self_profile_id);
        if cleared > 0 {
            debug!("Refetch of {} cleared {} pending entr(ies)", self.conversation, cleared);
        }
        Ok(())
    }

    async fn apply(self: &Arc<Self>, event: ChangeEvent) {
        if event.kind == ChangeKind::Insert {
            let mut state = self.state.lock().await;
            state.pending.reconcile(&event.message, &self.self_profile_id);
        }

        match self.ctx.settings.sync_mode {
            SyncMode::Refetch => {
                if let Err(e) = self.refresh().await {
                    warn!(
                        "Refetch of {} failed, applying event row directly: {}",
                        self.conversation, e
                    );
                    self.state.lock().await.upsert(event.message);
                }
            }
            SyncMode::Incremental => {
                self.state.lock().await.upsert(event.message);
            }
        }

        self.bump();
        self.schedule_mark_read().await;
    }

    /// Fire-and-forget read update for unread messages addressed to the user
    async fn schedule_mark_read(self: &Arc<Self>) {
        let ids: Vec<String> = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let ids: Vec<String> = state
                .messages
                .iter()
                .filter(|m| m.is_unread_for(&self.self_profile_id) && !state.marking.contains(&m.id))
                .map(|m| m.id.clone())
                .collect();
            state.marking.extend(ids.iter().cloned());
            ids
        };
        if ids.is_empty() {
            return;
        }

        let shared = self.clone();
        tokio::spawn(async move {
            let result = bounded(
                shared.ctx.settings.store_timeout(),
                "mark read",
                shared.ctx.store.mark_read(&shared.conversation, &ids),
            )
            .await;

            let mut state = shared.state.lock().await;
            for id in &ids {
                state.marking.remove(id);
            }
            match result {
                Ok(changed) => {
                    for message in state.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
                        message.mark_read();
                    }
                    drop(state);
                    debug!(
                        "Marked {} of {} message(s) read in {}",
                        changed,
                        ids.len(),
                        shared.conversation
                    );
                    shared.bump();
                }
                Err(e) => {
                    warn!("Mark-read in {} failed: {}", shared.conversation, e);
                }
            }
        });
    }

    async fn fail(&self, local_id: &str, error: &Error) {
        self.state.lock().await.pending.mark_failed(local_id, error.to_string());
        self.bump();
        warn!("Send {} in {} failed: {}", local_id, self.conversation, error);
    }

    /// Body bound: the configured limit, never above what the store accepts
    fn max_body_chars(&self) -> usize {
        self.ctx.settings.max_body_chars.min(self.ctx.store.max_body_chars())
    }

    /// Resolve the receiver and insert
    async fn deliver(&self, local_id: &str, body: String) -> Result<()> {
        let limit = self.ctx.settings.store_timeout();

        let access = match bounded(limit, "receiver resolution", self.resolver.resolve(&self.conversation)).await {
            Ok(access) => access,
            Err(e) => {
                let error = match e {
                    Error::ReceiverNotFound(_) => e,
                    other => Error::ReceiverNotFound(other.to_string()),
                };
                self.fail(local_id, &error).await;
                return Err(error);
            }
        };

        if !access.send_allowed() {
            let reason = access
                .permission
                .read_only_reason
                .clone()
                .unwrap_or_else(|| "conversation is read-only".to_string());
            {
                let mut state = self.state.lock().await;
                state.pending.mark_failed(local_id, reason.clone());
                state.permission = access.permission;
            }
            self.bump();
            info!("Send into {} refused: {}", self.conversation, reason);
            return Err(Error::PermissionDenied(reason));
        }

        let message = NewMessage::new(
            self.conversation.clone(),
            access.sender_profile_id,
            access.receiver_profile_id,
            body,
            Some(local_id.to_string()),
        );

        // Spawned so that dropping the send future doesn't cancel the write
        let store = self.ctx.store.clone();
        let insert = tokio::spawn(async move { store.insert(message).await });

        let outcome = match tokio::time::timeout(limit, insert).await {
            Ok(Ok(Ok(stored))) => Ok(stored),
            Ok(Ok(Err(Error::StoreInsert(reason)))) => Err(Error::StoreInsert(reason)),
            Ok(Ok(Err(other))) => Err(Error::StoreInsert(other.to_string())),
            Ok(Err(join)) => Err(Error::StoreInsert(join.to_string())),
            Err(_) => Err(Error::StoreInsert(format!("insert timed out after {:?}", limit))),
        };

        match outcome {
            Ok(stored) => {
                self.state.lock().await.pending.mark_sent(local_id);
                self.bump();
                info!("Message {} stored as {} in {}", local_id, stored.id, self.conversation);
                Ok(())
            }
            Err(error) => {
                self.fail(local_id, &error).await;
                Err(error)
            }
        }
    }
}

/// One open conversation
///
/// # Example
/// ```rust,no_run
/// use marketchat::messaging::ChatSession;
/// use marketchat::storage::{ChatSettings, ConversationKey, SqliteStore};
/// use marketchat::store::{AuthContext, ChatContext};
/// use std::sync::Arc;
///
/// # async fn example() -> marketchat::Result<()> {
/// let backend = Arc::new(SqliteStore::new("chat.db")?);
/// let ctx = ChatContext::with_backend(backend, AuthContext::new("acct_customer"), ChatSettings::default());
///
/// let session = ChatSession::open(ctx, ConversationKey::booking("booking_1")).await?;
/// match session.send("Hello, is Saturday still available?").await {
///     Ok(local_id) => println!("sent {}", local_id),
///     Err(e) if e.is_user_visible() => println!("failed: {}", e),
///     Err(e) => println!("not sent: {}", e),
/// }
///
/// for bubble in session.bubbles().await {
///     println!("{} {}", bubble.body, bubble.indicator);
/// }
/// session.close();
/// # Ok(())
/// # }
/// ```
pub struct ChatSession {
    shared: Arc<SessionShared>,
    listener: JoinHandle<()>,
}

impl ChatSession {
    /// Open a conversation: resolve permission, subscribe, load the newest page
    ///
    /// The subscription is opened before history is fetched so no insert can
    /// fall between the two.
    pub async fn open(ctx: ChatContext, conversation: ConversationKey) -> Result<Self> {
        let limit = ctx.settings.store_timeout();
        let page_size = ctx.settings.history_page_size.max(1);
        let resolver = ConversationResolver::new(&ctx);

        let profile = bounded(limit, "profile lookup", resolver.self_profile()).await?;
        let permission = bounded(limit, "permission lookup", resolver.permission(&conversation)).await?;
        let subscription = bounded(
            limit,
            "subscribe",
            ctx.store
                .subscribe(ChangeFilter::Conversation(conversation.clone())),
        )
        .await?;
        let history = bounded(
            limit,
            "history fetch",
            ctx.store.list(&conversation, HistoryPage::latest(page_size)),
        )
        .await?;

        info!(
            "Opened {} for {} ({} message(s), send allowed: {})",
            conversation,
            profile.id,
            history.len(),
            permission.send_allowed
        );

        let (revision, _) = watch::channel(0);
        let (link, _) = watch::channel(LinkState::Live);
        let shared = Arc::new(SessionShared {
            resolver,
            conversation,
            self_profile_id: profile.id,
            state: Mutex::new(SessionState {
                has_more_history: history.len() == page_size,
                messages: history,
                pending: PendingQueue::new(),
                permission,
                marking: HashSet::new(),
            }),
            revision,
            link,
            ctx,
        });

        shared.schedule_mark_read().await;
        let listener = tokio::spawn(listen(shared.clone(), subscription));

        Ok(Self { shared, listener })
    }

    /// Conversation this session shows
    pub fn conversation(&self) -> &ConversationKey {
        &self.shared.conversation
    }

    /// Current user's profile id
    pub fn self_profile_id(&self) -> &str {
        &self.shared.self_profile_id
    }

    /// Send a message
    ///
    /// Appends a pending entry immediately, resolves the receiver and inserts.
    /// The entry is dropped once the confirmed row arrives on the change feed.
    ///
    /// # Arguments
    /// * `text` - Composer text; trimmed before validation
    ///
    /// # Returns
    /// * `Ok(local_id)` - Insert succeeded; entry is `sent` until confirmed
    /// * `Err(Error::InvalidBody)` / `Err(Error::PermissionDenied)` - refused before any store call
    /// * `Err(Error::ReceiverNotFound)` / `Err(Error::StoreInsert)` - entry left `failed` for resend
    pub async fn send(&self, text: &str) -> Result<String> {
        let body = validate_body(text, self.shared.max_body_chars())?;

        let local_id = {
            let mut state = self.shared.state.lock().await;
            if !state.permission.send_allowed {
                let reason = state
                    .permission
                    .read_only_reason
                    .clone()
                    .unwrap_or_else(|| "conversation is read-only".to_string());
                return Err(Error::PermissionDenied(reason));
            }
            state.pending.push(body.clone())
        };
        self.shared.bump();
        debug!("Queued {} in {}", local_id, self.shared.conversation);

        match self.shared.deliver(&local_id, body).await {
            Ok(()) => Ok(local_id),
            Err(Error::PermissionDenied(reason)) => {
                // Nothing was written; a fresh send that is refused leaves no entry
                self.shared.state.lock().await.pending.remove(&local_id);
                self.shared.bump();
                Err(Error::PermissionDenied(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Send a failed message again under the same local id
    ///
    /// Reusing the id keeps the insert idempotent: if the first attempt
    /// landed late, the store returns that row instead of a duplicate. A
    /// refused resend leaves the entry `failed` with its body.
    pub async fn resend(&self, local_id: &str) -> Result<String> {
        let body = {
            let mut state = self.shared.state.lock().await;
            if state.pending.get(local_id).is_none_or(|e| e.status != PendingStatus::Failed) {
                return Err(Error::NotFound(format!("failed message {}", local_id)));
            }
            if !state.permission.send_allowed {
                let reason = state
                    .permission
                    .read_only_reason
                    .clone()
                    .unwrap_or_else(|| "conversation is read-only".to_string());
                return Err(Error::PermissionDenied(reason));
            }
            state
                .pending
                .retry(local_id)
                .ok_or_else(|| Error::NotFound(format!("failed message {}", local_id)))?
        };
        self.shared.bump();
        debug!("Retrying {} in {}", local_id, self.shared.conversation);

        self.shared.deliver(local_id, body).await?;
        Ok(local_id.to_string())
    }

    /// Drop a failed message without resending; returns its body
    pub async fn discard(&self, local_id: &str) -> Option<String> {
        let entry = self.shared.state.lock().await.pending.take_failed(local_id)?;
        self.shared.bump();
        Some(entry.body)
    }

    /// Load the next page of older history
    ///
    /// # Returns
    /// Number of messages prepended (0 when history is exhausted)
    pub async fn load_older(&self) -> Result<usize> {
        let oldest = {
            let state = self.shared.state.lock().await;
            if !state.has_more_history {
                return Ok(0);
            }
            state.messages.first().map(|m| m.created_at)
        };
        let Some(oldest) = oldest else {
            return Ok(0);
        };

        let page_size = self.shared.page_size();
        let page = self.shared.fetch(HistoryPage::before(oldest, page_size)).await?;

        let added = {
            let mut state = self.shared.state.lock().await;
            state.has_more_history = page.len() == page_size;
            state.prepend(page)
        };
        self.shared.bump();
        self.shared.schedule_mark_read().await;
        debug!("Loaded {} older message(s) in {}", added, self.shared.conversation);

        Ok(added)
    }

    /// Re-list history now
    pub async fn refresh(&self) -> Result<()> {
        self.shared.refresh().await?;
        self.shared.bump();
        self.shared.schedule_mark_read().await;
        Ok(())
    }

    /// Re-check whether sending is allowed (e.g. after a booking status change)
    pub async fn refresh_permission(&self) -> Result<Permission> {
        let permission = bounded(
            self.shared.ctx.settings.store_timeout(),
            "permission lookup",
            self.shared.resolver.permission(&self.shared.conversation),
        )
        .await?;
        self.shared.state.lock().await.permission = permission.clone();
        self.shared.bump();
        Ok(permission)
    }

    /// Snapshot of the rendered state
    pub async fn view(&self) -> ConversationView {
        let state = self.shared.state.lock().await;
        ConversationView {
            conversation: self.shared.conversation.clone(),
            self_profile_id: self.shared.self_profile_id.clone(),
            messages: state.messages.clone(),
            pending: state.pending.entries().to_vec(),
            composer: if state.permission.send_allowed {
                ComposerState::Enabled
            } else {
                ComposerState::Disabled {
                    reason: state
                        .permission
                        .read_only_reason
                        .clone()
                        .unwrap_or_else(|| "conversation is read-only".to_string()),
                }
            },
            link: *self.shared.link.borrow(),
            has_more_history: state.has_more_history,
        }
    }

    /// Rendered bubbles: confirmed messages, then pending entries
    pub async fn bubbles(&self) -> Vec<Bubble> {
        self.view().await.bubbles()
    }

    /// Revision counter bumped on every visible change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Current live-feed health
    pub fn link_state(&self) -> LinkState {
        *self.shared.link.borrow()
    }

    /// Watch live-feed health
    pub fn link_changes(&self) -> watch::Receiver<LinkState> {
        self.shared.link.subscribe()
    }

    /// Close the conversation, releasing the subscription
    ///
    /// An insert already in flight still completes.
    pub fn close(self) {
        info!("Closing {}", self.shared.conversation);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(shared: Arc<SessionShared>, mut subscription: Subscription) {
    loop {
        match subscription.recv().await {
            Ok(Some(event)) => {
                shared.apply(event).await;
                continue;
            }
            Ok(None) => warn!("Change feed for {} closed", shared.conversation),
            Err(e) => warn!("Change feed for {} failed: {}", shared.conversation, e),
        }

        let filter = subscription.filter().clone();
        drop(subscription);
        shared.bump();

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
                // Close any gap left while the feed was down
                if let Err(e) = shared.refresh().await {
                    warn!("Refetch of {} after reconnect failed: {}", shared.conversation, e);
                }
                shared.bump();
                shared.schedule_mark_read().await;
            }
            None => {
                shared.bump();
                return;
            }
        }
    }
}
