//! Backend boundary module
//!
//! This module defines the contracts the chat core needs from its backend:
//! - `MessageStore` - durable per-conversation message history plus a change feed
//! - `Directory` - identity lookups and the booking/inquiry rows that scope chats
//! - `Subscription` - a filtered live change feed; dropping it unsubscribes
//! - `ChatContext` - the explicitly passed backend handles, auth context and settings
//!
//! `storage::SqliteStore` implements both traits and serves as the reference
//! backend; any transport with ordered delivery and a server timestamp can be
//! plugged in instead.

use crate::{
    Error, Result,
    storage::{
        Booking, BookingStatus, ChatSettings, ConversationKey, Inquiry, MAX_BODY_CHARS, Message,
        NewMessage, Profile, Provider, ReconnectPolicy,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Kind of row change reported by the live feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new message row
    Insert,
    /// Read/delivery state of an existing row changed
    Update,
}

/// A single change on the message table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Insert or update
    pub kind: ChangeKind,
    /// Row contents after the change
    pub message: Message,
}

/// Which changes a subscription receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Changes within one conversation
    Conversation(ConversationKey),
    /// Changes where the profile is sender or receiver
    Participant(String),
    /// Every change
    All,
}

impl ChangeFilter {
    /// Whether a changed row passes this filter
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::Conversation(key) => &message.conversation == key,
            Self::Participant(profile_id) => {
                &message.sender_id == profile_id || &message.receiver_id == profile_id
            }
            Self::All => true,
        }
    }
}

/// A live, filtered change feed
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    filter: ChangeFilter,
    events: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Wrap a raw broadcast receiver with a filter
    pub fn new(filter: ChangeFilter, events: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { filter, events }
    }

    /// The filter this subscription was opened with
    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Wait for the next matching change
    ///
    /// # Returns
    /// * `Ok(Some(event))` - next matching change
    /// * `Ok(None)` - the feed was closed by the backend
    /// * `Err(Error::Subscription)` - events were missed (receiver lagged)
    pub async fn recv(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            match self.events.recv().await {
                Ok(event) if self.filter.matches(&event.message) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(Error::Subscription(format!("missed {} change events", missed)));
                }
            }
        }
    }
}

/// Health of a live subscription, for a subtle "reconnecting" indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Receiving live changes
    Live,
    /// Channel dropped; retrying
    Reconnecting {
        /// 1-based retry number
        attempt: u32,
    },
    /// Gave up after the policy's retry limit
    Disconnected,
}

/// One page of history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPage {
    /// Only messages created strictly before this instant (None = newest)
    pub before: Option<DateTime<Utc>>,
    /// Maximum number of messages
    pub limit: usize,
}

impl HistoryPage {
    /// Newest `limit` messages
    pub fn latest(limit: usize) -> Self {
        Self { before: None, limit }
    }

    /// `limit` messages older than `before`
    pub fn before(before: DateTime<Utc>, limit: usize) -> Self {
        Self {
            before: Some(before),
            limit,
        }
    }
}

/// Durable, ordered per-conversation message store with a change feed
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fetch a page of history, ordered ascending by `created_at`
    async fn list(&self, conversation: &ConversationKey, page: HistoryPage) -> Result<Vec<Message>>;

    /// Insert a message; failures are reported as `Error::StoreInsert`
    ///
    /// Repeating an insert with the same `client_token` returns the existing row.
    async fn insert(&self, message: NewMessage) -> Result<Message>;

    /// Set `read = true` (and `delivery_status = read` where tracked) on the given ids
    ///
    /// Already-read rows are left untouched. Returns the number of rows changed.
    async fn mark_read(&self, conversation: &ConversationKey, ids: &[String]) -> Result<usize>;

    /// Advance `sent` messages addressed to `receiver_id` to `delivered`
    async fn mark_delivered(&self, conversation: &ConversationKey, receiver_id: &str) -> Result<usize>;

    /// Most recent message in a conversation
    async fn latest(&self, conversation: &ConversationKey) -> Result<Option<Message>>;

    /// Number of unread messages addressed to `receiver_id`
    async fn unread_count(&self, conversation: &ConversationKey, receiver_id: &str) -> Result<usize>;

    /// Open a live change feed
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription>;

    /// Longest body, in characters, the store accepts
    fn max_body_chars(&self) -> usize {
        MAX_BODY_CHARS
    }
}

/// Identity and conversation-scope lookups
#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetch a booking by id
    async fn booking(&self, id: &str) -> Result<Option<Booking>>;

    /// Fetch an inquiry conversation by id
    async fn inquiry(&self, id: &str) -> Result<Option<Inquiry>>;

    /// Fetch a provider by id
    async fn provider(&self, id: &str) -> Result<Option<Provider>>;

    /// Provider operated by an account, if any
    async fn provider_for_account(&self, account_id: &str) -> Result<Option<Provider>>;

    /// Resolve a profile from an account id
    async fn profile_for_account(&self, account_id: &str) -> Result<Option<Profile>>;

    /// Fetch a profile by id (profile → account)
    async fn profile(&self, profile_id: &str) -> Result<Option<Profile>>;

    /// Bookings of a provider in any of the given statuses
    async fn bookings_for_provider(
        &self,
        provider_id: &str,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>>;

    /// Bookings made by a customer account in any of the given statuses
    async fn bookings_for_customer(
        &self,
        account_id: &str,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>>;

    /// Inquiries addressed to a provider
    async fn inquiries_for_provider(&self, provider_id: &str) -> Result<Vec<Inquiry>>;

    /// Inquiries opened by a customer account
    async fn inquiries_for_customer(&self, account_id: &str) -> Result<Vec<Inquiry>>;
}

/// The signed-in user, as supplied by the auth collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthContext {
    /// Auth account id (not the profile id)
    pub account_id: String,
}

impl AuthContext {
    /// Create an auth context for an account
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
        }
    }
}

/// Backend handles, current user and settings, passed explicitly to every component
#[derive(Clone)]
pub struct ChatContext {
    /// Message store
    pub store: Arc<dyn MessageStore>,
    /// Identity directory
    pub directory: Arc<dyn Directory>,
    /// Current user
    pub auth: AuthContext,
    /// Shared settings
    pub settings: Arc<ChatSettings>,
}

impl ChatContext {
    /// Create a context from separate store and directory handles
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn Directory>,
        auth: AuthContext,
        settings: ChatSettings,
    ) -> Self {
        Self {
            store,
            directory,
            auth,
            settings: Arc::new(settings),
        }
    }

    /// Create a context from a single backend implementing both traits
    ///
    /// # Example
    /// ```rust,no_run
    /// use marketchat::storage::{ChatSettings, SqliteStore};
    /// use marketchat::store::{AuthContext, ChatContext};
    /// use std::sync::Arc;
    ///
    /// # fn example() -> marketchat::Result<()> {
    /// let backend = Arc::new(SqliteStore::new_in_memory()?);
    /// let ctx = ChatContext::with_backend(backend, AuthContext::new("acct_1"), ChatSettings::default());
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_backend<B>(backend: Arc<B>, auth: AuthContext, settings: ChatSettings) -> Self
    where
        B: MessageStore + Directory + 'static,
    {
        Self::new(backend.clone(), backend, auth, settings)
    }

    /// Same backend and settings, different signed-in user
    pub fn for_account(&self, account_id: impl Into<String>) -> Self {
        Self {
            auth: AuthContext::new(account_id),
            ..self.clone()
        }
    }
}

/// Bound a store call with a timeout
pub(crate) async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("{} after {:?}", operation, limit))),
    }
}

/// Re-open a dropped subscription, backing off between attempts
///
/// Publishes `Reconnecting` on every attempt, `Live` on success and
/// `Disconnected` once the policy gives up.
pub(crate) async fn resubscribe(
    store: &dyn MessageStore,
    filter: &ChangeFilter,
    policy: &ReconnectPolicy,
    limit: Duration,
    link: &watch::Sender<LinkState>,
) -> Option<Subscription> {
    let mut attempt = 0;
    while policy.should_retry(attempt) {
        link.send_replace(LinkState::Reconnecting {
            attempt: attempt + 1,
        });
        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;

        match bounded(limit, "subscribe", store.subscribe(filter.clone())).await {
            Ok(subscription) => {
                info!("Re-subscribed to {:?} after {} attempt(s)", filter, attempt + 1);
                link.send_replace(LinkState::Live);
                return Some(subscription);
            }
            Err(e) => {
                warn!("Re-subscribe attempt {} for {:?} failed: {}", attempt + 1, filter, e);
            }
        }
        attempt += 1;
    }

    warn!("Giving up on subscription {:?} after {} attempt(s)", filter, attempt);
    link.send_replace(LinkState::Disconnected);
    None
}
