// Shared fixtures: a seeded in-memory store and a fault-injecting wrapper

use crate::storage::{
    Booking, BookingStatus, ChatSettings, ConversationKey, Inquiry, InquiryStatus, Message,
    NewMessage, Profile, Provider, ReconnectPolicy, SqliteStore,
};
use crate::store::{
    AuthContext, ChangeFilter, ChatContext, Directory, HistoryPage, MessageStore, Subscription,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

pub const CUSTOMER_ACCOUNT: &str = "acct_customer";
pub const CUSTOMER_PROFILE: &str = "profile_customer";
pub const OTHER_CUSTOMER_ACCOUNT: &str = "acct_other";
pub const OTHER_CUSTOMER_PROFILE: &str = "profile_other";
pub const PROVIDER_ACCOUNT: &str = "acct_provider";
pub const PROVIDER_PROFILE: &str = "profile_provider";
pub const PROVIDER_ID: &str = "provider_1";
pub const BOOKING_ID: &str = "booking_1";
pub const INQUIRY_ID: &str = "inquiry_1";

pub fn booking_key() -> ConversationKey {
    ConversationKey::booking(BOOKING_ID)
}

pub fn inquiry_key() -> ConversationKey {
    ConversationKey::inquiry(INQUIRY_ID)
}

/// Settings with short timeouts so failure paths resolve quickly
pub fn test_settings() -> ChatSettings {
    ChatSettings {
        store_timeout_ms: 2_000,
        typing_timeout_ms: 200,
        reconnect: ReconnectPolicy {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            max_retries: None,
        },
        ..ChatSettings::default()
    }
}

/// Store with a customer, a second customer, a provider, one accepted booking and one open inquiry
pub async fn seeded_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::new_in_memory().expect("Failed to create store"));

    for (id, account, name) in [
        (CUSTOMER_PROFILE, CUSTOMER_ACCOUNT, "Amara"),
        (OTHER_CUSTOMER_PROFILE, OTHER_CUSTOMER_ACCOUNT, "Bayo"),
        (PROVIDER_PROFILE, PROVIDER_ACCOUNT, "Golden Hour Events"),
    ] {
        store
            .add_profile(&Profile {
                id: id.to_string(),
                account_id: account.to_string(),
                display_name: name.to_string(),
            })
            .await
            .expect("Failed to add profile");
    }

    store
        .add_provider(&Provider {
            id: PROVIDER_ID.to_string(),
            owner_account_id: PROVIDER_ACCOUNT.to_string(),
            business_name: "Golden Hour Events".to_string(),
        })
        .await
        .expect("Failed to add provider");

    add_booking(&store, BOOKING_ID, CUSTOMER_ACCOUNT, BookingStatus::Accepted).await;

    store
        .add_inquiry(&Inquiry {
            id: INQUIRY_ID.to_string(),
            customer_account_id: CUSTOMER_ACCOUNT.to_string(),
            provider_id: PROVIDER_ID.to_string(),
            status: InquiryStatus::Open,
            updated_at: Utc::now(),
        })
        .await
        .expect("Failed to add inquiry");

    store
}

pub async fn add_booking(store: &SqliteStore, id: &str, customer_account: &str, status: BookingStatus) {
    store
        .add_booking(&Booking {
            id: id.to_string(),
            customer_account_id: customer_account.to_string(),
            provider_id: PROVIDER_ID.to_string(),
            status,
        })
        .await
        .expect("Failed to add booking");
}

/// Insert a message directly, as another client would
pub async fn post(store: &SqliteStore, key: &ConversationKey, from: &str, to: &str, body: &str) -> Message {
    store
        .insert(NewMessage::new(
            key.clone(),
            from.to_string(),
            to.to_string(),
            body.to_string(),
            None,
        ))
        .await
        .expect("Failed to insert message")
}

pub fn context<B>(backend: Arc<B>, account: &str) -> ChatContext
where
    B: MessageStore + Directory + 'static,
{
    ChatContext::with_backend(backend, AuthContext::new(account), test_settings())
}

/// Wraps a `SqliteStore`, counting calls and injecting insert failures or delays
pub struct FlakyStore {
    pub inner: Arc<SqliteStore>,
    pub fail_inserts: AtomicBool,
    pub insert_delay_ms: AtomicU64,
    pub inserts: AtomicUsize,
    pub mark_read_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_inserts: AtomicBool::new(false),
            insert_delay_ms: AtomicU64::new(0),
            inserts: AtomicUsize::new(0),
            mark_read_calls: AtomicUsize::new(0),
        })
    }

    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn mark_read_count(&self) -> usize {
        self.mark_read_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn list(&self, conversation: &ConversationKey, page: HistoryPage) -> Result<Vec<Message>> {
        self.inner.list(conversation, page).await
    }

    async fn insert(&self, message: NewMessage) -> Result<Message> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let delay = self.insert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::StoreInsert("simulated network failure".to_string()));
        }
        self.inner.insert(message).await
    }

    async fn mark_read(&self, conversation: &ConversationKey, ids: &[String]) -> Result<usize> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.mark_read(conversation, ids).await
    }

    async fn mark_delivered(&self, conversation: &ConversationKey, receiver_id: &str) -> Result<usize> {
        self.inner.mark_delivered(conversation, receiver_id).await
    }

    async fn latest(&self, conversation: &ConversationKey) -> Result<Option<Message>> {
        self.inner.latest(conversation).await
    }

    async fn unread_count(&self, conversation: &ConversationKey, receiver_id: &str) -> Result<usize> {
        self.inner.unread_count(conversation, receiver_id).await
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription> {
        self.inner.subscribe(filter).await
    }

    fn max_body_chars(&self) -> usize {
        self.inner.max_body_chars()
    }
}

#[async_trait]
impl Directory for FlakyStore {
    async fn booking(&self, id: &str) -> Result<Option<Booking>> {
        self.inner.booking(id).await
    }

    async fn inquiry(&self, id: &str) -> Result<Option<Inquiry>> {
        self.inner.inquiry(id).await
    }

    async fn provider(&self, id: &str) -> Result<Option<Provider>> {
        self.inner.provider(id).await
    }

    async fn provider_for_account(&self, account_id: &str) -> Result<Option<Provider>> {
        self.inner.provider_for_account(account_id).await
    }

    async fn profile_for_account(&self, account_id: &str) -> Result<Option<Profile>> {
        self.inner.profile_for_account(account_id).await
    }

    async fn profile(&self, profile_id: &str) -> Result<Option<Profile>> {
        self.inner.profile(profile_id).await
    }

    async fn bookings_for_provider(&self, provider_id: &str, statuses: &[BookingStatus]) -> Result<Vec<Booking>> {
        self.inner.bookings_for_provider(provider_id, statuses).await
    }

    async fn bookings_for_customer(&self, account_id: &str, statuses: &[BookingStatus]) -> Result<Vec<Booking>> {
        self.inner.bookings_for_customer(account_id, statuses).await
    }

    async fn inquiries_for_provider(&self, provider_id: &str) -> Result<Vec<Inquiry>> {
        self.inner.inquiries_for_provider(provider_id).await
    }

    async fn inquiries_for_customer(&self, account_id: &str) -> Result<Vec<Inquiry>> {
        self.inner.inquiries_for_customer(account_id).await
    }
}
