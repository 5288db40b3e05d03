//! SQLite-based storage backend
//!
//! This module provides a complete SQLite implementation of the chat backend:
//! the durable message table with its change feed, and the profile, provider,
//! booking and inquiry rows the chat core looks up.

use crate::{
    Error, Result,
    storage::{
        conversation::{Booking, BookingStatus, Inquiry, InquiryStatus, Profile, Provider},
        message::{ConversationKey, DeliveryStatus, MAX_BODY_CHARS, Message, NewMessage},
    },
    store::{ChangeEvent, ChangeFilter, ChangeKind, Directory, HistoryPage, MessageStore, Subscription},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};
use std::path::Path;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

/// Capacity of the change feed; slower subscribers observe a lag error
const CHANGE_FEED_CAPACITY: usize = 256;

const MESSAGE_COLUMNS: &str = "id, conversation_kind, conversation_id, sender_id, receiver_id, \
     body, created_at, read, delivery_status, client_token";

struct Inner {
    conn: Connection,
    /// Last assigned `created_at`, in microseconds
    last_created_micros: i64,
    changes: broadcast::Sender<ChangeEvent>,
}

/// SQLite-based chat backend
///
/// Implements both [`MessageStore`] and [`Directory`]. Timestamps are
/// assigned by the store and are strictly increasing, so `created_at` alone
/// orders messages.
pub struct SqliteStore {
    inner: Mutex<Inner>,
}

impl SqliteStore {
    /// Create a new storage instance with a database file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Store(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory storage instance (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Store(format!("Failed to create in-memory database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        let last_created_micros: i64 =
            conn.query_row("SELECT COALESCE(MAX(created_at), 0) FROM messages", [], |row| {
                row.get(0)
            })?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                last_created_micros,
                changes,
            }),
        })
    }

    // ========== Directory seeding ==========

    /// Save or update a profile
    pub async fn add_profile(&self, profile: &Profile) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.conn.execute(
            "INSERT OR REPLACE INTO profiles (id, account_id, display_name) VALUES (?1, ?2, ?3)",
            params![profile.id, profile.account_id, profile.display_name],
        )?;
        Ok(())
    }

    /// Save or update a provider
    pub async fn add_provider(&self, provider: &Provider) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.conn.execute(
            "INSERT OR REPLACE INTO providers (id, owner_account_id, business_name) VALUES (?1, ?2, ?3)",
            params![provider.id, provider.owner_account_id, provider.business_name],
        )?;
        Ok(())
    }

    /// Save or update a booking
    pub async fn add_booking(&self, booking: &Booking) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.conn.execute(
            "INSERT OR REPLACE INTO bookings (id, customer_account_id, provider_id, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                booking.id,
                booking.customer_account_id,
                booking.provider_id,
                booking.status.as_str()
            ],
        )?;
        Ok(())
    }

    /// Change a booking's lifecycle status
    pub async fn set_booking_status(&self, booking_id: &str, status: BookingStatus) -> Result<()> {
        let inner = self.inner.lock().await;
        let changed = inner.conn.execute(
            "UPDATE bookings SET status = ?1 WHERE id = ?2",
            params![status.as_str(), booking_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("booking {}", booking_id)));
        }
        Ok(())
    }

    /// Save or update an inquiry conversation
    pub async fn add_inquiry(&self, inquiry: &Inquiry) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.conn.execute(
            "INSERT OR REPLACE INTO inquiries (id, customer_account_id, provider_id, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                inquiry.id,
                inquiry.customer_account_id,
                inquiry.provider_id,
                inquiry.status.as_str(),
                inquiry.updated_at.timestamp_micros()
            ],
        )?;
        Ok(())
    }

    /// Change an inquiry's status
    pub async fn set_inquiry_status(&self, inquiry_id: &str, status: InquiryStatus) -> Result<()> {
        let inner = self.inner.lock().await;
        let changed = inner.conn.execute(
            "UPDATE inquiries SET status = ?1 WHERE id = ?2",
            params![status.as_str(), inquiry_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("inquiry {}", inquiry_id)));
        }
        Ok(())
    }

    /// Close every open change feed, as a backend restart would
    ///
    /// Existing subscribers observe the end of their feed; new subscriptions
    /// attach to a fresh feed.
    pub async fn disconnect_subscribers(&self) {
        let mut inner = self.inner.lock().await;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let dropped = std::mem::replace(&mut inner.changes, changes);
        info!("Closing change feed with {} subscriber(s)", dropped.receiver_count());
    }

    /// Number of live change-feed subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.changes.receiver_count()
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS providers (
            id TEXT PRIMARY KEY,
            owner_account_id TEXT NOT NULL,
            business_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bookings (
            id TEXT PRIMARY KEY,
            customer_account_id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            status TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS inquiries (
            id TEXT PRIMARY KEY,
            customer_account_id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            status TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_kind TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                body TEXT NOT NULL CHECK (length(body) BETWEEN 1 AND {}),
                created_at INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                delivery_status TEXT,
                client_token TEXT UNIQUE
            )",
            MAX_BODY_CHARS
        ),
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation
         ON messages(conversation_kind, conversation_id, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver_id, read)",
        [],
    )?;

    Ok(())
}

fn conversion_error(column: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(Error::Store(what)))
}

fn timestamp_from_micros(column: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| conversion_error(column, format!("timestamp out of range: {}", micros)))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(1)?;
    let conversation_id: String = row.get(2)?;
    let conversation = ConversationKey::from_parts(&kind, conversation_id)
        .ok_or_else(|| conversion_error(1, format!("unknown conversation kind: {}", kind)))?;
    let status: Option<String> = row.get(8)?;
    let delivery_status = match status {
        Some(s) => Some(
            DeliveryStatus::parse(&s)
                .ok_or_else(|| conversion_error(8, format!("unknown delivery status: {}", s)))?,
        ),
        None => None,
    };

    Ok(Message {
        id: row.get(0)?,
        conversation,
        sender_id: row.get(3)?,
        receiver_id: row.get(4)?,
        body: row.get(5)?,
        created_at: timestamp_from_micros(6, row.get(6)?)?,
        read: row.get(7)?,
        delivery_status,
        client_token: row.get(9)?,
    })
}

fn booking_from_row(row: &Row<'_>) -> rusqlite::Result<Booking> {
    let status: String = row.get(3)?;
    Ok(Booking {
        id: row.get(0)?,
        customer_account_id: row.get(1)?,
        provider_id: row.get(2)?,
        status: BookingStatus::parse(&status)
            .ok_or_else(|| conversion_error(3, format!("unknown booking status: {}", status)))?,
    })
}

fn inquiry_from_row(row: &Row<'_>) -> rusqlite::Result<Inquiry> {
    let status: String = row.get(3)?;
    Ok(Inquiry {
        id: row.get(0)?,
        customer_account_id: row.get(1)?,
        provider_id: row.get(2)?,
        status: InquiryStatus::parse(&status)
            .ok_or_else(|| conversion_error(3, format!("unknown inquiry status: {}", status)))?,
        updated_at: timestamp_from_micros(4, row.get(4)?)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get(0)?,
        account_id: row.get(1)?,
        display_name: row.get(2)?,
    })
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<Provider> {
    Ok(Provider {
        id: row.get(0)?,
        owner_account_id: row.get(1)?,
        business_name: row.get(2)?,
    })
}

fn message_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<Message>> {
    conn.query_row(
        &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
        params![id],
        message_from_row,
    )
    .optional()
}

fn publish_updates(inner: &Inner, ids: &[String]) -> Result<()> {
    for id in ids {
        if let Some(message) = message_by_id(&inner.conn, id)? {
            // No receivers is fine
            let _ = inner.changes.send(ChangeEvent {
                kind: ChangeKind::Update,
                message,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn list(&self, conversation: &ConversationKey, page: HistoryPage) -> Result<Vec<Message>> {
        let inner = self.inner.lock().await;
        let before = page.before.map_or(i64::MAX, |t| t.timestamp_micros());

        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE conversation_kind = ?1 AND conversation_id = ?2 AND created_at < ?3
             ORDER BY created_at DESC
             LIMIT ?4",
            MESSAGE_COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![conversation.kind(), conversation.id(), before, page.limit as i64],
            message_from_row,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();

        Ok(messages)
    }

    async fn insert(&self, message: NewMessage) -> Result<Message> {
        let len = message.body.chars().count();
        if len == 0 || len > MAX_BODY_CHARS {
            return Err(Error::StoreInsert(format!(
                "body length {} outside 1..={}",
                len, MAX_BODY_CHARS
            )));
        }

        let mut inner = self.inner.lock().await;

        if let Some(token) = &message.client_token {
            let existing = inner
                .conn
                .query_row(
                    &format!("SELECT {} FROM messages WHERE client_token = ?1", MESSAGE_COLUMNS),
                    params![token],
                    message_from_row,
                )
                .optional()
                .map_err(|e| Error::StoreInsert(e.to_string()))?;
            if let Some(existing) = existing {
                debug!("Insert with token {} already stored as {}", token, existing.id);
                return Ok(existing);
            }
        }

        let scope_table = match &message.conversation {
            ConversationKey::Booking(_) => "bookings",
            ConversationKey::Inquiry(_) => "inquiries",
        };
        let scope_exists = inner
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", scope_table),
                params![message.conversation.id()],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| Error::StoreInsert(e.to_string()))?
            .is_some();
        if !scope_exists {
            return Err(Error::StoreInsert(format!(
                "unknown conversation {}",
                message.conversation
            )));
        }

        let created_micros = Utc::now()
            .timestamp_micros()
            .max(inner.last_created_micros + 1);
        let created_at = timestamp_from_micros(6, created_micros)
            .map_err(|e| Error::StoreInsert(e.to_string()))?;
        let stored = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation: message.conversation,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            body: message.body,
            created_at,
            read: false,
            delivery_status: message.delivery_status,
            client_token: message.client_token,
        };

        let tx = inner
            .conn
            .transaction()
            .map_err(|e| Error::StoreInsert(e.to_string()))?;
        tx.execute(
            &format!(
                "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
                MESSAGE_COLUMNS
            ),
            params![
                stored.id,
                stored.conversation.kind(),
                stored.conversation.id(),
                stored.sender_id,
                stored.receiver_id,
                stored.body,
                created_micros,
                stored.delivery_status.map(|s| s.as_str()),
                stored.client_token,
            ],
        )
        .map_err(|e| Error::StoreInsert(e.to_string()))?;
        if let ConversationKey::Inquiry(id) = &stored.conversation {
            tx.execute(
                "UPDATE inquiries SET updated_at = ?1 WHERE id = ?2",
                params![created_micros, id],
            )
            .map_err(|e| Error::StoreInsert(e.to_string()))?;
        }
        tx.commit().map_err(|e| Error::StoreInsert(e.to_string()))?;

        inner.last_created_micros = created_micros;
        let _ = inner.changes.send(ChangeEvent {
            kind: ChangeKind::Insert,
            message: stored.clone(),
        });
        debug!("Stored message {} in {}", stored.id, stored.conversation);

        Ok(stored)
    }

    async fn mark_read(&self, conversation: &ConversationKey, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock().await;
        let tx = inner.conn.transaction()?;
        let mut changed = Vec::new();
        for id in ids {
            let n = tx.execute(
                "UPDATE messages
                 SET read = 1,
                     delivery_status = CASE WHEN delivery_status IS NULL THEN NULL ELSE 'read' END
                 WHERE id = ?1 AND conversation_kind = ?2 AND conversation_id = ?3 AND read = 0",
                params![id, conversation.kind(), conversation.id()],
            )?;
            if n > 0 {
                changed.push(id.clone());
            }
        }
        tx.commit()?;

        publish_updates(&inner, &changed)?;
        Ok(changed.len())
    }

    async fn mark_delivered(&self, conversation: &ConversationKey, receiver_id: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let tx = inner.conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM messages
                 WHERE conversation_kind = ?1 AND conversation_id = ?2
                   AND receiver_id = ?3 AND delivery_status = 'sent'",
            )?;
            let rows = stmt.query_map(
                params![conversation.kind(), conversation.id(), receiver_id],
                |row| row.get::<_, String>(0),
            )?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        for id in &ids {
            tx.execute(
                "UPDATE messages SET delivery_status = 'delivered'
                 WHERE id = ?1 AND delivery_status = 'sent'",
                params![id],
            )?;
        }
        tx.commit()?;

        publish_updates(&inner, &ids)?;
        Ok(ids.len())
    }

    async fn latest(&self, conversation: &ConversationKey) -> Result<Option<Message>> {
        let inner = self.inner.lock().await;
        let message = inner
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM messages
                     WHERE conversation_kind = ?1 AND conversation_id = ?2
                     ORDER BY created_at DESC LIMIT 1",
                    MESSAGE_COLUMNS
                ),
                params![conversation.kind(), conversation.id()],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    async fn unread_count(&self, conversation: &ConversationKey, receiver_id: &str) -> Result<usize> {
        let inner = self.inner.lock().await;
        let count: i64 = inner.conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_kind = ?1 AND conversation_id = ?2 AND receiver_id = ?3 AND read = 0",
            params![conversation.kind(), conversation.id(), receiver_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription> {
        let inner = self.inner.lock().await;
        debug!("Opening change feed for {:?}", filter);
        Ok(Subscription::new(filter, inner.changes.subscribe()))
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn booking(&self, id: &str) -> Result<Option<Booking>> {
        let inner = self.inner.lock().await;
        let booking = inner
            .conn
            .query_row(
                "SELECT id, customer_account_id, provider_id, status FROM bookings WHERE id = ?1",
                params![id],
                booking_from_row,
            )
            .optional()?;
        Ok(booking)
    }

    async fn inquiry(&self, id: &str) -> Result<Option<Inquiry>> {
        let inner = self.inner.lock().await;
        let inquiry = inner
            .conn
            .query_row(
                "SELECT id, customer_account_id, provider_id, status, updated_at
                 FROM inquiries WHERE id = ?1",
                params![id],
                inquiry_from_row,
            )
            .optional()?;
        Ok(inquiry)
    }

    async fn provider(&self, id: &str) -> Result<Option<Provider>> {
        let inner = self.inner.lock().await;
        let provider = inner
            .conn
            .query_row(
                "SELECT id, owner_account_id, business_name FROM providers WHERE id = ?1",
                params![id],
                provider_from_row,
            )
            .optional()?;
        Ok(provider)
    }

    async fn provider_for_account(&self, account_id: &str) -> Result<Option<Provider>> {
        let inner = self.inner.lock().await;
        let provider = inner
            .conn
            .query_row(
                "SELECT id, owner_account_id, business_name FROM providers
                 WHERE owner_account_id = ?1 ORDER BY id LIMIT 1",
                params![account_id],
                provider_from_row,
            )
            .optional()?;
        Ok(provider)
    }

    async fn profile_for_account(&self, account_id: &str) -> Result<Option<Profile>> {
        let inner = self.inner.lock().await;
        let profile = inner
            .conn
            .query_row(
                "SELECT id, account_id, display_name FROM profiles WHERE account_id = ?1",
                params![account_id],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    async fn profile(&self, profile_id: &str) -> Result<Option<Profile>> {
        let inner = self.inner.lock().await;
        let profile = inner
            .conn
            .query_row(
                "SELECT id, account_id, display_name FROM profiles WHERE id = ?1",
                params![profile_id],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    async fn bookings_for_provider(
        &self,
        provider_id: &str,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>> {
        let inner = self.inner.lock().await;
        let mut stmt = inner.conn.prepare(
            "SELECT id, customer_account_id, provider_id, status FROM bookings
             WHERE provider_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![provider_id], booking_from_row)?;

        let mut bookings = Vec::new();
        for row in rows {
            let booking = row?;
            if statuses.contains(&booking.status) {
                bookings.push(booking);
            }
        }
        Ok(bookings)
    }

    async fn bookings_for_customer(
        &self,
        account_id: &str,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>> {
        let inner = self.inner.lock().await;
        let mut stmt = inner.conn.prepare(
            "SELECT id, customer_account_id, provider_id, status FROM bookings
             WHERE customer_account_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![account_id], booking_from_row)?;

        let mut bookings = Vec::new();
        for row in rows {
            let booking = row?;
            if statuses.contains(&booking.status) {
                bookings.push(booking);
            }
        }
        Ok(bookings)
    }

    async fn inquiries_for_provider(&self, provider_id: &str) -> Result<Vec<Inquiry>> {
        let inner = self.inner.lock().await;
        let mut stmt = inner.conn.prepare(
            "SELECT id, customer_account_id, provider_id, status, updated_at FROM inquiries
             WHERE provider_id = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![provider_id], inquiry_from_row)?;

        let mut inquiries = Vec::new();
        for row in rows {
            inquiries.push(row?);
        }
        Ok(inquiries)
    }

    async fn inquiries_for_customer(&self, account_id: &str) -> Result<Vec<Inquiry>> {
        let inner = self.inner.lock().await;
        let mut stmt = inner.conn.prepare(
            "SELECT id, customer_account_id, provider_id, status, updated_at FROM inquiries
             WHERE customer_account_id = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![account_id], inquiry_from_row)?;

        let mut inquiries = Vec::new();
        for row in rows {
            inquiries.push(row?);
        }
        Ok(inquiries)
    }
}
