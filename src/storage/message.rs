//! Message structures, conversation keys and delivery status tracking

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default upper bound on message body length, in characters
pub const MAX_BODY_CHARS: usize = 5000;

/// Identifies the conversation a message belongs to
///
/// Booking chats are scoped implicitly by booking id; inquiry chats by the
/// id of an explicit inquiry-conversation row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationKey {
    /// Conversation attached to a booking
    Booking(String),
    /// Pre-booking inquiry conversation
    Inquiry(String),
}

impl ConversationKey {
    /// Create a booking-scoped key
    pub fn booking(id: impl Into<String>) -> Self {
        Self::Booking(id.into())
    }

    /// Create an inquiry-scoped key
    pub fn inquiry(id: impl Into<String>) -> Self {
        Self::Inquiry(id.into())
    }

    /// Storage discriminator ("booking" / "inquiry")
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Booking(_) => "booking",
            Self::Inquiry(_) => "inquiry",
        }
    }

    /// The underlying booking or inquiry id
    pub fn id(&self) -> &str {
        match self {
            Self::Booking(id) | Self::Inquiry(id) => id,
        }
    }

    /// Rebuild a key from its storage columns
    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "booking" => Some(Self::Booking(id)),
            "inquiry" => Some(Self::Inquiry(id)),
            _ => None,
        }
    }

    /// Whether messages in this conversation carry a delivery status
    ///
    /// Inquiry chat only tracks the `read` flag.
    pub fn tracks_delivery(&self) -> bool {
        matches!(self, Self::Booking(_))
    }

    /// Channel name used for presence in this conversation
    pub fn presence_channel(&self) -> String {
        format!("presence:{}:{}", self.kind(), self.id())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Message delivery status
///
/// Ordered so that a status can only ever advance: `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Stored, not yet seen by the receiver's client
    #[default]
    Sent,
    /// Fetched by the receiver's client
    Delivered,
    /// Viewed by the receiver
    Read,
}

impl DeliveryStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    /// Parse the storage representation
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }

    /// Move forward to `next`, never backward
    pub fn advance(self, next: DeliveryStatus) -> DeliveryStatus {
        self.max(next)
    }
}

/// A server-confirmed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned message ID
    pub id: String,
    /// Conversation this message belongs to
    pub conversation: ConversationKey,
    /// Sender profile ID
    pub sender_id: String,
    /// Receiver profile ID
    pub receiver_id: String,
    /// Message text
    pub body: String,
    /// Server timestamp; strictly increasing within a store
    pub created_at: DateTime<Utc>,
    /// Whether the receiver has viewed the message
    #[serde(default)]
    pub read: bool,
    /// Delivery status (booking chat only)
    #[serde(default)]
    pub delivery_status: Option<DeliveryStatus>,
    /// Token echoed back from the sending client, if any
    #[serde(default)]
    pub client_token: Option<String>,
}

impl Message {
    /// Whether this message is addressed to `profile_id` and still unread
    pub fn is_unread_for(&self, profile_id: &str) -> bool {
        !self.read && self.receiver_id == profile_id
    }

    /// Mark the message as read
    ///
    /// `read` only moves false → true; the delivery status, where tracked,
    /// advances to `Read`.
    pub fn mark_read(&mut self) {
        self.read = true;
        self.delivery_status = self.delivery_status.map(|s| s.advance(DeliveryStatus::Read));
    }

    /// Mark the message as delivered (no-op for untracked or already-read messages)
    pub fn mark_delivered(&mut self) {
        self.delivery_status = self
            .delivery_status
            .map(|s| s.advance(DeliveryStatus::Delivered));
    }

    /// Merge a newer copy of the same row without regressing read state
    pub fn merge_from(&mut self, newer: &Message) {
        let read = self.read || newer.read;
        let status = match (self.delivery_status, newer.delivery_status) {
            (Some(a), Some(b)) => Some(a.advance(b)),
            (a, b) => a.or(b),
        };
        *self = newer.clone();
        self.read = read;
        self.delivery_status = status;
        if read {
            self.delivery_status = self.delivery_status.map(|s| s.advance(DeliveryStatus::Read));
        }
    }

    /// Get human-readable delivery status indicator
    pub fn status_indicator(&self) -> &str {
        match (self.delivery_status, self.read) {
            (Some(DeliveryStatus::Read), _) | (None, true) => "👁",
            (Some(DeliveryStatus::Delivered), _) => "✓✓",
            _ => "✓",
        }
    }
}

/// A message about to be inserted into the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Conversation this message belongs to
    pub conversation: ConversationKey,
    /// Sender profile ID
    pub sender_id: String,
    /// Receiver profile ID
    pub receiver_id: String,
    /// Validated message text
    pub body: String,
    /// Initial delivery status; `None` for conversations that don't track it
    pub delivery_status: Option<DeliveryStatus>,
    /// Client idempotency token, echoed on the confirmed row
    pub client_token: Option<String>,
}

impl NewMessage {
    /// Build an insert request with the initial status appropriate for the conversation
    pub fn new(
        conversation: ConversationKey,
        sender_id: String,
        receiver_id: String,
        body: String,
        client_token: Option<String>,
    ) -> Self {
        let delivery_status = conversation.tracks_delivery().then_some(DeliveryStatus::Sent);
        Self {
            conversation,
            sender_id,
            receiver_id,
            body,
            delivery_status,
            client_token,
        }
    }
}

/// Trim and validate a message body
///
/// # Arguments
/// * `raw` - Text as typed in the composer
/// * `max_chars` - Upper bound on the trimmed length, in characters
///
/// # Returns
/// The trimmed body, or `Error::InvalidBody` if it is empty or too long
pub fn validate_body(raw: &str, max_chars: usize) -> Result<String> {
    let body = raw.trim();
    if body.is_empty() {
        return Err(Error::InvalidBody("message is empty".to_string()));
    }
    let len = body.chars().count();
    if len > max_chars {
        return Err(Error::InvalidBody(format!(
            "message is {} characters, limit is {}",
            len, max_chars
        )));
    }
    Ok(body.to_string())
}
