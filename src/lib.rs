//! Marketchat - real-time chat core for a services marketplace
//!
//! This library provides the messaging layer behind booking and inquiry
//! conversations between customers and service providers: optimistic sends
//! reconciled against server-confirmed rows, read/delivery tracking, live
//! presence, and per-user conversation lists.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod inbox;
pub mod messaging;
pub mod presence;
pub mod queue;
pub mod resolver;
pub mod storage;
pub mod store;

#[cfg(test)]
mod tests;

/// Result type alias for Marketchat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Marketchat operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The counterpart of a conversation could not be resolved
    #[error("Receiver not found: {0}")]
    ReceiverNotFound(String),

    /// Durable message write failed
    #[error("Store insert failed: {0}")]
    StoreInsert(String),

    /// Live change channel dropped or lagged
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Conversation is read-only for the current user
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Message body rejected before reaching the store
    #[error("Invalid message body: {0}")]
    InvalidBody(String),

    /// Referenced booking, inquiry or profile does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A store call did not settle in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Store read or update error
    #[error("Store error: {0}")]
    Store(String),

    /// Presence channel error
    #[error("Presence error: {0}")]
    Presence(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error should be shown to the user (toast or failed bubble).
    ///
    /// Everything else is recovered silently or rendered as a normal state.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Error::ReceiverNotFound(_) | Error::StoreInsert(_))
    }
}

/// Initialize the Marketchat library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}
