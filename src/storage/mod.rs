//! Local storage module
//!
//! This module holds the records the chat core works with and a reference
//! SQLite store:
//! - `message` - Messages, conversation keys and delivery status
//! - `conversation` - Bookings, inquiries, providers and profiles
//! - `settings` - Chat configuration
//! - `storage_db` - SQLite message store, change feed and identity directory

pub mod conversation;
pub mod message;
pub mod settings;
pub mod storage_db;

pub use conversation::{Booking, BookingStatus, Inquiry, InquiryStatus, Profile, Provider, Role};
pub use message::{ConversationKey, DeliveryStatus, MAX_BODY_CHARS, Message, NewMessage, validate_body};
pub use settings::{ChatSettings, ReconnectPolicy, SyncMode};
pub use storage_db::SqliteStore;
