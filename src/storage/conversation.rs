//! Booking, inquiry and identity records the chat core reads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the marketplace the current user is acting as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Customer who books services
    Customer,
    /// Service provider account owner
    Provider,
}

/// Booking lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Requested, awaiting provider response
    Pending,
    /// Accepted by the provider
    Accepted,
    /// Declined by the provider
    Rejected,
    /// Service delivered
    Completed,
    /// Cancelled by either side
    Cancelled,
}

impl BookingStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the storage representation
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether the booking chat is closed to new messages
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Inquiry conversation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InquiryStatus {
    /// Open for messages
    Open,
    /// Closed; history remains readable
    Closed,
}

impl InquiryStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Parse the storage representation
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// User profile; message sender/receiver ids are profile ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile ID
    pub id: String,
    /// Auth account that owns this profile
    pub account_id: String,
    /// Name shown in conversation lists
    pub display_name: String,
}

/// Service provider listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    /// Provider ID
    pub id: String,
    /// Auth account that operates this provider
    pub owner_account_id: String,
    /// Business name
    pub business_name: String,
}

/// A booking between a customer account and a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking ID
    pub id: String,
    /// Customer's auth account id
    pub customer_account_id: String,
    /// Booked provider
    pub provider_id: String,
    /// Lifecycle status
    pub status: BookingStatus,
}

/// Explicit inquiry conversation row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inquiry {
    /// Inquiry conversation ID
    pub id: String,
    /// Customer's auth account id
    pub customer_account_id: String,
    /// Provider being asked
    pub provider_id: String,
    /// Open/closed status
    pub status: InquiryStatus,
    /// Bumped on every message append
    pub updated_at: DateTime<Utc>,
}

impl Inquiry {
    /// Whether the inquiry is closed to new messages
    pub fn is_read_only(&self) -> bool {
        self.status == InquiryStatus::Closed
    }
}
