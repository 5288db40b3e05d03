//! Outgoing message queue module
//!
//! This module tracks optimistic sends for one open conversation:
//! - Pending entries appended at send time, rendered after confirmed messages
//! - Status transitions (`sending` → `sent` / `failed`)
//! - Reconciliation against confirmed rows arriving from the change feed
//!
//! The queue is local to a session and never persisted.

use crate::storage::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Status of an optimistic send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    /// Insert in flight
    Sending,
    /// Insert succeeded; waiting for the confirmed row on the change feed
    Sent,
    /// Receiver resolution or insert failed; user may resend
    Failed,
}

/// A message shown locally before the store confirms it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// Client-generated id; doubles as the insert's idempotency token
    pub local_id: String,
    /// Message text, preserved for resend on failure
    pub body: String,
    /// Send status
    pub status: PendingStatus,
    /// When the user pressed send
    pub queued_at: DateTime<Utc>,
    /// Failure reason, if failed
    pub error: Option<String>,
}

impl PendingMessage {
    /// Get human-readable status indicator
    pub fn status_indicator(&self) -> &str {
        match self.status {
            PendingStatus::Sending => "🕓",
            PendingStatus::Sent => "✓",
            PendingStatus::Failed => "✗",
        }
    }

    /// Get full status text
    pub fn status_text(&self) -> String {
        match (&self.status, &self.error) {
            (PendingStatus::Sending, _) => "sending".to_string(),
            (PendingStatus::Sent, _) => "sent".to_string(),
            (PendingStatus::Failed, Some(reason)) => format!("failed: {}", reason),
            (PendingStatus::Failed, None) => "failed".to_string(),
        }
    }
}

/// Ordered buffer of optimistic sends
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    entries: Vec<PendingMessage>,
}

impl PendingQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new entry in `sending` state and return its local id
    pub fn push(&mut self, body: String) -> String {
        let local_id = uuid::Uuid::new_v4().to_string();
        self.entries.push(PendingMessage {
            local_id: local_id.clone(),
            body,
            status: PendingStatus::Sending,
            queued_at: Utc::now(),
            error: None,
        });
        local_id
    }

    /// Mark an in-flight entry as sent
    ///
    /// Returns false if the entry is gone (already reconciled) or no longer sending.
    pub fn mark_sent(&mut self, local_id: &str) -> bool {
        match self.get_mut(local_id) {
            Some(entry) if entry.status == PendingStatus::Sending => {
                entry.status = PendingStatus::Sent;
                true
            }
            _ => false,
        }
    }

    /// Mark an in-flight entry as failed, keeping its body for resend
    pub fn mark_failed(&mut self, local_id: &str, reason: impl Into<String>) -> bool {
        match self.get_mut(local_id) {
            Some(entry) if entry.status == PendingStatus::Sending => {
                entry.status = PendingStatus::Failed;
                entry.error = Some(reason.into());
                true
            }
            _ => false,
        }
    }

    /// Drop the entry a confirmed row supersedes
    ///
    /// Rows carrying a client token match only the entry with that local id.
    /// Rows without one fall back to the first non-failed entry with the same
    /// body. Only the user's own rows are considered. Safe to call repeatedly
    /// or out of order: no match is a no-op.
    pub fn reconcile(&mut self, confirmed: &Message, self_profile_id: &str) -> Option<PendingMessage> {
        if confirmed.sender_id != self_profile_id {
            return None;
        }

        let position = match &confirmed.client_token {
            Some(token) => self.entries.iter().position(|e| &e.local_id == token),
            None => self
                .entries
                .iter()
                .position(|e| e.status != PendingStatus::Failed && e.body == confirmed.body),
        }?;

        let removed = self.entries.remove(position);
        debug!(
            "Pending {} superseded by confirmed message {}",
            removed.local_id, confirmed.id
        );
        Some(removed)
    }

    /// Drop every entry whose token appears among a refetched history window
    ///
    /// Body matching is not used here: a refetch returns old rows too, and
    /// identical text sent earlier must not clear a new entry.
    pub fn reconcile_history(&mut self, history: &[Message], self_profile_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            !history.iter().any(|m| {
                m.sender_id == self_profile_id
                    && m.client_token.as_deref() == Some(entry.local_id.as_str())
            })
        });
        before - self.entries.len()
    }

    /// Remove a failed entry, returning it (for resend or discard)
    pub fn take_failed(&mut self, local_id: &str) -> Option<PendingMessage> {
        let position = self
            .entries
            .iter()
            .position(|e| e.local_id == local_id && e.status == PendingStatus::Failed)?;
        Some(self.entries.remove(position))
    }

    /// Put a failed entry back in flight, keeping its local id
    ///
    /// The local id is the idempotency token, so a retried insert that races
    /// a late first attempt still yields one stored row. Returns the body to send.
    pub fn retry(&mut self, local_id: &str) -> Option<String> {
        match self.get_mut(local_id) {
            Some(entry) if entry.status == PendingStatus::Failed => {
                entry.status = PendingStatus::Sending;
                entry.error = None;
                Some(entry.body.clone())
            }
            _ => None,
        }
    }

    /// Remove an entry regardless of status
    pub fn remove(&mut self, local_id: &str) -> Option<PendingMessage> {
        let position = self.entries.iter().position(|e| e.local_id == local_id)?;
        Some(self.entries.remove(position))
    }

    /// Look up an entry by local id
    pub fn get(&self, local_id: &str) -> Option<&PendingMessage> {
        self.entries.iter().find(|e| e.local_id == local_id)
    }

    fn get_mut(&mut self, local_id: &str) -> Option<&mut PendingMessage> {
        self.entries.iter_mut().find(|e| e.local_id == local_id)
    }

    /// Entries in send order
    pub fn entries(&self) -> &[PendingMessage] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
