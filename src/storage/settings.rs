//! Chat settings and configuration

use crate::{
    Error, Result,
    storage::{conversation::BookingStatus, message::MAX_BODY_CHARS},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a session applies live change events to its message list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Re-list the loaded window on every event
    #[default]
    Refetch,
    /// Upsert the event's row into the loaded window
    Incremental,
}

/// Reconnect-with-backoff policy for live subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between retries, in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier applied per attempt
    pub backoff_multiplier: f64,
    /// Maximum number of retries (None = unbounded)
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate delay for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Check if we should retry after the given number of attempts
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_retries.is_none_or(|max| attempts < max)
    }
}

/// Chat settings
///
/// Settings are stored in JSON format and can be loaded/saved from disk.
/// Missing fields fall back to their defaults.
///
/// # Example
/// ```rust,no_run
/// use marketchat::storage::ChatSettings;
///
/// let mut settings = ChatSettings::load("chat.json").expect("Failed to load");
/// settings.typing_timeout_ms = 3_000;
/// settings.save("chat.json").expect("Failed to save");
///
/// println!("Store timeout: {:?}", settings.store_timeout());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Upper bound on message body length, in characters
    pub max_body_chars: usize,
    /// Messages per history page (initial load and each older page)
    pub history_page_size: usize,
    /// Timeout applied to every store call, in milliseconds
    pub store_timeout_ms: u64,
    /// How long a typing signal stays visible without a refresh, in milliseconds
    pub typing_timeout_ms: u64,
    /// Subscription reconnect policy
    pub reconnect: ReconnectPolicy,
    /// Booking statuses that show up in conversation lists
    pub active_booking_statuses: Vec<BookingStatus>,
    /// How sessions apply live events
    pub sync_mode: SyncMode,
    /// Advance incoming messages to `delivered` when the inbox refreshes
    pub acknowledge_delivery: bool,
}

impl ChatSettings {
    /// Load settings from a JSON file
    ///
    /// # Arguments
    /// * `path` - Path to the settings file
    ///
    /// # Returns
    /// The loaded settings, or default settings if the file doesn't exist or is empty
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Store(format!("Failed to read settings: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: Self = serde_json::from_str(&data)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check values that would otherwise fail later at send time
    ///
    /// `max_body_chars` must lie in `1..=MAX_BODY_CHARS`: a larger value would
    /// let the composer accept bodies every insert then rejects.
    pub fn validate(&self) -> Result<()> {
        if self.max_body_chars == 0 || self.max_body_chars > MAX_BODY_CHARS {
            return Err(Error::Config(format!(
                "max_body_chars must be between 1 and {}, got {}",
                MAX_BODY_CHARS, self.max_body_chars
            )));
        }
        Ok(())
    }

    /// Save settings to a JSON file, creating parent directories as needed
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;

        Ok(())
    }

    /// Store call timeout as a `Duration`
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Typing indicator timeout as a `Duration`
    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_body_chars: MAX_BODY_CHARS,
            history_page_size: 50,
            store_timeout_ms: 10_000,
            typing_timeout_ms: 4_000,
            reconnect: ReconnectPolicy::default(),
            active_booking_statuses: vec![BookingStatus::Accepted],
            sync_mode: SyncMode::Refetch,
            acknowledge_delivery: true,
        }
    }
}
