// Settings Tests - Testing ChatSettings and ReconnectPolicy

use crate::Error;
use crate::storage::{BookingStatus, ChatSettings, ReconnectPolicy, SyncMode};
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

#[test]
fn test_settings_default() {
    let settings = ChatSettings::default();

    assert_eq!(settings.max_body_chars, 5000);
    assert_eq!(settings.history_page_size, 50);
    assert_eq!(settings.store_timeout(), Duration::from_secs(10));
    assert_eq!(settings.typing_timeout(), Duration::from_secs(4));
    assert_eq!(settings.active_booking_statuses, vec![BookingStatus::Accepted]);
    assert_eq!(settings.sync_mode, SyncMode::Refetch);
    assert!(settings.acknowledge_delivery);
}

#[test]
fn test_settings_save_and_load() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");

    let settings = ChatSettings {
        history_page_size: 20,
        sync_mode: SyncMode::Incremental,
        ..ChatSettings::default()
    };
    settings.save(temp_file.path()).expect("Failed to save settings");

    let loaded = ChatSettings::load(temp_file.path()).expect("Failed to load settings");
    assert_eq!(loaded, settings);
}

#[test]
fn test_settings_load_missing_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let loaded = ChatSettings::load(dir.path().join("absent.json")).expect("Failed to load settings");
    assert_eq!(loaded, ChatSettings::default());
}

#[test]
fn test_settings_load_empty_file() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let loaded = ChatSettings::load(temp_file.path()).expect("Failed to load settings");
    assert_eq!(loaded, ChatSettings::default());
}

#[test]
fn test_settings_partial_json_uses_defaults() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    std::fs::write(
        temp_file.path(),
        r#"{"typing_timeout_ms": 1500, "reconnect": {"max_retries": 3}}"#,
    )
    .expect("Failed to write settings");

    let loaded = ChatSettings::load(temp_file.path()).expect("Failed to load settings");
    assert_eq!(loaded.typing_timeout_ms, 1500);
    assert_eq!(loaded.reconnect.max_retries, Some(3));
    assert_eq!(loaded.reconnect.initial_delay_ms, 500);
    assert_eq!(loaded.history_page_size, 50);
}

#[test]
fn test_settings_load_invalid_json() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    std::fs::write(temp_file.path(), "{ not json").expect("Failed to write settings");
    assert!(ChatSettings::load(temp_file.path()).is_err());
}

#[test]
fn test_settings_body_limit_above_store_rejected() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    std::fs::write(temp_file.path(), r#"{"max_body_chars": 6000}"#).expect("Failed to write settings");
    assert!(matches!(ChatSettings::load(temp_file.path()), Err(Error::Config(_))));

    std::fs::write(temp_file.path(), r#"{"max_body_chars": 0}"#).expect("Failed to write settings");
    assert!(matches!(ChatSettings::load(temp_file.path()), Err(Error::Config(_))));

    std::fs::write(temp_file.path(), r#"{"max_body_chars": 280}"#).expect("Failed to write settings");
    let loaded = ChatSettings::load(temp_file.path()).expect("Failed to load settings");
    assert_eq!(loaded.max_body_chars, 280);
    assert!(ChatSettings::default().validate().is_ok());
}

#[test]
fn test_settings_save_creates_parent_dirs() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("nested").join("chat.json");

    ChatSettings::default().save(&path).expect("Failed to save settings");
    assert!(path.exists());
}

#[test]
fn test_reconnect_backoff() {
    let policy = ReconnectPolicy::default();

    assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
    assert_eq!(policy.delay_for_attempt(20), Duration::from_millis(30_000));
}

#[test]
fn test_reconnect_retry_limit() {
    let unbounded = ReconnectPolicy::default();
    assert!(unbounded.should_retry(0));
    assert!(unbounded.should_retry(10_000));

    let bounded = ReconnectPolicy {
        max_retries: Some(2),
        ..ReconnectPolicy::default()
    };
    assert!(bounded.should_retry(0));
    assert!(bounded.should_retry(1));
    assert!(!bounded.should_retry(2));
}
