// SqliteStore Tests - message table, change feed and directory lookups

use crate::Error;
use crate::storage::{BookingStatus, ConversationKey, DeliveryStatus, InquiryStatus, NewMessage, SqliteStore};
use crate::store::{ChangeFilter, ChangeKind, Directory, HistoryPage, MessageStore};
use crate::tests::helpers::*;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

fn new_message(key: &ConversationKey, body: &str, token: Option<&str>) -> NewMessage {
    NewMessage::new(
        key.clone(),
        CUSTOMER_PROFILE.to_string(),
        PROVIDER_PROFILE.to_string(),
        body.to_string(),
        token.map(str::to_string),
    )
}

#[tokio::test]
async fn test_insert_assigns_id_and_timestamp() {
    let store = seeded_store().await;
    let stored = store
        .insert(new_message(&booking_key(), "Hello", None))
        .await
        .expect("Failed to insert");

    assert!(!stored.id.is_empty());
    assert!(!stored.read);
    assert_eq!(stored.delivery_status, Some(DeliveryStatus::Sent));
    assert_eq!(stored.conversation, booking_key());
}

#[tokio::test]
async fn test_list_orders_ascending_with_strict_timestamps() {
    let store = seeded_store().await;
    for i in 0..20 {
        post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, &format!("m{}", i)).await;
    }

    let messages = store
        .list(&booking_key(), HistoryPage::latest(100))
        .await
        .expect("Failed to list");
    assert_eq!(messages.len(), 20);
    assert!(messages.windows(2).all(|w| w[0].created_at < w[1].created_at));
    assert_eq!(messages[0].body, "m0");
    assert_eq!(messages[19].body, "m19");
}

#[tokio::test]
async fn test_list_pages_backward() {
    let store = seeded_store().await;
    for i in 0..5 {
        post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, &format!("m{}", i)).await;
    }

    let newest = store
        .list(&booking_key(), HistoryPage::latest(2))
        .await
        .expect("Failed to list");
    let bodies: Vec<&str> = newest.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["m3", "m4"]);

    let older = store
        .list(&booking_key(), HistoryPage::before(newest[0].created_at, 2))
        .await
        .expect("Failed to list");
    let bodies: Vec<&str> = older.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_list_is_scoped_to_conversation() {
    let store = seeded_store().await;
    post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "booking").await;
    post(&store, &inquiry_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "inquiry").await;

    let messages = store
        .list(&inquiry_key(), HistoryPage::latest(10))
        .await
        .expect("Failed to list");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "inquiry");
    assert_eq!(messages[0].delivery_status, None);
}

#[tokio::test]
async fn test_insert_same_token_returns_existing_row() {
    let store = seeded_store().await;
    let first = store
        .insert(new_message(&booking_key(), "Hello", Some("tok-1")))
        .await
        .expect("Failed to insert");
    let second = store
        .insert(new_message(&booking_key(), "Hello", Some("tok-1")))
        .await
        .expect("Failed to insert");

    assert_eq!(first.id, second.id);
    let messages = store
        .list(&booking_key(), HistoryPage::latest(10))
        .await
        .expect("Failed to list");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].client_token.as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn test_insert_rejects_bad_body_length() {
    let store = seeded_store().await;

    let empty = store.insert(new_message(&booking_key(), "", None)).await;
    assert!(matches!(empty, Err(Error::StoreInsert(_))));

    let long = "x".repeat(5001);
    let too_long = store.insert(new_message(&booking_key(), &long, None)).await;
    assert!(matches!(too_long, Err(Error::StoreInsert(_))));
}

#[tokio::test]
async fn test_insert_rejects_unknown_conversation() {
    let store = seeded_store().await;
    let result = store
        .insert(new_message(&ConversationKey::booking("missing"), "Hello", None))
        .await;
    assert!(matches!(result, Err(Error::StoreInsert(_))));
}

#[tokio::test]
async fn test_insert_bumps_inquiry_updated_at() {
    let store = seeded_store().await;
    let before = store
        .inquiry(INQUIRY_ID)
        .await
        .expect("Failed to load inquiry")
        .expect("Inquiry should exist");

    let stored = post(&store, &inquiry_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "Question").await;

    let after = store
        .inquiry(INQUIRY_ID)
        .await
        .expect("Failed to load inquiry")
        .expect("Inquiry should exist");
    assert_eq!(after.updated_at, stored.created_at);
    assert!(after.updated_at >= before.updated_at);
}

#[tokio::test]
async fn test_mark_read_is_idempotent() {
    let store = seeded_store().await;
    let a = post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "a").await;
    let b = post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "b").await;
    let ids = vec![a.id.clone(), b.id.clone()];

    let first = store.mark_read(&booking_key(), &ids).await.expect("Failed to mark read");
    let second = store.mark_read(&booking_key(), &ids).await.expect("Failed to mark read");
    assert_eq!(first, 2);
    assert_eq!(second, 0);

    let messages = store
        .list(&booking_key(), HistoryPage::latest(10))
        .await
        .expect("Failed to list");
    assert!(messages.iter().all(|m| m.read));
    assert!(messages.iter().all(|m| m.delivery_status == Some(DeliveryStatus::Read)));
}

#[tokio::test]
async fn test_mark_read_ignores_other_conversations() {
    let store = seeded_store().await;
    let msg = post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "a").await;

    let changed = store
        .mark_read(&inquiry_key(), &[msg.id.clone()])
        .await
        .expect("Failed to mark read");
    assert_eq!(changed, 0);
    assert_eq!(
        store.unread_count(&booking_key(), PROVIDER_PROFILE).await.expect("Failed to count"),
        1
    );
}

#[tokio::test]
async fn test_inquiry_mark_read_keeps_status_untracked() {
    let store = seeded_store().await;
    let msg = post(&store, &inquiry_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "q").await;

    store
        .mark_read(&inquiry_key(), &[msg.id.clone()])
        .await
        .expect("Failed to mark read");
    let latest = store
        .latest(&inquiry_key())
        .await
        .expect("Failed to load latest")
        .expect("Message should exist");
    assert!(latest.read);
    assert_eq!(latest.delivery_status, None);
}

#[tokio::test]
async fn test_mark_delivered_advances_only_sent() {
    let store = seeded_store().await;
    let a = post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "a").await;
    post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "b").await;
    store.mark_read(&booking_key(), &[a.id.clone()]).await.expect("Failed to mark read");

    let changed = store
        .mark_delivered(&booking_key(), PROVIDER_PROFILE)
        .await
        .expect("Failed to mark delivered");
    assert_eq!(changed, 1);

    let messages = store
        .list(&booking_key(), HistoryPage::latest(10))
        .await
        .expect("Failed to list");
    assert_eq!(messages[0].delivery_status, Some(DeliveryStatus::Read));
    assert_eq!(messages[1].delivery_status, Some(DeliveryStatus::Delivered));
}

#[tokio::test]
async fn test_latest_and_unread_count() {
    let store = seeded_store().await;
    assert!(store.latest(&booking_key()).await.expect("Failed to load latest").is_none());

    post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "one").await;
    post(&store, &booking_key(), PROVIDER_PROFILE, CUSTOMER_PROFILE, "two").await;
    post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "three").await;

    let latest = store
        .latest(&booking_key())
        .await
        .expect("Failed to load latest")
        .expect("Message should exist");
    assert_eq!(latest.body, "three");
    assert_eq!(store.unread_count(&booking_key(), PROVIDER_PROFILE).await.expect("Failed to count"), 2);
    assert_eq!(store.unread_count(&booking_key(), CUSTOMER_PROFILE).await.expect("Failed to count"), 1);
}

#[tokio::test]
async fn test_change_feed_filters_by_conversation() {
    let store = seeded_store().await;
    let mut feed = store
        .subscribe(ChangeFilter::Conversation(inquiry_key()))
        .await
        .expect("Failed to subscribe");

    post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "skip me").await;
    let stored = post(&store, &inquiry_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "see me").await;

    let event = feed.recv().await.expect("Feed failed").expect("Feed closed");
    assert_eq!(event.kind, ChangeKind::Insert);
    assert_eq!(event.message.id, stored.id);
}

#[tokio::test]
async fn test_change_feed_reports_updates() {
    let store = seeded_store().await;
    let stored = post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "hi").await;
    let mut feed = store
        .subscribe(ChangeFilter::Participant(CUSTOMER_PROFILE.to_string()))
        .await
        .expect("Failed to subscribe");

    store
        .mark_read(&booking_key(), &[stored.id.clone()])
        .await
        .expect("Failed to mark read");

    let event = feed.recv().await.expect("Feed failed").expect("Feed closed");
    assert_eq!(event.kind, ChangeKind::Update);
    assert!(event.message.read);
}

#[tokio::test]
async fn test_change_feed_participant_filter() {
    let store = seeded_store().await;
    add_booking(&store, "booking_2", OTHER_CUSTOMER_ACCOUNT, BookingStatus::Accepted).await;
    let mut feed = store
        .subscribe(ChangeFilter::Participant(CUSTOMER_PROFILE.to_string()))
        .await
        .expect("Failed to subscribe");

    post(
        &store,
        &ConversationKey::booking("booking_2"),
        OTHER_CUSTOMER_PROFILE,
        PROVIDER_PROFILE,
        "not for you",
    )
    .await;
    let mine = post(&store, &booking_key(), PROVIDER_PROFILE, CUSTOMER_PROFILE, "for you").await;

    let event = feed.recv().await.expect("Feed failed").expect("Feed closed");
    assert_eq!(event.message.id, mine.id);
}

#[tokio::test]
async fn test_disconnect_closes_feeds() {
    let store = seeded_store().await;
    let mut feed = store.subscribe(ChangeFilter::All).await.expect("Failed to subscribe");
    assert_eq!(store.subscriber_count().await, 1);

    store.disconnect_subscribers().await;
    assert!(feed.recv().await.expect("Feed failed").is_none());
    assert_eq!(store.subscriber_count().await, 0);

    drop(feed);
    let _fresh = store.subscribe(ChangeFilter::All).await.expect("Failed to subscribe");
    assert_eq!(store.subscriber_count().await, 1);
}

#[tokio::test]
async fn test_lagging_feed_reports_error() {
    let store = seeded_store().await;
    let mut feed = store.subscribe(ChangeFilter::All).await.expect("Failed to subscribe");

    for i in 0..300 {
        post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, &format!("m{}", i)).await;
    }

    let result = feed.recv().await;
    assert!(matches!(result, Err(Error::Subscription(_))));
}

#[tokio::test]
async fn test_directory_lookups() {
    let store = seeded_store().await;

    let profile = store
        .profile_for_account(CUSTOMER_ACCOUNT)
        .await
        .expect("Failed to look up profile")
        .expect("Profile should exist");
    assert_eq!(profile.id, CUSTOMER_PROFILE);
    assert_eq!(
        store.profile(PROVIDER_PROFILE).await.expect("Failed to look up profile").map(|p| p.account_id),
        Some(PROVIDER_ACCOUNT.to_string())
    );

    let provider = store
        .provider_for_account(PROVIDER_ACCOUNT)
        .await
        .expect("Failed to look up provider")
        .expect("Provider should exist");
    assert_eq!(provider.id, PROVIDER_ID);
    assert!(store.provider_for_account(CUSTOMER_ACCOUNT).await.expect("Failed to look up provider").is_none());

    assert!(store.booking("missing").await.expect("Failed to look up booking").is_none());
}

#[tokio::test]
async fn test_booking_queries_filter_by_status() {
    let store = seeded_store().await;
    add_booking(&store, "booking_done", CUSTOMER_ACCOUNT, BookingStatus::Completed).await;
    add_booking(&store, "booking_new", CUSTOMER_ACCOUNT, BookingStatus::Pending).await;

    let active = store
        .bookings_for_provider(PROVIDER_ID, &[BookingStatus::Accepted])
        .await
        .expect("Failed to list bookings");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, BOOKING_ID);

    let visible = store
        .bookings_for_customer(CUSTOMER_ACCOUNT, &[BookingStatus::Accepted, BookingStatus::Completed])
        .await
        .expect("Failed to list bookings");
    let ids: Vec<&str> = visible.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec!["booking_1", "booking_done"]);
}

#[tokio::test]
async fn test_status_updates() {
    let store = seeded_store().await;

    assert_ok!(store.set_booking_status(BOOKING_ID, BookingStatus::Completed).await);
    let booking = store
        .booking(BOOKING_ID)
        .await
        .expect("Failed to look up booking")
        .expect("Booking should exist");
    assert_eq!(booking.status, BookingStatus::Completed);

    assert_ok!(store.set_inquiry_status(INQUIRY_ID, InquiryStatus::Closed).await);
    let inquiries = store
        .inquiries_for_customer(CUSTOMER_ACCOUNT)
        .await
        .expect("Failed to list inquiries");
    assert!(inquiries[0].is_read_only());

    assert_err!(store.set_booking_status("missing", BookingStatus::Completed).await);
}

#[tokio::test]
async fn test_file_store_persists_and_keeps_order() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("chat.db");

    let last = {
        let store = SqliteStore::new(&path).expect("Failed to open store");
        add_booking(&store, BOOKING_ID, CUSTOMER_ACCOUNT, BookingStatus::Accepted).await;
        post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "first").await
    };

    let store = SqliteStore::new(&path).expect("Failed to reopen store");
    let next = post(&store, &booking_key(), CUSTOMER_PROFILE, PROVIDER_PROFILE, "second").await;
    assert!(next.created_at > last.created_at);

    let messages = store
        .list(&booking_key(), HistoryPage::latest(10))
        .await
        .expect("Failed to list");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].body, "first");
}
