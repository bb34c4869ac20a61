use super::*;
use chrono::TimeZone;
use fintrack_shared::domain::{DeliveryState, MessageId};

fn message(sender: &str, body: &str, at_secs: i64) -> Message {
    Message {
        id: MessageId::provisional(),
        sender_id: UserId::new(sender),
        recipient_id: UserId::new("support"),
        sender_display_name: None,
        body: body.to_string(),
        encrypted_on_wire: false,
        timestamp: Utc.timestamp_opt(at_secs, 0).single().expect("timestamp"),
        delivery: DeliveryState::Confirmed,
        broadcast: false,
    }
}

#[tokio::test]
async fn history_round_trips_per_principal() {
    let cache = MessageCache::open("sqlite::memory:").await.expect("open");
    let alice = UserId::new("alice");
    let bob = UserId::new("bob");

    cache
        .save_history(&alice, &[message("alice", "hello", 1)])
        .await
        .expect("save");
    cache
        .save_history(&bob, &[message("bob", "other", 2), message("bob", "more", 3)])
        .await
        .expect("save");

    let loaded = cache.load_history(&alice).await.expect("load");
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].body, "hello");

    // Full overwrite, not append.
    cache
        .save_history(&alice, &[message("alice", "rewritten", 4)])
        .await
        .expect("save");
    let loaded = cache.load_history(&alice).await.expect("load");
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].body, "rewritten");

    assert_eq!(cache.load_history(&bob).await.expect("load").len(), 2);
}

#[tokio::test]
async fn missing_principal_yields_empty_history() {
    let cache = MessageCache::open("sqlite::memory:").await.expect("open");
    let history = cache
        .load_history(&UserId::new("nobody"))
        .await
        .expect("load");
    assert!(history.is_empty());
}

#[tokio::test]
async fn corrupt_history_is_treated_as_empty() {
    let cache = MessageCache::open("sqlite::memory:").await.expect("open");
    sqlx::query("INSERT INTO conversations (principal_id, history) VALUES (?, ?)")
        .bind("mallory")
        .bind("{this is not json")
        .execute(&cache.pool)
        .await
        .expect("seed corrupt row");

    let history = cache
        .load_history(&UserId::new("mallory"))
        .await
        .expect("load must not fail on corruption");
    assert!(history.is_empty());
}

#[tokio::test]
async fn watermark_round_trips_and_survives_history_writes() {
    let cache = MessageCache::open("sqlite::memory:").await.expect("open");
    let alice = UserId::new("alice");
    let at = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");

    cache.save_watermark(&alice, at).await.expect("save");
    cache
        .save_history(&alice, &[message("alice", "hi", 1)])
        .await
        .expect("save history");

    assert_eq!(cache.load_watermark(&alice).await.expect("load"), Some(at));
}

#[tokio::test]
async fn corrupt_watermark_is_treated_as_unset() {
    let cache = MessageCache::open("sqlite::memory:").await.expect("open");
    sqlx::query("INSERT INTO conversations (principal_id, watermark) VALUES (?, ?)")
        .bind("mallory")
        .bind("yesterday-ish")
        .execute(&cache.pool)
        .await
        .expect("seed corrupt row");

    assert_eq!(
        cache
            .load_watermark(&UserId::new("mallory"))
            .await
            .expect("load"),
        None
    );
}

#[tokio::test]
async fn clear_wipes_one_principal_only() {
    let cache = MessageCache::open("sqlite::memory:").await.expect("open");
    let alice = UserId::new("alice");
    let bob = UserId::new("bob");
    cache
        .save_history(&alice, &[message("alice", "hi", 1)])
        .await
        .expect("save");
    cache
        .save_history(&bob, &[message("bob", "yo", 2)])
        .await
        .expect("save");

    cache.clear(&alice).await.expect("clear");

    assert!(cache.load_history(&alice).await.expect("load").is_empty());
    assert_eq!(cache.load_watermark(&alice).await.expect("load"), None);
    assert_eq!(cache.load_history(&bob).await.expect("load").len(), 1);
}

#[tokio::test]
async fn open_creates_parent_directory_for_file_urls() {
    let root = tempfile::tempdir().expect("tempdir");
    let db_path = root.path().join("nested").join("chat.db");
    let url = format!("sqlite://{}", db_path.display());

    let cache = MessageCache::open(&url).await.expect("open");
    cache.health_check().await.expect("ping");
    assert!(db_path.parent().expect("parent").exists());
}
