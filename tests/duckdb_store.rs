//! DuckDB-backed persistence, behind the `duckdb-store` feature.
#![cfg(feature = "duckdb-store")]

use chrono::{Duration, Utc};

use palaver::store::duckdb::DuckDbStore;
use palaver::store::schema::{apply_migrations, usage_uid, CURRENT_VERSION};
use palaver::store::{
    Account, AccountStore, HistoryEntry, HistoryStore, Role, Tier, UsageLedger, UsageRecord,
};

fn record(user: &str, model: &str, completion_tokens: u64, at: chrono::DateTime<Utc>) -> UsageRecord {
    UsageRecord {
        user_id: user.to_string(),
        model: model.to_string(),
        prompt_tokens: 10,
        completion_tokens,
        estimated: false,
        at,
    }
}

#[tokio::test]
async fn history_is_replaced_and_ordered() {
    let store = DuckDbStore::open(None).unwrap();

    let first = vec![HistoryEntry::user("one"), HistoryEntry::assistant("two")];
    store.save("c1", &first).await.unwrap();
    let mut longer = first.clone();
    longer.push(HistoryEntry::user("three"));
    store.save("c1", &longer).await.unwrap();
    store.save("c2", &[HistoryEntry::user("other")]).await.unwrap();

    let loaded = store.load("c1").await.unwrap();
    assert_eq!(loaded, longer);
    assert_eq!(loaded[1].role, Role::Assistant);
    assert!(store.load("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn accounts_round_trip_and_adjust_with_floor() {
    let store = DuckDbStore::open(None).unwrap();
    assert_eq!(store.get("alice").await.unwrap(), None);

    let expires = Utc::now() + Duration::days(3);
    let mut alice = Account::new("alice");
    alice.points = 5.0;
    alice.balance = 1.0;
    alice.tier = Tier::Standard;
    alice.tier_expires_at = Some(expires);
    store.upsert_account(alice).await.unwrap();

    let loaded = store.get("alice").await.unwrap().unwrap();
    assert_eq!(loaded.tier, Tier::Standard);
    assert_eq!(
        loaded.tier_expires_at.map(|t| t.timestamp_millis()),
        Some(expires.timestamp_millis())
    );

    assert_eq!(store.add_points("alice", -2.0).await.unwrap(), 3.0);
    assert_eq!(store.add_points("alice", -10.0).await.unwrap(), 0.0);
    assert_eq!(store.add_balance("alice", 0.5).await.unwrap(), 1.5);
    assert!(store.add_balance("bob", 1.0).await.is_err());
}

#[tokio::test]
async fn count_today_ignores_other_days_models_and_users() {
    let store = DuckDbStore::open(None).unwrap();
    let now = Utc::now();

    store.record(record("u1", "m", 1, now)).await.unwrap();
    store.record(record("u1", "m", 2, now)).await.unwrap();
    store.record(record("u1", "m", 3, now - Duration::days(2))).await.unwrap();
    store.record(record("u1", "other", 4, now)).await.unwrap();
    store.record(record("u2", "m", 5, now)).await.unwrap();

    assert_eq!(store.count_today("u1", "m").await.unwrap(), 2);
    assert_eq!(store.count_today("u2", "m").await.unwrap(), 1);
    assert_eq!(store.count_today("u3", "m").await.unwrap(), 0);
}

#[tokio::test]
async fn replayed_usage_record_is_rejected() {
    let store = DuckDbStore::open(None).unwrap();
    let rec = record("u1", "m", 7, Utc::now());

    store.record(rec.clone()).await.unwrap();
    assert!(store.record(rec).await.is_err());
    assert_eq!(store.count_today("u1", "m").await.unwrap(), 1);
}

#[tokio::test]
async fn file_database_persists_across_reopen() {
    let dir = std::env::temp_dir().join(format!("palaver-db-{}", uuid::Uuid::new_v4()));
    let path = dir.join("nested").join("palaver.duckdb");

    {
        let store = DuckDbStore::open(Some(path.clone())).unwrap();
        store.save("c1", &[HistoryEntry::user("kept")]).await.unwrap();
    }

    let store = DuckDbStore::open(Some(path)).unwrap();
    assert_eq!(store.load("c1").await.unwrap(), vec![HistoryEntry::user("kept")]);
    drop(store);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn migrations_are_idempotent() {
    let conn = duckdb::Connection::open_in_memory().unwrap();
    assert_eq!(apply_migrations(&conn).unwrap(), CURRENT_VERSION);
    assert_eq!(apply_migrations(&conn).unwrap(), CURRENT_VERSION);
}

#[test]
fn usage_uid_is_stable_and_field_sensitive() {
    let a = usage_uid("u1", 1_700_000_000_000, "m", 10, 20);
    assert_eq!(a, usage_uid("u1", 1_700_000_000_000, "m", 10, 20));
    assert_eq!(a.len(), 16);
    assert_ne!(a, usage_uid("u1", 1_700_000_000_000, "m", 10, 21));
}
