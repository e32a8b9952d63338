//! Hot event store pipeline behaviour, hermetic against a temporary sled
//! directory: idempotent puts, deterministic scans, processed marking and
//! retention cleanup.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use meterflow_core::errors::StoreError;
use meterflow_core::model::HotUsageEvent;
use meterflow_storage::HotEventStore;

fn event(key: &str, offset_secs: i64) -> HotUsageEvent {
    let ingested_at = Utc::now() + Duration::seconds(offset_secs);
    HotUsageEvent {
        id: Uuid::new_v4(),
        organisation_id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        metric_name: "api_calls".to_string(),
        metric_value: Decimal::ONE,
        unit: "count".to_string(),
        timestamp: ingested_at,
        metadata: Some(serde_json::json!({ "region": "ap-south-1" })),
        idempotency_key: key.to_string(),
        ingested_at,
        processed_at: None,
    }
}

/// Duplicate ingest: repeating the same event id leaves exactly one stored
/// event, and the second attempt reports the duplicate.
#[test]
fn duplicate_event_ids_store_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = HotEventStore::open_at(dir.path()).unwrap();

    store.put(&event("e1", 0)).unwrap();
    match store.put(&event("e1", 1)) {
        Err(StoreError::DuplicateKey { key }) => assert_eq!(key, "e1"),
        other => panic!("expected duplicate, got {other:?}"),
    }
    assert_eq!(store.total_len(), 1);
    assert_eq!(store.pending_len(), 1);

    let stored = store.get("e1").unwrap().unwrap();
    assert_eq!(stored.metric_name, "api_calls");
    assert_eq!(
        stored.metadata.unwrap()["region"],
        serde_json::json!("ap-south-1")
    );
}

/// Migration safety, hot side: only marked events leave the pending scan,
/// and marking is idempotent under overlapping runs.
#[test]
fn mark_processed_is_idempotent_and_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let store = HotEventStore::open_at(dir.path()).unwrap();

    let first = event("a", 0);
    let second = event("b", 5);
    let third = event("c", 10);
    store.put(&third).unwrap();
    store.put(&first).unwrap();
    store.put(&second).unwrap();

    let batch = store.scan_unprocessed(2).unwrap();
    let keys: Vec<_> = batch.iter().map(|e| e.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b"]);

    store.mark_processed(&batch, Utc::now()).unwrap();
    store.mark_processed(&batch, Utc::now()).unwrap();

    let remaining = store.scan_unprocessed(10).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].idempotency_key, "c");

    // Marked rows keep their processed_at stamp
    assert!(store.get("a").unwrap().unwrap().processed_at.is_some());
    assert!(store.get("c").unwrap().unwrap().processed_at.is_none());
}

/// Cleanup deletes only processed events older than the retention cutoff.
#[test]
fn retention_cleanup_spares_recent_and_unprocessed_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = HotEventStore::open_at(dir.path()).unwrap();

    let old_processed = event("old", -86_400 * 10);
    let old_unprocessed = event("stuck", -86_400 * 10);
    let recent = event("recent", 0);
    store.put(&old_processed).unwrap();
    store.put(&old_unprocessed).unwrap();
    store.put(&recent).unwrap();

    store
        .mark_processed(std::slice::from_ref(&old_processed), Utc::now() - Duration::days(9))
        .unwrap();
    store
        .mark_processed(std::slice::from_ref(&recent), Utc::now())
        .unwrap();

    let deleted = store
        .delete_processed_older_than(Utc::now() - Duration::days(7))
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(!store.exists("old").unwrap());
    assert!(store.exists("stuck").unwrap());
    assert!(store.exists("recent").unwrap());
}
