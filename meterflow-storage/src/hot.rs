//! Hot event store
//!
//! Write-optimised sled store holding raw usage events between ingest and
//! migration. Two trees: `events` maps the client-chosen idempotency key to
//! the serialized event, and `pending` is a secondary index keyed by
//! `(ingested_at nanos BE, event id)` so unprocessed scans come back in a
//! deterministic order. Both trees are written in one sled transaction so a
//! crash never leaves an event invisible to the migration worker.

use std::path::Path;

use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::debug;

use meterflow_core::config::HotStoreConfig;
use meterflow_core::errors::{StoreError, StoreResult};
use meterflow_core::model::HotUsageEvent;

const EVENTS_TREE: &str = "events";
const PENDING_TREE: &str = "pending";

/// Write-optimised store for raw events awaiting migration
pub struct HotEventStore {
    db: sled::Db,
    events: sled::Tree,
    pending: sled::Tree,
}

impl HotEventStore {
    pub fn open(config: &HotStoreConfig) -> StoreResult<Self> {
        let db = sled::Config::new()
            .path(&config.data_dir)
            .flush_every_ms(Some(config.flush_every_ms))
            .open()?;
        Self::from_db(db)
    }

    /// Open at an explicit path; used by tests with temporary directories.
    pub fn open_at(path: &Path) -> StoreResult<Self> {
        let db = sled::Config::new().path(path).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        let events = db.open_tree(EVENTS_TREE)?;
        let pending = db.open_tree(PENDING_TREE)?;
        Ok(Self { db, events, pending })
    }

    fn pending_key(event: &HotUsageEvent) -> [u8; 24] {
        let nanos = event
            .ingested_at
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX)
            .max(0) as u64;
        let mut key = [0u8; 24];
        key[..8].copy_from_slice(&nanos.to_be_bytes());
        key[8..].copy_from_slice(event.id.as_bytes());
        key
    }

    /// Insert an event; fails with `DuplicateKey` when the idempotency key
    /// already exists.
    pub fn put(&self, event: &HotUsageEvent) -> StoreResult<()> {
        let value = serde_json::to_vec(event)?;
        let key = event.idempotency_key.as_bytes().to_vec();
        let pending_key = Self::pending_key(event).to_vec();

        let result: Result<(), TransactionError<StoreError>> =
            (&self.events, &self.pending).transaction(move |(events, pending)| {
                if events.get(&key)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        StoreError::DuplicateKey {
                            key: String::from_utf8_lossy(&key).into_owned(),
                        },
                    ));
                }
                events.insert(key.as_slice(), value.as_slice())?;
                pending.insert(pending_key.as_slice(), key.as_slice())?;
                Ok(())
            });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StoreError::Hot(e)),
        }
    }

    pub fn exists(&self, idempotency_key: &str) -> StoreResult<bool> {
        Ok(self.events.contains_key(idempotency_key.as_bytes())?)
    }

    pub fn get(&self, idempotency_key: &str) -> StoreResult<Option<HotUsageEvent>> {
        match self.events.get(idempotency_key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Unprocessed events in `(ingested_at, id)` order, up to `limit`.
    pub fn scan_unprocessed(&self, limit: usize) -> StoreResult<Vec<HotUsageEvent>> {
        let mut batch = Vec::with_capacity(limit.min(1024));
        for entry in self.pending.iter() {
            if batch.len() >= limit {
                break;
            }
            let (_, event_key) = entry?;
            // A pending entry can outlive its event briefly during cleanup
            if let Some(bytes) = self.events.get(&event_key)? {
                batch.push(serde_json::from_slice::<HotUsageEvent>(&bytes)?);
            } else {
                self.pending_remove(&event_key)?;
            }
        }
        Ok(batch)
    }

    fn pending_remove(&self, event_key: &[u8]) -> StoreResult<()> {
        // Rebuild the index key from the stored record when available;
        // otherwise sweep matching values.
        if let Some(bytes) = self.events.get(event_key)? {
            let event: HotUsageEvent = serde_json::from_slice(&bytes)?;
            self.pending.remove(Self::pending_key(&event))?;
            return Ok(());
        }
        for entry in self.pending.iter() {
            let (index_key, value) = entry?;
            if value == event_key {
                self.pending.remove(index_key)?;
            }
        }
        Ok(())
    }

    /// Mark events as migrated. Re-marking an already processed event is a
    /// no-op, so overlapping migration runs are safe.
    pub fn mark_processed(
        &self,
        events: &[HotUsageEvent],
        processed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        for event in events {
            if let Some(bytes) = self.events.get(event.idempotency_key.as_bytes())? {
                let mut stored: HotUsageEvent = serde_json::from_slice(&bytes)?;
                if stored.processed_at.is_none() {
                    stored.processed_at = Some(processed_at);
                    self.events.insert(
                        event.idempotency_key.as_bytes(),
                        serde_json::to_vec(&stored)?,
                    )?;
                }
            }
            self.pending.remove(Self::pending_key(event))?;
        }
        Ok(())
    }

    /// Delete processed events older than the cutoff; returns how many rows
    /// were removed.
    pub fn delete_processed_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut deleted = 0u64;
        for entry in self.events.iter() {
            let (key, bytes) = entry?;
            let event: HotUsageEvent = serde_json::from_slice(&bytes)?;
            match event.processed_at {
                Some(processed_at) if processed_at < cutoff => {
                    self.events.remove(key)?;
                    self.pending.remove(Self::pending_key(&event))?;
                    deleted += 1;
                }
                _ => {}
            }
        }
        if deleted > 0 {
            debug!(deleted, "hot store cleanup removed processed events");
        }
        Ok(deleted)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn total_len(&self) -> usize {
        self.events.len()
    }

    /// Every event currently held, processed or not. The hot store only ever
    /// holds a few days of events, so reconciliation reads it whole.
    pub fn all_events(&self) -> StoreResult<Vec<HotUsageEvent>> {
        let mut events = Vec::with_capacity(self.events.len());
        for entry in self.events.iter() {
            let (_, bytes) = entry?;
            events.push(serde_json::from_slice::<HotUsageEvent>(&bytes)?);
        }
        Ok(events)
    }

    /// Cheap liveness probe for the health endpoint.
    pub fn ping(&self) -> StoreResult<()> {
        self.events.contains_key(b"__ping__")?;
        Ok(())
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn event(key: &str, ingested_at: DateTime<Utc>) -> HotUsageEvent {
        HotUsageEvent {
            id: Uuid::new_v4(),
            organisation_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            metric_name: "api_calls".to_string(),
            metric_value: Decimal::ONE,
            unit: "count".to_string(),
            timestamp: ingested_at,
            metadata: None,
            idempotency_key: key.to_string(),
            ingested_at,
            processed_at: None,
        }
    }

    fn open_store() -> (tempfile::TempDir, HotEventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HotEventStore::open_at(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_rejects_duplicate_keys() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store.put(&event("e1", now)).unwrap();
        match store.put(&event("e1", now)) {
            Err(StoreError::DuplicateKey { key }) => assert_eq!(key, "e1"),
            other => panic!("expected duplicate key, got {other:?}"),
        }
        assert!(store.exists("e1").unwrap());
        assert!(!store.exists("e2").unwrap());
    }

    #[test]
    fn scan_returns_ingest_order() {
        let (_dir, store) = open_store();
        let base = Utc::now();
        store.put(&event("late", base + Duration::seconds(2))).unwrap();
        store.put(&event("early", base)).unwrap();
        store.put(&event("middle", base + Duration::seconds(1))).unwrap();

        let batch = store.scan_unprocessed(10).unwrap();
        let keys: Vec<_> = batch.iter().map(|e| e.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["early", "middle", "late"]);

        let limited = store.scan_unprocessed(2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn mark_processed_removes_from_pending() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let e1 = event("e1", now);
        let e2 = event("e2", now + Duration::seconds(1));
        store.put(&e1).unwrap();
        store.put(&e2).unwrap();

        store.mark_processed(&[e1.clone()], Utc::now()).unwrap();
        let remaining = store.scan_unprocessed(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].idempotency_key, "e2");
        assert!(store.get("e1").unwrap().unwrap().processed_at.is_some());

        // Re-marking is a no-op
        store.mark_processed(&[e1], Utc::now()).unwrap();
        assert_eq!(store.scan_unprocessed(10).unwrap().len(), 1);
    }

    #[test]
    fn cleanup_removes_only_old_processed_events() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let old = event("old", now - Duration::days(10));
        let fresh = event("fresh", now);
        let unprocessed = event("unprocessed", now - Duration::days(10));
        store.put(&old).unwrap();
        store.put(&fresh).unwrap();
        store.put(&unprocessed).unwrap();

        store
            .mark_processed(&[old.clone()], now - Duration::days(9))
            .unwrap();
        store.mark_processed(&[fresh.clone()], now).unwrap();

        let deleted = store
            .delete_processed_older_than(now - Duration::days(7))
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!store.exists("old").unwrap());
        assert!(store.exists("fresh").unwrap());
        assert!(store.exists("unprocessed").unwrap());
        assert_eq!(store.pending_len(), 1);
    }
}
