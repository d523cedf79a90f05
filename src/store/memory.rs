//! In-process lease store.
//!
//! Mirrors the Redis access pattern closely enough to exercise the lifecycle
//! without a server: hashes keyed by `<prefix><id>`, per-key expiry measured
//! on the Tokio clock, and guarded writes that never recreate a missing key.
//! [`MemoryLeaseStore::set_field`] is the one unguarded write. Faults
//! can be injected per operation, and every mutating call is recorded in an
//! event log so tests can assert on ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Result, WorkerError};
use crate::lease::{
    format_timestamp, lease_key, LeaseRecord, LeaseStatus, WorkerId, FIELD_LAST_HEARTBEAT,
    FIELD_STATUS,
};
use crate::store::{LeaseStore, StoreConnector};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Connect,
    Ping,
    Publish,
    ReadStatus,
    Renew,
    MarkShuttingDown,
    Delete,
}

/// One mutating call as observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Published { key: String, ttl: Duration },
    Renewed { key: String, last_heartbeat: String, ttl: Duration },
    MarkedShuttingDown { key: String, ttl: Duration },
    Deleted { key: String },
    Closed,
}

#[derive(Debug)]
struct Entry {
    fields: HashMap<String, String>,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expire_in(&mut self, ttl: Duration) {
        self.ttl = Some(ttl);
        self.expires_at = Some(Instant::now() + ttl);
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Remaining injected failures per operation; `None` fails forever
    faults: HashMap<StoreOp, Option<u32>>,
    events: Vec<StoreEvent>,
    connects: u32,
    closed: bool,
}

impl State {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
    }

    fn check(&mut self, op: StoreOp) -> Result<()> {
        if self.closed && op != StoreOp::Connect {
            return Err(WorkerError::StoreOperation("connection closed".to_string()));
        }
        let exhausted = match self.faults.get_mut(&op) {
            None => return Ok(()),
            Some(None) => false,
            Some(Some(0)) => true,
            Some(Some(n)) => {
                *n -= 1;
                false
            }
        };
        if exhausted {
            self.faults.remove(&op);
            return Ok(());
        }
        Err(WorkerError::StoreOperation(format!(
            "injected {:?} failure",
            op
        )))
    }
}

/// Shared-state lease store. Clones observe the same data.
#[derive(Debug, Clone)]
pub struct MemoryLeaseStore {
    state: Arc<Mutex<State>>,
    key_prefix: String,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new("worker:")
    }
}

impl MemoryLeaseStore {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, id: &WorkerId) -> String {
        lease_key(&self.key_prefix, id)
    }

    /// Make the next `times` calls of `op` fail.
    pub async fn fail_next(&self, op: StoreOp, times: u32) {
        self.state.lock().await.faults.insert(op, Some(times));
    }

    /// Make every call of `op` fail until [`clear_faults`](Self::clear_faults).
    pub async fn fail_always(&self, op: StoreOp) {
        self.state.lock().await.faults.insert(op, None);
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Number of connection attempts seen, successful or not.
    pub async fn connect_attempts(&self) -> u32 {
        self.state.lock().await.connects
    }

    pub async fn events(&self) -> Vec<StoreEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn contains(&self, id: &WorkerId) -> bool {
        let mut state = self.state.lock().await;
        state.purge_expired();
        state.entries.contains_key(&self.key(id))
    }

    /// Raw field map of a lease, bypassing fault injection.
    pub async fn fields(&self, id: &WorkerId) -> Option<HashMap<String, String>> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        state.entries.get(&self.key(id)).map(|e| e.fields.clone())
    }

    /// TTL most recently applied to a lease.
    pub async fn ttl(&self, id: &WorkerId) -> Option<Duration> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        state.entries.get(&self.key(id)).and_then(|e| e.ttl)
    }

    /// Overwrite one field as an external writer (e.g. the dispatcher) would.
    pub async fn set_field(&self, id: &WorkerId, field: &str, value: &str) {
        let mut state = self.state.lock().await;
        state.purge_expired();
        let key = self.key(id);
        state
            .entries
            .entry(key)
            .or_insert_with(|| Entry {
                fields: HashMap::new(),
                ttl: None,
                expires_at: None,
            })
            .fields
            .insert(field.to_string(), value.to_string());
    }

    /// Remove a lease without recording a `Deleted` event, as expiry would.
    pub async fn evict(&self, id: &WorkerId) {
        let key = self.key(id);
        self.state.lock().await.entries.remove(&key);
    }
}

#[async_trait]
impl StoreConnector for MemoryLeaseStore {
    async fn connect(&self) -> Result<Arc<dyn LeaseStore>> {
        let mut state = self.state.lock().await;
        state.connects += 1;
        state.check(StoreOp::Connect)?;
        state.closed = false;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn ping(&self) -> Result<()> {
        self.state.lock().await.check(StoreOp::Ping)
    }

    async fn publish(&self, record: &LeaseRecord, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check(StoreOp::Publish)?;
        state.purge_expired();

        let key = self.key(&record.id);
        let mut entry = Entry {
            fields: record
                .to_fields()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            ttl: None,
            expires_at: None,
        };
        entry.expire_in(ttl);
        state.entries.insert(key.clone(), entry);
        state.events.push(StoreEvent::Published { key, ttl });
        Ok(())
    }

    async fn read_status(&self, id: &WorkerId) -> Result<Option<LeaseStatus>> {
        let mut state = self.state.lock().await;
        state.check(StoreOp::ReadStatus)?;
        state.purge_expired();

        match state
            .entries
            .get(&self.key(id))
            .and_then(|e| e.fields.get(FIELD_STATUS))
        {
            Some(value) => Ok(Some(value.parse()?)),
            None => Ok(None),
        }
    }

    async fn renew(
        &self,
        id: &WorkerId,
        last_heartbeat: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check(StoreOp::Renew)?;
        state.purge_expired();

        let key = self.key(id);
        let stamp = format_timestamp(&last_heartbeat);
        let Some(entry) = state.entries.get_mut(&key) else {
            return Ok(false);
        };
        entry
            .fields
            .insert(FIELD_LAST_HEARTBEAT.to_string(), stamp.clone());
        entry.expire_in(ttl);
        state.events.push(StoreEvent::Renewed {
            key,
            last_heartbeat: stamp,
            ttl,
        });
        Ok(true)
    }

    async fn mark_shutting_down(&self, id: &WorkerId, terminal_ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check(StoreOp::MarkShuttingDown)?;
        state.purge_expired();

        let key = self.key(id);
        let Some(entry) = state.entries.get_mut(&key) else {
            return Ok(false);
        };
        entry.fields.insert(
            FIELD_STATUS.to_string(),
            LeaseStatus::ShuttingDown.to_string(),
        );
        entry.expire_in(terminal_ttl);
        state.events.push(StoreEvent::MarkedShuttingDown {
            key,
            ttl: terminal_ttl,
        });
        Ok(true)
    }

    async fn delete(&self, id: &WorkerId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check(StoreOp::Delete)?;

        let key = self.key(id);
        state.entries.remove(&key);
        state.events.push(StoreEvent::Deleted { key });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.closed = true;
            state.events.push(StoreEvent::Closed);
        }
        Ok(())
    }

    async fn fetch(&self, id: &WorkerId) -> Result<Option<LeaseRecord>> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        match state.entries.get(&self.key(id)) {
            Some(entry) => Ok(Some(LeaseRecord::from_fields(&entry.fields)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<LeaseRecord>> {
        let mut state = self.state.lock().await;
        state.purge_expired();

        let mut keys: Vec<&String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(&self.key_prefix))
            .collect();
        keys.sort();

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match LeaseRecord::from_fields(&state.entries[key].fields) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping malformed lease record"),
            }
        }
        Ok(records)
    }

    async fn request_recycle(&self, id: &WorkerId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        match state.entries.get_mut(&self.key(id)) {
            Some(entry) => {
                entry
                    .fields
                    .insert(FIELD_STATUS.to_string(), LeaseStatus::Recycling.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: WorkerId) -> LeaseRecord {
        LeaseRecord::available(id, "ws://127.0.0.1:3000/x".to_string(), Utc::now())
    }

    #[tokio::test]
    async fn publish_then_read_status() {
        let store = MemoryLeaseStore::default();
        let id = WorkerId::new();
        store.publish(&record(id), Duration::from_secs(30)).await.unwrap();

        assert_eq!(
            store.read_status(&id).await.unwrap(),
            Some(LeaseStatus::Available)
        );
        assert_eq!(store.ttl(&id).await, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn read_status_of_missing_key_is_none() {
        let store = MemoryLeaseStore::default();
        assert_eq!(store.read_status(&WorkerId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_status_surfaces_as_lease_error() {
        let store = MemoryLeaseStore::default();
        let id = WorkerId::new();
        store.publish(&record(id), Duration::from_secs(30)).await.unwrap();
        store.set_field(&id, FIELD_STATUS, "paused").await;

        let err = store.read_status(&id).await.unwrap_err();
        assert!(matches!(err, WorkerError::Lease(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = MemoryLeaseStore::default();
        let id = WorkerId::new();
        store.publish(&record(id), Duration::from_secs(2)).await.unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(store.contains(&id).await);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!store.contains(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_expiry() {
        let store = MemoryLeaseStore::default();
        let id = WorkerId::new();
        store.publish(&record(id), Duration::from_secs(2)).await.unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        store.renew(&id, Utc::now(), Duration::from_secs(2)).await.unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(store.contains(&id).await);
    }

    #[tokio::test]
    async fn guarded_writes_do_not_recreate_missing_lease() {
        let store = MemoryLeaseStore::default();
        let id = WorkerId::new();
        store.publish(&record(id), Duration::from_secs(30)).await.unwrap();
        store.evict(&id).await;

        assert!(!store.renew(&id, Utc::now(), Duration::from_secs(30)).await.unwrap());
        assert!(!store
            .mark_shutting_down(&id, Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!store.request_recycle(&id).await.unwrap());
        assert!(!store.contains(&id).await);
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let store = MemoryLeaseStore::default();
        store.fail_next(StoreOp::Ping, 2).await;

        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn permanent_faults_last_until_cleared() {
        let store = MemoryLeaseStore::default();
        store.fail_always(StoreOp::Connect).await;

        assert!(store.connect().await.is_err());
        assert!(store.connect().await.is_err());
        store.clear_faults().await;
        assert!(store.connect().await.is_ok());
        assert_eq!(store.connect_attempts().await, 3);
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = MemoryLeaseStore::default();
        store.close().await.unwrap();
        assert!(store.ping().await.is_err());
        assert!(store.is_closed().await);
        assert_eq!(store.events().await, vec![StoreEvent::Closed]);
    }

    #[tokio::test]
    async fn request_recycle_only_touches_existing_records() {
        let store = MemoryLeaseStore::default();
        let id = WorkerId::new();
        assert!(!store.request_recycle(&id).await.unwrap());

        store.publish(&record(id), Duration::from_secs(30)).await.unwrap();
        assert!(store.request_recycle(&id).await.unwrap());
        assert_eq!(
            store.read_status(&id).await.unwrap(),
            Some(LeaseStatus::Recycling)
        );
    }

    #[tokio::test]
    async fn list_skips_other_prefixes_and_malformed_records() {
        let store = MemoryLeaseStore::default();
        let good = WorkerId::new();
        let broken = WorkerId::new();
        store.publish(&record(good), Duration::from_secs(30)).await.unwrap();
        store.set_field(&broken, FIELD_STATUS, "available").await;

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, good);
    }
}
