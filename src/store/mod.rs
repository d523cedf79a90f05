//! Coordination store access for lease records.
//!
//! The store is the single source of truth for worker liveness. Each worker
//! only ever touches its own key; the dispatcher reads every key and writes
//! `status=recycling` to retire a worker.
//!
//! # Components
//!
//! - [`LeaseStore`]: record read/write, TTL management, deletion
//! - [`StoreConnector`]: opens a connection to a store
//! - [`connect_with_retry`]: bounded connect + PING loop used at startup
//! - [`redis_store`]: production adapter
//! - [`memory`]: in-process adapter with fault injection

pub mod memory;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RetryConfig;
use crate::error::{error_chain, Result, WorkerError};
use crate::lease::{LeaseRecord, LeaseStatus, WorkerId};

pub use self::memory::MemoryLeaseStore;
pub use self::redis_store::{RedisConnector, RedisLeaseStore};

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Liveness check against the store itself.
    async fn ping(&self) -> Result<()>;

    /// Write every field of `record` and set the key's TTL.
    async fn publish(&self, record: &LeaseRecord, ttl: Duration) -> Result<()>;

    /// Current `status` of a lease, `None` if the key no longer exists.
    ///
    /// A value outside the known statuses surfaces as
    /// [`LeaseError::UnknownStatus`](crate::lease::LeaseError::UnknownStatus).
    async fn read_status(&self, id: &WorkerId) -> Result<Option<LeaseStatus>>;

    /// Update `lastHeartbeat` and reset the TTL. Returns `false`, writing
    /// nothing, when the key no longer exists.
    async fn renew(&self, id: &WorkerId, last_heartbeat: DateTime<Utc>, ttl: Duration)
        -> Result<bool>;

    /// Write `status=shutting-down` and shorten the TTL to `terminal_ttl`.
    /// Returns `false`, writing nothing, when the key no longer exists.
    async fn mark_shutting_down(&self, id: &WorkerId, terminal_ttl: Duration) -> Result<bool>;

    async fn delete(&self, id: &WorkerId) -> Result<()>;

    /// Release the connection. Later operations fail.
    async fn close(&self) -> Result<()>;

    /// Full record, `None` if absent.
    async fn fetch(&self, id: &WorkerId) -> Result<Option<LeaseRecord>>;

    /// Every parseable lease record under this store's key prefix.
    async fn list(&self) -> Result<Vec<LeaseRecord>>;

    /// Write `status=recycling` on an existing record. Returns `false` when the
    /// record does not exist.
    async fn request_recycle(&self, id: &WorkerId) -> Result<bool>;
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn LeaseStore>>;
}

/// Connect and PING with a bounded number of attempts.
///
/// Each attempt (connect plus PING) is limited by `retry.timeout()`; an
/// attempt that times out counts as a failure. Between failures the loop
/// sleeps for `retry.delay()`.
pub async fn connect_with_retry(
    connector: &dyn StoreConnector,
    retry: &RetryConfig,
) -> Result<Arc<dyn LeaseStore>> {
    let attempts = retry.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let outcome = tokio::time::timeout(retry.timeout(), async {
            let store = connector.connect().await?;
            store.ping().await?;
            Ok::<_, WorkerError>(store)
        })
        .await;

        match outcome {
            Ok(Ok(store)) => {
                tracing::info!(attempt, "Connected to coordination store");
                return Ok(store);
            }
            Ok(Err(e)) => {
                last_error = error_chain(&e);
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    error = %last_error,
                    "Store connection attempt failed"
                );
            }
            Err(_) => {
                last_error = format!("timed out after {}ms", retry.timeout_ms);
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    timeout_ms = retry.timeout_ms,
                    "Store connection attempt timed out"
                );
            }
        }

        if attempt < attempts {
            tokio::time::sleep(retry.delay()).await;
        }
    }

    Err(WorkerError::StoreUnavailable {
        attempts,
        last_error,
    })
}
