use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{error_chain, WorkerError};
use crate::lease::{LeaseError, LeaseStatus, WorkerId};
use crate::shutdown::{ShutdownCause, ShutdownHandle};
use crate::store::LeaseStore;
use crate::worker::state::{LifecycleState, WorkerPhase};

/// What one heartbeat tick concluded.
#[derive(Debug)]
pub enum TickOutcome {
    /// `lastHeartbeat` was written and the TTL reset
    Renewed(DateTime<Utc>),
    /// The record asks this worker to retire
    Recycle,
    /// The record no longer exists
    LeaseLost,
    /// The store could not be read or written
    Failed(WorkerError),
    /// A shutdown is already in progress
    Skipped,
}

/// Periodic lease renewal for one worker.
pub struct Heartbeat {
    id: WorkerId,
    store: Arc<dyn LeaseStore>,
    interval: Duration,
    ttl: Duration,
    lifecycle: Arc<LifecycleState>,
    last_beat: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(
        id: WorkerId,
        store: Arc<dyn LeaseStore>,
        interval: Duration,
        ttl: Duration,
        lifecycle: Arc<LifecycleState>,
        last_beat: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            store,
            interval,
            ttl,
            lifecycle,
            last_beat,
        }
    }

    /// Run one tick: read the status, then either renew or report why not.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.lifecycle.is_shutting_down() {
            return TickOutcome::Skipped;
        }

        match self.store.read_status(&self.id).await {
            Ok(Some(LeaseStatus::Available)) => {}
            Ok(Some(LeaseStatus::Recycling)) => return TickOutcome::Recycle,
            Ok(Some(other)) => {
                // Only the dispatcher writes `recycling` and only this worker
                // writes `shutting-down`; anything else is treated as a retire order.
                tracing::error!(
                    worker_id = %self.id,
                    status = %other,
                    "Lease record has unexpected status, treating as recycle"
                );
                return TickOutcome::Recycle;
            }
            Ok(None) => return TickOutcome::LeaseLost,
            Err(WorkerError::Lease(LeaseError::UnknownStatus(value))) => {
                tracing::error!(
                    worker_id = %self.id,
                    status = %value,
                    "Lease record status is corrupt, treating as recycle"
                );
                return TickOutcome::Recycle;
            }
            Err(e) => return TickOutcome::Failed(e),
        }

        let now = next_heartbeat(self.last_beat, Utc::now());
        match self.store.renew(&self.id, now, self.ttl).await {
            Ok(true) => {
                self.last_beat = now;
                TickOutcome::Renewed(now)
            }
            // Expired or deleted between the status read and the write
            Ok(false) => TickOutcome::LeaseLost,
            Err(e) => TickOutcome::Failed(e),
        }
    }

    /// Tick every interval until cancelled or until a tick asks for shutdown.
    ///
    /// The first tick fires one interval after start; the record was just
    /// published with a fresh TTL.
    pub async fn run(mut self, cancel: CancellationToken, shutdown: ShutdownHandle) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if self.lifecycle.is_shutting_down() {
                break;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.tick() => outcome,
            };

            match outcome {
                TickOutcome::Renewed(at) => {
                    tracing::debug!(worker_id = %self.id, last_heartbeat = %at, "Heartbeat renewed");
                }
                TickOutcome::Skipped => break,
                TickOutcome::Recycle => {
                    tracing::info!(worker_id = %self.id, "Recycle command observed");
                    self.lifecycle.advance(WorkerPhase::RecycleObserved);
                    shutdown.request(ShutdownCause::RecycleCommand);
                    break;
                }
                TickOutcome::LeaseLost => {
                    tracing::warn!(worker_id = %self.id, "Lease record disappeared from store");
                    shutdown.request(ShutdownCause::LeaseLost);
                    break;
                }
                TickOutcome::Failed(e) => {
                    tracing::error!(
                        worker_id = %self.id,
                        error = %error_chain(&e),
                        "Heartbeat failed, shutting down"
                    );
                    shutdown.request(ShutdownCause::HeartbeatError);
                    break;
                }
            }
        }

        tracing::debug!(worker_id = %self.id, "Heartbeat loop stopped");
    }
}

/// Heartbeat timestamp at millisecond precision, strictly after `previous`.
pub fn next_heartbeat(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc
        .timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now);
    if now > previous {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}
