use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::engine::{rewrite_loopback_host, Engine, EngineLauncher, LaunchOptions};
use crate::error::{error_chain, Result, WorkerError};
use crate::lease::{LeaseRecord, WorkerId};
use crate::shutdown::{install_signal_handlers, shutdown_channel, ShutdownCause, ShutdownHandle};
use crate::store::{connect_with_retry, LeaseStore, StoreConnector};
use crate::worker::heartbeat::Heartbeat;
use crate::worker::state::{LifecycleState, WorkerPhase};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: i32,
    pub cause: ShutdownCause,
}

enum Startup {
    Started,
    Failed(WorkerError),
    Interrupted(ShutdownCause),
}

async fn next_cause(rx: &mut Option<mpsc::Receiver<ShutdownCause>>) -> ShutdownCause {
    match rx.as_mut() {
        Some(rx) => rx.recv().await.unwrap_or(ShutdownCause::Requested),
        None => ShutdownCause::Requested,
    }
}

/// Owns one worker's identity and drives its lease lifecycle.
pub struct WorkerController {
    config: WorkerConfig,
    id: WorkerId,
    started_at: DateTime<Utc>,
    connector: Arc<dyn StoreConnector>,
    launcher: Arc<dyn EngineLauncher>,
    lifecycle: Arc<LifecycleState>,
    shutdown_handle: ShutdownHandle,
    shutdown_rx: Option<mpsc::Receiver<ShutdownCause>>,
    store: Option<Arc<dyn LeaseStore>>,
    engine: Option<Box<dyn Engine>>,
    endpoint: Option<String>,
    heartbeat_cancel: CancellationToken,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl WorkerController {
    pub fn new(
        config: WorkerConfig,
        connector: Arc<dyn StoreConnector>,
        launcher: Arc<dyn EngineLauncher>,
    ) -> Self {
        let (shutdown_handle, shutdown_rx) = shutdown_channel();

        Self {
            config,
            id: WorkerId::new(),
            started_at: Utc::now(),
            connector,
            launcher,
            lifecycle: Arc::new(LifecycleState::new()),
            shutdown_handle,
            shutdown_rx: Some(shutdown_rx),
            store: None,
            engine: None,
            endpoint: None,
            heartbeat_cancel: CancellationToken::new(),
            heartbeat_task: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Published endpoint, once the engine is listening.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn phase(&self) -> WorkerPhase {
        self.lifecycle.phase()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<WorkerPhase> {
        self.lifecycle.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown_handle.clone()
    }

    /// Run the worker to completion: start, serve until told to stop, tear
    /// down. A failed start still cleans up and yields a non-zero exit code.
    ///
    /// Signal handlers are installed before startup, so a signal during the
    /// store connect or engine launch interrupts startup and runs the graceful
    /// shutdown instead of killing the process outright.
    pub async fn run(mut self) -> WorkerExit {
        let signals = match install_signal_handlers(self.shutdown_handle()) {
            Ok(task) => task,
            Err(e) => return self.fail(e).await,
        };

        let mut shutdown_rx = self.shutdown_rx.take();
        let startup = tokio::select! {
            result = self.start() => match result {
                Ok(()) => Startup::Started,
                Err(e) => Startup::Failed(e),
            },
            cause = next_cause(&mut shutdown_rx) => Startup::Interrupted(cause),
        };
        self.shutdown_rx = shutdown_rx;

        let exit = match startup {
            Startup::Started => {
                let cause = self.wait_for_shutdown().await;
                self.shutdown(cause).await
            }
            Startup::Failed(e) => self.fail(e).await,
            Startup::Interrupted(cause) => {
                tracing::warn!(worker_id = %self.id, cause = %cause, "Shutdown requested during startup");
                self.shutdown(cause).await
            }
        };
        signals.abort();
        exit
    }

    /// Connect, launch the engine, publish the lease and start heartbeating.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            worker_id = %self.id,
            started_at = %self.started_at,
            "Starting worker"
        );

        let store = connect_with_retry(self.connector.as_ref(), &self.config.store.retry).await?;
        self.store = Some(store.clone());

        let options = LaunchOptions {
            port: self.config.engine.port,
            headless: self.config.engine.headless,
            path: self.id.path_segment(),
        };
        let engine = self.launcher.launch(&options).await?;
        let advertised = engine.endpoint().to_string();
        self.engine = Some(engine);

        if advertised.is_empty() {
            return Err(WorkerError::EngineLaunch(
                "engine advertised an empty endpoint".to_string(),
            ));
        }

        let endpoint = match self.config.engine.private_hostname.as_deref() {
            Some(hostname) => rewrite_loopback_host(&advertised, hostname),
            None => advertised,
        };

        let record = LeaseRecord::available(self.id, endpoint.clone(), self.started_at);
        store.publish(&record, self.config.lease.ttl()).await?;
        self.endpoint = Some(endpoint);
        self.lifecycle.advance(WorkerPhase::Available);

        tracing::info!(
            worker_id = %self.id,
            endpoint = %record.endpoint,
            ttl_secs = self.config.lease.ttl_secs,
            "Lease published, worker available"
        );

        let heartbeat = Heartbeat::new(
            self.id,
            store,
            self.config.lease.heartbeat_interval(),
            self.config.lease.ttl(),
            self.lifecycle.clone(),
            record.last_heartbeat,
        );
        let cancel = self.heartbeat_cancel.clone();
        let handle = self.shutdown_handle();
        self.heartbeat_task = Some(tokio::spawn(async move {
            heartbeat.run(cancel, handle).await;
        }));

        Ok(())
    }

    /// Wait for the first shutdown request. Later requests are never read.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownCause {
        let cause = next_cause(&mut self.shutdown_rx).await;
        self.lifecycle.begin_shutdown();
        cause
    }

    /// Graceful teardown: stop heartbeating, mark the lease `shutting-down`
    /// with a short TTL, close the engine, then clean up.
    pub async fn shutdown(mut self, cause: ShutdownCause) -> WorkerExit {
        self.lifecycle.begin_shutdown();
        self.lifecycle.advance(WorkerPhase::ShuttingDown);
        tracing::info!(worker_id = %self.id, cause = %cause, "Graceful shutdown started");

        self.stop_heartbeat().await;

        if let Some(store) = &self.store {
            let terminal_ttl = self.config.lease.terminal_ttl();
            match store.mark_shutting_down(&self.id, terminal_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(worker_id = %self.id, "No lease to mark shutting-down");
                }
                Err(e) => tracing::warn!(
                    worker_id = %self.id,
                    error = %error_chain(&e),
                    "Failed to mark lease shutting-down"
                ),
            }
        }

        self.close_engine().await;
        self.cleanup(0, cause).await
    }

    /// Fatal startup path: close whatever was started, then clean up with a
    /// non-zero exit code.
    async fn fail(mut self, error: WorkerError) -> WorkerExit {
        tracing::error!(
            worker_id = %self.id,
            error = %error_chain(&error),
            debug = ?error,
            "Worker startup failed"
        );
        self.lifecycle.begin_shutdown();
        self.lifecycle.advance(WorkerPhase::ShuttingDown);

        self.stop_heartbeat().await;
        self.close_engine().await;
        self.cleanup(1, ShutdownCause::StartupFailure).await
    }

    async fn stop_heartbeat(&mut self) {
        self.heartbeat_cancel.cancel();
        if let Some(task) = self.heartbeat_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(worker_id = %self.id, error = %e, "Heartbeat task ended abnormally");
            }
        }
    }

    async fn close_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            tracing::info!(worker_id = %self.id, "Closing engine");
            if let Err(e) = engine.close().await {
                tracing::error!(
                    worker_id = %self.id,
                    error = %error_chain(&e),
                    "Engine close failed"
                );
            }
        }
    }

    async fn cleanup(mut self, code: i32, cause: ShutdownCause) -> WorkerExit {
        self.heartbeat_cancel.cancel();

        if let Some(store) = self.store.take() {
            if let Err(e) = store.delete(&self.id).await {
                tracing::warn!(
                    worker_id = %self.id,
                    error = %error_chain(&e),
                    terminal_ttl_secs = self.config.lease.terminal_ttl_secs,
                    "Failed to delete lease, relying on expiry"
                );
            }
            if let Err(e) = store.close().await {
                tracing::warn!(
                    worker_id = %self.id,
                    error = %error_chain(&e),
                    "Failed to close store connection"
                );
            }
        }

        self.lifecycle.advance(WorkerPhase::Terminated);
        if cause.is_graceful() {
            tracing::info!(worker_id = %self.id, cause = %cause, exit_code = code, "Worker terminated");
        } else {
            tracing::error!(worker_id = %self.id, cause = %cause, exit_code = code, "Worker terminated");
        }

        WorkerExit { code, cause }
    }
}
