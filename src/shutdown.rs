use std::fmt;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Queue depth for shutdown requests. Only the first request is acted on, so
/// a full queue just means a shutdown is already pending.
const SHUTDOWN_QUEUE: usize = 16;

/// Why a worker is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// SIGINT or SIGTERM
    Signal(&'static str),
    /// The dispatcher wrote `status=recycling`
    RecycleCommand,
    /// A store read or write failed during a heartbeat tick
    HeartbeatError,
    /// The lease record vanished from the store between heartbeats
    LeaseLost,
    /// Startup failed before the heartbeat began
    StartupFailure,
    /// Requested programmatically through a [`ShutdownHandle`]
    Requested,
}

impl ShutdownCause {
    pub fn is_graceful(&self) -> bool {
        !matches!(self, ShutdownCause::StartupFailure)
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Signal(name) => f.write_str(name),
            ShutdownCause::RecycleCommand => f.write_str("recycle_command"),
            ShutdownCause::HeartbeatError => f.write_str("heartbeat_error"),
            ShutdownCause::LeaseLost => f.write_str("lease_lost"),
            ShutdownCause::StartupFailure => f.write_str("startup_failure"),
            ShutdownCause::Requested => f.write_str("requested"),
        }
    }
}

/// Cloneable entry point into the shutdown coordinator.
///
/// Every trigger (signal, heartbeat, caller) funnels through here; the
/// coordinator consumes exactly one request.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<ShutdownCause>,
}

impl ShutdownHandle {
    pub fn request(&self, cause: ShutdownCause) {
        match self.tx.try_send(cause) {
            Ok(()) => tracing::debug!(cause = %cause, "Shutdown requested"),
            Err(e) => tracing::debug!(cause = %cause, error = %e, "Shutdown already pending"),
        }
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, mpsc::Receiver<ShutdownCause>) {
    let (tx, rx) = mpsc::channel(SHUTDOWN_QUEUE);
    (ShutdownHandle { tx }, rx)
}

/// Install handlers for SIGTERM and SIGINT.
///
/// Each received signal becomes a shutdown request carrying the signal name.
/// Repeated signals are forwarded too; the coordinator ignores all but the
/// first.
pub fn install_signal_handlers(handle: ShutdownHandle) -> Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigterm.recv() => "SIGTERM",
                Some(()) = sigint.recv() => "SIGINT",
                else => break,
            };
            tracing::info!(signal = name, "Received {}, initiating graceful shutdown", name);
            handle.request(ShutdownCause::Signal(name));
        }
    }))
}
