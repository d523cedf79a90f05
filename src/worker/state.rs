use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// Lifecycle phase of one worker process. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerPhase {
    Starting,
    Available,
    RecycleObserved,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerPhase::Starting => write!(f, "starting"),
            WorkerPhase::Available => write!(f, "available"),
            WorkerPhase::RecycleObserved => write!(f, "recycle-observed"),
            WorkerPhase::ShuttingDown => write!(f, "shutting-down"),
            WorkerPhase::Terminated => write!(f, "terminated"),
        }
    }
}

/// Phase tracking plus the one-shot shutdown gate, shared between the
/// controller and its heartbeat task.
#[derive(Debug)]
pub struct LifecycleState {
    phase: watch::Sender<WorkerPhase>,
    shutting_down: AtomicBool,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleState {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(WorkerPhase::Starting);
        Self {
            phase,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    /// Move to `next` if it is later than the current phase.
    pub fn advance(&self, next: WorkerPhase) -> bool {
        let advanced = self.phase.send_if_modified(|phase| {
            if next > *phase {
                *phase = next;
                true
            } else {
                false
            }
        });
        if advanced {
            tracing::debug!(phase = %next, "Worker phase changed");
        }
        advanced
    }

    /// Close the shutdown gate. Returns `true` only for the first caller.
    pub fn begin_shutdown(&self) -> bool {
        self.shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn phases_only_move_forward() {
        let state = LifecycleState::new();
        assert_eq!(state.phase(), WorkerPhase::Starting);

        assert!(state.advance(WorkerPhase::Available));
        assert!(state.advance(WorkerPhase::ShuttingDown));
        assert!(!state.advance(WorkerPhase::RecycleObserved));
        assert!(!state.advance(WorkerPhase::Available));
        assert_eq!(state.phase(), WorkerPhase::ShuttingDown);
    }

    #[test]
    fn shutdown_gate_opens_once() {
        let state = LifecycleState::new();
        assert!(!state.is_shutting_down());
        assert!(state.begin_shutdown());
        assert!(!state.begin_shutdown());
        assert!(state.is_shutting_down());
    }

    #[test]
    fn shutdown_gate_has_one_winner_across_threads() {
        let state = Arc::new(LifecycleState::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || state.begin_shutdown())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn subscribers_observe_phase_changes() {
        let state = LifecycleState::new();
        let mut rx = state.subscribe();
        state.advance(WorkerPhase::Available);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), WorkerPhase::Available);
    }
}
