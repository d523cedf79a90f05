//! Worker lifecycle: registration, heartbeat, recycling and shutdown.
//!
//! # Components
//!
//! - [`WorkerController`]: owns the worker identity, the store connection and
//!   the engine; runs startup and the single shutdown sequence
//! - [`heartbeat`]: periodic lease renewal and recycle detection
//! - [`state`]: lifecycle phases and the one-shot shutdown gate
//!
//! # Lifecycle
//!
//! 1. Connect to the store (bounded retry, PING)
//! 2. Launch the engine on `/<worker id>` and read its endpoint
//! 3. Publish the lease with `status=available` and a TTL
//! 4. Heartbeat: renew, or hand a shutdown cause to the coordinator
//! 5. Shutdown: mark `shutting-down` with a short TTL, close the engine,
//!    delete the lease, close the store
//!
//! Every shutdown trigger is a message on one channel; the controller reads
//! only the first, so the teardown runs once no matter how many triggers race.

pub mod controller;
pub mod heartbeat;
pub mod state;

pub use controller::{WorkerController, WorkerExit};
pub use heartbeat::Heartbeat;
pub use state::{LifecycleState, WorkerPhase};
