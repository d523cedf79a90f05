//! Automation engine management.
//!
//! The engine is an opaque subprocess: it is started with a listen port, a
//! headless flag and a unique path segment, reports the URI it accepts
//! connections on, and can be asked to close.
//!
//! # Components
//!
//! - [`EngineLauncher`] / [`Engine`]: the start/close contract the worker
//!   controller depends on
//! - [`ProcessLauncher`]: spawns the configured engine command
//! - [`endpoint`]: endpoint discovery and loopback-host rewriting

pub mod endpoint;
pub mod process;

use async_trait::async_trait;

use crate::error::Result;

pub use endpoint::rewrite_loopback_host;
pub use process::{ProcessEngine, ProcessLauncher};

/// What the engine is asked to listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub port: u16,
    pub headless: bool,
    /// Unique path component, e.g. `/<worker id>`
    pub path: String,
}

/// A running engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// URI the engine advertised once it was listening.
    fn endpoint(&self) -> &str;

    /// Stop the engine and wait until it has exited.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn Engine>>;
}
