use std::time::Duration;

use crate::error::{Result, WorkerError};

/// Bounded retry policy for establishing the store connection.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total connection attempts before giving up
    pub attempts: u32,
    /// Upper bound on a single connect + PING attempt
    pub timeout_ms: u64,
    /// Pause between failed attempts
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_ms: 5_000,
            delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Coordination store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub url: String,
    /// Prefix prepended to the worker id to form the lease key
    pub key_prefix: String,
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "worker:".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

/// Lease timing: how long a record lives without renewal.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// TTL applied on publish and every heartbeat
    pub ttl_secs: u64,
    /// Short TTL applied when the worker enters `shutting-down`
    pub terminal_ttl_secs: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            terminal_ttl_secs: 5,
            heartbeat_interval_ms: 10_000,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn terminal_ttl(&self) -> Duration {
        Duration::from_secs(self.terminal_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Settings for the managed automation engine subprocess.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Program to execute
    pub command: String,
    /// Arguments placed before the generated `--port`/`--path`/`--headless` flags
    pub args: Vec<String>,
    /// Port the engine listens on
    pub port: u16,
    pub headless: bool,
    /// Hostname substituted for a loopback host in the advertised endpoint
    pub private_hostname: Option<String>,
    /// How long to wait for the engine to advertise its endpoint
    pub startup_timeout_ms: u64,
    /// How long to wait after SIGTERM before killing the engine
    pub close_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec!["playwright".to_string(), "run-server".to_string()],
            port: 3000,
            headless: true,
            private_hostname: None,
            startup_timeout_ms: 30_000,
            close_grace_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Everything one worker process needs, built once at process entry.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub engine: EngineConfig,
    pub log: LogConfig,
}

impl WorkerConfig {
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.store.url = url.into();
        self
    }

    pub fn with_private_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.engine.private_hostname = Some(hostname.into());
        self
    }

    /// Reject settings that would break the lease protocol.
    pub fn validate(&self) -> Result<()> {
        if self.store.retry.attempts == 0 {
            return Err(WorkerError::Config(
                "connect attempts must be at least 1".to_string(),
            ));
        }
        if self.store.retry.timeout_ms == 0 {
            return Err(WorkerError::Config(
                "connect timeout must be non-zero".to_string(),
            ));
        }
        if self.lease.heartbeat_interval_ms == 0 {
            return Err(WorkerError::Config(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }
        if self.lease.terminal_ttl_secs == 0 {
            return Err(WorkerError::Config(
                "terminal TTL must be at least one second".to_string(),
            ));
        }
        if self.lease.terminal_ttl_secs >= self.lease.ttl_secs {
            return Err(WorkerError::Config(format!(
                "terminal TTL ({}s) must be shorter than lease TTL ({}s)",
                self.lease.terminal_ttl_secs, self.lease.ttl_secs
            )));
        }
        if self.lease.heartbeat_interval() >= self.lease.ttl() {
            return Err(WorkerError::Config(format!(
                "heartbeat interval ({}ms) must be shorter than lease TTL ({}s)",
                self.lease.heartbeat_interval_ms, self.lease.ttl_secs
            )));
        }
        if self.engine.command.trim().is_empty() {
            return Err(WorkerError::Config("engine command is empty".to_string()));
        }
        if self.engine.private_hostname.as_deref() == Some("") {
            return Err(WorkerError::Config(
                "private hostname must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
