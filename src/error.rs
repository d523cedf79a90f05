use thiserror::Error;

use crate::lease::LeaseError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Store unavailable after {attempts} attempt(s): {last_error}")]
    StoreUnavailable { attempts: u32, last_error: String },

    #[error("Store operation failed: {0}")]
    StoreOperation(String),

    #[error("Lease record error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Lease record not found: {0}")]
    LeaseNotFound(String),

    #[error("Engine launch failed: {0}")]
    EngineLaunch(String),

    #[error("Engine close failed: {0}")]
    EngineClose(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Render an error together with its `source()` chain for log events.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unavailable_message_mentions_attempts() {
        let err = WorkerError::StoreUnavailable {
            attempts: 3,
            last_error: "connection refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = WorkerError::Lease(LeaseError::UnknownStatus("bogus".to_string()));
        let chain = error_chain(&err);
        assert!(chain.starts_with("Lease record error"));
        assert!(chain.contains("bogus"));
    }
}
