pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod shutdown;
pub mod store;
pub mod worker;
