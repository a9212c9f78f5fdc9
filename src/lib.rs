//! Library crate for portwatch-rs: recurring port-range sweeps with persisted results.
pub mod notify;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
