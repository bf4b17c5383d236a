//! Library crate for scan-relay: engine process pool, job starters, status
//! polling and fan-out, and the HTTP surface.
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod poller;
pub mod pool;
pub mod ports;
pub mod scanner;
pub mod server;
pub mod store;
pub mod types;

pub use monitor::{JobMonitor, MonitorOptions};
pub use pool::ClientPool;
