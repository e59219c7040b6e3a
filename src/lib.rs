// Core modules
pub mod api;
pub mod convert;
pub mod execution;
pub mod history;
pub mod models;
pub mod monitor;
pub mod persistence;
pub mod strategy;

// Re-export commonly used types
pub use api::{ApiCredentials, CoinbaseClient};
pub use models::*;
pub use monitor::{CycleOutcome, TradingMonitor};
pub use persistence::{SnapshotStore, StateDocument};
