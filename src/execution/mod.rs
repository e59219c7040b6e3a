// Order execution and position state module
pub mod executor;
pub mod position_tracker;

pub use executor::{ExecutionContext, ExecutionOutcome, OrderExecutor};
pub use position_tracker::PositionTracker;
