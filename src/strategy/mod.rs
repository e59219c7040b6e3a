// Trigger evaluation module
pub mod triggers;

pub use triggers::{
    BuyDecision, BuyTrigger, SellDecision, SellTrigger, TriggerConfig,
};
