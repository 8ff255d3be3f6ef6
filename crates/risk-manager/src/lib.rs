pub mod manager;
pub mod models;

pub use manager::{round_to_step, RiskManager};
pub use models::*;
