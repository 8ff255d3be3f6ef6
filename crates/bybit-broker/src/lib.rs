pub mod client;
pub mod models;

pub use broker_trait::ExchangeClient;
pub use client::{BybitClient, BybitConfig};
pub use models::*;
