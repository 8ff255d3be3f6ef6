pub mod stats;
pub mod types;

pub use types::*;
