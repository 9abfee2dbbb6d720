pub mod engine;

pub use engine::{SettlementEngine, SettlementSettings};
