pub mod monitor;
pub mod strategy;

pub use monitor::CandleMonitor;
pub use strategy::DetectionStrategy;
