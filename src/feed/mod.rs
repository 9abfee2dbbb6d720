pub mod live;
pub mod replay;

pub use live::LivePriceFeed;
pub use replay::load_csv;
