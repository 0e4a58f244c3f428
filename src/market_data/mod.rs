pub mod bars;
pub mod exchange;
pub mod frames;

pub use bars::BarBuilder;
pub use exchange::{ExchangeFeed, FeedSupervisor, WsTickFeed};
pub use frames::FrameBuffer;
