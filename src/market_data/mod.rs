// Market data polling and rolling bar history
pub mod buffer;
pub mod feed;

use async_trait::async_trait;

use crate::error::DataUnavailable;
use crate::models::PriceBar;

pub use buffer::BarBuffer;
pub use feed::{LatestBar, MarketDataFeed, HISTORY_MARGIN};

/// Anything that can hand out the most recent bars for a symbol
#[async_trait]
pub trait BarSource: Send + Sync {
    /// Latest `count` bars, oldest first
    async fn fetch_bars(&self, symbol: &str, count: usize) -> Result<Vec<PriceBar>, DataUnavailable>;
}
