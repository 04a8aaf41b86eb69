use super::{BarBuffer, BarSource};
use crate::error::DataUnavailable;
use crate::models::PriceBar;

/// Bars kept beyond the longest window any attached strategy needs
pub const HISTORY_MARGIN: usize = 10;

/// Result of one poll of the feed
#[derive(Debug, Clone, PartialEq)]
pub struct LatestBar {
    pub bar: PriceBar,
    /// False when the source served a bar the feed already holds
    pub appended: bool,
}

/// Polls a bar source for one symbol and keeps a bounded, deduplicated history
pub struct MarketDataFeed {
    symbol: String,
    buffer: BarBuffer,
    required: usize,
}

impl MarketDataFeed {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            buffer: BarBuffer::new(HISTORY_MARGIN),
            required: 0,
        }
    }

    /// Feed sized for a strategy that needs `window` bars
    pub fn with_window(symbol: &str, window: usize) -> Self {
        let mut feed = Self::new(symbol);
        feed.require_window(window);
        feed
    }

    /// Grow the history bound so a `window`-bar strategy can evaluate.
    ///
    /// The bound is `max(required windows) + HISTORY_MARGIN`; attaching a
    /// smaller window never shrinks it.
    pub fn require_window(&mut self, window: usize) {
        if window <= self.required && self.buffer.capacity() >= self.required + HISTORY_MARGIN {
            return;
        }
        self.required = self.required.max(window);
        let capacity = self.required + HISTORY_MARGIN;
        tracing::debug!(symbol = %self.symbol, "History bound set to {} bars", capacity);
        self.buffer.set_capacity(capacity);
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Poll the source for the newest bar and append it if it is new
    pub async fn fetch_latest(
        &mut self,
        source: &dyn BarSource,
    ) -> Result<LatestBar, DataUnavailable> {
        let bars = source.fetch_bars(&self.symbol, 1).await?;
        let bar = bars
            .into_iter()
            .last()
            .ok_or_else(|| DataUnavailable::new(&self.symbol, "gateway returned no bars"))?;
        validate(&self.symbol, &bar)?;

        let appended = self.buffer.push(bar.clone());
        if appended {
            tracing::debug!(symbol = %self.symbol, close = bar.close, "New bar at {}", bar.timestamp);
        }
        Ok(LatestBar { bar, appended })
    }

    /// Load up to `count` recent bars so strategies can evaluate from the first tick.
    ///
    /// Returns how many bars were appended.
    pub async fn backfill(
        &mut self,
        count: usize,
        source: &dyn BarSource,
    ) -> Result<usize, DataUnavailable> {
        let bars = source.fetch_bars(&self.symbol, count).await?;
        let mut appended = 0;
        for bar in bars {
            if validate(&self.symbol, &bar).is_err() {
                tracing::warn!(symbol = %self.symbol, "Skipping malformed bar at {}", bar.timestamp);
                continue;
            }
            if self.buffer.push(bar) {
                appended += 1;
            }
        }
        tracing::info!(symbol = %self.symbol, "📊 Backfilled {} bars", appended);
        Ok(appended)
    }

    /// Ordered history, most recent last
    pub fn history(&self) -> Vec<PriceBar> {
        self.buffer.bars()
    }
}

fn validate(symbol: &str, bar: &PriceBar) -> Result<(), DataUnavailable> {
    if bar.symbol != symbol {
        return Err(DataUnavailable::new(
            symbol,
            format!("gateway returned a bar for {}", bar.symbol),
        ));
    }
    if !bar.close.is_finite() || bar.close <= 0.0 {
        return Err(DataUnavailable::new(
            symbol,
            format!("invalid close price {}", bar.close),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Mutex;

    /// Serves a fixed list of bars, one more on each call
    struct ScriptedSource {
        bars: Vec<PriceBar>,
        cursor: Mutex<usize>,
        fail: bool,
    }

    impl ScriptedSource {
        fn new(closes: &[f64]) -> Self {
            let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
            Self {
                bars: closes
                    .iter()
                    .enumerate()
                    .map(|(i, c)| PriceBar::flat("HK.00700", start + Duration::days(i as i64), *c, 1.0))
                    .collect(),
                cursor: Mutex::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl BarSource for ScriptedSource {
        async fn fetch_bars(&self, symbol: &str, count: usize) -> Result<Vec<PriceBar>, DataUnavailable> {
            if self.fail {
                return Err(DataUnavailable::new(symbol, "market closed"));
            }
            let mut cursor = self.cursor.lock().unwrap();
            *cursor = (*cursor + 1).min(self.bars.len());
            let start = cursor.saturating_sub(count);
            Ok(self.bars[start..*cursor].to_vec())
        }
    }

    #[tokio::test]
    async fn test_fetch_latest_appends_each_new_bar() {
        let source = ScriptedSource::new(&[10.0, 11.0, 12.0]);
        let mut feed = MarketDataFeed::with_window("HK.00700", 4);

        for expected in [10.0, 11.0, 12.0] {
            let latest = feed.fetch_latest(&source).await.unwrap();
            assert!(latest.appended);
            assert_eq!(latest.bar.close, expected);
        }

        let closes: Vec<f64> = feed.history().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![10.0, 11.0, 12.0]);
    }

    #[tokio::test]
    async fn test_repeated_bar_is_not_double_appended() {
        let source = ScriptedSource::new(&[10.0]);
        let mut feed = MarketDataFeed::with_window("HK.00700", 4);

        assert!(feed.fetch_latest(&source).await.unwrap().appended);
        assert!(!feed.fetch_latest(&source).await.unwrap().appended);
        assert_eq!(feed.history().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_data_unavailable() {
        let mut source = ScriptedSource::new(&[10.0]);
        source.fail = true;
        let mut feed = MarketDataFeed::new("HK.00700");

        let err = feed.fetch_latest(&source).await.unwrap_err();
        assert_eq!(err.reason, "market closed");
        assert_eq!(feed.history().len(), 0);
    }

    #[tokio::test]
    async fn test_empty_reply_is_data_unavailable() {
        let source = ScriptedSource::new(&[]);
        let mut feed = MarketDataFeed::new("HK.00700");
        assert!(feed.fetch_latest(&source).await.is_err());
    }

    #[tokio::test]
    async fn test_history_bounded_by_window_plus_margin() {
        let closes: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        let source = ScriptedSource::new(&closes);
        let mut feed = MarketDataFeed::with_window("HK.00700", 5);

        for _ in 0..40 {
            feed.fetch_latest(&source).await.unwrap();
        }

        let history = feed.history();
        assert_eq!(history.len(), 5 + HISTORY_MARGIN);
        assert_eq!(history.last().unwrap().close, 40.0);
    }

    #[test]
    fn test_bound_recomputed_for_larger_window() {
        let mut feed = MarketDataFeed::with_window("HK.00700", 4);
        assert_eq!(feed.capacity(), 14);

        feed.require_window(30);
        assert_eq!(feed.capacity(), 40);

        // A smaller strategy does not shrink the bound
        feed.require_window(2);
        assert_eq!(feed.capacity(), 40);
    }

    #[tokio::test]
    async fn test_backfill_loads_history() {
        let closes: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let source = ScriptedSource::new(&closes);
        // Advance the source so several bars are visible
        for _ in 0..9 {
            source.fetch_bars("HK.00700", 1).await.unwrap();
        }

        let mut feed = MarketDataFeed::with_window("HK.00700", 4);
        let appended = feed.backfill(14, &source).await.unwrap();
        assert_eq!(appended, 10);
        assert_eq!(feed.history().last().unwrap().close, 10.0);
    }

    #[test]
    fn test_rejects_invalid_close() {
        let bar = PriceBar::flat("HK.00700", Utc::now(), f64::NAN, 1.0);
        assert!(validate("HK.00700", &bar).is_err());
        let bar = PriceBar::flat("US.AAPL", Utc::now(), 10.0, 1.0);
        assert!(validate("HK.00700", &bar).is_err());
    }
}
