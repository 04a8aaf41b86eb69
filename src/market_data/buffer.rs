use crate::models::PriceBar;
use std::collections::VecDeque;

/// Rolling window of bars for one symbol
///
/// Bars are kept oldest first. A bar is only appended when its timestamp is
/// strictly newer than the last stored bar, so re-reading the same bar from
/// the gateway never double-appends.
#[derive(Debug, Clone)]
pub struct BarBuffer {
    bars: VecDeque<PriceBar>,
    max_bars: usize,
}

impl BarBuffer {
    /// Create a new bar buffer
    ///
    /// # Arguments
    /// * `max_bars` - Maximum number of bars to keep
    pub fn new(max_bars: usize) -> Self {
        let max_bars = max_bars.max(1);
        Self {
            bars: VecDeque::with_capacity(max_bars),
            max_bars,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_bars
    }

    /// Change the bound, evicting oldest bars if it shrank
    pub fn set_capacity(&mut self, max_bars: usize) {
        self.max_bars = max_bars.max(1);
        self.evict();
    }

    /// Append a bar if it is newer than the last one held.
    ///
    /// Returns whether the bar was appended.
    pub fn push(&mut self, bar: PriceBar) -> bool {
        if let Some(last) = self.bars.back() {
            if bar.timestamp <= last.timestamp {
                return false;
            }
        }

        self.bars.push_back(bar);
        self.evict();
        true
    }

    fn evict(&mut self) {
        while self.bars.len() > self.max_bars {
            self.bars.pop_front();
        }
    }

    /// All bars, most recent last
    pub fn bars(&self) -> Vec<PriceBar> {
        self.bars.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(minute: i64, price: f64) -> PriceBar {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 1, 30, 0).unwrap();
        PriceBar::flat("HK.00700", start + Duration::minutes(minute), price, 1000.0)
    }

    #[test]
    fn test_push_and_read() {
        let mut buffer = BarBuffer::new(100);

        assert!(buffer.push(bar(0, 100.0)));
        assert!(buffer.push(bar(1, 101.0)));
        assert!(buffer.push(bar(2, 102.0)));

        let bars = buffer.bars();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 100.0);
        assert_eq!(bars[2].close, 102.0);
    }

    #[test]
    fn test_duplicate_timestamp_not_appended() {
        let mut buffer = BarBuffer::new(100);

        assert!(buffer.push(bar(0, 100.0)));
        assert!(!buffer.push(bar(0, 100.5)));
        // Older bars arriving late are ignored too
        buffer.push(bar(5, 101.0));
        assert!(!buffer.push(bar(3, 99.0)));

        let bars = buffer.bars();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 101.0);
    }

    #[test]
    fn test_fifo_eviction() {
        let mut buffer = BarBuffer::new(5);

        for i in 0..10 {
            buffer.push(bar(i, 100.0 + i as f64));
        }

        let bars = buffer.bars();
        assert_eq!(bars.len(), 5);
        assert_eq!(bars[0].close, 105.0);
        assert_eq!(bars[4].close, 109.0);
    }

    #[test]
    fn test_shrinking_capacity_evicts_oldest() {
        let mut buffer = BarBuffer::new(10);
        for i in 0..8 {
            buffer.push(bar(i, i as f64));
        }

        buffer.set_capacity(3);
        let closes: Vec<f64> = buffer.bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![5.0, 6.0, 7.0]);
    }
}
