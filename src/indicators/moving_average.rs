use crate::models::PriceBar;

/// Close prices of a bar sequence, oldest first
pub fn closes(bars: &[PriceBar]) -> Vec<f64> {
    bars.iter().map(|bar| bar.close).collect()
}

/// Simple Moving Average over the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Exponential Moving Average, seeded with the SMA of the first `period` prices
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = calculate_sma(&prices[..period], period)?;
    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
    }

    Some(ema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_sma_uses_most_recent_prices() {
        let prices = vec![10.0, 10.0, 10.0, 12.0, 14.0, 16.0];
        assert_eq!(calculate_sma(&prices, 2), Some(15.0));
        assert_eq!(calculate_sma(&prices, 4), Some(13.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        assert!(calculate_sma(&[100.0, 102.0], 5).is_none());
        assert!(calculate_sma(&[100.0], 0).is_none());
    }

    #[test]
    fn test_ema_tracks_trend() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let ema = calculate_ema(&prices, 5).unwrap();
        // Seed SMA is 104, one step toward 110
        assert!((ema - 106.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_of_flat_series_is_the_price() {
        let prices = vec![42.0; 12];
        assert_eq!(calculate_ema(&prices, 4), Some(42.0));
    }

    #[test]
    fn test_closes() {
        let now = Utc::now();
        let bars = vec![
            PriceBar::flat("HK.00700", now, 1.0, 0.0),
            PriceBar::flat("HK.00700", now, 2.0, 0.0),
        ];
        assert_eq!(closes(&bars), vec![1.0, 2.0]);
    }
}
