// Trading strategy module
pub mod crossover;
pub mod registry;

use crate::models::{PriceBar, Signal};
use std::fmt;

pub use crossover::{MaKind, MovingAverageCrossover};
pub use registry::{StrategyParams, StrategyRegistry};

/// Sign of `short MA - long MA` at the last evaluated tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadSign {
    Negative,
    Zero,
    Positive,
}

impl SpreadSign {
    /// Classify a spread, treating differences below `tolerance` as zero
    pub fn of(spread: f64, tolerance: f64) -> Self {
        if spread > tolerance {
            SpreadSign::Positive
        } else if spread < -tolerance {
            SpreadSign::Negative
        } else {
            SpreadSign::Zero
        }
    }
}

/// State a strategy carries from one tick to the next
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyState {
    pub last_spread_sign: Option<SpreadSign>,
}

/// A signal plus the indicator values that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct SignalReport {
    pub signal: Signal,
    pub values: Vec<(&'static str, f64)>,
}

impl SignalReport {
    pub fn hold() -> Self {
        Self {
            signal: Signal::Hold,
            values: Vec::new(),
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, v)| *v)
    }
}

impl fmt::Display for SignalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.signal)?;
        for (name, value) in &self.values {
            write!(f, " {}={:.4}", name, value)?;
        }
        Ok(())
    }
}

/// Base trait for all trading strategies
///
/// Strategies are pure: everything carried between ticks lives in the
/// returned `StrategyState`, which the caller stores and hands back.
pub trait Strategy: Send + Sync {
    /// Registry identifier, also used when deriving order correlation ids
    fn name(&self) -> &str;

    /// Parameter names and values, for logs and reports
    fn parameters(&self) -> Vec<(String, String)>;

    /// Bars of history needed before the strategy can evaluate
    fn required_history(&self) -> usize;

    /// Evaluate the latest history (most recent bar last)
    fn evaluate(&self, history: &[PriceBar], prior: &StrategyState) -> (SignalReport, StrategyState);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spread_sign() {
        assert_eq!(SpreadSign::of(0.5, 1e-9), SpreadSign::Positive);
        assert_eq!(SpreadSign::of(-0.5, 1e-9), SpreadSign::Negative);
        assert_eq!(SpreadSign::of(1e-12, 1e-9), SpreadSign::Zero);
    }

    #[test]
    fn test_report_display() {
        let report = SignalReport {
            signal: Signal::Buy,
            values: vec![("short_ma", 11.0), ("long_ma", 10.5)],
        };
        assert_eq!(report.to_string(), "Buy short_ma=11.0000 long_ma=10.5000");
        assert_eq!(report.value("long_ma"), Some(10.5));
        assert_eq!(report.value("spread"), None);
    }
}
