use super::{SignalReport, SpreadSign, Strategy, StrategyState};
use crate::error::StrategyError;
use crate::indicators::{calculate_ema, calculate_sma, closes};
use crate::models::{PriceBar, Signal};

/// Relative tolerance below which the two averages count as equal
const SPREAD_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaKind {
    Simple,
    Exponential,
}

/// Moving-average crossover
///
/// Edge-triggered: a Buy fires only when the short average moves from at or
/// below the long average to above it, a Sell only on the opposite move. The
/// first tick with enough history just records the current side.
#[derive(Debug, Clone)]
pub struct MovingAverageCrossover {
    short_window: usize,
    long_window: usize,
    kind: MaKind,
}

impl MovingAverageCrossover {
    pub fn new(short_window: usize, long_window: usize, kind: MaKind) -> Result<Self, StrategyError> {
        if short_window == 0 || short_window >= long_window {
            return Err(StrategyError::InvalidParameters(format!(
                "need 0 < short window < long window, got {} and {}",
                short_window, long_window
            )));
        }
        Ok(Self {
            short_window,
            long_window,
            kind,
        })
    }

    pub fn sma(short_window: usize, long_window: usize) -> Result<Self, StrategyError> {
        Self::new(short_window, long_window, MaKind::Simple)
    }

    pub fn ema(short_window: usize, long_window: usize) -> Result<Self, StrategyError> {
        Self::new(short_window, long_window, MaKind::Exponential)
    }

    fn average(&self, prices: &[f64], period: usize) -> Option<f64> {
        match self.kind {
            MaKind::Simple => calculate_sma(prices, period),
            MaKind::Exponential => calculate_ema(prices, period),
        }
    }
}

impl Strategy for MovingAverageCrossover {
    fn name(&self) -> &str {
        match self.kind {
            MaKind::Simple => "sma",
            MaKind::Exponential => "ema",
        }
    }

    fn parameters(&self) -> Vec<(String, String)> {
        vec![
            ("short_window".to_string(), self.short_window.to_string()),
            ("long_window".to_string(), self.long_window.to_string()),
        ]
    }

    fn required_history(&self) -> usize {
        self.long_window
    }

    fn evaluate(&self, history: &[PriceBar], prior: &StrategyState) -> (SignalReport, StrategyState) {
        if history.len() < self.long_window {
            return (SignalReport::hold(), prior.clone());
        }

        let prices = closes(history);
        let (Some(short_ma), Some(long_ma)) = (
            self.average(&prices, self.short_window),
            self.average(&prices, self.long_window),
        ) else {
            return (SignalReport::hold(), prior.clone());
        };

        let spread = short_ma - long_ma;
        let sign = SpreadSign::of(spread, SPREAD_TOLERANCE * long_ma.abs().max(1.0));

        let signal = match (prior.last_spread_sign, sign) {
            (None, _) => Signal::Hold,
            (Some(previous), SpreadSign::Positive) if previous != SpreadSign::Positive => Signal::Buy,
            (Some(previous), SpreadSign::Negative) if previous != SpreadSign::Negative => Signal::Sell,
            _ => Signal::Hold,
        };

        let report = SignalReport {
            signal,
            values: vec![("short_ma", short_ma), ("long_ma", long_ma), ("spread", spread)],
        };
        let state = StrategyState {
            last_spread_sign: Some(sign),
        };
        (report, state)
    }
}
