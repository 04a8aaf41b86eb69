//! Strategy identifier → constructor mapping.
//!
//! The CLI and the session only ever see `Box<dyn Strategy>`; adding a
//! strategy means registering one more constructor here.

use std::collections::BTreeMap;

use super::{MovingAverageCrossover, Strategy};
use crate::error::StrategyError;

const DEFAULT_SHORT_WINDOW: usize = 10;
const DEFAULT_LONG_WINDOW: usize = 30;

/// Parameters a strategy constructor may read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyParams {
    pub short_window: usize,
    pub long_window: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            short_window: DEFAULT_SHORT_WINDOW,
            long_window: DEFAULT_LONG_WINDOW,
        }
    }
}

pub type StrategyConstructor = fn(&StrategyParams) -> Result<Box<dyn Strategy>, StrategyError>;

pub struct StrategyRegistry {
    constructors: BTreeMap<&'static str, StrategyConstructor>,
}

impl StrategyRegistry {
    /// Registry with no strategies
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the built-in crossover strategies (`sma`, `ema`)
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("sma", build_sma);
        registry.register("ema", build_ema);
        registry
    }

    pub fn register(&mut self, id: &'static str, constructor: StrategyConstructor) {
        self.constructors.insert(id, constructor);
    }

    pub fn create(&self, id: &str, params: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
        let key = id.trim().to_lowercase();
        let constructor = self
            .constructors
            .get(key.as_str())
            .ok_or_else(|| StrategyError::Unknown(id.to_string()))?;
        constructor(params)
    }

    /// Registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }
}

fn build_sma(params: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
    Ok(Box::new(MovingAverageCrossover::sma(
        params.short_window,
        params.long_window,
    )?))
}

fn build_ema(params: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
    Ok(Box::new(MovingAverageCrossover::ema(
        params.short_window,
        params.long_window,
    )?))
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_strategies() {
        let registry = StrategyRegistry::new();
        assert_eq!(registry.identifiers(), vec!["ema", "sma"]);

        let strategy = registry.create("SMA", &StrategyParams::default()).unwrap();
        assert_eq!(strategy.name(), "sma");
        assert_eq!(strategy.required_history(), 30);
    }

    #[test]
    fn test_unknown_strategy() {
        let registry = StrategyRegistry::new();
        let err = registry.create("macd", &StrategyParams::default()).err().unwrap();
        assert_eq!(err, StrategyError::Unknown("macd".to_string()));
    }

    #[test]
    fn test_invalid_parameters_surface() {
        let registry = StrategyRegistry::new();
        let params = StrategyParams {
            short_window: 30,
            long_window: 10,
        };
        assert!(matches!(
            registry.create("sma", &params),
            Err(StrategyError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_register_custom_constructor() {
        fn fast_sma(_: &StrategyParams) -> Result<Box<dyn Strategy>, StrategyError> {
            Ok(Box::new(MovingAverageCrossover::sma(2, 4)?))
        }

        let mut registry = StrategyRegistry::empty();
        registry.register("fast_sma", fast_sma);

        let strategy = registry.create("fast_sma", &StrategyParams::default()).unwrap();
        assert_eq!(strategy.required_history(), 4);
    }
}
