// Session orchestration: connection lifecycle plus the poll-evaluate-act loop
mod orchestrator;

use std::time::Duration;

use crate::config::AppConfig;
use crate::gateway::BackoffPolicy;
use crate::models::{OrderRecord, Position};
use crate::strategy::SignalReport;

pub use orchestrator::TradingSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Sleep between ticks
    pub tick_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive failed connection attempts before the session gives up
    pub max_consecutive_failures: u32,
    /// Load each symbol's history window from the gateway at startup
    pub backfill: bool,
    /// Cancel still-working orders while draining
    pub cancel_on_stop: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            backoff: BackoffPolicy::default(),
            max_consecutive_failures: 5,
            backfill: true,
            cancel_on_stop: true,
        }
    }
}

impl SessionConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            tick_interval: config.quote_interval,
            backoff: config.backoff.clone(),
            max_consecutive_failures: config.max_consecutive_failures,
            backfill: true,
            cancel_on_stop: true,
        }
    }
}

/// What happened to one symbol during a tick
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    /// Data fetch failed; the symbol sits this tick out
    DataUnavailable(String),
    /// The gateway served a bar the feed already had
    NoNewBar,
    Evaluated {
        report: SignalReport,
        action: TickAction,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    None,
    /// The ledger declined to act on the signal
    Skipped(String),
    Submitted(OrderRecord),
    Rejected(String),
    /// Submission outcome unknown because the gateway went away
    SubmitFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTick {
    pub symbol: String,
    pub outcome: SymbolOutcome,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickReport {
    /// 1-based tick number
    pub tick: u64,
    pub reconnected: bool,
    pub events_applied: usize,
    pub symbols: Vec<SymbolTick>,
}

impl TickReport {
    /// Orders submitted during this tick
    pub fn submitted(&self) -> Vec<&OrderRecord> {
        self.symbols
            .iter()
            .filter_map(|s| match &s.outcome {
                SymbolOutcome::Evaluated {
                    action: TickAction::Submitted(record),
                    ..
                } => Some(record),
                _ => None,
            })
            .collect()
    }
}

/// Summary returned when a session stops
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub state: SessionState,
    pub ticks: u64,
    pub orders_submitted: usize,
    pub orders_rejected: usize,
    pub reconnects: u32,
    pub positions: Vec<Position>,
}
