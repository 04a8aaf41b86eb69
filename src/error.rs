//! Error taxonomy shared by every component.
//!
//! Components return these as typed results; the session orchestrator is the
//! only place that decides between retry, skip and terminate.

use std::time::Duration;
use thiserror::Error;

use crate::models::CorrelationId;

/// Transport-level failure talking to the gateway
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionError {
    /// Nothing is listening on the configured endpoint
    #[error("gateway process is not running at {endpoint}")]
    GatewayNotRunning { endpoint: String },

    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("gateway call `{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("not connected to gateway")]
    NotConnected,

    #[error("gateway protocol error: {0}")]
    Protocol(String),

    /// The gateway answered, but with an error reply
    #[error("gateway error {code}: {message}")]
    Remote { code: i32, message: String },
}

impl ConnectionError {
    /// Whether reconnecting with backoff may help within this run
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::GatewayNotRunning { .. })
    }

    /// Whether the transport itself is gone and the session must reconnect
    pub fn is_transport_loss(&self) -> bool {
        matches!(
            self,
            ConnectionError::Transient(_) | ConnectionError::Timeout { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    #[error("gateway rejected credentials: {0}")]
    Rejected(String),

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Market data could not be fetched this tick
#[derive(Debug, Clone, Error, PartialEq)]
#[error("market data unavailable for {symbol}: {reason}")]
pub struct DataUnavailable {
    pub symbol: String,
    pub reason: String,
}

impl DataUnavailable {
    pub fn new(symbol: &str, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("order {correlation_id} rejected: {reason}")]
pub struct OrderRejected {
    pub correlation_id: CorrelationId,
    pub reason: String,
}

/// Failure submitting or cancelling an order
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmitError {
    #[error(transparent)]
    Rejected(#[from] OrderRejected),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StrategyError {
    #[error("unknown strategy: {0}")]
    Unknown(String),

    #[error("invalid strategy parameters: {0}")]
    InvalidParameters(String),
}

/// Outcomes that end a trading session
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("gateway unreachable: {0}")]
    GatewayUnavailable(ConnectionError),

    #[error("gave up after {attempts} consecutive connection failures, last: {last}")]
    RetryBudgetExhausted {
        attempts: u32,
        last: ConnectionError,
    },

    #[error("session has no symbols to trade")]
    NoSymbols,

    #[error("session cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: crate::session::SessionState,
    },
}

/// Umbrella error for callers that do not care which component failed
#[derive(Debug, Error)]
pub enum TradingError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    DataUnavailable(#[from] DataUnavailable),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_not_running_is_not_retryable() {
        let err = ConnectionError::GatewayNotRunning {
            endpoint: "127.0.0.1:11111".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(ConnectionError::Transient("reset".to_string()).is_retryable());
        assert!(ConnectionError::Timeout {
            operation: "ping",
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = DataUnavailable::new("HK.00700", "market closed");
        assert_eq!(
            err.to_string(),
            "market data unavailable for HK.00700: market closed"
        );

        let err: TradingError = AuthError::MissingCredential("FUTU_ACCOUNT_PWD").into();
        assert!(err.to_string().contains("FUTU_ACCOUNT_PWD"));
    }
}
