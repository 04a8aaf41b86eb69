// Core modules
pub mod auth;
pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod indicators;
pub mod market_data;
pub mod models;
pub mod session;
pub mod strategy;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{
    AuthError, ConfigError, ConnectionError, DataUnavailable, OrderRejected, SessionError,
    StrategyError, SubmitError, TradingError,
};
pub use execution::{LedgerPolicy, OrderLedger, OrderRouter};
pub use gateway::{GatewayConnection, PaperGateway, TcpTransport, Transport};
pub use market_data::{BarSource, MarketDataFeed};
pub use models::*;
pub use session::{SessionConfig, SessionReport, SessionState, TradingSession};
pub use strategy::{Strategy, StrategyRegistry};

// Error handling
pub type Result<T, E = TradingError> = std::result::Result<T, E>;
