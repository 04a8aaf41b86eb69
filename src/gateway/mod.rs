// Gateway connectivity: transport seam, connection lifecycle and simulated gateway
pub mod backoff;
mod connection;
pub mod paper;
pub mod protocol;
pub mod tcp;

use async_trait::async_trait;

use crate::error::ConnectionError;
use protocol::{GatewayRequest, GatewayResponse};

pub use backoff::BackoffPolicy;
pub use connection::GatewayConnection;
pub use paper::{PaperGateway, ReceivedOrder};
pub use protocol::{GatewayInfo, OrderSnapshot};
pub use tcp::TcpTransport;

/// Lifecycle of the gateway session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Ready,
    Failed,
}

/// Request/response channel to the gateway process
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open (or reopen) the channel to `endpoint`
    async fn open(&self, endpoint: &str) -> Result<(), ConnectionError>;

    async fn call(&self, request: GatewayRequest) -> Result<GatewayResponse, ConnectionError>;

    async fn close(&self);
}
