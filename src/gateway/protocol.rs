use serde::{Deserialize, Serialize};

use crate::models::{
    AccountInfo, AccountSummary, CorrelationId, FillEvent, GatewayOrderId, MarketSnapshot,
    OrderBook, OrderKind, OrderStatus, Position, PriceBar, Quote, Side, TradingEnv,
};

/// Requests understood by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GatewayRequest {
    Handshake {
        client_id: String,
    },
    Login {
        account_id: String,
        password: String,
    },
    UnlockTrade {
        password: String,
        trading_env: TradingEnv,
    },
    Ping,
    Quote {
        symbol: String,
    },
    Snapshot {
        symbols: Vec<String>,
    },
    Kline {
        symbol: String,
        count: usize,
    },
    OrderBook {
        symbol: String,
        depth: usize,
    },
    PlaceOrder {
        symbol: String,
        side: Side,
        quantity: i64,
        kind: OrderKind,
        correlation_id: CorrelationId,
        trading_env: TradingEnv,
    },
    CancelOrder {
        order_id: GatewayOrderId,
        trading_env: TradingEnv,
    },
    /// Change a working order; `None` keeps the current price
    ModifyOrder {
        order_id: GatewayOrderId,
        quantity: i64,
        price: Option<f64>,
        trading_env: TradingEnv,
    },
    Positions {
        trading_env: TradingEnv,
    },
    AccountInfo {
        trading_env: TradingEnv,
    },
    AccountList,
    OrderList {
        trading_env: TradingEnv,
    },
    PollEvents,
}

impl GatewayRequest {
    /// Operation name used in logs and timeout errors
    pub fn operation(&self) -> &'static str {
        match self {
            GatewayRequest::Handshake { .. } => "handshake",
            GatewayRequest::Login { .. } => "login",
            GatewayRequest::UnlockTrade { .. } => "unlock_trade",
            GatewayRequest::Ping => "ping",
            GatewayRequest::Quote { .. } => "quote",
            GatewayRequest::Snapshot { .. } => "snapshot",
            GatewayRequest::Kline { .. } => "kline",
            GatewayRequest::OrderBook { .. } => "order_book",
            GatewayRequest::PlaceOrder { .. } => "place_order",
            GatewayRequest::CancelOrder { .. } => "cancel_order",
            GatewayRequest::ModifyOrder { .. } => "modify_order",
            GatewayRequest::Positions { .. } => "positions",
            GatewayRequest::AccountInfo { .. } => "account_info",
            GatewayRequest::AccountList => "account_list",
            GatewayRequest::OrderList { .. } => "order_list",
            GatewayRequest::PollEvents => "poll_events",
        }
    }
}

/// Handshake reply describing the gateway process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayInfo {
    pub version: String,
    pub quote_logged_in: bool,
    pub trade_logged_in: bool,
}

/// Order as listed by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSnapshot {
    pub order_id: GatewayOrderId,
    pub correlation_id: Option<CorrelationId>,
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub filled_quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum GatewayResponse {
    Handshake(GatewayInfo),
    Ack,
    Pong,
    Quote(Quote),
    Snapshots(Vec<MarketSnapshot>),
    Klines(Vec<PriceBar>),
    OrderBook(OrderBook),
    OrderAccepted { order_id: GatewayOrderId },
    Positions(Vec<Position>),
    Account(AccountInfo),
    Accounts(Vec<AccountSummary>),
    Orders(Vec<OrderSnapshot>),
    Events(Vec<FillEvent>),
    Error { code: i32, message: String },
}

/// Wire frame: one JSON object per line, correlated by `id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}
