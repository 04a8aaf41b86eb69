use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One K-line bar for a symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceBar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    /// Bar whose OHLC are all the same price (useful for quotes and tests)
    pub fn flat(symbol: &str, timestamp: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }
}

/// Real-time quote snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub last_price: f64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub prev_close_price: f64,
    pub volume: f64,
    pub turnover: f64,
    pub timestamp: DateTime<Utc>,
}

/// Market-wide snapshot row, as returned for a batch of symbols
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: f64,
    pub prev_close_price: f64,
    pub volume: f64,
    pub turnover: f64,
    pub lot_size: i64,
    pub suspended: bool,
    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Percentage change against the previous close
    pub fn change_rate(&self) -> f64 {
        if self.prev_close_price == 0.0 {
            0.0
        } else {
            (self.last_price - self.prev_close_price) / self.prev_close_price * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBookLevel {
    pub price: f64,
    pub volume: f64,
    pub order_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

/// Trading signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Sign applied to a fill quantity when updating a position
    pub fn sign(self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum OrderKind {
    Market,
    Limit(f64),
}

/// Client-assigned idempotency key for an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Deterministic id derived from the event that caused the order.
    ///
    /// Re-deriving the id for the same event always yields the same value,
    /// so a retried tick cannot produce a second order.
    pub fn for_event(strategy: &str, symbol: &str, side: Side, event_key: &str) -> Self {
        let name = format!("{strategy}:{symbol}:{side}:{event_key}");
        Self(uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
    }

    /// Fresh random id for manual orders
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order id assigned by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GatewayOrderId(pub String);

impl fmt::Display for GatewayOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub kind: OrderKind,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Accepted,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    /// Rejected and cancelled orders may be resubmitted under the same id
    pub fn is_failed(self) -> bool {
        matches!(self, OrderStatus::Rejected | OrderStatus::Cancelled)
    }

    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Accepted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRecord {
    pub intent: OrderIntent,
    pub gateway_order_id: Option<GatewayOrderId>,
    pub status: OrderStatus,
    pub filled_quantity: i64,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn new(intent: OrderIntent) -> Self {
        let now = Utc::now();
        Self {
            intent,
            gateway_order_id: None,
            status: OrderStatus::Pending,
            filled_quantity: 0,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_quantity(&self) -> i64 {
        (self.intent.quantity - self.filled_quantity).max(0)
    }
}

/// Net position in a symbol. Positive quantity is long, negative is short.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub quantity: i64,
    pub average_cost: f64,
}

impl Position {
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity: 0,
            average_cost: 0.0,
        }
    }

    /// Apply a signed fill, keeping average cost of the remaining exposure
    pub fn apply_fill(&mut self, signed_qty: i64, price: f64) {
        if signed_qty == 0 {
            return;
        }
        let new_qty = self.quantity + signed_qty;
        let same_direction = self.quantity == 0 || self.quantity.signum() == signed_qty.signum();

        if same_direction {
            let total_cost = self.average_cost * self.quantity.abs() as f64
                + price * signed_qty.abs() as f64;
            self.average_cost = total_cost / new_qty.abs() as f64;
        } else if new_qty == 0 {
            self.average_cost = 0.0;
        } else if new_qty.signum() != self.quantity.signum() {
            // Flipped through flat: the remainder was opened at this price
            self.average_cost = price;
        }

        self.quantity = new_qty;
    }
}

/// Callback-style event reported by the gateway for an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FillEvent {
    pub gateway_order_id: GatewayOrderId,
    pub correlation_id: Option<CorrelationId>,
    pub symbol: String,
    pub side: Side,
    pub kind: FillKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FillKind {
    /// One execution; `deal_id` is unique per execution, not per order
    Filled {
        deal_id: String,
        quantity: i64,
        price: f64,
    },
    Rejected { reason: String },
    Cancelled,
}

/// Funds summary for the trading account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountInfo {
    pub power: f64,
    pub total_assets: f64,
    pub cash: f64,
    pub market_value: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSummary {
    pub account_id: String,
    pub trading_env: TradingEnv,
    pub account_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradingEnv {
    Real,
    Simulate,
}

impl fmt::Display for TradingEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingEnv::Real => write!(f, "REAL"),
            TradingEnv::Simulate => write!(f, "SIMULATE"),
        }
    }
}

/// Markets the gateway can trade, keyed by their configuration names
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Market {
    Hk,
    Us,
    Sh,
    Sz,
    Sg,
}

impl Market {
    /// Parse a `DEFAULT_MARKET` value (`HK`, `US`, `CN`, `CN_SZ`, `SG`)
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "HK" => Some(Market::Hk),
            "US" => Some(Market::Us),
            "CN" | "SH" => Some(Market::Sh),
            "CN_SZ" | "SZ" => Some(Market::Sz),
            "SG" => Some(Market::Sg),
            _ => None,
        }
    }

    /// Code prefix used in gateway symbols
    pub fn code(self) -> &'static str {
        match self {
            Market::Hk => "HK",
            Market::Us => "US",
            Market::Sh => "SH",
            Market::Sz => "SZ",
            Market::Sg => "SG",
        }
    }

    /// Qualify a bare security code with this market's prefix.
    ///
    /// Codes that already carry a prefix (`HK.00700`) are returned unchanged.
    pub fn qualify(self, code: &str) -> String {
        let code = code.trim();
        if code.contains('.') {
            code.to_uppercase()
        } else {
            format!("{}.{}", self.code(), code.to_uppercase())
        }
    }
}
