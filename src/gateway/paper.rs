//! In-process simulated gateway.
//!
//! Implements [`Transport`] directly, so a [`GatewayConnection`] built on it
//! behaves like one talking to a real gateway: same handshake, login, order
//! and event flow. Used by the test suite and by the CLI's `--paper` mode.
//!
//! Simulated time advances one bar per event poll. Scripted symbols reveal
//! their next bar on each poll; once the script is exhausted the last bar
//! keeps being served. Symbols without a script follow a seeded random walk.
//!
//! [`GatewayConnection`]: super::GatewayConnection

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use super::protocol::{GatewayInfo, GatewayRequest, GatewayResponse, OrderSnapshot};
use super::Transport;
use crate::error::ConnectionError;
use crate::models::{
    AccountInfo, AccountSummary, CorrelationId, FillEvent, FillKind, GatewayOrderId,
    MarketSnapshot, OrderBook, OrderBookLevel, OrderKind, OrderStatus, Position, PriceBar, Quote,
    Side, TradingEnv,
};

const PAPER_VERSION: &str = "paper-1.0";
const STARTING_CASH: f64 = 1_000_000.0;
const RANDOM_WALK_START: f64 = 100.0;
const BAR_MINUTES: i64 = 1;
const LOT_SIZE: i64 = 100;

#[derive(Debug, Clone)]
struct Script {
    bars: Vec<PriceBar>,
    revealed: usize,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: GatewayOrderId,
    correlation_id: CorrelationId,
    symbol: String,
    side: Side,
    quantity: i64,
    price: f64,
    limit: Option<f64>,
}

#[derive(Debug)]
struct PaperState {
    open: bool,
    dropped: bool,
    refuse: bool,
    failing_connects: u32,
    connect_attempts: u32,
    expected_login_password: Option<String>,
    expected_unlock_password: Option<String>,
    reject_reason: Option<String>,
    auto_fill: bool,
    scripts: HashMap<String, Script>,
    walks: HashMap<String, Vec<PriceBar>>,
    unavailable: HashSet<String>,
    pending: Vec<PaperOrder>,
    queued_events: Vec<FillEvent>,
    positions: HashMap<String, Position>,
    cash: f64,
    placed: Vec<ReceivedOrder>,
    next_order: u64,
    next_deal: u64,
    rng: StdRng,
}

/// What the simulated gateway saw for one `place_order` call
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedOrder {
    pub correlation_id: CorrelationId,
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
}

/// Simulated gateway. Clones share state, so a test can keep a handle for
/// scripting and inspection while the connection owns another.
#[derive(Clone)]
pub struct PaperGateway {
    state: Arc<Mutex<PaperState>>,
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Gateway whose random walks are reproducible
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(PaperState {
                open: false,
                dropped: false,
                refuse: false,
                failing_connects: 0,
                connect_attempts: 0,
                expected_login_password: None,
                expected_unlock_password: None,
                reject_reason: None,
                auto_fill: true,
                scripts: HashMap::new(),
                walks: HashMap::new(),
                unavailable: HashSet::new(),
                pending: Vec::new(),
                queued_events: Vec::new(),
                positions: HashMap::new(),
                cash: STARTING_CASH,
                placed: Vec::new(),
                next_order: 1,
                next_deal: 1,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script future closes for `symbol`, one bar per day from 2024-01-02
    pub fn with_bars(self, symbol: &str, closes: &[f64]) -> Self {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).single().unwrap_or_else(Utc::now);
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, close)| PriceBar::flat(symbol, start + Duration::days(i as i64), *close, 1_000.0))
            .collect();
        self.script_bars(symbol, bars);
        self
    }

    /// Script future bars for `symbol`, revealed one per event poll
    pub fn script_bars(&self, symbol: &str, bars: Vec<PriceBar>) {
        self.lock()
            .scripts
            .insert(symbol.to_string(), Script { bars, revealed: 0 });
    }

    /// Reveal `n` scripted bars up front, as if they were already history
    pub fn preload(&self, symbol: &str, n: usize) {
        if let Some(script) = self.lock().scripts.get_mut(symbol) {
            script.revealed = (script.revealed + n).min(script.bars.len());
        }
    }

    /// Step simulated time by one bar without polling events
    pub fn advance(&self) {
        self.lock().advance();
    }

    /// The next `n` connection attempts fail transiently
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// Behave as if no gateway process is listening
    pub fn refuse_connections(&self) {
        self.lock().refuse = true;
    }

    /// Sever the current channel; calls fail until the client reconnects
    pub fn drop_connection(&self) {
        let mut state = self.lock();
        state.open = false;
        state.dropped = true;
    }

    /// Login must present exactly this (transmitted) password
    pub fn expect_login_password(&self, password: &str) {
        self.lock().expected_login_password = Some(password.to_string());
    }

    /// Trade unlock must present exactly this (transmitted) password
    pub fn expect_unlock_password(&self, password: &str) {
        self.lock().expected_unlock_password = Some(password.to_string());
    }

    pub fn reject_orders(&self, reason: &str) {
        self.lock().reject_reason = Some(reason.to_string());
    }

    /// Keep accepted orders working instead of filling them on the next poll
    pub fn hold_fills(&self) {
        self.lock().auto_fill = false;
    }

    pub fn release_fills(&self) {
        self.lock().auto_fill = true;
    }

    /// K-line requests for `symbol` answer with an error reply
    pub fn mark_unavailable(&self, symbol: &str) {
        self.lock().unavailable.insert(symbol.to_string());
    }

    pub fn mark_available(&self, symbol: &str) {
        self.lock().unavailable.remove(symbol);
    }

    /// Seed a position the gateway reports at startup
    pub fn set_position(&self, symbol: &str, quantity: i64, average_cost: f64) {
        self.lock().positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                quantity,
                average_cost,
            },
        );
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.lock().positions.get(symbol).cloned()
    }

    /// Number of `place_order` calls received, accepted or not
    pub fn orders_received(&self) -> usize {
        self.lock().placed.len()
    }

    pub fn placed_orders(&self) -> Vec<ReceivedOrder> {
        self.lock().placed.clone()
    }

    /// Accepted orders not yet filled or cancelled
    pub fn working_orders(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }
}

impl PaperState {
    fn advance(&mut self) {
        for script in self.scripts.values_mut() {
            if script.revealed < script.bars.len() {
                script.revealed += 1;
            }
        }

        let symbols: Vec<String> = self.walks.keys().cloned().collect();
        for symbol in symbols {
            let step: f64 = self.rng.gen_range(-0.01..0.01);
            if let Some(history) = self.walks.get_mut(&symbol) {
                if let Some(last) = history.last() {
                    let close = (last.close * (1.0 + step)).max(0.01);
                    let bar = walk_bar(&symbol, last.timestamp + Duration::minutes(BAR_MINUTES), last.close, close);
                    history.push(bar);
                }
            }
        }
    }

    /// Bars visible now for `symbol`, seeding a random walk on first use
    fn visible_bars(&mut self, symbol: &str, seed_len: usize) -> Vec<PriceBar> {
        if let Some(script) = self.scripts.get(symbol) {
            return script.bars[..script.revealed].to_vec();
        }

        if !self.walks.contains_key(symbol) {
            let count = seed_len.max(1);
            let start = Utc::now() - Duration::minutes(count as i64 * BAR_MINUTES);
            let mut price = RANDOM_WALK_START;
            let mut history = Vec::with_capacity(count);
            for i in 0..count {
                let step: f64 = self.rng.gen_range(-0.01..0.01);
                let close = (price * (1.0 + step)).max(0.01);
                history.push(walk_bar(
                    symbol,
                    start + Duration::minutes(i as i64 * BAR_MINUTES),
                    price,
                    close,
                ));
                price = close;
            }
            self.walks.insert(symbol.to_string(), history);
        }

        self.walks.get(symbol).cloned().unwrap_or_default()
    }

    fn last_price(&mut self, symbol: &str) -> Option<f64> {
        self.visible_bars(symbol, 1).last().map(|bar| bar.close)
    }

    fn handle(&mut self, request: GatewayRequest) -> GatewayResponse {
        match request {
            GatewayRequest::Handshake { .. } => GatewayResponse::Handshake(GatewayInfo {
                version: PAPER_VERSION.to_string(),
                quote_logged_in: true,
                trade_logged_in: true,
            }),
            GatewayRequest::Login { password, .. } => {
                check_password(self.expected_login_password.as_deref(), &password)
            }
            GatewayRequest::UnlockTrade { password, .. } => {
                check_password(self.expected_unlock_password.as_deref(), &password)
            }
            GatewayRequest::Ping => GatewayResponse::Pong,
            GatewayRequest::Quote { symbol } => self.quote(&symbol),
            GatewayRequest::Snapshot { symbols } => self.snapshot(&symbols),
            GatewayRequest::Kline { symbol, count } => {
                if self.unavailable.contains(&symbol) {
                    return error(-1, &format!("no k-line data for {}", symbol));
                }
                let bars = self.visible_bars(&symbol, count);
                let skip = bars.len().saturating_sub(count);
                GatewayResponse::Klines(bars[skip..].to_vec())
            }
            GatewayRequest::OrderBook { symbol, depth } => self.order_book(&symbol, depth),
            GatewayRequest::PlaceOrder {
                symbol,
                side,
                quantity,
                kind,
                correlation_id,
                ..
            } => self.place(symbol, side, quantity, kind, correlation_id),
            GatewayRequest::CancelOrder { order_id, .. } => self.cancel(&order_id),
            GatewayRequest::ModifyOrder {
                order_id,
                quantity,
                price,
                ..
            } => self.modify(&order_id, quantity, price),
            GatewayRequest::Positions { .. } => {
                let mut positions: Vec<Position> = self
                    .positions
                    .values()
                    .filter(|p| p.quantity != 0)
                    .cloned()
                    .collect();
                positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
                GatewayResponse::Positions(positions)
            }
            GatewayRequest::AccountInfo { .. } => {
                let market_value: f64 = self
                    .positions
                    .values()
                    .map(|p| p.quantity as f64 * p.average_cost)
                    .sum();
                GatewayResponse::Account(AccountInfo {
                    power: self.cash.max(0.0),
                    total_assets: self.cash + market_value,
                    cash: self.cash,
                    market_value,
                    currency: "HKD".to_string(),
                })
            }
            GatewayRequest::AccountList => GatewayResponse::Accounts(vec![AccountSummary {
                account_id: "PAPER-1".to_string(),
                trading_env: TradingEnv::Simulate,
                account_type: "CASH".to_string(),
            }]),
            GatewayRequest::OrderList { .. } => GatewayResponse::Orders(
                self.pending
                    .iter()
                    .map(|o| OrderSnapshot {
                        order_id: o.order_id.clone(),
                        correlation_id: Some(o.correlation_id.clone()),
                        symbol: o.symbol.clone(),
                        side: o.side,
                        quantity: o.quantity,
                        price: o.limit,
                        status: OrderStatus::Accepted,
                        filled_quantity: 0,
                    })
                    .collect(),
            ),
            GatewayRequest::PollEvents => {
                let mut events = std::mem::take(&mut self.queued_events);
                if self.auto_fill {
                    for order in std::mem::take(&mut self.pending) {
                        events.push(self.fill(order));
                    }
                }
                self.advance();
                GatewayResponse::Events(events)
            }
        }
    }

    fn quote(&mut self, symbol: &str) -> GatewayResponse {
        let bars = self.visible_bars(symbol, 30);
        let Some(last) = bars.last() else {
            return error(-1, &format!("no quote for {}", symbol));
        };
        let prev_close = bars
            .len()
            .checked_sub(2)
            .and_then(|i| bars.get(i))
            .map(|bar| bar.close)
            .unwrap_or(last.open);

        GatewayResponse::Quote(Quote {
            symbol: symbol.to_string(),
            last_price: last.close,
            open_price: last.open,
            high_price: last.high,
            low_price: last.low,
            prev_close_price: prev_close,
            volume: last.volume,
            turnover: last.volume * last.close,
            timestamp: last.timestamp,
        })
    }

    fn snapshot(&mut self, symbols: &[String]) -> GatewayResponse {
        let mut rows = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if self.unavailable.contains(symbol) {
                return error(-1, &format!("no snapshot for {}", symbol));
            }
            let bars = self.visible_bars(symbol, 2);
            let Some(last) = bars.last() else {
                return error(-1, &format!("no snapshot for {}", symbol));
            };
            let prev_close = bars
                .len()
                .checked_sub(2)
                .and_then(|i| bars.get(i))
                .map(|bar| bar.close)
                .unwrap_or(last.open);

            rows.push(MarketSnapshot {
                symbol: symbol.clone(),
                last_price: last.close,
                prev_close_price: prev_close,
                volume: last.volume,
                turnover: last.volume * last.close,
                lot_size: LOT_SIZE,
                suspended: false,
                timestamp: last.timestamp,
            });
        }
        GatewayResponse::Snapshots(rows)
    }

    fn order_book(&mut self, symbol: &str, depth: usize) -> GatewayResponse {
        let Some(mid) = self.last_price(symbol) else {
            return error(-1, &format!("no order book for {}", symbol));
        };
        let tick = (mid * 0.001).max(0.01);
        let level = |price: f64, i: usize| OrderBookLevel {
            price,
            volume: 1_000.0 * (i + 1) as f64,
            order_count: (i + 1) as u32,
        };

        GatewayResponse::OrderBook(OrderBook {
            symbol: symbol.to_string(),
            bids: (0..depth).map(|i| level(mid - tick * (i + 1) as f64, i)).collect(),
            asks: (0..depth).map(|i| level(mid + tick * (i + 1) as f64, i)).collect(),
        })
    }

    fn place(
        &mut self,
        symbol: String,
        side: Side,
        quantity: i64,
        kind: OrderKind,
        correlation_id: CorrelationId,
    ) -> GatewayResponse {
        self.placed.push(ReceivedOrder {
            correlation_id: correlation_id.clone(),
            symbol: symbol.clone(),
            side,
            quantity,
        });

        if let Some(reason) = &self.reject_reason {
            return error(-1, reason);
        }
        if quantity <= 0 {
            return error(-1, "quantity must be positive");
        }

        let limit = match kind {
            OrderKind::Market => None,
            OrderKind::Limit(price) => Some(price),
        };
        let Some(price) = limit.or_else(|| self.last_price(&symbol)) else {
            return error(-1, &format!("no price for {}", symbol));
        };

        let order_id = GatewayOrderId(format!("P{:06}", self.next_order));
        self.next_order += 1;
        self.pending.push(PaperOrder {
            order_id: order_id.clone(),
            correlation_id,
            symbol,
            side,
            quantity,
            price,
            limit,
        });

        GatewayResponse::OrderAccepted { order_id }
    }

    fn cancel(&mut self, order_id: &GatewayOrderId) -> GatewayResponse {
        let Some(index) = self.pending.iter().position(|o| &o.order_id == order_id) else {
            return error(-1, &format!("order {} is not working", order_id));
        };
        let order = self.pending.remove(index);
        self.queued_events.push(FillEvent {
            gateway_order_id: order.order_id,
            correlation_id: Some(order.correlation_id),
            symbol: order.symbol,
            side: order.side,
            kind: FillKind::Cancelled,
            timestamp: Utc::now(),
        });
        GatewayResponse::Ack
    }

    fn modify(
        &mut self,
        order_id: &GatewayOrderId,
        quantity: i64,
        price: Option<f64>,
    ) -> GatewayResponse {
        if quantity <= 0 {
            return error(-1, "quantity must be positive");
        }
        let Some(order) = self.pending.iter_mut().find(|o| &o.order_id == order_id) else {
            return error(-1, &format!("order {} is not working", order_id));
        };
        order.quantity = quantity;
        if let Some(price) = price {
            order.price = price;
            order.limit = Some(price);
        }
        GatewayResponse::Ack
    }

    fn fill(&mut self, order: PaperOrder) -> FillEvent {
        let position = self
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| Position::flat(&order.symbol));
        position.apply_fill(order.side.sign() * order.quantity, order.price);
        self.cash -= order.side.sign() as f64 * order.quantity as f64 * order.price;
        let deal_id = format!("D{:06}", self.next_deal);
        self.next_deal += 1;

        FillEvent {
            gateway_order_id: order.order_id,
            correlation_id: Some(order.correlation_id),
            symbol: order.symbol,
            side: order.side,
            kind: FillKind::Filled {
                deal_id,
                quantity: order.quantity,
                price: order.price,
            },
            timestamp: Utc::now(),
        }
    }
}

fn check_password(expected: Option<&str>, presented: &str) -> GatewayResponse {
    match expected {
        Some(expected) if expected != presented => error(-1, "password incorrect"),
        _ => GatewayResponse::Ack,
    }
}

fn walk_bar(symbol: &str, timestamp: DateTime<Utc>, open: f64, close: f64) -> PriceBar {
    PriceBar {
        symbol: symbol.to_string(),
        timestamp,
        open,
        high: open.max(close),
        low: open.min(close),
        close,
        volume: 10_000.0,
    }
}

fn error(code: i32, message: &str) -> GatewayResponse {
    GatewayResponse::Error {
        code,
        message: message.to_string(),
    }
}

#[async_trait]
impl Transport for PaperGateway {
    async fn open(&self, endpoint: &str) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if state.refuse {
            return Err(ConnectionError::GatewayNotRunning {
                endpoint: endpoint.to_string(),
            });
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(ConnectionError::Transient(format!(
                "connection to {} reset",
                endpoint
            )));
        }

        state.open = true;
        state.dropped = false;
        Ok(())
    }

    async fn call(&self, request: GatewayRequest) -> Result<GatewayResponse, ConnectionError> {
        let mut state = self.lock();
        if !state.open {
            return Err(if state.dropped {
                ConnectionError::Transient("connection reset by gateway".to_string())
            } else {
                ConnectionError::NotConnected
            });
        }
        Ok(state.handle(request))
    }

    async fn close(&self) {
        let mut state = self.lock();
        state.open = false;
        state.dropped = false;
    }
}
