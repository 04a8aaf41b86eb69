use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::{timeout, Instant};

use super::protocol::{GatewayInfo, GatewayRequest, GatewayResponse, OrderSnapshot};
use super::{ConnectionState, Transport};
use crate::auth::Credentials;
use crate::config::GatewaySettings;
use crate::error::{AuthError, ConnectionError, DataUnavailable, OrderRejected, SubmitError};
use crate::execution::OrderRouter;
use crate::market_data::BarSource;
use crate::models::{
    AccountInfo, AccountSummary, CorrelationId, FillEvent, GatewayOrderId, MarketSnapshot, OrderBook,
    OrderIntent, Position, PriceBar, Quote, TradingEnv,
};

const CLIENT_ID: &str = concat!("fututrader/", env!("CARGO_PKG_VERSION"));
const ORDER_QUOTA_WINDOW: Duration = Duration::from_secs(30);

type OrderRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Session with one gateway process.
///
/// Every call is bounded by the configured timeout. A transport failure or
/// timeout on any call drops the state to `Disconnected` so the orchestrator
/// knows to reconnect.
pub struct GatewayConnection {
    transport: Box<dyn Transport>,
    settings: GatewaySettings,
    trading_env: TradingEnv,
    state: RwLock<ConnectionState>,
    last_contact: Mutex<Option<Instant>>,
    info: Mutex<Option<GatewayInfo>>,
    order_limiter: Arc<OrderRateLimiter>,
}

impl GatewayConnection {
    pub fn new(
        transport: Box<dyn Transport>,
        settings: GatewaySettings,
        trading_env: TradingEnv,
    ) -> Self {
        let burst = NonZeroU32::new(settings.order_rate_per_30s).unwrap_or(NonZeroU32::MIN);
        let period = ORDER_QUOTA_WINDOW / burst.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        Self {
            transport,
            settings,
            trading_env,
            state: RwLock::new(ConnectionState::Disconnected),
            last_contact: Mutex::new(None),
            info: Mutex::new(None),
            order_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *guard != state {
            tracing::debug!("Gateway state {:?} -> {:?}", *guard, state);
            *guard = state;
        }
    }

    pub fn trading_env(&self) -> TradingEnv {
        self.trading_env
    }

    pub fn endpoint(&self) -> String {
        self.settings.endpoint()
    }

    /// Handshake data from the most recent successful connect
    pub fn info(&self) -> Option<GatewayInfo> {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open the transport and handshake. Any previous channel is closed first.
    pub async fn connect(&self) -> Result<ConnectionState, ConnectionError> {
        let endpoint = self.settings.endpoint();
        self.set_state(ConnectionState::Connecting);
        self.transport.close().await;

        tracing::debug!("Connecting to gateway at {}", endpoint);
        let opened = timeout(self.settings.call_timeout, self.transport.open(&endpoint))
            .await
            .unwrap_or(Err(ConnectionError::Timeout {
                operation: "open",
                timeout: self.settings.call_timeout,
            }));
        if let Err(e) = opened {
            self.set_state(ConnectionState::Failed);
            return Err(e);
        }

        let request = GatewayRequest::Handshake {
            client_id: CLIENT_ID.to_string(),
        };
        match self.call(request).await {
            Ok(GatewayResponse::Handshake(info)) => {
                tracing::info!("🔌 Connected to gateway version: {}", info.version);
                tracing::info!("Quote login status: {}", info.quote_logged_in);
                tracing::info!("Trade login status: {}", info.trade_logged_in);
                *self.info.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
                self.set_state(ConnectionState::Connected);
                Ok(ConnectionState::Connected)
            }
            Ok(other) => {
                self.set_state(ConnectionState::Failed);
                Err(unexpected("handshake", &other))
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Log in and unlock trading. Requires a `Connected` session.
    pub async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<ConnectionState, AuthError> {
        if self.state() != ConnectionState::Connected {
            return Err(AuthError::Connection(ConnectionError::NotConnected));
        }
        if credentials.account_id.is_empty() {
            return Err(AuthError::MissingCredential("FUTU_ACCOUNT_ID"));
        }
        if credentials.account_pwd.is_empty() {
            return Err(AuthError::MissingCredential("FUTU_ACCOUNT_PWD"));
        }

        self.set_state(ConnectionState::Authenticating);

        let login = GatewayRequest::Login {
            account_id: credentials.account_id.clone(),
            password: credentials.transmittable(&credentials.account_pwd),
        };
        if let Err(e) = self.expect_ack(login).await {
            return Err(self.auth_failure(e));
        }
        tracing::info!("Logged in as account {}", credentials.account_id);

        let unlock = credentials.unlock_password();
        if unlock.is_empty() {
            tracing::warn!("Trade password not configured, trading stays locked");
        } else {
            let request = GatewayRequest::UnlockTrade {
                password: credentials.transmittable(unlock),
                trading_env: self.trading_env,
            };
            if let Err(e) = self.expect_ack(request).await {
                return Err(self.auth_failure(e));
            }
            tracing::info!("🔓 Trade unlocked successfully ({})", self.trading_env);
        }

        self.set_state(ConnectionState::Ready);
        Ok(ConnectionState::Ready)
    }

    fn auth_failure(&self, err: ConnectionError) -> AuthError {
        match err {
            ConnectionError::Remote { message, .. } => {
                self.set_state(ConnectionState::Failed);
                AuthError::Rejected(message)
            }
            other => {
                if self.state() == ConnectionState::Authenticating {
                    self.set_state(ConnectionState::Failed);
                }
                AuthError::Connection(other)
            }
        }
    }

    /// True when authenticated and the gateway answered recently.
    ///
    /// Pings the gateway if nothing was heard within the heartbeat interval.
    pub async fn is_healthy(&self) -> bool {
        if self.state() != ConnectionState::Ready {
            return false;
        }

        let stale = self
            .last_contact
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed() >= self.settings.heartbeat_interval)
            .unwrap_or(true);
        if !stale {
            return true;
        }

        match self.call(GatewayRequest::Ping).await {
            Ok(GatewayResponse::Pong) => true,
            Ok(other) => {
                tracing::warn!("Heartbeat got unexpected reply: {:?}", other);
                false
            }
            Err(e) => {
                tracing::warn!("Heartbeat failed: {}", e);
                false
            }
        }
    }

    pub async fn disconnect(&self) {
        self.transport.close().await;
        *self.last_contact.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Connection closed");
    }

    async fn call(&self, request: GatewayRequest) -> Result<GatewayResponse, ConnectionError> {
        let operation = request.operation();
        let result = match timeout(self.settings.call_timeout, self.transport.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout {
                operation,
                timeout: self.settings.call_timeout,
            }),
        };

        match &result {
            Ok(_) => {
                *self.last_contact.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Instant::now());
            }
            Err(e) if e.is_transport_loss() || *e == ConnectionError::NotConnected => {
                tracing::warn!("Gateway call `{}` failed: {}", operation, e);
                self.set_state(ConnectionState::Disconnected);
            }
            Err(_) => {}
        }

        // Error replies are answers, not transport failures
        match result? {
            GatewayResponse::Error { code, message } => {
                Err(ConnectionError::Remote { code, message })
            }
            response => Ok(response),
        }
    }

    async fn expect_ack(&self, request: GatewayRequest) -> Result<(), ConnectionError> {
        let operation = request.operation();
        match self.call(request).await? {
            GatewayResponse::Ack => Ok(()),
            other => Err(unexpected(operation, &other)),
        }
    }

    pub async fn quote(&self, symbol: &str) -> Result<Quote, ConnectionError> {
        let request = GatewayRequest::Quote {
            symbol: symbol.to_string(),
        };
        match self.call(request).await? {
            GatewayResponse::Quote(quote) => Ok(quote),
            other => Err(unexpected("quote", &other)),
        }
    }

    /// One snapshot row per symbol, in request order
    pub async fn market_snapshot(
        &self,
        symbols: &[String],
    ) -> Result<Vec<MarketSnapshot>, ConnectionError> {
        let request = GatewayRequest::Snapshot {
            symbols: symbols.to_vec(),
        };
        match self.call(request).await? {
            GatewayResponse::Snapshots(rows) => Ok(rows),
            other => Err(unexpected("snapshot", &other)),
        }
    }

    /// Latest `count` K-line bars, oldest first
    pub async fn klines(&self, symbol: &str, count: usize) -> Result<Vec<PriceBar>, ConnectionError> {
        let request = GatewayRequest::Kline {
            symbol: symbol.to_string(),
            count,
        };
        match self.call(request).await? {
            GatewayResponse::Klines(bars) => Ok(bars),
            other => Err(unexpected("kline", &other)),
        }
    }

    pub async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ConnectionError> {
        let request = GatewayRequest::OrderBook {
            symbol: symbol.to_string(),
            depth,
        };
        match self.call(request).await? {
            GatewayResponse::OrderBook(book) => Ok(book),
            other => Err(unexpected("order_book", &other)),
        }
    }

    /// Place an order, waiting for the order-rate quota first
    pub async fn place_order(&self, intent: &OrderIntent) -> Result<GatewayOrderId, SubmitError> {
        self.order_limiter.until_ready().await;

        let request = GatewayRequest::PlaceOrder {
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: intent.quantity,
            kind: intent.kind,
            correlation_id: intent.correlation_id.clone(),
            trading_env: self.trading_env,
        };
        match self.call(request).await {
            Ok(GatewayResponse::OrderAccepted { order_id }) => Ok(order_id),
            Ok(other) => Err(SubmitError::Connection(unexpected("place_order", &other))),
            Err(ConnectionError::Remote { code, message }) => Err(SubmitError::Rejected(OrderRejected {
                correlation_id: intent.correlation_id.clone(),
                reason: format!("{} (code {})", message, code),
            })),
            Err(e) => Err(SubmitError::Connection(e)),
        }
    }

    pub async fn cancel_order(&self, order_id: &GatewayOrderId) -> Result<(), ConnectionError> {
        self.expect_ack(GatewayRequest::CancelOrder {
            order_id: order_id.clone(),
            trading_env: self.trading_env,
        })
        .await
    }

    /// Modify a working order. Shares the order-rate quota with placement.
    ///
    /// The gateway knows the order only by its id, so a rejection carries
    /// the order id where the correlation id would be.
    pub async fn modify_order(
        &self,
        order_id: &GatewayOrderId,
        quantity: i64,
        price: Option<f64>,
    ) -> Result<(), SubmitError> {
        self.order_limiter.until_ready().await;

        let request = GatewayRequest::ModifyOrder {
            order_id: order_id.clone(),
            quantity,
            price,
            trading_env: self.trading_env,
        };
        match self.call(request).await {
            Ok(GatewayResponse::Ack) => Ok(()),
            Ok(other) => Err(SubmitError::Connection(unexpected("modify_order", &other))),
            Err(ConnectionError::Remote { code, message }) => {
                Err(SubmitError::Rejected(OrderRejected {
                    correlation_id: CorrelationId(order_id.to_string()),
                    reason: format!("{} (code {})", message, code),
                }))
            }
            Err(e) => Err(SubmitError::Connection(e)),
        }
    }

    pub async fn positions(&self) -> Result<Vec<Position>, ConnectionError> {
        match self
            .call(GatewayRequest::Positions {
                trading_env: self.trading_env,
            })
            .await?
        {
            GatewayResponse::Positions(positions) => Ok(positions),
            other => Err(unexpected("positions", &other)),
        }
    }

    pub async fn account_info(&self) -> Result<AccountInfo, ConnectionError> {
        match self
            .call(GatewayRequest::AccountInfo {
                trading_env: self.trading_env,
            })
            .await?
        {
            GatewayResponse::Account(info) => Ok(info),
            other => Err(unexpected("account_info", &other)),
        }
    }

    pub async fn accounts(&self) -> Result<Vec<AccountSummary>, ConnectionError> {
        match self.call(GatewayRequest::AccountList).await? {
            GatewayResponse::Accounts(accounts) => Ok(accounts),
            other => Err(unexpected("account_list", &other)),
        }
    }

    pub async fn orders(&self) -> Result<Vec<OrderSnapshot>, ConnectionError> {
        match self
            .call(GatewayRequest::OrderList {
                trading_env: self.trading_env,
            })
            .await?
        {
            GatewayResponse::Orders(orders) => Ok(orders),
            other => Err(unexpected("order_list", &other)),
        }
    }

    /// Order events the gateway queued since the last poll
    pub async fn poll_events(&self) -> Result<Vec<FillEvent>, ConnectionError> {
        match self.call(GatewayRequest::PollEvents).await? {
            GatewayResponse::Events(events) => Ok(events),
            other => Err(unexpected("poll_events", &other)),
        }
    }
}

fn unexpected(operation: &str, response: &GatewayResponse) -> ConnectionError {
    ConnectionError::Protocol(format!(
        "unexpected reply to `{}`: {:?}",
        operation, response
    ))
}

#[async_trait]
impl OrderRouter for GatewayConnection {
    async fn place_order(&self, intent: &OrderIntent) -> Result<GatewayOrderId, SubmitError> {
        GatewayConnection::place_order(self, intent).await
    }

    async fn cancel_order(&self, order_id: &GatewayOrderId) -> Result<(), SubmitError> {
        GatewayConnection::cancel_order(self, order_id)
            .await
            .map_err(SubmitError::from)
    }

    async fn modify_order(
        &self,
        order_id: &GatewayOrderId,
        quantity: i64,
        price: Option<f64>,
    ) -> Result<(), SubmitError> {
        GatewayConnection::modify_order(self, order_id, quantity, price).await
    }
}

#[async_trait]
impl BarSource for GatewayConnection {
    async fn fetch_bars(&self, symbol: &str, count: usize) -> Result<Vec<PriceBar>, DataUnavailable> {
        self.klines(symbol, count)
            .await
            .map_err(|e| DataUnavailable::new(symbol, e.to_string()))
    }
}
