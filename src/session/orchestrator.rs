use tokio::sync::watch;

use super::{
    SessionConfig, SessionReport, SessionState, SymbolOutcome, SymbolTick, TickAction, TickReport,
};
use crate::auth::Credentials;
use crate::error::{AuthError, ConnectionError, SessionError, SubmitError};
use crate::execution::{LedgerAction, LedgerPolicy, OrderLedger};
use crate::gateway::{ConnectionState, GatewayConnection};
use crate::market_data::MarketDataFeed;
use crate::models::{CorrelationId, Position, PriceBar, Signal};
use crate::strategy::{Strategy, StrategyState};

/// One traded symbol: its own history and strategy state
struct SymbolSlot {
    symbol: String,
    strategy: Box<dyn Strategy>,
    feed: MarketDataFeed,
    state: StrategyState,
}

/// Outcome of one connect + authenticate attempt
enum Attempt {
    Ready,
    Retry(ConnectionError),
}

/// Drives the trading loop for a set of symbols over one gateway connection.
///
/// The session is the only place that decides whether a failure is retried,
/// skipped or fatal. Components below it just return typed errors.
pub struct TradingSession {
    gateway: GatewayConnection,
    credentials: Credentials,
    ledger: OrderLedger,
    config: SessionConfig,
    slots: Vec<SymbolSlot>,
    state: SessionState,
    ticks: u64,
    consecutive_failures: u32,
    reconnects: u32,
    orders_submitted: usize,
    orders_rejected: usize,
}

impl TradingSession {
    pub fn new(
        gateway: GatewayConnection,
        credentials: Credentials,
        policy: LedgerPolicy,
        config: SessionConfig,
    ) -> Self {
        Self {
            gateway,
            credentials,
            ledger: OrderLedger::new(policy),
            config,
            slots: Vec::new(),
            state: SessionState::Idle,
            ticks: 0,
            consecutive_failures: 0,
            reconnects: 0,
            orders_submitted: 0,
            orders_rejected: 0,
        }
    }

    /// Trade `symbol` with `strategy`. Each symbol gets its own feed and state.
    ///
    /// Attaching a strategy to a symbol that is already traded widens that
    /// symbol's history bound if the new strategy needs more bars.
    pub fn add_symbol(&mut self, symbol: &str, strategy: Box<dyn Strategy>) {
        let window = strategy.required_history();
        tracing::info!(
            symbol = %symbol,
            "Attached strategy {} {:?} (needs {} bars)",
            strategy.name(),
            strategy.parameters(),
            window
        );

        if let Some(slot) = self.slots.iter_mut().find(|s| s.symbol == symbol) {
            slot.feed.require_window(window);
            slot.strategy = strategy;
            slot.state = StrategyState::default();
            return;
        }

        self.slots.push(SymbolSlot {
            symbol: symbol.to_string(),
            strategy,
            feed: MarketDataFeed::with_window(symbol, window),
            state: StrategyState::default(),
        });
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn gateway(&self) -> &GatewayConnection {
        &self.gateway
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn current_position(&self, symbol: &str) -> Position {
        self.ledger.current_position(symbol)
    }

    /// Rolling history held for `symbol`, most recent last
    pub fn history(&self, symbol: &str) -> Vec<PriceBar> {
        self.slots
            .iter()
            .find(|s| s.symbol == symbol)
            .map(|s| s.feed.history())
            .unwrap_or_default()
    }

    /// Ask the gateway to cancel one of this session's working orders
    pub async fn cancel_order(&mut self, correlation_id: &CorrelationId) -> Result<bool, SubmitError> {
        self.ledger.cancel(correlation_id, &self.gateway).await
    }

    /// Change quantity (and limit price, when given) of a working order
    pub async fn modify_order(
        &mut self,
        correlation_id: &CorrelationId,
        quantity: i64,
        price: Option<f64>,
    ) -> Result<bool, SubmitError> {
        self.ledger
            .modify(correlation_id, quantity, price, &self.gateway)
            .await
    }

    /// Connect, authenticate, load positions and history. Idle → Running.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                action: "start",
                state: self.state,
            });
        }
        if self.slots.is_empty() {
            return Err(SessionError::NoSymbols);
        }

        tracing::info!(
            "🚀 Starting session: {} symbol(s), tick every {:?}, {}",
            self.slots.len(),
            self.config.tick_interval,
            self.gateway.trading_env()
        );
        self.state = SessionState::Connecting;
        if let Err(e) = self.establish().await {
            self.state = SessionState::Draining;
            return Err(e);
        }

        match self.gateway.positions().await {
            Ok(positions) => self.ledger.rebuild_positions(positions),
            Err(e) => tracing::warn!("Could not load positions from gateway: {}", e),
        }

        if self.config.backfill {
            for slot in self.slots.iter_mut() {
                let count = slot.feed.capacity();
                if let Err(e) = slot.feed.backfill(count, &self.gateway).await {
                    tracing::warn!(symbol = %slot.symbol, "Backfill failed: {}", e);
                }
            }
        }

        self.state = SessionState::Running;
        tracing::info!("✅ Session running");
        Ok(())
    }

    /// Connect and authenticate, retrying transient failures with backoff.
    ///
    /// A gateway that is not running or rejected credentials end the session
    /// at once. Transient failures are retried until the consecutive failure
    /// threshold is reached.
    async fn establish(&mut self) -> Result<(), SessionError> {
        loop {
            match self.attempt().await? {
                Attempt::Ready => {
                    self.consecutive_failures = 0;
                    return Ok(());
                }
                Attempt::Retry(err) => {
                    self.consecutive_failures += 1;
                    let attempts = self.consecutive_failures;
                    if attempts >= self.config.max_consecutive_failures {
                        tracing::error!(
                            "❌ Giving up after {} consecutive connection failures: {}",
                            attempts,
                            err
                        );
                        return Err(SessionError::RetryBudgetExhausted {
                            attempts,
                            last: err,
                        });
                    }

                    let delay = self.config.backoff.delay(attempts);
                    tracing::warn!(
                        "Connection attempt {} failed: {}. Retrying in {:?}",
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(&mut self) -> Result<Attempt, SessionError> {
        if let Err(e) = self.gateway.connect().await {
            if !e.is_retryable() {
                tracing::error!("❌ {}", e);
                return Err(SessionError::GatewayUnavailable(e));
            }
            return Ok(Attempt::Retry(e));
        }

        match self.gateway.authenticate(&self.credentials).await {
            Ok(_) => Ok(Attempt::Ready),
            Err(AuthError::Connection(e)) if e.is_retryable() => Ok(Attempt::Retry(e)),
            Err(e) => {
                tracing::error!("❌ Authentication failed: {}", e);
                Err(SessionError::Auth(e))
            }
        }
    }

    /// Reconnect if the gateway is unhealthy. Returns whether a reconnect happened.
    async fn ensure_ready(&mut self) -> Result<bool, SessionError> {
        if self.gateway.is_healthy().await {
            return Ok(false);
        }

        tracing::warn!(
            "🔌 Gateway unhealthy ({:?}), reconnecting",
            self.gateway.state()
        );
        self.establish().await?;
        self.reconnects += 1;

        // Settle orders whose submission was cut off by the outage
        match self.gateway.orders().await {
            Ok(orders) => self.ledger.sync_orders(&orders),
            Err(e) => tracing::warn!("Could not load open orders after reconnect: {}", e),
        }
        tracing::info!("✅ Reconnected to gateway");
        Ok(true)
    }

    /// One poll-evaluate-act iteration over every symbol
    pub async fn tick(&mut self) -> Result<TickReport, SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::InvalidState {
                action: "tick",
                state: self.state,
            });
        }

        self.ticks += 1;
        let mut report = TickReport {
            tick: self.ticks,
            ..TickReport::default()
        };

        report.reconnected = match self.ensure_ready().await {
            Ok(reconnected) => reconnected,
            Err(e) => {
                self.state = SessionState::Draining;
                return Err(e);
            }
        };

        match self.gateway.poll_events().await {
            Ok(events) => {
                for event in &events {
                    self.ledger.reconcile(event);
                }
                report.events_applied = events.len();
            }
            Err(e) if e.is_transport_loss() => {
                tracing::warn!("Lost gateway while polling events, skipping tick: {}", e);
                return Ok(report);
            }
            Err(e) => tracing::warn!("Could not poll order events: {}", e),
        }

        for slot in self.slots.iter_mut() {
            let symbol = slot.symbol.clone();

            let latest = match slot.feed.fetch_latest(&self.gateway).await {
                Ok(latest) => latest,
                Err(e) => {
                    tracing::warn!(symbol = %symbol, "{}, skipping tick", e);
                    report.symbols.push(SymbolTick {
                        symbol,
                        outcome: SymbolOutcome::DataUnavailable(e.reason),
                    });
                    continue;
                }
            };
            if !latest.appended {
                tracing::debug!(symbol = %symbol, "No new bar");
                report.symbols.push(SymbolTick {
                    symbol,
                    outcome: SymbolOutcome::NoNewBar,
                });
                continue;
            }

            let history = slot.feed.history();
            let (signal_report, next_state) = slot.strategy.evaluate(&history, &slot.state);
            slot.state = next_state;
            tracing::info!(
                symbol = %symbol,
                "📈 {} @ {:.4}: {}",
                slot.strategy.name(),
                latest.bar.close,
                signal_report
            );

            let action = if signal_report.signal == Signal::Hold {
                TickAction::None
            } else {
                let event_key = latest.bar.timestamp.to_rfc3339();
                let decision = self.ledger.decide(
                    signal_report.signal,
                    &symbol,
                    slot.strategy.name(),
                    &event_key,
                );

                match decision.action {
                    LedgerAction::Skip => {
                        tracing::info!(symbol = %symbol, "⏭️  Skipped: {}", decision.reason);
                        TickAction::Skipped(decision.reason)
                    }
                    LedgerAction::Submit(intent) => {
                        tracing::info!(symbol = %symbol, "💹 {}", decision.reason);
                        match self.ledger.submit(intent, &self.gateway).await {
                            Ok(record) => {
                                self.orders_submitted += 1;
                                TickAction::Submitted(record)
                            }
                            Err(SubmitError::Rejected(rejected)) => {
                                self.orders_rejected += 1;
                                TickAction::Rejected(rejected.reason)
                            }
                            Err(SubmitError::Connection(e)) => {
                                TickAction::SubmitFailed(e.to_string())
                            }
                        }
                    }
                }
            };

            report.symbols.push(SymbolTick {
                symbol,
                outcome: SymbolOutcome::Evaluated {
                    report: signal_report,
                    action,
                },
            });
        }

        Ok(report)
    }

    /// Run until shutdown is signalled or a fatal error occurs.
    ///
    /// Every gateway wait and the inter-tick sleep is abandoned as soon as
    /// shutdown is signalled. The connection is always released before this
    /// returns.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionReport, SessionError> {
        let result = self.run_until(&mut shutdown).await;
        let report = self.stop().await;

        match result {
            Ok(()) => Ok(report),
            Err(e) => {
                tracing::error!("❌ Session ended with fatal error: {}", e);
                Err(e)
            }
        }
    }

    async fn run_until(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), SessionError> {
        if self.state == SessionState::Idle {
            tokio::select! {
                result = self.start() => result?,
                _ = shutdown_requested(shutdown) => return Ok(()),
            }
        }

        loop {
            tokio::select! {
                result = self.tick() => { result?; }
                _ = shutdown_requested(shutdown) => return Ok(()),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown_requested(shutdown) => return Ok(()),
            }
        }
    }

    /// Drain and release the connection. Safe to call more than once.
    pub async fn stop(&mut self) -> SessionReport {
        if self.state != SessionState::Stopped {
            tracing::info!("⚠️  Draining session");
            self.state = SessionState::Draining;
            if self.config.cancel_on_stop {
                self.cancel_working_orders().await;
            }
            self.gateway.disconnect().await;
            self.state = SessionState::Stopped;
            tracing::info!("👋 Session stopped after {} ticks", self.ticks);
        }
        self.report()
    }

    /// Best effort: only attempted while the gateway is still usable
    async fn cancel_working_orders(&mut self) {
        if self.gateway.state() != ConnectionState::Ready {
            return;
        }
        let working: Vec<CorrelationId> = self
            .slots
            .iter()
            .flat_map(|slot| self.ledger.open_orders(&slot.symbol))
            .map(|record| record.intent.correlation_id.clone())
            .collect();

        for correlation_id in working {
            if let Err(e) = self.ledger.cancel(&correlation_id, &self.gateway).await {
                tracing::warn!("Could not cancel order {}: {}", correlation_id, e);
            }
        }
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            state: self.state,
            ticks: self.ticks,
            orders_submitted: self.orders_submitted,
            orders_rejected: self.orders_rejected,
            reconnects: self.reconnects,
            positions: self.ledger.positions(),
        }
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
