use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};

use crate::error::{OrderRejected, SubmitError};
use crate::gateway::OrderSnapshot;
use crate::models::{
    CorrelationId, FillEvent, FillKind, GatewayOrderId, OrderIntent, OrderKind, OrderRecord,
    OrderStatus, Position, Side, Signal,
};

/// Sizing and position limits applied to strategy signals
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerPolicy {
    /// Quantity for each opening order
    pub order_quantity: i64,
    /// Largest net long position (and, when shorting is allowed, net short)
    pub max_long: i64,
    pub allow_short: bool,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            order_quantity: 100,
            max_long: 100,
            allow_short: false,
        }
    }
}

/// Where the ledger sends orders
#[async_trait]
pub trait OrderRouter: Send + Sync {
    async fn place_order(&self, intent: &OrderIntent) -> Result<GatewayOrderId, SubmitError>;

    async fn cancel_order(&self, order_id: &GatewayOrderId) -> Result<(), SubmitError>;

    /// Change quantity and, for limit orders, price of a working order
    async fn modify_order(
        &self,
        order_id: &GatewayOrderId,
        quantity: i64,
        price: Option<f64>,
    ) -> Result<(), SubmitError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerAction {
    Submit(OrderIntent),
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerDecision {
    pub action: LedgerAction,
    pub reason: String,
}

impl LedgerDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: LedgerAction::Skip,
            reason: reason.into(),
        }
    }
}

/// What `reconcile` did with a gateway event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// Event for an order this ledger never submitted
    Unmatched,
    /// Repeat of an event already applied
    Duplicate,
    /// Fill larger than the order's unfilled quantity; not applied
    Overfill,
}

/// Orders and positions for one trading session.
///
/// Positions change only in `reconcile` (confirmed gateway events) and in
/// `rebuild_positions` (gateway snapshot at startup). Submitting an order
/// never touches a position.
pub struct OrderLedger {
    policy: LedgerPolicy,
    records: HashMap<CorrelationId, OrderRecord>,
    by_order_id: HashMap<GatewayOrderId, CorrelationId>,
    positions: HashMap<String, Position>,
    seen_deals: HashSet<String>,
}

impl OrderLedger {
    pub fn new(policy: LedgerPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            by_order_id: HashMap::new(),
            positions: HashMap::new(),
            seen_deals: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn current_position(&self, symbol: &str) -> Position {
        self.positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol))
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .values()
            .filter(|p| p.quantity != 0)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn record(&self, correlation_id: &CorrelationId) -> Option<&OrderRecord> {
        self.records.get(correlation_id)
    }

    /// Working orders for `symbol`, oldest first
    pub fn open_orders(&self, symbol: &str) -> Vec<&OrderRecord> {
        let mut open: Vec<&OrderRecord> = self
            .records
            .values()
            .filter(|r| r.intent.symbol == symbol && r.status.is_open())
            .collect();
        open.sort_by_key(|r| r.created_at);
        open
    }

    pub fn records(&self) -> impl Iterator<Item = &OrderRecord> {
        self.records.values()
    }

    fn pending_quantity(&self, symbol: &str, side: Side) -> i64 {
        self.open_orders(symbol)
            .iter()
            .filter(|r| r.intent.side == side)
            .map(|r| r.remaining_quantity())
            .sum()
    }

    /// Turn a signal into an order intent, or explain why not.
    ///
    /// Working orders count toward exposure, so an order that has not filled
    /// yet is never duplicated by a later signal.
    pub fn decide(
        &self,
        signal: Signal,
        symbol: &str,
        strategy: &str,
        event_key: &str,
    ) -> LedgerDecision {
        let held = self.current_position(symbol).quantity;
        let pending_buy = self.pending_quantity(symbol, Side::Buy);
        let pending_sell = self.pending_quantity(symbol, Side::Sell);
        let qty = self.policy.order_quantity;

        let (side, quantity, reason) = match signal {
            Signal::Hold => return LedgerDecision::skip("Hold signal"),
            Signal::Buy => {
                let projected = held + pending_buy - pending_sell + qty;
                if projected > self.policy.max_long {
                    return LedgerDecision::skip(format!(
                        "Position cap reached: {} held, {} pending buy, cap {}",
                        held, pending_buy, self.policy.max_long
                    ));
                }
                (Side::Buy, qty, "Buy signal within position cap".to_string())
            }
            Signal::Sell => {
                let closable = held - pending_sell;
                if closable > 0 {
                    (
                        Side::Sell,
                        closable,
                        format!("Sell signal closes {} long", closable),
                    )
                } else if !self.policy.allow_short {
                    return LedgerDecision::skip("No long position to close");
                } else if closable - qty < -self.policy.max_long {
                    return LedgerDecision::skip(format!(
                        "Short cap reached: {} held, {} pending sell, cap {}",
                        held, pending_sell, self.policy.max_long
                    ));
                } else {
                    (Side::Sell, qty, "Sell signal opens short".to_string())
                }
            }
        };

        LedgerDecision {
            action: LedgerAction::Submit(OrderIntent {
                symbol: symbol.to_string(),
                side,
                quantity,
                kind: OrderKind::Market,
                correlation_id: CorrelationId::for_event(strategy, symbol, side, event_key),
            }),
            reason,
        }
    }

    /// Submit an order, at most once per correlation id.
    ///
    /// If a record exists for the id and it has not failed, it is returned
    /// as-is and the router is not called. Rejected or cancelled records are
    /// replaced by a fresh submission.
    pub async fn submit(
        &mut self,
        intent: OrderIntent,
        router: &dyn OrderRouter,
    ) -> Result<OrderRecord, SubmitError> {
        if let Some(existing) = self.records.get(&intent.correlation_id) {
            if !existing.status.is_failed() {
                tracing::debug!(
                    "Order {} already {:?}, not resubmitting",
                    intent.correlation_id,
                    existing.status
                );
                return Ok(existing.clone());
            }
        }

        let correlation_id = intent.correlation_id.clone();
        let mut record = OrderRecord::new(intent.clone());
        let result = router.place_order(&intent).await;
        record.updated_at = Utc::now();

        let outcome = match result {
            Ok(order_id) => {
                tracing::info!(
                    symbol = %intent.symbol,
                    "📝 Order accepted: {} {} x{} (order {}, correlation {})",
                    intent.side,
                    intent.symbol,
                    intent.quantity,
                    order_id,
                    correlation_id
                );
                record.status = OrderStatus::Accepted;
                record.gateway_order_id = Some(order_id.clone());
                self.by_order_id.insert(order_id, correlation_id.clone());
                Ok(record.clone())
            }
            Err(SubmitError::Rejected(rejected)) => {
                tracing::warn!(
                    symbol = %intent.symbol,
                    "⚠️ Order rejected: {}",
                    rejected.reason
                );
                record.status = OrderStatus::Rejected;
                record.reject_reason = Some(rejected.reason.clone());
                Err(SubmitError::Rejected(rejected))
            }
            Err(SubmitError::Connection(e)) => {
                // Outcome unknown: the record stays Pending until the gateway's
                // order list or an event settles it
                tracing::warn!(
                    symbol = %intent.symbol,
                    "Order {} outcome unknown: {}",
                    correlation_id,
                    e
                );
                Err(SubmitError::Connection(e))
            }
        };

        self.records.insert(correlation_id, record);
        outcome
    }

    /// Ask the gateway to cancel a working order.
    ///
    /// Returns false without calling the router when the order is not
    /// working. The record only becomes Cancelled once the gateway confirms.
    pub async fn cancel(
        &mut self,
        correlation_id: &CorrelationId,
        router: &dyn OrderRouter,
    ) -> Result<bool, SubmitError> {
        let Some(record) = self.records.get(correlation_id) else {
            return Ok(false);
        };
        let (true, Some(order_id)) = (record.status.is_open(), record.gateway_order_id.clone()) else {
            return Ok(false);
        };

        router.cancel_order(&order_id).await?;
        tracing::info!("Cancel requested for order {} ({})", order_id, correlation_id);
        Ok(true)
    }

    /// Change a working order's quantity, and its price when `price` is set.
    ///
    /// Returns false without calling the router when the order is not
    /// working. The new quantity must exceed what has already filled.
    pub async fn modify(
        &mut self,
        correlation_id: &CorrelationId,
        quantity: i64,
        price: Option<f64>,
        router: &dyn OrderRouter,
    ) -> Result<bool, SubmitError> {
        let Some(record) = self.records.get_mut(correlation_id) else {
            return Ok(false);
        };
        let (true, Some(order_id)) = (record.status.is_open(), record.gateway_order_id.clone()) else {
            return Ok(false);
        };
        if quantity <= record.filled_quantity {
            return Err(OrderRejected {
                correlation_id: correlation_id.clone(),
                reason: format!(
                    "new quantity {} does not exceed filled {}",
                    quantity, record.filled_quantity
                ),
            }
            .into());
        }

        router
            .modify_order(&order_id, quantity, price)
            .await
            .map_err(|e| match e {
                SubmitError::Rejected(rejected) => SubmitError::Rejected(OrderRejected {
                    correlation_id: correlation_id.clone(),
                    reason: rejected.reason,
                }),
                other => other,
            })?;
        record.intent.quantity = quantity;
        if let Some(price) = price {
            record.intent.kind = OrderKind::Limit(price);
        }
        record.updated_at = Utc::now();
        tracing::info!(
            symbol = %record.intent.symbol,
            "✏️ Order {} modified: quantity {}, price {:?}",
            order_id,
            quantity,
            price
        );
        Ok(true)
    }

    /// Apply a gateway fill, reject or cancel event.
    ///
    /// Fills are deduplicated by deal id, so a redelivered partial fill is
    /// applied once.
    pub fn reconcile(&mut self, event: &FillEvent) -> ReconcileOutcome {
        if let FillKind::Filled { deal_id, .. } = &event.kind {
            if self.seen_deals.contains(deal_id) {
                tracing::warn!(
                    "Duplicate fill {} for order {} ignored",
                    deal_id,
                    event.gateway_order_id
                );
                return ReconcileOutcome::Duplicate;
            }
        }

        let correlation_id = event
            .correlation_id
            .as_ref()
            .filter(|id| self.records.contains_key(*id))
            .cloned()
            .or_else(|| self.by_order_id.get(&event.gateway_order_id).cloned());

        let Some(correlation_id) = correlation_id else {
            return self.reconcile_unmatched(event);
        };
        let Some(record) = self.records.get_mut(&correlation_id) else {
            return self.reconcile_unmatched(event);
        };

        if record.gateway_order_id.is_none() {
            record.gateway_order_id = Some(event.gateway_order_id.clone());
            self.by_order_id
                .insert(event.gateway_order_id.clone(), correlation_id.clone());
        }

        match &event.kind {
            FillKind::Filled {
                deal_id,
                quantity,
                price,
            } => {
                if *quantity > record.remaining_quantity() {
                    tracing::warn!(
                        symbol = %record.intent.symbol,
                        "Fill {} of {} exceeds unfilled {} on order {}, not applied",
                        deal_id,
                        quantity,
                        record.remaining_quantity(),
                        event.gateway_order_id
                    );
                    return ReconcileOutcome::Overfill;
                }
                self.seen_deals.insert(deal_id.clone());
                record.filled_quantity += quantity;
                record.status = if record.remaining_quantity() == 0 {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Accepted
                };
                record.updated_at = Utc::now();

                let side = record.intent.side;
                let symbol = record.intent.symbol.clone();
                let position = self.apply_fill(&symbol, side, *quantity, *price);
                tracing::info!(
                    symbol = %symbol,
                    "✅ Filled {} {} @ {:.4}, position now {} @ {:.4}",
                    side,
                    quantity,
                    price,
                    position.quantity,
                    position.average_cost
                );
            }
            FillKind::Rejected { reason } => {
                record.status = OrderStatus::Rejected;
                record.reject_reason = Some(reason.clone());
                record.updated_at = Utc::now();
                tracing::warn!(
                    symbol = %record.intent.symbol,
                    "⚠️ Order {} rejected by gateway: {}",
                    event.gateway_order_id,
                    reason
                );
            }
            FillKind::Cancelled => {
                record.status = OrderStatus::Cancelled;
                record.updated_at = Utc::now();
                tracing::info!("Order {} cancelled", event.gateway_order_id);
            }
        }

        ReconcileOutcome::Applied
    }

    fn reconcile_unmatched(&mut self, event: &FillEvent) -> ReconcileOutcome {
        tracing::warn!(
            symbol = %event.symbol,
            "Reconciliation gap: event for unknown order {} (correlation {:?})",
            event.gateway_order_id,
            event.correlation_id
        );

        // The gateway is authoritative for positions even when the order is not ours
        if let FillKind::Filled {
            deal_id,
            quantity,
            price,
        } = &event.kind
        {
            self.seen_deals.insert(deal_id.clone());
            self.apply_fill(&event.symbol, event.side, *quantity, *price);
        }
        ReconcileOutcome::Unmatched
    }

    fn apply_fill(&mut self, symbol: &str, side: Side, quantity: i64, price: f64) -> Position {
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::flat(symbol));
        position.apply_fill(side.sign() * quantity, price);
        position.clone()
    }

    /// Replace local positions with the gateway's view (startup, reconnect)
    pub fn rebuild_positions(&mut self, positions: Vec<Position>) {
        self.positions.clear();
        for position in positions {
            tracing::info!(
                symbol = %position.symbol,
                "Position from gateway: {} @ {:.4}",
                position.quantity,
                position.average_cost
            );
            self.positions.insert(position.symbol.clone(), position);
        }
    }

    /// Settle orders whose submission outcome was unknown against the
    /// gateway's order list.
    ///
    /// A found order is attached and marked working; its fills still arrive
    /// as events, so the snapshot's filled quantity is not copied.
    pub fn sync_orders(&mut self, snapshots: &[OrderSnapshot]) {
        for record in self.records.values_mut() {
            if record.status != OrderStatus::Pending || record.gateway_order_id.is_some() {
                continue;
            }

            let found = snapshots
                .iter()
                .find(|s| s.correlation_id.as_ref() == Some(&record.intent.correlation_id));
            match found {
                Some(snapshot) => {
                    record.gateway_order_id = Some(snapshot.order_id.clone());
                    record.status = if snapshot.status.is_failed() {
                        snapshot.status
                    } else {
                        OrderStatus::Accepted
                    };
                    self.by_order_id.insert(
                        snapshot.order_id.clone(),
                        record.intent.correlation_id.clone(),
                    );
                }
                None => {
                    tracing::warn!(
                        "Order {} never reached the gateway, marking rejected",
                        record.intent.correlation_id
                    );
                    record.status = OrderStatus::Rejected;
                    record.reject_reason = Some("not received by gateway".to_string());
                }
            }
            record.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRouter {
        placed: Mutex<Vec<OrderIntent>>,
        cancelled: Mutex<Vec<GatewayOrderId>>,
        modified: Mutex<Vec<(GatewayOrderId, i64, Option<f64>)>>,
        reject: Option<String>,
        offline: bool,
    }

    #[async_trait]
    impl OrderRouter for RecordingRouter {
        async fn place_order(&self, intent: &OrderIntent) -> Result<GatewayOrderId, SubmitError> {
            if self.offline {
                return Err(ConnectionError::Transient("reset".to_string()).into());
            }
            let mut placed = self.placed.lock().unwrap();
            placed.push(intent.clone());
            if let Some(reason) = &self.reject {
                return Err(OrderRejected {
                    correlation_id: intent.correlation_id.clone(),
                    reason: reason.clone(),
                }
                .into());
            }
            Ok(GatewayOrderId(format!("G{}", placed.len())))
        }

        async fn cancel_order(&self, order_id: &GatewayOrderId) -> Result<(), SubmitError> {
            self.cancelled.lock().unwrap().push(order_id.clone());
            Ok(())
        }

        async fn modify_order(
            &self,
            order_id: &GatewayOrderId,
            quantity: i64,
            price: Option<f64>,
        ) -> Result<(), SubmitError> {
            self.modified
                .lock()
                .unwrap()
                .push((order_id.clone(), quantity, price));
            Ok(())
        }
    }

    impl RecordingRouter {
        fn calls(&self) -> usize {
            self.placed.lock().unwrap().len()
        }
    }

    fn intent_of(decision: LedgerDecision) -> OrderIntent {
        match decision.action {
            LedgerAction::Submit(intent) => intent,
            LedgerAction::Skip => panic!("expected submit, got skip: {}", decision.reason),
        }
    }

    fn fill(record: &OrderRecord, deal_id: &str, quantity: i64, price: f64) -> FillEvent {
        FillEvent {
            gateway_order_id: record.gateway_order_id.clone().unwrap(),
            correlation_id: Some(record.intent.correlation_id.clone()),
            symbol: record.intent.symbol.clone(),
            side: record.intent.side,
            kind: FillKind::Filled {
                deal_id: deal_id.to_string(),
                quantity,
                price,
            },
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_same_correlation_id_submits_once() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();

        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let first = ledger.submit(intent.clone(), &router).await.unwrap();
        let second = ledger.submit(intent, &router).await.unwrap();

        assert_eq!(router.calls(), 1);
        assert_eq!(first.gateway_order_id, second.gateway_order_id);
        assert_eq!(second.status, OrderStatus::Accepted);
    }

    #[tokio::test]
    async fn test_filled_record_is_not_resubmitted() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();

        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let record = ledger.submit(intent.clone(), &router).await.unwrap();
        ledger.reconcile(&fill(&record, "D1", 100, 10.0));

        let again = ledger.submit(intent, &router).await.unwrap();
        assert_eq!(router.calls(), 1);
        assert_eq!(again.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_rejected_record_may_be_resubmitted() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let rejecting = RecordingRouter {
            reject: Some("market closed".to_string()),
            ..Default::default()
        };

        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let err = ledger.submit(intent.clone(), &rejecting).await.unwrap_err();
        assert!(matches!(err, SubmitError::Rejected(_)));

        let record = ledger.record(&intent.correlation_id).unwrap();
        assert_eq!(record.status, OrderStatus::Rejected);
        assert_eq!(record.reject_reason.as_deref(), Some("market closed"));

        let router = RecordingRouter::default();
        let retried = ledger.submit(intent, &router).await.unwrap();
        assert_eq!(retried.status, OrderStatus::Accepted);
        assert_eq!(router.calls(), 1);
    }

    #[tokio::test]
    async fn test_position_changes_only_on_fill() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();

        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let record = ledger.submit(intent, &router).await.unwrap();
        assert_eq!(ledger.current_position("HK.00700").quantity, 0);

        assert_eq!(ledger.reconcile(&fill(&record, "D1", 40, 10.0)), ReconcileOutcome::Applied);
        assert_eq!(ledger.current_position("HK.00700").quantity, 40);
        assert_eq!(ledger.open_orders("HK.00700").len(), 1);

        ledger.reconcile(&fill(&record, "D2", 60, 11.0));
        let position = ledger.current_position("HK.00700");
        assert_eq!(position.quantity, 100);
        assert!((position.average_cost - 10.6).abs() < 1e-9);
        assert!(ledger.open_orders("HK.00700").is_empty());
    }

    #[tokio::test]
    async fn test_buy_suppressed_at_cap() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();
        ledger.rebuild_positions(vec![Position {
            symbol: "HK.00700".to_string(),
            quantity: 100,
            average_cost: 300.0,
        }]);

        let decision = ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-9");
        assert_eq!(decision.action, LedgerAction::Skip);
        assert!(decision.reason.contains("cap"));
        assert_eq!(router.calls(), 0);
    }

    #[tokio::test]
    async fn test_pending_buy_counts_toward_cap() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();

        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        ledger.submit(intent, &router).await.unwrap();

        let decision = ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-9");
        assert_eq!(decision.action, LedgerAction::Skip);
    }

    #[test]
    fn test_sell_without_position_suppressed() {
        let ledger = OrderLedger::new(LedgerPolicy::default());
        let decision = ledger.decide(Signal::Sell, "HK.00700", "sma", "bar-6");
        assert_eq!(decision.action, LedgerAction::Skip);
        assert_eq!(decision.reason, "No long position to close");
    }

    #[test]
    fn test_sell_closes_whole_position() {
        let mut ledger = OrderLedger::new(LedgerPolicy {
            order_quantity: 100,
            max_long: 500,
            allow_short: false,
        });
        ledger.rebuild_positions(vec![Position {
            symbol: "HK.00700".to_string(),
            quantity: 300,
            average_cost: 10.0,
        }]);

        let intent = intent_of(ledger.decide(Signal::Sell, "HK.00700", "sma", "bar-6"));
        assert_eq!(intent.side, Side::Sell);
        assert_eq!(intent.quantity, 300);
    }

    #[test]
    fn test_short_selling_when_allowed() {
        let ledger = OrderLedger::new(LedgerPolicy {
            allow_short: true,
            ..LedgerPolicy::default()
        });
        let intent = intent_of(ledger.decide(Signal::Sell, "US.AAPL", "sma", "bar-6"));
        assert_eq!(intent.quantity, 100);
    }

    #[test]
    fn test_correlation_id_derived_from_event() {
        let ledger = OrderLedger::new(LedgerPolicy::default());
        let a = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let b = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let c = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-7"));

        assert_eq!(a.correlation_id, b.correlation_id);
        assert_ne!(a.correlation_id, c.correlation_id);
    }

    #[test]
    fn test_unknown_fill_is_gap_but_updates_position() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let event = FillEvent {
            gateway_order_id: GatewayOrderId("X1".to_string()),
            correlation_id: Some(CorrelationId("from-before-restart".to_string())),
            symbol: "HK.00700".to_string(),
            side: Side::Buy,
            kind: FillKind::Filled {
                deal_id: "D9".to_string(),
                quantity: 100,
                price: 320.0,
            },
            timestamp: Utc::now(),
        };

        assert_eq!(ledger.reconcile(&event), ReconcileOutcome::Unmatched);
        assert_eq!(ledger.current_position("HK.00700").quantity, 100);
    }

    #[tokio::test]
    async fn test_duplicate_fill_ignored() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();
        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let record = ledger.submit(intent, &router).await.unwrap();

        ledger.reconcile(&fill(&record, "D1", 100, 10.0));
        assert_eq!(
            ledger.reconcile(&fill(&record, "D1", 100, 10.0)),
            ReconcileOutcome::Duplicate
        );
        assert_eq!(ledger.current_position("HK.00700").quantity, 100);
    }

    #[tokio::test]
    async fn test_redelivered_partial_fill_applied_once() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();
        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let record = ledger.submit(intent.clone(), &router).await.unwrap();

        let partial = fill(&record, "D1", 40, 10.0);
        assert_eq!(ledger.reconcile(&partial), ReconcileOutcome::Applied);
        assert_eq!(ledger.reconcile(&partial), ReconcileOutcome::Duplicate);

        assert_eq!(ledger.current_position("HK.00700").quantity, 40);
        let record = ledger.record(&intent.correlation_id).unwrap();
        assert_eq!(record.filled_quantity, 40);
        assert_eq!(record.status, OrderStatus::Accepted);
    }

    #[tokio::test]
    async fn test_fill_beyond_order_quantity_not_applied() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();
        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let record = ledger.submit(intent, &router).await.unwrap();

        ledger.reconcile(&fill(&record, "D1", 60, 10.0));
        assert_eq!(
            ledger.reconcile(&fill(&record, "D2", 60, 10.0)),
            ReconcileOutcome::Overfill
        );
        assert_eq!(ledger.current_position("HK.00700").quantity, 60);

        // The correct remainder still applies
        assert_eq!(
            ledger.reconcile(&fill(&record, "D3", 40, 10.0)),
            ReconcileOutcome::Applied
        );
        assert_eq!(ledger.current_position("HK.00700").quantity, 100);
    }

    #[tokio::test]
    async fn test_modify_working_order() {
        let mut ledger = OrderLedger::new(LedgerPolicy {
            max_long: 500,
            ..LedgerPolicy::default()
        });
        let router = RecordingRouter::default();
        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let record = ledger.submit(intent.clone(), &router).await.unwrap();
        ledger.reconcile(&fill(&record, "D1", 40, 10.0));

        assert!(ledger
            .modify(&intent.correlation_id, 200, Some(9.5), &router)
            .await
            .unwrap());
        let modified = ledger.record(&intent.correlation_id).unwrap();
        assert_eq!(modified.intent.quantity, 200);
        assert_eq!(modified.intent.kind, OrderKind::Limit(9.5));
        assert_eq!(modified.remaining_quantity(), 160);
        assert_eq!(router.modified.lock().unwrap().len(), 1);

        // Cannot shrink below what already filled
        let err = ledger
            .modify(&intent.correlation_id, 40, None, &router)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Rejected(_)));
        assert_eq!(router.modified.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_modify_finished_order_is_noop() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();
        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let record = ledger.submit(intent.clone(), &router).await.unwrap();
        ledger.reconcile(&fill(&record, "D1", 100, 10.0));

        assert!(!ledger
            .modify(&intent.correlation_id, 300, None, &router)
            .await
            .unwrap());
        assert!(router.modified.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_flow() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let router = RecordingRouter::default();
        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        let record = ledger.submit(intent.clone(), &router).await.unwrap();

        assert!(ledger.cancel(&intent.correlation_id, &router).await.unwrap());
        // Still working until the gateway confirms
        assert_eq!(ledger.open_orders("HK.00700").len(), 1);

        ledger.reconcile(&FillEvent {
            kind: FillKind::Cancelled,
            ..fill(&record, "-", 0, 0.0)
        });
        assert_eq!(
            ledger.record(&intent.correlation_id).unwrap().status,
            OrderStatus::Cancelled
        );
        assert!(!ledger.cancel(&intent.correlation_id, &router).await.unwrap());
        assert_eq!(router.cancelled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_outcome_settled_by_order_list() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let offline = RecordingRouter {
            offline: true,
            ..Default::default()
        };
        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        assert!(ledger.submit(intent.clone(), &offline).await.is_err());
        assert_eq!(
            ledger.record(&intent.correlation_id).unwrap().status,
            OrderStatus::Pending
        );

        ledger.sync_orders(&[]);
        assert_eq!(
            ledger.record(&intent.correlation_id).unwrap().status,
            OrderStatus::Rejected
        );
    }

    #[tokio::test]
    async fn test_synced_order_still_takes_its_fill() {
        let mut ledger = OrderLedger::new(LedgerPolicy::default());
        let offline = RecordingRouter {
            offline: true,
            ..Default::default()
        };
        let intent = intent_of(ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-6"));
        assert!(ledger.submit(intent.clone(), &offline).await.is_err());

        // The order list already shows it filled, but the fill event is still queued
        ledger.sync_orders(&[OrderSnapshot {
            order_id: GatewayOrderId("G7".to_string()),
            correlation_id: Some(intent.correlation_id.clone()),
            symbol: "HK.00700".to_string(),
            side: Side::Buy,
            quantity: 100,
            price: None,
            status: OrderStatus::Filled,
            filled_quantity: 100,
        }]);
        let record = ledger.record(&intent.correlation_id).unwrap().clone();
        assert_eq!(record.status, OrderStatus::Accepted);
        assert_eq!(record.filled_quantity, 0);

        assert_eq!(
            ledger.reconcile(&fill(&record, "D1", 100, 10.0)),
            ReconcileOutcome::Applied
        );
        assert_eq!(ledger.current_position("HK.00700").quantity, 100);
        assert_eq!(
            ledger.decide(Signal::Buy, "HK.00700", "sma", "bar-9").action,
            LedgerAction::Skip
        );
    }
}
