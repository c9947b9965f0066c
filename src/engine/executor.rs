use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::domain::{
    AccountSnapshot, CloseTrigger, DailyStats, Execution, Order, OrderRequest, OrderStatus, Position,
    PositionKey, PositionStatus, PriceSnapshot, RiskLimit, TradeReason, TradeRecord,
};
use crate::error::{LedgerError, LimitError, MarketDataError, OrderError, Result, ValidationError};
use crate::ledger::{Fill, FillResult, PositionLedger};
use crate::market::{MarketDataCache, MarketDataStream, SubscriptionHandle};
use crate::persistence::TradeStore;
use crate::risk::{RiskCheckRecord, RiskDecision, RiskHistoryFilter, RiskInput, RiskManager};

/// One order plus the channel its committed states are published on.
///
/// The mutex serialises every transition of the order; whoever holds it sees
/// the current status and is the only one allowed to change it.
struct OrderSlot {
    order: Mutex<Order>,
    updates: watch::Sender<Order>,
}

impl OrderSlot {
    fn new(order: Order) -> Self {
        let (updates, _) = watch::channel(order.clone());
        Self {
            order: Mutex::new(order),
            updates,
        }
    }

    fn committed(&self) -> Order {
        self.updates.borrow().clone()
    }
}

/// Result of one execution attempt, computed while the order is locked
enum Attempt {
    NotYet,
    Failed(String),
    Filled {
        price: Decimal,
        fill: FillResult,
        prior: Option<Position>,
    },
}

/// What one price tick caused
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Positions closed by stop-loss, take-profit or liquidation
    pub auto_closed: Vec<TradeRecord>,
    /// Pending orders that filled on this tick
    pub filled: Vec<Uuid>,
    /// Pending orders that became executable but were refused
    pub failed: Vec<Uuid>,
}

/// Risk-gated order execution over a shared cache, risk manager and ledger.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ExecutionEngine {
    cache: Arc<MarketDataCache>,
    risk: Arc<RiskManager>,
    ledger: Arc<PositionLedger>,
    store: Arc<dyn TradeStore>,
    orders: Arc<DashMap<Uuid, Arc<OrderSlot>>>,
    /// Pending order ids per symbol, in submission order
    pending: Arc<DashMap<String, Vec<Uuid>>>,
    client_ids: Arc<DashMap<(String, String), Uuid>>,
    /// Serialises fills and automatic closes per (owner, symbol)
    fill_locks: Arc<DashMap<PositionKey, Arc<Mutex<()>>>>,
    /// Serialises cache update plus repricing per symbol
    mark_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    trades: broadcast::Sender<TradeRecord>,
    persistence_failures: Arc<AtomicU64>,
    rollover_interval: Duration,
    eviction_interval: Duration,
    order_retention: chrono::Duration,
}

impl ExecutionEngine {
    pub fn new(config: &AppConfig, store: Arc<dyn TradeStore>) -> Self {
        let (trades, _) = broadcast::channel(config.execution.trade_channel_capacity.max(1));
        Self {
            cache: Arc::new(MarketDataCache::new(config.market.clone())),
            risk: Arc::new(RiskManager::new(config.risk.clone())),
            ledger: Arc::new(PositionLedger::new(
                config.ledger.clone(),
                config.execution.commission_rate,
            )),
            store,
            orders: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            client_ids: Arc::new(DashMap::new()),
            fill_locks: Arc::new(DashMap::new()),
            mark_locks: Arc::new(DashMap::new()),
            trades,
            persistence_failures: Arc::new(AtomicU64::new(0)),
            rollover_interval: config.ledger.rollover_interval(),
            eviction_interval: config.execution.eviction_interval(),
            order_retention: config.execution.order_retention(),
        }
    }

    pub fn cache(&self) -> &Arc<MarketDataCache> {
        &self.cache
    }

    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    /// Start cache reclamation, daily-stats rollover and order eviction.
    /// All stop when `shutdown` flips to true.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            rollover_secs = self.rollover_interval.as_secs(),
            eviction_secs = self.eviction_interval.as_secs(),
            "Starting background tasks"
        );
        vec![
            Arc::clone(&self.cache).spawn_reclaimer(shutdown.clone()),
            self.ledger
                .stats_book()
                .spawn_rollover(self.rollover_interval, shutdown.clone()),
            self.spawn_evictor(shutdown),
        ]
    }

    fn spawn_evictor(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.eviction_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = engine.evict_orders(Utc::now() - engine.order_retention);
                        if evicted > 0 {
                            debug!(evicted, "Evicted terminal orders");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Order evictor stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Drop terminal orders last changed before `cutoff`, together with
    /// their client order ids, and any idle per-key locks. Pending orders are
    /// never evicted. A client order id can be reused once its order is gone.
    pub fn evict_orders(&self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<(Uuid, String, Option<String>)> = self
            .orders
            .iter()
            .filter_map(|entry| {
                let order = entry.value().committed();
                (order.status.is_terminal() && order.updated_at < cutoff)
                    .then_some((order.id, order.owner, order.client_order_id))
            })
            .collect();

        for (order_id, owner, client_order_id) in &expired {
            self.orders.remove(order_id);
            if let Some(client_order_id) = client_order_id {
                self.client_ids
                    .remove_if(&(owner.clone(), client_order_id.clone()), |_, id| id == order_id);
            }
        }
        // a lock only the map references is idle
        self.fill_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.mark_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        expired.len()
    }

    // ==================== Orders ====================

    /// Validate and accept an order. Execution happens asynchronously; use
    /// [`wait_for`](Self::wait_for) or [`watch_order`](Self::watch_order) to
    /// follow it.
    pub async fn submit(&self, request: OrderRequest) -> std::result::Result<Uuid, ValidationError> {
        request.validate()?;
        let order = Order::from_request(request);
        let order_id = order.id;

        if let Some(client_order_id) = &order.client_order_id {
            match self
                .client_ids
                .entry((order.owner.clone(), client_order_id.clone()))
            {
                Entry::Occupied(_) => {
                    return Err(ValidationError::DuplicateClientOrderId {
                        client_order_id: client_order_id.clone(),
                    })
                }
                Entry::Vacant(entry) => {
                    entry.insert(order_id);
                }
            }
        }

        info!(
            order_id = %order_id,
            owner = %order.owner,
            symbol = %order.symbol,
            side = %order.side,
            kind = order.kind.as_str(),
            size = %order.size,
            "Order accepted"
        );

        let accepted = order.clone();
        self.orders.insert(order_id, Arc::new(OrderSlot::new(order)));
        self.pending.entry(accepted.symbol.clone()).or_default().push(order_id);

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.attempt(order_id).await {
                warn!(order_id = %order_id, error = %e, "Execution attempt failed");
            }
        });

        // may land after the attempt's update; the store keeps the later revision
        self.persisted("order", self.store.save_order(&accepted).await);
        Ok(order_id)
    }

    /// Try to execute a pending order against the current snapshot.
    ///
    /// A limit order whose condition is not met stays pending. Anything else
    /// reaches a terminal state: filled, or failed with a reason. Calling
    /// this on a terminal order returns it unchanged.
    pub async fn attempt(&self, order_id: Uuid) -> std::result::Result<Order, OrderError> {
        let slot = self.slot(order_id)?;
        let mut order = slot.order.lock().await;
        if !order.is_pending() {
            return Ok(order.clone());
        }

        let mut trade = None;
        let mut fill_outcome = None;
        match self.execute(&order).await {
            Attempt::NotYet => {
                debug!(order_id = %order_id, "Limit condition not met, order stays pending");
                return Ok(order.clone());
            }
            Attempt::Failed(reason) => {
                warn!(order_id = %order_id, owner = %order.owner, symbol = %order.symbol, %reason, "Order failed");
                order.mark_failed(reason);
            }
            Attempt::Filled { price, fill, prior } => {
                order.mark_filled(price);
                info!(
                    order_id = %order_id,
                    owner = %order.owner,
                    symbol = %order.symbol,
                    side = %order.side,
                    size = %order.size,
                    price = %price,
                    realized = %fill.realized_pnl,
                    "Order filled"
                );
                trade = Some(TradeRecord {
                    id: Uuid::new_v4(),
                    order_id: Some(order_id),
                    owner: order.owner.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    size: order.size,
                    price,
                    commission: fill.commission,
                    realized_pnl: fill.realized_pnl,
                    reason: TradeReason::Order,
                    timestamp: Utc::now(),
                });
                fill_outcome = Some((fill, prior));
            }
        }

        self.remove_pending(&order.symbol, order_id);
        slot.updates.send_replace(order.clone());
        let committed = order.clone();
        drop(order);

        self.persisted("order", self.store.update_order(&committed).await);
        if let Some((fill, prior)) = fill_outcome {
            self.persist_fill(&fill, prior.is_none()).await;
        }
        if let Some(trade) = trade {
            self.publish(trade).await;
        }
        Ok(committed)
    }

    async fn execute(&self, order: &Order) -> Attempt {
        let snapshot = match self.cache.require(&order.symbol) {
            Ok(snapshot) => snapshot,
            Err(e) => return Attempt::Failed(e.to_string()),
        };
        let price = match order.try_execute(&snapshot) {
            Execution::Satisfied(price) => price,
            Execution::NotYet => return Attempt::NotYet,
        };

        let lock = self.fill_lock(&order.owner, &order.symbol);
        let _guard = lock.lock().await;

        let limit = self.risk.effective_limit(&order.owner, &order.symbol).await;
        let position = self.ledger.position(&order.owner, &order.symbol).await;
        let account = self.ledger.account(&order.owner).await;
        let input = RiskInput {
            order,
            snapshot: &snapshot,
            position: position.as_ref(),
            limit: &limit,
            account: &account,
            conditions: self
                .cache
                .market_conditions(&order.symbol, order.side, self.risk.volatility_window()),
            gates: self.risk.gates(),
        };
        if let RiskDecision::Violation(violation) = self.risk.check(&input).await {
            return Attempt::Failed(violation.to_string());
        }

        let fill = Fill {
            owner: order.owner.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            size: order.size,
            price,
            leverage: order.leverage,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
        };
        match self.ledger.apply_fill(fill).await {
            Ok(fill) => Attempt::Filled {
                price,
                fill,
                prior: position,
            },
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }

    /// Cancel a pending order
    pub async fn cancel(&self, order_id: Uuid) -> std::result::Result<Order, OrderError> {
        let slot = self.slot(order_id)?;
        let mut order = slot.order.lock().await;
        if !order.is_pending() {
            return Err(OrderError::InvalidState {
                order_id: order_id.to_string(),
                status: order.status.to_string(),
            });
        }
        order.mark_cancelled();
        self.remove_pending(&order.symbol, order_id);
        slot.updates.send_replace(order.clone());
        let committed = order.clone();
        drop(order);

        info!(order_id = %order_id, "Order cancelled");
        self.persisted("order", self.store.update_order(&committed).await);
        Ok(committed)
    }

    /// Follow an order's committed states
    pub fn watch_order(&self, order_id: Uuid) -> std::result::Result<watch::Receiver<Order>, OrderError> {
        Ok(self.slot(order_id)?.updates.subscribe())
    }

    /// Wait until the order reaches a terminal state
    pub async fn wait_for(&self, order_id: Uuid) -> std::result::Result<Order, OrderError> {
        let mut updates = self.watch_order(order_id)?;
        let order = updates
            .wait_for(|order| order.status.is_terminal())
            .await
            .map_err(|_| OrderError::NotFound {
                order_id: order_id.to_string(),
            })?;
        Ok((*order).clone())
    }

    pub fn order(&self, order_id: Uuid) -> Option<Order> {
        self.orders.get(&order_id).map(|slot| slot.committed())
    }

    /// The owner's orders, oldest first
    pub fn orders(&self, owner: &str) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .map(|entry| entry.value().committed())
            .filter(|order| order.owner == owner)
            .collect();
        orders.sort_by_key(|order| order.created_at);
        orders
    }

    pub fn order_by_client_id(&self, owner: &str, client_order_id: &str) -> Option<Order> {
        let order_id = *self
            .client_ids
            .get(&(owner.to_string(), client_order_id.to_string()))?
            .value();
        self.order(order_id)
    }

    pub fn pending_orders(&self, symbol: &str) -> Vec<Uuid> {
        self.pending
            .get(symbol)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    // ==================== Market data ====================

    /// Price-tick entry point.
    ///
    /// Updates the cache, reprices open positions in the symbol, closes the
    /// ones that crossed a stop-loss, take-profit or liquidation price, then
    /// retries pending orders for the symbol.
    pub async fn ingest(&self, snapshot: PriceSnapshot) -> std::result::Result<IngestReport, MarketDataError> {
        let symbol = snapshot.symbol.clone();
        let mut report = IngestReport::default();

        // positions are marked in the same order the cache accepts ticks
        let marked = {
            let lock = self.mark_lock(&symbol);
            let _guard = lock.lock().await;
            let snapshot = self.cache.update(snapshot)?;
            self.ledger.mark_symbol(&symbol, snapshot.last_price).await
        };

        match marked {
            Ok(outcomes) => {
                for outcome in outcomes.into_iter().filter(|o| o.trigger.is_some()) {
                    if let Some(trade) = self.auto_close(&outcome.position.owner, &symbol).await {
                        report.auto_closed.push(trade);
                    }
                }
            }
            Err(e) => error!(symbol = %symbol, error = %e, "Failed to mark positions"),
        }

        for order_id in self.pending_orders(&symbol) {
            match self.attempt(order_id).await {
                Ok(order) if order.status == OrderStatus::Filled => report.filled.push(order_id),
                Ok(order) if order.status == OrderStatus::Failed => report.failed.push(order_id),
                Ok(_) => {}
                Err(e) => warn!(order_id = %order_id, error = %e, "Retry of pending order failed"),
            }
        }

        Ok(report)
    }

    /// Close a position whose threshold is crossed at the latest price.
    /// Re-checks under the fill lock, since a fill may have landed since the
    /// position was marked.
    async fn auto_close(&self, owner: &str, symbol: &str) -> Option<TradeRecord> {
        let lock = self.fill_lock(owner, symbol);
        let guard = lock.lock().await;

        let price = self.cache.latest(symbol)?.last_price;
        let marked = self.ledger.mark_price(owner, symbol, price).await.ok()?;
        let trigger = marked.trigger?;
        let status = match trigger {
            CloseTrigger::Liquidation => PositionStatus::Liquidated,
            CloseTrigger::StopLoss | CloseTrigger::TakeProfit => PositionStatus::Closed,
        };
        let outcome = match self.ledger.close_with_status(owner, symbol, price, status).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(owner, symbol, error = %e, "Automatic close failed");
                return None;
            }
        };
        drop(guard);

        let reason = match trigger {
            CloseTrigger::StopLoss => TradeReason::StopLoss,
            CloseTrigger::TakeProfit => TradeReason::TakeProfit,
            CloseTrigger::Liquidation => TradeReason::Liquidation,
        };
        if trigger == CloseTrigger::Liquidation {
            warn!(owner, symbol, price = %price, realized = %outcome.realized_pnl, "Position liquidated");
        } else {
            info!(owner, symbol, %trigger, price = %price, realized = %outcome.realized_pnl, "Position closed by trigger");
        }

        let trade = TradeRecord {
            id: Uuid::new_v4(),
            order_id: None,
            owner: owner.to_string(),
            symbol: symbol.to_string(),
            side: marked.position.side.closing_side(),
            size: marked.position.size,
            price,
            commission: outcome.commission,
            realized_pnl: outcome.realized_pnl,
            reason,
            timestamp: Utc::now(),
        };

        self.persisted("position", self.store.update_position(&outcome.position).await);
        self.persisted("daily_stats", self.store.save_daily_stats(&outcome.stats).await);
        self.publish(trade.clone()).await;
        Some(trade)
    }

    /// Latest snapshot; unknown symbols are an error, never a zero price
    pub fn latest_snapshot(&self, symbol: &str) -> std::result::Result<Arc<PriceSnapshot>, MarketDataError> {
        self.cache.require(symbol)
    }

    pub fn latest_price(&self, symbol: &str) -> std::result::Result<Decimal, MarketDataError> {
        self.cache.require(symbol).map(|s| s.last_price)
    }

    pub fn subscribe_market_data(&self, symbol: &str) -> (SubscriptionHandle, MarketDataStream) {
        self.cache.subscribe(symbol)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.cache.unsubscribe(handle)
    }

    // ==================== Positions & accounts ====================

    pub async fn position(&self, owner: &str, symbol: &str) -> Option<Position> {
        self.ledger.position(owner, symbol).await
    }

    pub async fn positions(&self, owner: &str) -> Vec<Position> {
        self.ledger.positions(owner).await
    }

    pub async fn account(&self, owner: &str) -> AccountSnapshot {
        self.ledger.account(owner).await
    }

    pub async fn set_collateral(
        &self,
        owner: &str,
        collateral: Decimal,
    ) -> std::result::Result<AccountSnapshot, LedgerError> {
        self.ledger.set_collateral(owner, collateral).await
    }

    /// Replace stop-loss and take-profit on an open position. Takes effect
    /// from the next tick.
    pub async fn set_protection(
        &self,
        owner: &str,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> std::result::Result<Position, LedgerError> {
        let position = self
            .ledger
            .set_protection(owner, symbol, stop_loss, take_profit)
            .await?;
        self.persisted("position", self.store.update_position(&position).await);
        Ok(position)
    }

    pub async fn daily_stats(&self, owner: &str, date: NaiveDate) -> Option<DailyStats> {
        self.ledger.daily_stats(owner, date).await
    }

    pub async fn daily_stats_range(&self, owner: &str, from: NaiveDate, to: NaiveDate) -> Vec<DailyStats> {
        self.ledger.daily_stats_range(owner, from, to).await
    }

    // ==================== Risk ====================

    pub async fn update_limit(&self, limit: RiskLimit) -> std::result::Result<RiskLimit, LimitError> {
        self.risk.update_limit(limit).await
    }

    pub async fn risk_history(&self, filter: &RiskHistoryFilter) -> Vec<RiskCheckRecord> {
        self.risk.history(filter).await
    }

    // ==================== Trades & persistence ====================

    /// Every trade the engine books from now on, fills and automatic closes
    pub fn trades(&self) -> broadcast::Receiver<TradeRecord> {
        self.trades.subscribe()
    }

    /// Writes that failed since start. Failed writes are never retried or
    /// rolled back.
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    async fn publish(&self, trade: TradeRecord) {
        self.persisted("trade", self.store.save_trade(&trade).await);
        // no receivers is fine
        let _ = self.trades.send(trade);
    }

    async fn persist_fill(&self, fill: &FillResult, opened: bool) {
        if let Some(closed) = &fill.closed {
            self.persisted("position", self.store.update_position(closed).await);
        }
        let result = if opened || fill.closed.is_some() {
            self.store.save_position(&fill.position).await
        } else {
            self.store.update_position(&fill.position).await
        };
        self.persisted("position", result);
        if let Some(stats) = &fill.stats {
            self.persisted("daily_stats", self.store.save_daily_stats(stats).await);
        }
    }

    fn persisted(&self, record: &'static str, result: Result<()>) {
        if let Err(e) = result {
            let failures = self.persistence_failures.fetch_add(1, Ordering::Relaxed) + 1;
            error!(record, error = %e, failures, "Persistence write failed");
        }
    }

    // ==================== Internals ====================

    fn slot(&self, order_id: Uuid) -> std::result::Result<Arc<OrderSlot>, OrderError> {
        self.orders
            .get(&order_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| OrderError::NotFound {
                order_id: order_id.to_string(),
            })
    }

    fn fill_lock(&self, owner: &str, symbol: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.fill_locks
                .entry(PositionKey::new(owner, symbol))
                .or_default()
                .value(),
        )
    }

    fn mark_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.mark_locks.entry(symbol.to_string()).or_default().value())
    }

    fn remove_pending(&self, symbol: &str, order_id: Uuid) {
        if let Some(mut ids) = self.pending.get_mut(symbol) {
            ids.retain(|id| *id != order_id);
        }
        self.pending.remove_if(symbol, |_, ids| ids.is_empty());
    }
}
