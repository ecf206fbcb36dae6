/*
[INPUT]:  Price ticks, order-stream updates, monitor readings
[OUTPUT]: Executed grid actions and throttled state persistence
[POS]:    Control layer - the per-symbol tick loop
[UPDATE]: When phase ordering, boot steps, or save throttling change
*/

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use perpgrid_exchange::{ExchangeGateway, Order};

use crate::action::OrderAction;
use crate::executor::ExecuteActions;
use crate::metrics::EngineMetrics;
use crate::monitor::{RegimeMonitor, RiskMonitor};
use crate::reconciler::CircuitBreaker;
use crate::slot::SlotView;
use crate::slot_manager::{LedgerError, SlotManager, UpdateOutcome};
use crate::snapshot::LedgerSnapshot;
use crate::store::StateStore;
use crate::strategy::{GridParams, TickInputs, calculate_actions};

/// Minimum spacing between throttled (non-forced) saves.
const SAVE_INTERVAL: Duration = Duration::from_millis(500);

struct TickState {
    /// Zero until the first observed price (or restored snapshot).
    anchor_price: Decimal,
    last_price: Decimal,
    is_risk_triggered: bool,
    is_dirty: bool,
    last_save_time: Option<Instant>,
    /// Reused strategy-view buffer.
    strat_slots: Vec<SlotView>,
}

/// Per-symbol control loop. `on_price_update` runs three strictly
/// ordered phases; the state mutex is held in phases 1 and 3 only,
/// never across the executor call.
pub struct GridCoordinator {
    params: GridParams,
    gateway: Arc<dyn ExchangeGateway>,
    slot_manager: Arc<SlotManager>,
    store: Arc<StateStore>,
    executor: Arc<dyn ExecuteActions>,
    risk: Arc<dyn RiskMonitor>,
    regime: Arc<dyn RegimeMonitor>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<EngineMetrics>,
    state: Mutex<TickState>,
}

impl GridCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: GridParams,
        gateway: Arc<dyn ExchangeGateway>,
        slot_manager: Arc<SlotManager>,
        store: Arc<StateStore>,
        executor: Arc<dyn ExecuteActions>,
        risk: Arc<dyn RiskMonitor>,
        regime: Arc<dyn RegimeMonitor>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            params,
            gateway,
            slot_manager,
            store,
            executor,
            risk,
            regime,
            breaker,
            metrics,
            state: Mutex::new(TickState {
                anchor_price: Decimal::ZERO,
                last_price: Decimal::ZERO,
                is_risk_triggered: false,
                is_dirty: false,
                last_save_time: None,
                strat_slots: Vec::new(),
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.params.symbol
    }

    pub async fn last_price(&self) -> Decimal {
        self.state.lock().await.last_price
    }

    pub async fn is_risk_triggered(&self) -> bool {
        self.state.lock().await.is_risk_triggered
    }

    /// Boot: restore persisted intent, then fold in the exchange's
    /// authoritative view. Fetch failures abort the boot.
    pub async fn boot(&self) -> anyhow::Result<()> {
        let symbol = self.params.symbol.clone();

        match self.store.load().context("load persisted state")? {
            Some(snapshot) => {
                info!(
                    symbol = %symbol,
                    slots = snapshot.slots.len(),
                    last_price = %snapshot.last_price,
                    "restoring persisted ledger"
                );
                self.slot_manager.restore_state(&snapshot.slots);
                let mut state = self.state.lock().await;
                state.anchor_price = snapshot.last_price;
                state.last_price = snapshot.last_price;
                state.is_risk_triggered = snapshot.is_risk_triggered;
            }
            None => {
                info!(symbol = %symbol, "no persisted state; starting fresh");
            }
        }

        let (open_orders, positions) = tokio::try_join!(
            self.gateway.get_open_orders(&symbol),
            self.gateway.get_positions(&symbol),
        )
        .context("fetch exchange snapshot at boot")?;

        let net_position: Decimal = positions.iter().map(|p| p.quantity).sum();
        let report = self.slot_manager.sync_orders(&open_orders, net_position);
        self.metrics
            .ghost_fills
            .add((report.ghost_buys + report.ghost_sells) as u64);
        self.metrics.zombie_slots.add(report.zombies as u64);
        self.metrics
            .unmatched_orders
            .add(report.unmatched_keys.len() as u64);

        if let Some((local, exchange)) =
            self.slot_manager.restore_from_exchange_position(net_position)
        {
            warn!(
                symbol = %symbol,
                %local,
                %exchange,
                "position diverges after boot reconcile; live reconciler will escalate"
            );
        }

        info!(
            symbol = %symbol,
            matched = report.matched,
            ghosts = report.ghost_buys + report.ghost_sells,
            zombies = report.zombies,
            "boot reconcile complete"
        );
        Ok(())
    }

    pub async fn on_price_update(&self, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        self.metrics.ticks_processed.inc();
        self.risk.record_price(price);
        self.regime.record_price(price);

        if self.breaker.is_open() {
            let mut state = self.state.lock().await;
            state.last_price = price;
            return;
        }

        // Phase 1 (locked): read monitors, run the strategy, mark
        // every emitted action PENDING before anything dispatches.
        let (risk_actions, strategy_actions) = {
            let mut state = self.state.lock().await;
            if state.anchor_price.is_zero() {
                state.anchor_price = price;
                info!(symbol = %self.params.symbol, anchor = %price, "anchor price initialized");
            }

            let atr = self.risk.atr();
            let volatility_factor = self.risk.volatility_factor();
            let triggered_now = self.risk.is_triggered();
            let regime = self.regime.regime();

            let mut risk_actions = Vec::new();
            if triggered_now && !state.is_risk_triggered {
                risk_actions = self.slot_manager.cancel_all_buy_orders();
                warn!(
                    symbol = %self.params.symbol,
                    cancels = risk_actions.len(),
                    "risk triggered; pulling resting buys"
                );
            }
            state.is_risk_triggered = triggered_now;

            let mut buf = std::mem::take(&mut state.strat_slots);
            self.slot_manager.get_strategy_slots(&mut buf);
            let inputs = TickInputs {
                current_price: price,
                anchor_price: state.anchor_price,
                atr,
                volatility_factor,
                is_risk_triggered: triggered_now,
                regime,
            };
            let mut strategy_actions = calculate_actions(&self.params, &inputs, &buf);
            state.strat_slots = buf;

            // The rising-edge sweep already cancels these.
            if !risk_actions.is_empty() {
                let risk_ids: HashSet<i64> = risk_actions
                    .iter()
                    .filter_map(OrderAction::cancel_order_id)
                    .collect();
                strategy_actions.retain(|action| {
                    action
                        .cancel_order_id()
                        .is_none_or(|id| !risk_ids.contains(&id))
                });
            }

            let risk_actions = self.slot_manager.mark_slots_pending(risk_actions);
            let strategy_actions = self.slot_manager.mark_slots_pending(strategy_actions);
            (risk_actions, strategy_actions)
        };

        // Phase 2 (unlocked): dispatch, risk first; results land in the
        // ledger before the phase completes.
        let had_risk = !risk_actions.is_empty();
        let had_strategy = !strategy_actions.is_empty();
        if had_risk {
            let outcomes = self.executor.execute(risk_actions).await;
            self.slot_manager.apply_action_results(&outcomes);
        }
        if had_strategy {
            let outcomes = self.executor.execute(strategy_actions).await;
            self.slot_manager.apply_action_results(&outcomes);
        }

        // Phase 3 (locked): bookkeeping and throttled persistence.
        let mut state = self.state.lock().await;
        state.last_price = price;
        if had_risk || had_strategy {
            state.is_dirty = true;
        }
        self.save_state_locked(&mut state, had_risk);
    }

    /// Order-stream entry point; the stream is authoritative for fills.
    pub async fn on_order_update(&self, update: &Order) {
        match self.slot_manager.on_order_update(update) {
            Ok(outcome) => {
                if outcome == UpdateOutcome::Filled {
                    self.metrics.fills_applied.inc();
                }
                if outcome != UpdateOutcome::Ignored {
                    let mut state = self.state.lock().await;
                    state.is_dirty = true;
                    self.save_state_locked(&mut state, false);
                }
            }
            Err(LedgerError::SlotNotFound { order_id, client_oid }) => {
                warn!(
                    symbol = %self.params.symbol,
                    order_id,
                    client_oid = %client_oid,
                    "order update for unknown slot"
                );
            }
        }
    }

    pub async fn maybe_save_state(&self, force: bool) {
        let mut state = self.state.lock().await;
        self.save_state_locked(&mut state, force);
    }

    /// Unconditional persist; used by the reconciler after corrections.
    pub async fn persist_now(&self) {
        self.maybe_save_state(true).await;
    }

    /// Persists iff forced, or dirty and past the save interval. A
    /// failed save leaves the dirty flag set so the next tick retries.
    fn save_state_locked(&self, state: &mut TickState, force: bool) {
        let due = state
            .last_save_time
            .is_none_or(|at| at.elapsed() > SAVE_INTERVAL);
        if !(force || (state.is_dirty && due)) {
            return;
        }

        let snapshot = LedgerSnapshot::new(
            self.slot_manager.get_snapshot(),
            state.last_price,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            state.is_risk_triggered,
        );
        match self.store.save(&snapshot) {
            Ok(()) => {
                state.last_save_time = Some(Instant::now());
                state.is_dirty = false;
                self.metrics.saves_completed.inc();
            }
            Err(err) => {
                self.metrics.save_failures.inc();
                error!(symbol = %self.params.symbol, error = %err, "state save failed; will retry");
            }
        }
    }

    /// Best-effort teardown: pull resting orders, then persist a final
    /// snapshot. The engine has already stopped feeding ticks.
    pub async fn shutdown(&self) {
        if let Err(err) = self.gateway.cancel_all_orders(&self.params.symbol).await {
            warn!(symbol = %self.params.symbol, error = %err, "cancel-all on shutdown failed");
        }
        self.maybe_save_state(true).await;
        info!(symbol = %self.params.symbol, "coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicBool, Ordering};

    use perpgrid_exchange::{PaperGateway, Side};

    use crate::config::{GridConfig, PoolConfig};
    use crate::executor::OrderExecutor;
    use crate::monitor::{Regime, StaticRegimeMonitor};
    use crate::retry::RetryPolicy;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    #[derive(Default)]
    struct TestRiskMonitor {
        triggered: AtomicBool,
    }

    impl RiskMonitor for TestRiskMonitor {
        fn record_price(&self, _price: Decimal) {}
        fn atr(&self) -> Decimal {
            Decimal::ZERO
        }
        fn volatility_factor(&self) -> Decimal {
            Decimal::ZERO
        }
        fn is_triggered(&self) -> bool {
            self.triggered.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        paper: Arc<PaperGateway>,
        coordinator: Arc<GridCoordinator>,
        slot_manager: Arc<SlotManager>,
        risk: Arc<TestRiskMonitor>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<EngineMetrics>,
    }

    fn fixture() -> Fixture {
        let paper = PaperGateway::new();
        let slot_manager = Arc::new(SlotManager::new("BTCUSDT", 1));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let metrics = EngineMetrics::shared();
        let breaker = Arc::new(CircuitBreaker::new());
        let risk = Arc::new(TestRiskMonitor::default());
        let executor = Arc::new(OrderExecutor::new(
            paper.clone(),
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            &PoolConfig::default(),
            metrics.clone(),
        ));
        let grid = GridConfig {
            price_interval: dec("1"),
            order_quantity: dec("1"),
            min_order_value: dec("5"),
            buy_window_size: 2,
            sell_window_size: 2,
            is_neutral: true,
            volatility_scale: Decimal::ZERO,
            inventory_skew_factor: Decimal::ZERO,
        };
        let params = GridParams::from_config("BTCUSDT", 1, 3, &grid);

        let coordinator = Arc::new(GridCoordinator::new(
            params,
            paper.clone(),
            slot_manager.clone(),
            store,
            executor,
            risk.clone(),
            Arc::new(StaticRegimeMonitor(Regime::Range)),
            breaker.clone(),
            metrics.clone(),
        ));

        Fixture {
            paper,
            coordinator,
            slot_manager,
            risk,
            breaker,
            metrics,
        }
    }

    #[tokio::test]
    async fn first_tick_builds_the_grid() {
        let fx = fixture();
        fx.coordinator.boot().await.unwrap();
        fx.coordinator.on_price_update(dec("100")).await;

        // 2 buys below, 2 sells above.
        let orders = fx.paper.open_orders();
        assert_eq!(orders.len(), 4);
        let prices: Vec<Decimal> = orders.iter().map(|o| o.price).collect();
        assert!(prices.contains(&dec("99.0")));
        assert!(prices.contains(&dec("98.0")));
        assert!(prices.contains(&dec("101.0")));
        assert!(prices.contains(&dec("102.0")));

        let counts = fx.slot_manager.counts();
        assert_eq!(counts.locked, 4);
        assert_eq!(counts.pending, 0);

        // Everything locked is indexed (P1).
        for order in &orders {
            assert!(fx.slot_manager.contains_order(order.order_id));
        }
        assert!(fx.metrics.saves_completed.get() >= 1);
    }

    #[tokio::test]
    async fn second_tick_at_same_price_is_stable() {
        let fx = fixture();
        fx.coordinator.boot().await.unwrap();
        fx.coordinator.on_price_update(dec("100")).await;
        fx.coordinator.on_price_update(dec("100")).await;

        assert_eq!(fx.paper.open_order_count(), 4);
    }

    #[tokio::test]
    async fn risk_transition_pulls_buys_and_masks_new_ones() {
        let fx = fixture();
        fx.coordinator.boot().await.unwrap();
        fx.coordinator.on_price_update(dec("100")).await;
        assert_eq!(fx.paper.open_order_count(), 4);

        fx.risk.triggered.store(true, Ordering::SeqCst);
        fx.coordinator.on_price_update(dec("100")).await;

        // The two buys are canceled on the venue; sells remain.
        let orders = fx.paper.open_orders();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.side == Side::Sell));
        assert!(fx.coordinator.is_risk_triggered().await);
    }

    #[tokio::test]
    async fn open_breaker_emits_zero_actions() {
        let fx = fixture();
        fx.coordinator.boot().await.unwrap();
        fx.breaker.open("drift beyond threshold");

        fx.coordinator.on_price_update(dec("100")).await;
        assert_eq!(fx.paper.open_order_count(), 0);
        assert_eq!(fx.coordinator.last_price().await, dec("100"));
    }

    #[tokio::test]
    async fn fill_update_moves_inventory_and_dirties_state() {
        let fx = fixture();
        fx.coordinator.boot().await.unwrap();
        fx.coordinator.on_price_update(dec("100")).await;

        let buy = fx
            .paper
            .open_orders()
            .into_iter()
            .find(|o| o.side == Side::Buy && o.price == dec("99.0"))
            .unwrap();
        fx.paper.fill_order(buy.order_id).unwrap();

        let mut filled = buy;
        filled.status = perpgrid_exchange::OrderStatus::Filled;
        filled.executed_qty = filled.quantity;
        fx.coordinator.on_order_update(&filled).await;

        assert_eq!(fx.slot_manager.local_filled_sum(), dec("1"));
        assert_eq!(fx.metrics.fills_applied.get(), 1);

        // The next tick places the reduce-only close one interval up.
        fx.coordinator.on_price_update(dec("100")).await;
        let close = fx
            .paper
            .open_orders()
            .into_iter()
            .find(|o| o.reduce_only)
            .expect("close order resting");
        assert_eq!(close.side, Side::Sell);
        assert_eq!(close.price, dec("100.0"));
    }

    #[tokio::test]
    async fn unknown_order_update_is_logged_not_fatal() {
        let fx = fixture();
        fx.coordinator.boot().await.unwrap();

        let stray = perpgrid_exchange::Order {
            order_id: 4242,
            client_order_id: "who".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: perpgrid_exchange::OrderType::Limit,
            status: perpgrid_exchange::OrderStatus::Filled,
            price: dec("97"),
            quantity: dec("1"),
            executed_qty: dec("1"),
            avg_price: dec("97"),
            create_time: 0,
            update_time: 0,
            reduce_only: false,
            post_only: false,
        };
        fx.coordinator.on_order_update(&stray).await;
        assert_eq!(fx.slot_manager.local_filled_sum(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn saves_are_throttled_between_ticks() {
        let fx = fixture();
        fx.coordinator.boot().await.unwrap();
        fx.coordinator.on_price_update(dec("100")).await;
        let saves_after_first = fx.metrics.saves_completed.get();

        // Same grid, no actions, inside the save interval: no new save.
        fx.coordinator.on_price_update(dec("100")).await;
        assert_eq!(fx.metrics.saves_completed.get(), saves_after_first);
    }

    #[tokio::test]
    async fn shutdown_cancels_resting_orders_and_persists() {
        let fx = fixture();
        fx.coordinator.boot().await.unwrap();
        fx.coordinator.on_price_update(dec("100")).await;
        assert_eq!(fx.paper.open_order_count(), 4);

        fx.coordinator.shutdown().await;
        assert_eq!(fx.paper.open_order_count(), 0);
    }
}
