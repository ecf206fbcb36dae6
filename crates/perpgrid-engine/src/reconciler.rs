/*
[INPUT]:  Periodic exchange snapshots and the live slot ledger
[OUTPUT]: Folded state, drift corrections, or an opened circuit breaker
[POS]:    Recovery layer - background truth-sync with the venue
[UPDATE]: When drift policy, sweep cadence, or breaker semantics change
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use perpgrid_exchange::ExchangeGateway;

use crate::config::ReconcileConfig;
use crate::coordinator::GridCoordinator;
use crate::metrics::EngineMetrics;
use crate::slot_manager::{SlotManager, SyncReport};

/// Stale PENDING slots older than this are released by the sweep.
const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Divergence denominator floor, so a zero exchange position still
/// produces a finite (and huge) divergence.
const DIVERGENCE_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 9);

/// Per-symbol guard: while open, the coordinator emits zero actions.
/// Opened on large drift or operator action; closed only by operator
/// reset.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    open: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "circuit breaker opened");
        *self.reason.lock() = Some(reason);
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn reset(&self) {
        info!("circuit breaker reset");
        self.open.store(false, Ordering::SeqCst);
        *self.reason.lock() = None;
    }
}

/// Background reconciler: every interval it fetches the venue's open
/// orders and positions, folds them into the ledger, and applies the
/// drift policy.
pub struct Reconciler {
    gateway: Arc<dyn ExchangeGateway>,
    slot_manager: Arc<SlotManager>,
    coordinator: Arc<GridCoordinator>,
    breaker: Arc<CircuitBreaker>,
    config: ReconcileConfig,
    metrics: Arc<EngineMetrics>,
    last_divergence: Mutex<Decimal>,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        slot_manager: Arc<SlotManager>,
        coordinator: Arc<GridCoordinator>,
        breaker: Arc<CircuitBreaker>,
        config: ReconcileConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            gateway,
            slot_manager,
            coordinator,
            breaker,
            config,
            metrics,
            last_divergence: Mutex::new(Decimal::ZERO),
        }
    }

    /// Most recent divergence fraction, for the status endpoint.
    pub fn last_divergence(&self) -> Decimal {
        *self.last_divergence.lock()
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(symbol = %self.slot_manager.symbol(), "reconciler stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!(symbol = %self.slot_manager.symbol(), error = %err, "reconcile sweep failed");
                    }
                }
            }
        }
    }

    /// One sweep: release stale pendings, fold the exchange snapshot,
    /// then auto-correct small drift or open the breaker on large.
    pub async fn sweep(&self) -> anyhow::Result<SyncReport> {
        self.metrics.reconcile_sweeps.inc();
        let symbol = self.slot_manager.symbol().to_string();

        let (open_orders, positions) = tokio::try_join!(
            self.gateway.get_open_orders(&symbol),
            self.gateway.get_positions(&symbol),
        )
        .context("fetch exchange snapshot for sweep")?;
        let net_position: Decimal = positions.iter().map(|p| p.quantity).sum();

        let released = self.slot_manager.release_stale_pending(PENDING_TIMEOUT);
        if released > 0 {
            warn!(symbol = %symbol, released, "released stale pending slots");
        }

        let report = self.slot_manager.sync_orders(&open_orders, net_position);
        self.metrics
            .ghost_fills
            .add((report.ghost_buys + report.ghost_sells) as u64);
        self.metrics.zombie_slots.add(report.zombies as u64);
        self.metrics
            .unmatched_orders
            .add(report.unmatched_keys.len() as u64);

        if report.has_drift() {
            self.apply_drift_policy(&report).await;
        } else {
            *self.last_divergence.lock() = Decimal::ZERO;
        }

        Ok(report)
    }

    async fn apply_drift_policy(&self, report: &SyncReport) {
        let divergence = divergence_pct(report.exchange_position, report.local_filled);
        *self.last_divergence.lock() = divergence;

        if divergence < self.config.drift_small_threshold {
            let hint = self.coordinator.last_price().await;
            let delta = self
                .slot_manager
                .force_sync(report.exchange_position, hint);
            self.metrics.drift_corrections.inc();
            info!(
                symbol = %self.slot_manager.symbol(),
                %divergence,
                %delta,
                "small drift auto-corrected"
            );
            // Corrections mutate position_qty; persist before anything
            // else builds on the corrected ledger.
            self.coordinator.persist_now().await;
        } else {
            self.metrics.breaker_trips.inc();
            self.breaker.open(format!(
                "position drift {divergence} exceeds threshold {} (local {}, exchange {})",
                self.config.drift_small_threshold, report.local_filled, report.exchange_position,
            ));
            error!(
                symbol = %self.slot_manager.symbol(),
                local = %report.local_filled,
                exchange = %report.exchange_position,
                %divergence,
                "large position drift; trading suspended, operator action required"
            );
        }
    }
}

/// `|exchange - local| / max(|exchange|, epsilon)`.
pub fn divergence_pct(exchange: Decimal, local: Decimal) -> Decimal {
    let denom = exchange.abs().max(DIVERGENCE_EPSILON);
    (exchange - local).abs() / denom
}
