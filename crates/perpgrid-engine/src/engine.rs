/*
[INPUT]:  EngineConfig + OS shutdown signal
[OUTPUT]: Running per-symbol grid tasks with supervised streams
[POS]:    Wiring layer - construction, stream fan-in, lifecycle
[UPDATE]: When changing startup/shutdown guarantees or stream plumbing
*/

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use perpgrid_exchange::{
    ExchangeGateway, Order, PaperGateway, PriceTick, StreamHandle,
};

use crate::config::{EngineConfig, TaskConfig};
use crate::coordinator::GridCoordinator;
use crate::executor::OrderExecutor;
use crate::health::{Component, HealthRegistry, StatusSnapshot, TaskStatus};
use crate::metrics::EngineMetrics;
use crate::monitor::{DualMeanRegimeMonitor, RollingRiskMonitor};
use crate::reconciler::{CircuitBreaker, Reconciler};
use crate::retry::RetryPolicy;
use crate::slot_manager::SlotManager;
use crate::store::StateStore;
use crate::strategy::GridParams;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_REFRESH: Duration = Duration::from_secs(2);

/// Default drawdown fraction that trips the rolling risk monitor.
const DEFAULT_DRAWDOWN_TRIGGER: Decimal = Decimal::from_parts(3, 0, 0, false, 2);
/// Default fast/slow separation band for the regime classifier.
const DEFAULT_REGIME_BAND: Decimal = Decimal::from_parts(2, 0, 0, false, 3);

struct TaskRuntime {
    symbol: String,
    coordinator: Arc<GridCoordinator>,
    slot_manager: Arc<SlotManager>,
    reconciler: Arc<Reconciler>,
    breaker: Arc<CircuitBreaker>,
}

/// Owns every per-symbol task and supervises shutdown.
pub struct Engine {
    config: EngineConfig,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<Result<()>>>,
    streams: Vec<StreamHandle>,
    runtimes: Vec<Arc<TaskRuntime>>,
    metrics: Arc<EngineMetrics>,
    health: Arc<HealthRegistry>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            streams: Vec::new(),
            runtimes: Vec::new(),
            metrics: EngineMetrics::shared(),
            health: HealthRegistry::shared(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        self.health.clone()
    }

    /// Boots every configured task; any boot failure aborts startup.
    pub async fn start(&mut self, dry_run: bool) -> Result<()> {
        std::fs::create_dir_all(&self.config.state_dir)
            .with_context(|| format!("create state dir {}", self.config.state_dir.display()))?;

        if let Some(listen) = self.config.health_listen.clone() {
            let addr: std::net::SocketAddr =
                listen.parse().context("parse health_listen address")?;
            let registry = self.health.clone();
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                if let Err(err) = crate::health::serve(addr, registry, cancel).await {
                    warn!(error = %err, "health server exited");
                }
            });
        }

        let tasks = self.config.tasks.clone();
        for task_config in tasks {
            let symbol = task_config.symbol.clone();
            self.spawn_task(task_config, dry_run)
                .await
                .with_context(|| format!("start task for {symbol}"))?;
        }

        self.health.set_live(Component::OrderExecutor, true);
        self.health.set_live(Component::RiskMonitor, true);
        self.health.set_live(Component::SlotManager, true);
        self.health.set_live(Component::Exchange, true);
        self.spawn_status_updater();

        Ok(())
    }

    async fn spawn_task(&mut self, task_config: TaskConfig, dry_run: bool) -> Result<()> {
        let symbol = task_config.symbol.clone();
        let task_id = uuid::Uuid::new_v4();
        info!(task_uuid = %task_id, symbol = %symbol, exchange = %task_config.exchange, "task starting");
        let gateway = build_gateway(&task_config, dry_run)?;

        gateway
            .validate_credentials()
            .await
            .with_context(|| format!("credential validation failed for {symbol}"))?;

        let slot_manager = Arc::new(SlotManager::new(
            symbol.clone(),
            task_config.price_decimals,
        ));
        let store = Arc::new(
            StateStore::open(self.config.state_dir.join(format!("{symbol}.db")))
                .with_context(|| format!("open state store for {symbol}"))?,
        );
        let breaker = Arc::new(CircuitBreaker::new());
        let risk = Arc::new(RollingRiskMonitor::new(DEFAULT_DRAWDOWN_TRIGGER));
        let regime = Arc::new(DualMeanRegimeMonitor::new(DEFAULT_REGIME_BAND));
        let executor = Arc::new(OrderExecutor::new(
            gateway.clone(),
            RetryPolicy::from_config(&task_config.retry),
            &task_config.pool,
            self.metrics.clone(),
        ));

        let params = GridParams::from_config(
            symbol.clone(),
            task_config.price_decimals,
            task_config.quantity_decimals,
            &task_config.grid,
        );
        let coordinator = Arc::new(GridCoordinator::new(
            params,
            gateway.clone(),
            slot_manager.clone(),
            store,
            executor,
            risk,
            regime,
            breaker.clone(),
            self.metrics.clone(),
        ));

        coordinator.boot().await?;

        let reconciler = Arc::new(Reconciler::new(
            gateway.clone(),
            slot_manager.clone(),
            coordinator.clone(),
            breaker.clone(),
            task_config.reconcile.clone(),
            self.metrics.clone(),
        ));
        tokio::spawn(reconciler.clone().run(self.shutdown.child_token()));

        // Prices conflate to the latest tick (oldest dropped on
        // overflow); order updates are never dropped.
        let (price_tx, price_rx) = watch::channel(Decimal::ZERO);
        let (order_tx, order_rx) = mpsc::unbounded_channel::<Order>();

        let stream_symbol = symbol.clone();
        let price_stream = gateway
            .start_price_stream(
                vec![symbol.clone()],
                Arc::new(move |tick: PriceTick| {
                    if tick.symbol == stream_symbol {
                        let _ = price_tx.send(tick.price);
                    }
                }),
            )
            .await
            .context("start price stream")?;
        let order_stream = gateway
            .start_order_stream(Arc::new(move |order: Order| {
                let _ = order_tx.send(order);
            }))
            .await
            .context("start order stream")?;
        self.streams.push(price_stream);
        self.streams.push(order_stream);

        let runtime = Arc::new(TaskRuntime {
            symbol: symbol.clone(),
            coordinator: coordinator.clone(),
            slot_manager,
            reconciler,
            breaker,
        });
        self.runtimes.push(runtime);

        let cancel = self.shutdown.child_token();
        self.tasks.push(tokio::spawn(run_task_loop(
            symbol,
            coordinator,
            price_rx,
            order_rx,
            cancel,
        )));

        Ok(())
    }

    fn spawn_status_updater(&self) {
        let runtimes = self.runtimes.clone();
        let metrics = self.metrics.clone();
        let health = self.health.clone();
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_REFRESH);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }

                let mut tasks = Vec::with_capacity(runtimes.len());
                for runtime in &runtimes {
                    tasks.push(TaskStatus {
                        symbol: runtime.symbol.clone(),
                        last_price: runtime.coordinator.last_price().await,
                        last_tick_ms: chrono::Utc::now().timestamp_millis(),
                        slot_counts: runtime.slot_manager.counts(),
                        divergence: runtime.reconciler.last_divergence(),
                        breaker_open: runtime.breaker.is_open(),
                    });
                }
                health.set_status(StatusSnapshot {
                    tasks,
                    metrics: Some(metrics.snapshot()),
                });
            }
        });
    }

    /// Cancels everything and joins tasks within the shutdown budget.
    pub async fn shutdown_and_wait(&mut self) -> Result<()> {
        self.shutdown.cancel();
        for stream in self.streams.drain(..) {
            stream.stop();
        }

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        let mut handles = std::mem::take(&mut self.tasks);

        while let Some(mut handle) = handles.pop() {
            tokio::select! {
                res = &mut handle => {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            abort_all(handles);
                            return Err(err).context("task returned error");
                        }
                        Err(join_err) => {
                            abort_all(handles);
                            if join_err.is_panic() {
                                return Err(anyhow!("task panicked: {join_err}"));
                            }
                            return Err(anyhow!("task join error: {join_err}"));
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    handle.abort();
                    abort_all(handles);
                    return Err(anyhow!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}"));
                }
            }
        }

        Ok(())
    }
}

fn build_gateway(task_config: &TaskConfig, dry_run: bool) -> Result<Arc<dyn ExchangeGateway>> {
    if dry_run || task_config.exchange == "paper" {
        return Ok(PaperGateway::new());
    }
    // Live venue gateways implement ExchangeGateway and register here.
    Err(anyhow!(
        "exchange {} has no gateway wired; only \"paper\" ships in-tree",
        task_config.exchange
    ))
}

async fn run_task_loop(
    symbol: String,
    coordinator: Arc<GridCoordinator>,
    mut price_rx: watch::Receiver<Decimal>,
    mut order_rx: mpsc::UnboundedReceiver<Order>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(symbol = %symbol, "task loop running");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // In-flight phase 2 work has completed by the time
                // on_price_update returns, so teardown is safe here.
                coordinator.shutdown().await;
                info!(symbol = %symbol, "task loop stopped");
                return Ok(());
            }
            changed = price_rx.changed() => {
                if changed.is_err() {
                    // Stream owner dropped; shutdown will follow.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                let price = *price_rx.borrow_and_update();
                coordinator.on_price_update(price).await;
            }
            update = order_rx.recv() => {
                match update {
                    Some(order) => coordinator.on_order_update(&order).await,
                    None => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                }
            }
        }
    }
}

fn abort_all(handles: Vec<JoinHandle<Result<()>>>) {
    for handle in handles {
        handle.abort();
    }
}
