/*
[INPUT]:  Batches of order actions from the coordinator
[OUTPUT]: Per-action outcomes, in input order, after retries
[POS]:    Execution layer - bounded worker pool in front of the gateway
[UPDATE]: When pool sizing, retry classification, or duplicate handling change
*/

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use perpgrid_exchange::{ExchangeError, ExchangeGateway, Result, message_looks_transient};

use crate::action::{ActionOutcome, OrderAction};
use crate::config::PoolConfig;
use crate::metrics::EngineMetrics;
use crate::retry::{RetryPolicy, retry};

/// Seam the coordinator dispatches through; lets tests substitute the
/// pool with a recorder.
#[async_trait]
pub trait ExecuteActions: Send + Sync {
    async fn execute(&self, actions: Vec<OrderAction>) -> Vec<ActionOutcome>;
}

/// Dispatches actions through a bounded worker pool with retries.
///
/// `queue` bounds how many actions may wait for a worker; when it is
/// exhausted and the pool is non-blocking, the action runs on an
/// unbounded task instead so the tick never stalls behind the pool.
pub struct OrderExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    policy: RetryPolicy,
    workers: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    non_blocking: bool,
    metrics: Arc<EngineMetrics>,
}

impl OrderExecutor {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        policy: RetryPolicy,
        pool: &PoolConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            gateway,
            policy,
            workers: Arc::new(Semaphore::new(pool.max_workers.max(1))),
            queue: Arc::new(Semaphore::new(pool.max_capacity.max(1))),
            non_blocking: pool.non_blocking,
            metrics,
        }
    }

    fn spawn_action(&self, action: OrderAction) -> JoinHandle<ActionOutcome> {
        let queue_permit = match self.queue.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) if self.non_blocking => {
                // Saturated: preserve liveness on an unbounded task.
                self.metrics.executor_overflow.inc();
                warn!(symbol = action.symbol(), "executor queue full; overflow spawn");
                None
            }
            Err(_) => None,
        };
        let must_wait_for_queue = queue_permit.is_none() && !self.non_blocking;

        let gateway = self.gateway.clone();
        let policy = self.policy.clone();
        let workers = self.workers.clone();
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let _queue_permit = if must_wait_for_queue {
                Some(queue.acquire_owned().await.expect("queue semaphore open"))
            } else {
                queue_permit
            };
            let _worker_permit = workers.acquire_owned().await.expect("worker semaphore open");
            run_action(gateway.as_ref(), &policy, &metrics, action).await
        })
    }
}

#[async_trait]
impl ExecuteActions for OrderExecutor {
    /// Results come back in input order; the whole batch is awaited so
    /// the caller's phase barrier holds.
    async fn execute(&self, actions: Vec<OrderAction>) -> Vec<ActionOutcome> {
        let handles: Vec<JoinHandle<ActionOutcome>> = actions
            .into_iter()
            .map(|action| self.spawn_action(action))
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    // A panicked worker loses its action; the pending
                    // sweep reclaims the slot.
                    warn!(error = %join_err, "executor worker task failed");
                }
            }
        }
        outcomes
    }
}

fn is_transient(err: &ExchangeError) -> bool {
    err.is_transient() || message_looks_transient(&err.to_string())
}

async fn run_action(
    gateway: &dyn ExchangeGateway,
    policy: &RetryPolicy,
    metrics: &EngineMetrics,
    action: OrderAction,
) -> ActionOutcome {
    match &action {
        OrderAction::Place { request, .. } => {
            let result = retry(
                policy,
                is_transient,
                |_, _| metrics.retry_attempts.inc(),
                || gateway.place_order(request),
            )
            .await;

            let result = match result {
                // A duplicate means an earlier attempt landed: adopt it.
                Err(ExchangeError::DuplicateOrder(_)) if !request.client_order_id.is_empty() => {
                    debug!(
                        client_order_id = %request.client_order_id,
                        "duplicate place; fetching existing order"
                    );
                    gateway
                        .get_order(&request.symbol, 0, &request.client_order_id)
                        .await
                }
                other => other,
            };

            match result {
                Ok(order) => {
                    metrics.orders_placed.inc();
                    ActionOutcome::ok(action, Some(order))
                }
                Err(err) => {
                    metrics.place_failures.inc();
                    warn!(symbol = %request.symbol, price = %request.price, error = %err, "place failed");
                    ActionOutcome::err(action, err)
                }
            }
        }
        OrderAction::Cancel { symbol, order_id } => {
            let result: Result<()> = retry(
                policy,
                is_transient,
                |_, _| metrics.retry_attempts.inc(),
                || gateway.cancel_order(symbol, *order_id),
            )
            .await;

            match result {
                Ok(()) => {
                    metrics.orders_canceled.inc();
                    ActionOutcome::ok(action, None)
                }
                // Already gone is what a cancel wanted anyway.
                Err(err) if err.is_not_found() => {
                    metrics.orders_canceled.inc();
                    ActionOutcome::ok(action, None)
                }
                Err(err) => {
                    metrics.cancel_failures.inc();
                    warn!(symbol = %symbol, order_id, error = %err, "cancel failed");
                    ActionOutcome::err(action, err)
                }
            }
        }
    }
}
