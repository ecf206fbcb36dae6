/*
[INPUT]:  Engine order actions and stream subscriptions
[OUTPUT]: Abstract venue surface: orders, queries, and push streams
[POS]:    Gateway layer - the one trait the engine talks to
[UPDATE]: When the engine consumes a new venue capability
*/

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{AccountSnapshot, Order, OrderRequest, Position, PriceTick};

/// Stream callbacks. Implementations fire each callback at least once
/// with the current snapshot on (re)connect, then on every update.
/// Callbacks must not block; the engine bridges them onto channels.
pub type PriceCallback = Arc<dyn Fn(PriceTick) + Send + Sync>;
pub type OrderCallback = Arc<dyn Fn(Order) + Send + Sync>;
pub type PositionCallback = Arc<dyn Fn(Vec<Position>) + Send + Sync>;
pub type AccountCallback = Arc<dyn Fn(AccountSnapshot) + Send + Sync>;

/// Handle to a running stream task. Dropping the handle does not stop
/// the stream; call `stop` and await `join` during shutdown.
#[derive(Debug)]
pub struct StreamHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Abstract perpetual-futures venue.
///
/// Streams auto-reconnect indefinitely with capped exponential backoff;
/// queries and order calls surface `ExchangeError` mapped from venue
/// codes. Implementations are shared behind `Arc<dyn ExchangeGateway>`.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Human-readable venue name for logs and health reporting.
    fn name(&self) -> &str;

    /// Validate credentials; called once at startup. Failure is fatal.
    async fn validate_credentials(&self) -> Result<()>;

    async fn place_order(&self, request: &OrderRequest) -> Result<Order>;

    /// Places a batch; returns the successfully placed orders and
    /// whether any failure was a margin (insufficient funds) error.
    async fn batch_place_orders(&self, requests: &[OrderRequest]) -> Result<(Vec<Order>, bool)>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()>;

    async fn batch_cancel_orders(&self, symbol: &str, order_ids: &[i64]) -> Result<()>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    /// Fetch a single order, by venue id when nonzero, otherwise by
    /// client order id (used to adopt duplicate placements).
    async fn get_order(&self, symbol: &str, order_id: i64, client_order_id: &str)
    -> Result<Order>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>>;

    async fn get_positions(&self, symbol: &str) -> Result<Vec<Position>>;

    async fn get_account(&self) -> Result<AccountSnapshot>;

    async fn start_price_stream(&self, symbols: Vec<String>, cb: PriceCallback)
    -> Result<StreamHandle>;

    async fn start_order_stream(&self, cb: OrderCallback) -> Result<StreamHandle>;

    async fn start_position_stream(&self, cb: PositionCallback) -> Result<StreamHandle>;

    async fn start_account_stream(&self, cb: AccountCallback) -> Result<StreamHandle>;
}
