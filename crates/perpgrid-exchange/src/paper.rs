/*
[INPUT]:  Engine order flow, plus test-side price/fill injection
[OUTPUT]: Venue behavior with no network: resting orders, fills, streams
[POS]:    Gateway layer - in-memory venue for dry-run and integration tests
[UPDATE]: When tests need a venue behavior the real gateways exhibit
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::error::{ExchangeError, Result};
use crate::gateway::{
    AccountCallback, ExchangeGateway, OrderCallback, PositionCallback, PriceCallback,
    StreamHandle,
};
use crate::types::{
    AccountSnapshot, Order, OrderRequest, OrderStatus, OrderType, Position, PriceTick, Side,
};

#[derive(Default)]
struct PaperState {
    open_orders: HashMap<i64, Order>,
    done_orders: HashMap<i64, Order>,
    positions: HashMap<String, Decimal>,
    price_cbs: Vec<PriceCallback>,
    order_cbs: Vec<OrderCallback>,
    position_cbs: Vec<PositionCallback>,
    account_cbs: Vec<AccountCallback>,
    place_errors: Vec<ExchangeError>,
    clock_ms: i64,
}

/// In-memory venue. Orders rest until a test (or the dry-run fill
/// loop) crosses them; fills update the net position and fan out on
/// the order and position streams like a real venue would.
pub struct PaperGateway {
    next_order_id: AtomicI64,
    state: Mutex<PaperState>,
}

impl PaperGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_order_id: AtomicI64::new(1),
            state: Mutex::new(PaperState::default()),
        })
    }

    /// Queue an error returned by the next `place_order` call.
    pub fn inject_place_error(&self, err: ExchangeError) {
        self.state.lock().unwrap().place_errors.push(err);
    }

    /// Seed the authoritative net position (reboot / ghost-fill fixtures).
    pub fn set_position(&self, symbol: &str, quantity: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.positions.insert(symbol.to_string(), quantity);
    }

    /// Seed a resting order as if it survived a restart.
    pub fn seed_open_order(&self, order: Order) {
        let mut state = self.state.lock().unwrap();
        if order.order_id >= self.next_order_id.load(Ordering::SeqCst) {
            self.next_order_id.store(order.order_id + 1, Ordering::SeqCst);
        }
        state.open_orders.insert(order.order_id, order);
    }

    /// Publish a price tick to every price-stream subscriber.
    pub fn push_price(&self, symbol: &str, price: Decimal) {
        let (cbs, time) = {
            let mut state = self.state.lock().unwrap();
            state.clock_ms += 1;
            (state.price_cbs.clone(), state.clock_ms)
        };
        let tick = PriceTick {
            symbol: symbol.to_string(),
            price,
            time,
        };
        for cb in cbs {
            cb(tick.clone());
        }
    }

    /// Fully fill a resting order: moves the net position and emits
    /// order + position stream events.
    pub fn fill_order(&self, order_id: i64) -> Result<()> {
        let (order, position, order_cbs, position_cbs) = {
            let mut state = self.state.lock().unwrap();
            let mut order = state
                .open_orders
                .remove(&order_id)
                .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
            state.clock_ms += 1;
            order.status = OrderStatus::Filled;
            order.executed_qty = order.quantity;
            order.avg_price = order.price;
            order.update_time = state.clock_ms;

            let delta = match order.side {
                Side::Buy => order.quantity,
                Side::Sell => -order.quantity,
            };
            let entry = state.positions.entry(order.symbol.clone()).or_default();
            *entry += delta;
            let position = Position {
                symbol: order.symbol.clone(),
                quantity: *entry,
                entry_price: order.price,
                unrealized_pnl: Decimal::ZERO,
                update_time: state.clock_ms,
            };

            state.done_orders.insert(order_id, order.clone());
            (order, position, state.order_cbs.clone(), state.position_cbs.clone())
        };

        for cb in order_cbs {
            cb(order.clone());
        }
        for cb in position_cbs {
            cb(vec![position.clone()]);
        }
        Ok(())
    }

    pub fn open_order_count(&self) -> usize {
        self.state.lock().unwrap().open_orders.len()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .state
            .lock()
            .unwrap()
            .open_orders
            .values()
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.order_id);
        orders
    }

    fn spawn_stream(&self) -> StreamHandle {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            task_cancel.cancelled().await;
        });
        StreamHandle::new(cancel, task)
    }

    fn emit_order(&self, order: Order) {
        let cbs = self.state.lock().unwrap().order_cbs.clone();
        for cb in cbs {
            cb(order.clone());
        }
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn validate_credentials(&self) -> Result<()> {
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        let order = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.place_errors.pop() {
                return Err(err);
            }

            let duplicate = !request.client_order_id.is_empty()
                && state
                    .open_orders
                    .values()
                    .any(|o| o.client_order_id == request.client_order_id);
            if duplicate {
                return Err(ExchangeError::DuplicateOrder(request.client_order_id.clone()));
            }

            state.clock_ms += 1;
            let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
            let order = Order {
                order_id,
                client_order_id: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                status: OrderStatus::New,
                price: request.price,
                quantity: request.quantity,
                executed_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                create_time: state.clock_ms,
                update_time: state.clock_ms,
                reduce_only: request.reduce_only,
                post_only: request.post_only,
            };
            state.open_orders.insert(order_id, order.clone());
            order
        };

        self.emit_order(order.clone());
        Ok(order)
    }

    async fn batch_place_orders(&self, requests: &[OrderRequest]) -> Result<(Vec<Order>, bool)> {
        let mut placed = Vec::with_capacity(requests.len());
        let mut had_margin_error = false;
        for request in requests {
            match self.place_order(request).await {
                Ok(order) => placed.push(order),
                Err(ExchangeError::InsufficientFunds(_)) => had_margin_error = true,
                Err(err) => return Err(err),
            }
        }
        Ok((placed, had_margin_error))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> Result<()> {
        let order = {
            let mut state = self.state.lock().unwrap();
            let mut order = state
                .open_orders
                .remove(&order_id)
                .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
            state.clock_ms += 1;
            order.status = OrderStatus::Canceled;
            order.update_time = state.clock_ms;
            state.done_orders.insert(order_id, order.clone());
            order
        };

        self.emit_order(order);
        Ok(())
    }

    async fn batch_cancel_orders(&self, symbol: &str, order_ids: &[i64]) -> Result<()> {
        for order_id in order_ids {
            self.cancel_order(symbol, *order_id).await?;
        }
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let ids: Vec<i64> = {
            let state = self.state.lock().unwrap();
            state
                .open_orders
                .values()
                .filter(|o| o.symbol == symbol)
                .map(|o| o.order_id)
                .collect()
        };
        self.batch_cancel_orders(symbol, &ids).await
    }

    async fn get_order(
        &self,
        _symbol: &str,
        order_id: i64,
        client_order_id: &str,
    ) -> Result<Order> {
        let state = self.state.lock().unwrap();
        let by_id = |orders: &HashMap<i64, Order>| orders.get(&order_id).cloned();
        let by_client = |orders: &HashMap<i64, Order>| {
            orders
                .values()
                .find(|o| !client_order_id.is_empty() && o.client_order_id == client_order_id)
                .cloned()
        };

        if order_id != 0 {
            if let Some(order) = by_id(&state.open_orders).or_else(|| by_id(&state.done_orders)) {
                return Ok(order);
            }
        }
        by_client(&state.open_orders)
            .or_else(|| by_client(&state.done_orders))
            .ok_or_else(|| ExchangeError::OrderNotFound(format!("{order_id}/{client_order_id}")))
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let state = self.state.lock().unwrap();
        let mut orders: Vec<Order> = state
            .open_orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.order_id);
        Ok(orders)
    }

    async fn get_positions(&self, symbol: &str) -> Result<Vec<Position>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .get(symbol)
            .filter(|qty| !qty.is_zero())
            .map(|qty| {
                vec![Position {
                    symbol: symbol.to_string(),
                    quantity: *qty,
                    entry_price: Decimal::ZERO,
                    unrealized_pnl: Decimal::ZERO,
                    update_time: state.clock_ms,
                }]
            })
            .unwrap_or_default())
    }

    async fn get_account(&self) -> Result<AccountSnapshot> {
        let state = self.state.lock().unwrap();
        Ok(AccountSnapshot {
            total_equity: Decimal::from(1_000_000),
            available_balance: Decimal::from(1_000_000),
            margin_used: Decimal::ZERO,
            update_time: state.clock_ms,
        })
    }

    async fn start_price_stream(
        &self,
        _symbols: Vec<String>,
        cb: PriceCallback,
    ) -> Result<StreamHandle> {
        self.state.lock().unwrap().price_cbs.push(cb);
        Ok(self.spawn_stream())
    }

    async fn start_order_stream(&self, cb: OrderCallback) -> Result<StreamHandle> {
        self.state.lock().unwrap().order_cbs.push(cb);
        Ok(self.spawn_stream())
    }

    async fn start_position_stream(&self, cb: PositionCallback) -> Result<StreamHandle> {
        // Snapshot-on-connect: a subscriber immediately sees current holdings.
        let (positions, clock_ms) = {
            let state = self.state.lock().unwrap();
            (state.positions.clone(), state.clock_ms)
        };
        let snapshot: Vec<Position> = positions
            .into_iter()
            .filter(|(_, qty)| !qty.is_zero())
            .map(|(symbol, quantity)| Position {
                symbol,
                quantity,
                entry_price: Decimal::ZERO,
                unrealized_pnl: Decimal::ZERO,
                update_time: clock_ms,
            })
            .collect();
        if !snapshot.is_empty() {
            cb(snapshot);
        }
        self.state.lock().unwrap().position_cbs.push(cb);
        Ok(self.spawn_stream())
    }

    async fn start_account_stream(&self, cb: AccountCallback) -> Result<StreamHandle> {
        self.state.lock().unwrap().account_cbs.push(cb);
        Ok(self.spawn_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::AtomicUsize;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn limit_buy(symbol: &str, price: &str, qty: &str, cl: &str) -> OrderRequest {
        OrderRequest::limit(symbol, Side::Buy, dec(price), dec(qty)).with_client_order_id(cl)
    }

    #[tokio::test]
    async fn place_fill_moves_position_and_emits_updates() {
        let paper = PaperGateway::new();
        let fills = Arc::new(AtomicUsize::new(0));
        let fills_seen = fills.clone();
        paper
            .start_order_stream(Arc::new(move |order: Order| {
                if order.status == OrderStatus::Filled {
                    fills_seen.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .await
            .unwrap();

        let order = paper
            .place_order(&limit_buy("BTCUSDT", "100", "0.5", "gb1000"))
            .await
            .unwrap();
        assert_eq!(paper.open_order_count(), 1);

        paper.fill_order(order.order_id).unwrap();
        assert_eq!(paper.open_order_count(), 0);
        assert_eq!(fills.load(Ordering::SeqCst), 1);

        let positions = paper.get_positions("BTCUSDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec("0.5"));
    }

    #[tokio::test]
    async fn batch_place_reports_margin_errors_without_failing() {
        let paper = PaperGateway::new();
        paper.inject_place_error(ExchangeError::InsufficientFunds("margin".into()));

        let requests = vec![
            limit_buy("BTCUSDT", "99", "0.5", "gb990"),
            limit_buy("BTCUSDT", "98", "0.5", "gb980"),
        ];
        let (placed, had_margin_error) = paper.batch_place_orders(&requests).await.unwrap();

        assert!(had_margin_error);
        assert_eq!(placed.len(), 1);
        assert_eq!(paper.open_order_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_client_order_id_is_rejected_while_open() {
        let paper = PaperGateway::new();
        paper
            .place_order(&limit_buy("BTCUSDT", "100", "0.5", "gb1000"))
            .await
            .unwrap();

        let err = paper
            .place_order(&limit_buy("BTCUSDT", "100", "0.5", "gb1000"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::DuplicateOrder(_)));
    }

    #[tokio::test]
    async fn cancel_missing_order_is_not_found() {
        let paper = PaperGateway::new();
        let err = paper.cancel_order("BTCUSDT", 99).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn get_order_falls_back_to_client_order_id() {
        let paper = PaperGateway::new();
        let placed = paper
            .place_order(&limit_buy("BTCUSDT", "100", "0.5", "gb1000"))
            .await
            .unwrap();

        let fetched = paper.get_order("BTCUSDT", 0, "gb1000").await.unwrap();
        assert_eq!(fetched.order_id, placed.order_id);
    }
}
