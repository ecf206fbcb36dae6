/*
[INPUT]:  Grid price levels and order lifecycle events
[OUTPUT]: Slot entity with intent + inventory state and the key/oid codecs
[POS]:    State layer - the unit of the inventory ledger
[UPDATE]: When slot fields or the client order id encoding change
*/

use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use perpgrid_exchange::{Order, OrderStatus, Side};

/// Intent state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Free,
    /// Transient: an action is in flight; bounded by the pending sweep.
    Pending,
    Locked,
}

/// Inventory state of a slot, orthogonal to intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Empty,
    Filled,
}

/// Integer key for a price level: `round(price * 10^price_decimals)`.
pub fn price_key(price: Decimal, price_decimals: u32) -> i64 {
    let scaled = price * Decimal::from(10_i64.pow(price_decimals));
    scaled.round().to_i64().unwrap_or(0)
}

/// Inverse of `price_key`, carrying the canonical scale.
pub fn key_to_price(key: i64, price_decimals: u32) -> Decimal {
    Decimal::new(key, price_decimals)
}

/// Deterministic client order id for `(price, side)`: injective per
/// pair, so venue duplicate detection makes retries idempotent.
pub fn encode_client_order_id(price: Decimal, side: Side, price_decimals: u32) -> String {
    let side_flag = match side {
        Side::Buy => 'b',
        Side::Sell => 's',
    };
    format!("g{side_flag}{}", price_key(price, price_decimals))
}

/// Mutable slot fields, guarded by the per-slot mutex.
#[derive(Debug, Clone)]
pub struct SlotCells {
    pub slot_status: SlotStatus,
    pub position_status: PositionStatus,
    /// Signed; positive long, negative short.
    pub position_qty: Decimal,
    /// Venue order id; `0` when no live order.
    pub order_id: i64,
    pub client_oid: String,
    /// Snapshot of the current/last order. The close order's limit
    /// price differs from the slot price by one interval.
    pub order_side: Option<Side>,
    pub order_price: Decimal,
    pub order_status: OrderStatus,
    pub order_filled_qty: Decimal,
    pub original_qty: Decimal,
    /// Set when entering PENDING; drives the staleness sweep.
    pub pending_since: Option<Instant>,
}

impl Default for SlotCells {
    fn default() -> Self {
        Self {
            slot_status: SlotStatus::Free,
            position_status: PositionStatus::Empty,
            position_qty: Decimal::ZERO,
            order_id: 0,
            client_oid: String::new(),
            order_side: None,
            order_price: Decimal::ZERO,
            order_status: OrderStatus::Unspecified,
            order_filled_qty: Decimal::ZERO,
            original_qty: Decimal::ZERO,
            pending_since: None,
        }
    }
}

impl SlotCells {
    /// Drops the live-order association. Side, limit price, and
    /// original quantity stay behind as the last-order snapshot.
    pub fn clear_order_fields(&mut self) {
        self.order_id = 0;
        self.client_oid.clear();
        self.order_status = OrderStatus::Unspecified;
        self.order_filled_qty = Decimal::ZERO;
        self.pending_since = None;
    }

    /// Adopts an exchange-reported order as the slot's live order.
    pub fn adopt_order(&mut self, order: &Order) {
        self.slot_status = SlotStatus::Locked;
        self.order_id = order.order_id;
        self.client_oid = order.client_order_id.clone();
        self.order_side = Some(order.side);
        self.order_price = order.price;
        self.order_status = order.status;
        self.order_filled_qty = order.executed_qty;
        self.original_qty = order.quantity;
        self.pending_since = None;
    }
}

/// One slot per discrete grid price. Created on first reference and
/// never deleted. Field updates go through the per-slot mutex; the
/// ledger's map lock is always acquired first.
#[derive(Debug)]
pub struct Slot {
    pub key: i64,
    pub price: Decimal,
    cells: Mutex<SlotCells>,
}

impl Slot {
    pub fn new(key: i64, price: Decimal) -> Self {
        Self {
            key,
            price,
            cells: Mutex::new(SlotCells::default()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SlotCells> {
        self.cells.lock()
    }

    pub fn view(&self) -> SlotView {
        let cells = self.cells.lock();
        SlotView {
            key: self.key,
            price: self.price,
            slot_status: cells.slot_status,
            position_status: cells.position_status,
            position_qty: cells.position_qty,
            order_id: cells.order_id,
            order_side: cells.order_side,
            order_price: cells.order_price,
        }
    }

    pub fn to_persisted(&self) -> PersistedSlot {
        let cells = self.cells.lock();
        PersistedSlot {
            price: self.price,
            slot_status: cells.slot_status,
            position_status: cells.position_status,
            position_qty: cells.position_qty,
            order_id: cells.order_id,
            client_oid: cells.client_oid.clone(),
            order_side: cells.order_side,
            order_price: cells.order_price,
            order_status: cells.order_status,
            order_filled_qty: cells.order_filled_qty,
            original_qty: cells.original_qty,
        }
    }

    pub fn from_persisted(persisted: &PersistedSlot, price_decimals: u32) -> Self {
        let key = price_key(persisted.price, price_decimals);
        let slot = Slot::new(key, persisted.price);
        {
            let mut cells = slot.cells.lock();
            cells.slot_status = persisted.slot_status;
            cells.position_status = persisted.position_status;
            cells.position_qty = persisted.position_qty;
            cells.order_id = persisted.order_id;
            cells.client_oid = persisted.client_oid.clone();
            cells.order_side = persisted.order_side;
            cells.order_price = persisted.order_price;
            cells.order_status = persisted.order_status;
            cells.order_filled_qty = persisted.order_filled_qty;
            cells.original_qty = persisted.original_qty;
        }
        slot
    }
}

/// Read-only copy handed to the strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView {
    pub key: i64,
    pub price: Decimal,
    pub slot_status: SlotStatus,
    pub position_status: PositionStatus,
    pub position_qty: Decimal,
    pub order_id: i64,
    pub order_side: Option<Side>,
    pub order_price: Decimal,
}

/// Serialized form inside the ledger snapshot. `pending_since` is a
/// runtime instant and does not persist; restored PENDING slots are
/// resolved by the boot reconcile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSlot {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub slot_status: SlotStatus,
    pub position_status: PositionStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub position_qty: Decimal,
    pub order_id: i64,
    pub client_oid: String,
    pub order_side: Option<Side>,
    #[serde(with = "rust_decimal::serde::str")]
    pub order_price: Decimal,
    pub order_status: OrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub order_filled_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub original_qty: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    #[test]
    fn price_key_rounds_to_declared_precision() {
        assert_eq!(price_key(dec("99.5"), 1), 995);
        assert_eq!(price_key(dec("99.54"), 1), 995);
        assert_eq!(price_key(dec("99.55"), 1), 996);
        assert_eq!(price_key(dec("100"), 0), 100);
        assert_eq!(price_key(dec("-0.5"), 1), -5);
    }

    #[test]
    fn key_round_trips_through_price() {
        let price = dec("12345.6");
        let key = price_key(price, 1);
        assert_eq!(key_to_price(key, 1), price);
    }

    #[test]
    fn client_order_ids_are_injective_per_price_and_side() {
        let a = encode_client_order_id(dec("99.5"), Side::Buy, 1);
        let b = encode_client_order_id(dec("99.5"), Side::Sell, 1);
        let c = encode_client_order_id(dec("99.6"), Side::Buy, 1);
        assert_eq!(a, "gb995");
        assert_ne!(a, b);
        assert_ne!(a, c);
        // Retrying the same intent must reuse the same id.
        assert_eq!(a, encode_client_order_id(dec("99.5"), Side::Buy, 1));
    }

    #[test]
    fn clear_order_fields_keeps_last_order_snapshot() {
        let slot = Slot::new(995, dec("99.5"));
        {
            let mut cells = slot.lock();
            cells.slot_status = SlotStatus::Locked;
            cells.order_id = 42;
            cells.client_oid = "gb995".into();
            cells.order_side = Some(Side::Buy);
            cells.order_price = dec("99.5");
            cells.original_qty = dec("0.01");
            cells.clear_order_fields();
        }
        let cells = slot.lock();
        assert_eq!(cells.order_id, 0);
        assert!(cells.client_oid.is_empty());
        assert_eq!(cells.order_side, Some(Side::Buy));
        assert_eq!(cells.original_qty, dec("0.01"));
    }

    #[test]
    fn persisted_slot_round_trips_through_json() {
        let slot = Slot::new(995, dec("99.5"));
        {
            let mut cells = slot.lock();
            cells.slot_status = SlotStatus::Locked;
            cells.position_status = PositionStatus::Filled;
            cells.position_qty = dec("0.01");
            cells.order_id = 7;
            cells.client_oid = "gs1005".into();
            cells.order_side = Some(Side::Sell);
            cells.order_price = dec("100.5");
            cells.original_qty = dec("0.01");
        }

        let persisted = slot.to_persisted();
        let json = serde_json::to_string(&persisted).unwrap();
        let back: PersistedSlot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, persisted);

        let restored = Slot::from_persisted(&back, 1);
        assert_eq!(restored.key, 995);
        assert_eq!(restored.lock().order_id, 7);
    }
}
