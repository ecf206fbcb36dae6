/*
[INPUT]:  Normalized venue payloads after codec mapping
[OUTPUT]: Typed models with decimal-string serde
[POS]:    Data layer - models shared by gateway implementations and the engine
[UPDATE]: When the engine consumes a new venue field
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{OrderStatus, OrderType, Side};

/// Normalized order as reported by a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Venue-assigned id; `0` means "none assigned yet".
    pub order_id: i64,
    /// Caller-chosen id, unique per in-flight order.
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    /// Milliseconds since the Unix epoch.
    pub create_time: i64,
    pub update_time: i64,
    pub reduce_only: bool,
    pub post_only: bool,
}

impl Order {
    pub fn remaining_qty(&self) -> Decimal {
        if self.executed_qty >= self.quantity {
            Decimal::ZERO
        } else {
            self.quantity - self.executed_qty
        }
    }
}

/// Normalized position snapshot. `quantity` is signed: positive long,
/// negative short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub unrealized_pnl: Decimal,
    pub update_time: i64,
}

/// Normalized account snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    #[serde(with = "rust_decimal::serde::str")]
    pub total_equity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub margin_used: Decimal,
    pub update_time: i64,
}

/// Mid-price tick delivered on the price stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub time: i64,
}
