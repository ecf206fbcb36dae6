/*
[INPUT]:  Engine order intents
[OUTPUT]: Typed placement requests handed to gateway implementations
[POS]:    Data layer - outbound request types
[UPDATE]: When placements need new venue knobs
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{OrderType, Side};

/// Placement request. `client_order_id` must be set by the caller so
/// retries and duplicate detection stay idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    pub client_order_id: String,
    pub reduce_only: bool,
    pub post_only: bool,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: Side, price: Decimal, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            price,
            quantity,
            client_order_id: String::new(),
            reduce_only: false,
            post_only: false,
        }
    }

    pub fn with_client_order_id(mut self, client_order_id: impl Into<String>) -> Self {
        self.client_order_id = client_order_id.into();
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }
}
