/*
[INPUT]:  Strategy decisions
[OUTPUT]: Order actions flowing strategy -> ledger -> executor -> ledger
[POS]:    State layer - the unit of work between components
[UPDATE]: When actions need to carry new routing context
*/

use perpgrid_exchange::{ExchangeError, Order, OrderRequest};

/// A single action emitted by the strategy.
///
/// `slot_key` names the slot that owns the action, which for a
/// reduce-only close differs from the key of the order's limit price.
#[derive(Debug, Clone)]
pub enum OrderAction {
    Place { slot_key: i64, request: OrderRequest },
    Cancel { symbol: String, order_id: i64 },
}

impl OrderAction {
    pub fn symbol(&self) -> &str {
        match self {
            OrderAction::Place { request, .. } => &request.symbol,
            OrderAction::Cancel { symbol, .. } => symbol,
        }
    }

    pub fn is_place(&self) -> bool {
        matches!(self, OrderAction::Place { .. })
    }

    pub fn client_order_id(&self) -> Option<&str> {
        match self {
            OrderAction::Place { request, .. } if !request.client_order_id.is_empty() => {
                Some(&request.client_order_id)
            }
            _ => None,
        }
    }

    pub fn cancel_order_id(&self) -> Option<i64> {
        match self {
            OrderAction::Cancel { order_id, .. } => Some(*order_id),
            _ => None,
        }
    }
}

/// Result of executing one action, in input order.
#[derive(Debug)]
pub struct ActionOutcome {
    pub action: OrderAction,
    pub order: Option<Order>,
    pub error: Option<ExchangeError>,
}

impl ActionOutcome {
    pub fn ok(action: OrderAction, order: Option<Order>) -> Self {
        Self {
            action,
            order,
            error: None,
        }
    }

    pub fn err(action: OrderAction, error: ExchangeError) -> Self {
        Self {
            action,
            order: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
