/*
[INPUT]:  Tick inputs (price, anchor, volatility, risk, regime) + slot views
[OUTPUT]: Deterministic place/cancel actions for the grid
[POS]:    Strategy layer - pure function, no I/O, no clock
[UPDATE]: When grid shape, sizing, or trailing-cancel rules change
*/

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use perpgrid_exchange::{OrderRequest, Side};

use crate::action::OrderAction;
use crate::config::GridConfig;
use crate::monitor::Regime;
use crate::slot::{
    PositionStatus, SlotStatus, SlotView, encode_client_order_id, key_to_price, price_key,
};

/// Fraction of the interval a level must clear from the skewed price
/// before an opening order is placed there.
const SAFETY_BUFFER_RATIO: Decimal = Decimal::from_parts(1, 0, 0, false, 1);

/// Floor on the volatility sizing multiplier.
const MIN_QTY_RATIO: Decimal = Decimal::from_parts(1, 0, 0, false, 1);

/// Per-symbol grid parameters, fixed at task construction.
#[derive(Debug, Clone)]
pub struct GridParams {
    pub symbol: String,
    pub price_decimals: u32,
    pub quantity_decimals: u32,
    pub price_interval: Decimal,
    pub order_quantity: Decimal,
    pub min_order_value: Decimal,
    pub buy_window_size: u32,
    pub sell_window_size: u32,
    pub is_neutral: bool,
    pub volatility_scale: Decimal,
    pub inventory_skew_factor: Decimal,
}

impl GridParams {
    pub fn from_config(
        symbol: impl Into<String>,
        price_decimals: u32,
        quantity_decimals: u32,
        grid: &GridConfig,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price_decimals,
            quantity_decimals,
            price_interval: grid.price_interval,
            order_quantity: grid.order_quantity,
            min_order_value: grid.min_order_value,
            buy_window_size: grid.buy_window_size,
            sell_window_size: grid.sell_window_size,
            is_neutral: grid.is_neutral,
            volatility_scale: grid.volatility_scale,
            inventory_skew_factor: grid.inventory_skew_factor,
        }
    }
}

/// Everything the strategy reads on one tick.
#[derive(Debug, Clone)]
pub struct TickInputs {
    pub current_price: Decimal,
    pub anchor_price: Decimal,
    pub atr: Decimal,
    pub volatility_factor: Decimal,
    pub is_risk_triggered: bool,
    pub regime: Regime,
}

/// Computes the actions that move the resting order set toward the
/// desired grid. Output order is deterministic: existing slots by
/// ascending key, then new buys descending from the center, then new
/// sells ascending.
pub fn calculate_actions(
    params: &GridParams,
    inputs: &TickInputs,
    slots: &[SlotView],
) -> Vec<OrderAction> {
    if inputs.current_price <= Decimal::ZERO {
        return Vec::new();
    }

    let interval = effective_interval(params, inputs);
    let inventory: Decimal = slots
        .iter()
        .filter(|slot| slot.position_status == PositionStatus::Filled)
        .map(|slot| slot.position_qty)
        .sum();
    let skewed_price = skew_price(params, inputs.current_price, inventory);
    let center = snap_to_grid(skewed_price, inputs.anchor_price, interval);

    let buys_allowed = !inputs.is_risk_triggered && inputs.regime != Regime::Bear;
    let sells_allowed = params.is_neutral && inputs.regime != Regime::Bull;

    // Desired opening levels, keyed like slots.
    let mut desired_buys: BTreeMap<i64, Decimal> = BTreeMap::new();
    if buys_allowed {
        for step in 1..=params.buy_window_size {
            let price = center - interval * Decimal::from(step);
            if price > Decimal::ZERO {
                desired_buys.insert(price_key(price, params.price_decimals), price);
            }
        }
    }
    let mut desired_sells: BTreeMap<i64, Decimal> = BTreeMap::new();
    if sells_allowed {
        for step in 1..=params.sell_window_size {
            let price = center + interval * Decimal::from(step);
            desired_sells.insert(price_key(price, params.price_decimals), price);
        }
    }

    let open_qty = opening_qty(params, inputs.volatility_factor);
    let mut actions = Vec::new();

    let mut ordered: Vec<&SlotView> = slots.iter().collect();
    ordered.sort_by_key(|slot| slot.key);

    for slot in ordered {
        match (slot.slot_status, slot.position_status) {
            (SlotStatus::Free, PositionStatus::Empty) => {
                let buy_price = desired_buys.remove(&slot.key);
                let sell_price = desired_sells.remove(&slot.key);

                let (side, price) = match (buy_price, sell_price) {
                    (Some(price), _) => (Side::Buy, price),
                    (None, Some(price)) => (Side::Sell, price),
                    (None, None) => continue,
                };
                if !clears_safety_buffer(price, skewed_price, interval) {
                    continue;
                }
                if let Some(action) = opening_action(params, slot.key, side, price, open_qty) {
                    actions.push(action);
                }
            }
            (SlotStatus::Free, PositionStatus::Filled) => {
                desired_buys.remove(&slot.key);
                desired_sells.remove(&slot.key);
                if let Some(action) = closing_action(params, slot, interval) {
                    // The close occupies its own price level; never
                    // stack an opening order (same client oid) on it.
                    if let OrderAction::Place { request, .. } = &action {
                        let close_key = price_key(request.price, params.price_decimals);
                        desired_buys.remove(&close_key);
                        desired_sells.remove(&close_key);
                    }
                    actions.push(action);
                }
            }
            (SlotStatus::Locked, _) => {
                let Some(side) = slot.order_side else {
                    continue;
                };
                let order_key = price_key(slot.order_price, params.price_decimals);
                desired_buys.remove(&order_key);
                desired_sells.remove(&order_key);
                desired_buys.remove(&slot.key);
                desired_sells.remove(&slot.key);

                if slot.order_id != 0
                    && should_cancel(params, inputs, side, slot.order_price, interval)
                {
                    actions.push(OrderAction::Cancel {
                        symbol: params.symbol.clone(),
                        order_id: slot.order_id,
                    });
                }
            }
            (SlotStatus::Pending, _) => {
                // An action is already in flight for this level.
                desired_buys.remove(&slot.key);
                desired_sells.remove(&slot.key);
                let order_key = price_key(slot.order_price, params.price_decimals);
                desired_buys.remove(&order_key);
                desired_sells.remove(&order_key);
            }
        }
    }

    // Levels with no slot yet: buys nearest the center first.
    for (key, price) in desired_buys.iter().rev() {
        if !clears_safety_buffer(*price, skewed_price, interval) {
            continue;
        }
        if let Some(action) = opening_action(params, *key, Side::Buy, *price, open_qty) {
            actions.push(action);
        }
    }
    for (key, price) in desired_sells.iter() {
        if !clears_safety_buffer(*price, skewed_price, interval) {
            continue;
        }
        if let Some(action) = opening_action(params, *key, Side::Sell, *price, open_qty) {
            actions.push(action);
        }
    }

    actions
}

fn effective_interval(params: &GridParams, inputs: &TickInputs) -> Decimal {
    if params.volatility_scale > Decimal::ZERO && inputs.atr > Decimal::ZERO {
        let widened = inputs.atr * params.volatility_scale;
        params.price_interval.max(widened)
    } else {
        params.price_interval
    }
}

fn skew_price(params: &GridParams, current_price: Decimal, inventory: Decimal) -> Decimal {
    if params.inventory_skew_factor > Decimal::ZERO {
        current_price * (Decimal::ONE - inventory * params.inventory_skew_factor)
    } else {
        current_price
    }
}

/// Snaps a price to the nearest multiple of `interval` measured from
/// the anchor, so grid levels stay put as the price wanders.
fn snap_to_grid(price: Decimal, anchor: Decimal, interval: Decimal) -> Decimal {
    let steps = ((price - anchor) / interval).round();
    anchor + steps * interval
}

fn clears_safety_buffer(price: Decimal, skewed_price: Decimal, interval: Decimal) -> bool {
    (price - skewed_price).abs() >= SAFETY_BUFFER_RATIO * interval
}

fn opening_qty(params: &GridParams, volatility_factor: Decimal) -> Decimal {
    let damp = Decimal::ONE - Decimal::from(50) * volatility_factor;
    let ratio = damp.max(MIN_QTY_RATIO);
    (params.order_quantity * ratio).round_dp(params.quantity_decimals)
}

fn opening_action(
    params: &GridParams,
    slot_key: i64,
    side: Side,
    price: Decimal,
    qty: Decimal,
) -> Option<OrderAction> {
    let price = key_to_price(price_key(price, params.price_decimals), params.price_decimals);
    if qty <= Decimal::ZERO || price * qty < params.min_order_value {
        return None;
    }

    let request = OrderRequest::limit(&params.symbol, side, price, qty)
        .post_only()
        .with_client_order_id(encode_client_order_id(price, side, params.price_decimals));
    Some(OrderAction::Place { slot_key, request })
}

/// A held level needs a reduce-only order one interval away: longs
/// close with a sell above, shorts with a buy below.
fn closing_action(params: &GridParams, slot: &SlotView, interval: Decimal) -> Option<OrderAction> {
    let (side, price) = if slot.position_qty > Decimal::ZERO {
        (Side::Sell, slot.price + interval)
    } else if slot.position_qty < Decimal::ZERO {
        (Side::Buy, slot.price - interval)
    } else {
        return None;
    };

    let price = key_to_price(price_key(price, params.price_decimals), params.price_decimals);
    let qty = slot.position_qty.abs().round_dp(params.quantity_decimals);
    if price <= Decimal::ZERO || qty.is_zero() || price * qty < params.min_order_value {
        return None;
    }

    let request = OrderRequest::limit(&params.symbol, side, price, qty)
        .reduce_only()
        .with_client_order_id(encode_client_order_id(price, side, params.price_decimals));
    Some(OrderAction::Place {
        slot_key: slot.key,
        request,
    })
}

/// Trailing validity for a resting order: risk masks buys outright,
/// and anything outside the active window around the current price is
/// repositioned by cancel + next-tick replace.
fn should_cancel(
    params: &GridParams,
    inputs: &TickInputs,
    side: Side,
    order_price: Decimal,
    interval: Decimal,
) -> bool {
    match side {
        Side::Buy => {
            if inputs.is_risk_triggered {
                return true;
            }
            let lower = inputs.current_price - interval * Decimal::from(params.buy_window_size);
            order_price < lower || order_price > inputs.current_price
        }
        Side::Sell => {
            let upper = inputs.current_price + interval * Decimal::from(params.sell_window_size);
            order_price > upper || order_price < inputs.current_price
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn params() -> GridParams {
        GridParams {
            symbol: "BTCUSDT".to_string(),
            price_decimals: 1,
            quantity_decimals: 3,
            price_interval: dec("1"),
            order_quantity: dec("1"),
            min_order_value: dec("5"),
            buy_window_size: 2,
            sell_window_size: 2,
            is_neutral: true,
            volatility_scale: Decimal::ZERO,
            inventory_skew_factor: Decimal::ZERO,
        }
    }

    fn inputs(price: &str) -> TickInputs {
        TickInputs {
            current_price: dec(price),
            anchor_price: dec("100"),
            atr: Decimal::ZERO,
            volatility_factor: Decimal::ZERO,
            is_risk_triggered: false,
            regime: Regime::Range,
        }
    }

    fn locked_slot(price: &str, side: Side, order_id: i64) -> SlotView {
        SlotView {
            key: price_key(dec(price), 1),
            price: dec(price),
            slot_status: SlotStatus::Locked,
            position_status: PositionStatus::Empty,
            position_qty: Decimal::ZERO,
            order_id,
            order_side: Some(side),
            order_price: dec(price),
        }
    }

    fn place_prices(actions: &[OrderAction]) -> Vec<(Side, Decimal)> {
        actions
            .iter()
            .filter_map(|action| match action {
                OrderAction::Place { request, .. } => Some((request.side, request.price)),
                _ => None,
            })
            .collect()
    }

    // Fresh boot at 100 with a 2x2 neutral grid.
    #[test]
    fn fresh_grid_places_two_buys_and_two_sells() {
        let actions = calculate_actions(&params(), &inputs("100"), &[]);

        let placed = place_prices(&actions);
        assert_eq!(
            placed,
            vec![
                (Side::Buy, dec("99.0")),
                (Side::Buy, dec("98.0")),
                (Side::Sell, dec("101.0")),
                (Side::Sell, dec("102.0")),
            ]
        );
        for action in &actions {
            let OrderAction::Place { request, .. } = action else {
                panic!("expected places only");
            };
            assert!(request.post_only);
            assert!(!request.reduce_only);
            assert!(!request.client_order_id.is_empty());
        }
    }

    // Risk trigger cancels resting buys and opens no new ones.
    #[test]
    fn risk_trigger_cancels_buys_and_masks_new_ones() {
        let slots = vec![
            locked_slot("98", Side::Buy, 1),
            locked_slot("99", Side::Buy, 2),
            locked_slot("101", Side::Sell, 3),
            locked_slot("102", Side::Sell, 4),
        ];
        let mut tick = inputs("100");
        tick.is_risk_triggered = true;

        let actions = calculate_actions(&params(), &tick, &slots);

        let cancels: Vec<i64> = actions
            .iter()
            .filter_map(OrderAction::cancel_order_id)
            .collect();
        assert_eq!(cancels, vec![1, 2]);
        assert!(place_prices(&actions).is_empty());
    }

    #[test]
    fn bull_regime_masks_opening_sells() {
        let mut tick = inputs("100");
        tick.regime = Regime::Bull;

        let placed = place_prices(&calculate_actions(&params(), &tick, &[]));
        assert_eq!(placed, vec![(Side::Buy, dec("99.0")), (Side::Buy, dec("98.0"))]);
    }

    #[test]
    fn bear_regime_masks_opening_buys() {
        let mut tick = inputs("100");
        tick.regime = Regime::Bear;

        let placed = place_prices(&calculate_actions(&params(), &tick, &[]));
        assert_eq!(placed, vec![(Side::Sell, dec("101.0")), (Side::Sell, dec("102.0"))]);
    }

    #[test]
    fn directional_mode_never_opens_sells() {
        let mut p = params();
        p.is_neutral = false;

        let placed = place_prices(&calculate_actions(&p, &inputs("100"), &[]));
        assert_eq!(placed, vec![(Side::Buy, dec("99.0")), (Side::Buy, dec("98.0"))]);
    }

    #[test]
    fn held_long_level_gets_reduce_only_sell_one_interval_up() {
        let slot = SlotView {
            key: 990,
            price: dec("99"),
            slot_status: SlotStatus::Free,
            position_status: PositionStatus::Filled,
            position_qty: dec("1"),
            order_id: 0,
            order_side: Some(Side::Buy),
            order_price: dec("99"),
        };

        let actions = calculate_actions(&params(), &inputs("100"), &[slot]);
        let close = actions
            .iter()
            .find_map(|action| match action {
                OrderAction::Place { slot_key, request } if request.reduce_only => {
                    Some((*slot_key, request.clone()))
                }
                _ => None,
            })
            .expect("close order");

        assert_eq!(close.0, 990);
        assert_eq!(close.1.side, Side::Sell);
        assert_eq!(close.1.price, dec("100.0"));
        assert_eq!(close.1.quantity, dec("1"));
    }

    #[test]
    fn held_short_level_gets_reduce_only_buy_one_interval_down() {
        let slot = SlotView {
            key: 1010,
            price: dec("101"),
            slot_status: SlotStatus::Free,
            position_status: PositionStatus::Filled,
            position_qty: dec("-1"),
            order_id: 0,
            order_side: Some(Side::Sell),
            order_price: dec("101"),
        };

        let actions = calculate_actions(&params(), &inputs("100"), &[slot]);
        let close = actions
            .iter()
            .find_map(|action| match action {
                OrderAction::Place { request, .. } if request.reduce_only => Some(request.clone()),
                _ => None,
            })
            .expect("close order");

        assert_eq!(close.side, Side::Buy);
        assert_eq!(close.price, dec("100.0"));
    }

    #[test]
    fn drifted_buy_outside_window_is_canceled() {
        // Window at price 105 spans [103, 105]; the 99 buy is stale.
        let slots = vec![locked_slot("99", Side::Buy, 9)];
        let mut tick = inputs("105");
        tick.anchor_price = dec("100");

        let actions = calculate_actions(&params(), &tick, &slots);
        assert!(actions.iter().any(|a| a.cancel_order_id() == Some(9)));
    }

    #[test]
    fn resting_order_inside_window_is_kept_and_not_duplicated() {
        let slots = vec![locked_slot("99", Side::Buy, 9)];
        let actions = calculate_actions(&params(), &inputs("100"), &slots);

        assert!(actions.iter().all(|a| a.cancel_order_id() != Some(9)));
        // 99 already resting: only 98 + sells are new.
        let placed = place_prices(&actions);
        assert_eq!(
            placed,
            vec![
                (Side::Buy, dec("98.0")),
                (Side::Sell, dec("101.0")),
                (Side::Sell, dec("102.0")),
            ]
        );
    }

    #[test]
    fn volatility_widens_the_interval() {
        let mut p = params();
        p.volatility_scale = dec("2");
        let mut tick = inputs("100");
        tick.atr = dec("1.5");

        // interval = max(1, 1.5 * 2) = 3
        let placed = place_prices(&calculate_actions(&p, &tick, &[]));
        assert_eq!(
            placed,
            vec![
                (Side::Buy, dec("97.0")),
                (Side::Buy, dec("94.0")),
                (Side::Sell, dec("103.0")),
                (Side::Sell, dec("106.0")),
            ]
        );
    }

    #[test]
    fn inventory_skew_shifts_the_grid_center() {
        let mut p = params();
        p.inventory_skew_factor = dec("0.01");
        let slot = SlotView {
            key: 990,
            price: dec("99"),
            slot_status: SlotStatus::Free,
            position_status: PositionStatus::Filled,
            position_qty: dec("2"),
            order_id: 0,
            order_side: None,
            order_price: Decimal::ZERO,
        };

        // skewed = 100 * (1 - 2 * 0.01) = 98 -> center 98
        let actions = calculate_actions(&p, &inputs("100"), &[slot]);
        let buys: Vec<Decimal> = place_prices(&actions)
            .into_iter()
            .filter(|(side, _)| *side == Side::Buy)
            .map(|(_, price)| price)
            .collect();
        assert_eq!(buys, vec![dec("97.0"), dec("96.0")]);
    }

    #[test]
    fn volatility_factor_damps_quantity_with_floor() {
        let p = params();
        assert_eq!(opening_qty(&p, Decimal::ZERO), dec("1.000"));
        assert_eq!(opening_qty(&p, dec("0.01")), dec("0.500"));
        // 1 - 50 * 0.05 < 0.1 floor
        assert_eq!(opening_qty(&p, dec("0.05")), dec("0.100"));
    }

    #[test]
    fn tiny_notional_actions_are_dropped() {
        let mut p = params();
        p.min_order_value = dec("1000");

        let actions = calculate_actions(&p, &inputs("100"), &[]);
        assert!(actions.is_empty());
    }

    #[test]
    fn safety_buffer_requires_a_tenth_of_the_interval() {
        let interval = dec("1");
        assert!(!clears_safety_buffer(dec("99.95"), dec("100"), interval));
        assert!(clears_safety_buffer(dec("99.9"), dec("100"), interval));
        assert!(clears_safety_buffer(dec("99"), dec("100"), interval));
    }

    #[test]
    fn zero_price_yields_no_actions() {
        let actions = calculate_actions(&params(), &inputs("0"), &[]);
        assert!(actions.is_empty());
    }

    #[test]
    fn output_is_deterministic_across_calls() {
        let slots = vec![
            locked_slot("99", Side::Buy, 9),
            locked_slot("101", Side::Sell, 11),
        ];
        let a = calculate_actions(&params(), &inputs("100"), &slots);
        let b = calculate_actions(&params(), &inputs("100"), &slots);
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }
}
