/*
[INPUT]:  Strategy actions, executor outcomes, order-stream updates,
          and exchange snapshots
[OUTPUT]: The authoritative slot ledger plus its read-only views
[POS]:    State layer - single source of truth for local intent
[UPDATE]: When slot lifecycle transitions or the reconcile fold change
*/

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use perpgrid_exchange::{Order, OrderStatus, Side};

use crate::action::{ActionOutcome, OrderAction};
use crate::slot::{
    PersistedSlot, PositionStatus, Slot, SlotStatus, SlotView, price_key,
};

/// Orphaned PENDING slots younger than this are left alone by the
/// reconcile fold; their in-flight action has not reached the venue's
/// open-orders snapshot yet.
const PENDING_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("slot not found for order_id={order_id} client_oid={client_oid}")]
    SlotNotFound { order_id: i64, client_oid: String },
}

/// What an order-stream update did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Acknowledged,
    PartialFill,
    Filled,
    Canceled,
    Ignored,
}

/// Slot totals for the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SlotCounts {
    pub free: usize,
    pub pending: usize,
    pub locked: usize,
    pub filled: usize,
}

/// Result of one reconcile fold.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub matched: usize,
    pub ghost_buys: usize,
    pub ghost_sells: usize,
    pub zombies: usize,
    pub unmatched_keys: Vec<i64>,
    pub local_filled: Decimal,
    pub exchange_position: Decimal,
}

impl SyncReport {
    pub fn has_drift(&self) -> bool {
        self.local_filled != self.exchange_position
    }
}

struct Ledger {
    slots: BTreeMap<i64, Arc<Slot>>,
    order_index: HashMap<i64, Arc<Slot>>,
    client_index: HashMap<String, Arc<Slot>>,
}

/// The per-symbol inventory ledger.
///
/// Lock hierarchy: the map lock (`ledger`) is acquired before any
/// per-slot mutex, never the reverse. All three maps are mutated only
/// while holding the map write lock.
pub struct SlotManager {
    symbol: String,
    price_decimals: u32,
    ledger: RwLock<Ledger>,
}

impl SlotManager {
    pub fn new(symbol: impl Into<String>, price_decimals: u32) -> Self {
        Self {
            symbol: symbol.into(),
            price_decimals,
            ledger: RwLock::new(Ledger {
                slots: BTreeMap::new(),
                order_index: HashMap::new(),
                client_index: HashMap::new(),
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn price_decimals(&self) -> u32 {
        self.price_decimals
    }

    /// Creates the `(FREE, EMPTY)` slot on first use; idempotent.
    pub fn get_or_create_slot(&self, price: Decimal) -> Arc<Slot> {
        let key = price_key(price, self.price_decimals);
        {
            let ledger = self.ledger.read();
            if let Some(slot) = ledger.slots.get(&key) {
                return slot.clone();
            }
        }
        let mut ledger = self.ledger.write();
        ledger
            .slots
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Slot::new(key, crate::slot::key_to_price(key, self.price_decimals)))
            })
            .clone()
    }

    /// Marks slots PENDING for a batch of actions, recording the
    /// intended side, limit price, and provisional client oid. Must be
    /// called before dispatch; returns the subset actually marked (a
    /// slot advanced by a racing fill drops its action here).
    pub fn mark_slots_pending(&self, actions: Vec<OrderAction>) -> Vec<OrderAction> {
        if actions.is_empty() {
            return actions;
        }

        let mut ledger = self.ledger.write();
        let mut marked = Vec::with_capacity(actions.len());

        for action in actions {
            match &action {
                OrderAction::Place { slot_key, request } => {
                    let slot = ledger
                        .slots
                        .entry(*slot_key)
                        .or_insert_with(|| {
                            Arc::new(Slot::new(
                                *slot_key,
                                crate::slot::key_to_price(*slot_key, self.price_decimals),
                            ))
                        })
                        .clone();

                    let mut cells = slot.lock();
                    if cells.slot_status != SlotStatus::Free {
                        debug!(
                            symbol = %self.symbol,
                            slot_key,
                            status = ?cells.slot_status,
                            "slot advanced before pending mark; dropping place"
                        );
                        continue;
                    }

                    cells.slot_status = SlotStatus::Pending;
                    cells.pending_since = Some(Instant::now());
                    cells.order_side = Some(request.side);
                    cells.order_price = request.price;
                    cells.client_oid = request.client_order_id.clone();
                    cells.original_qty = request.quantity;
                    drop(cells);

                    if !request.client_order_id.is_empty() {
                        ledger
                            .client_index
                            .insert(request.client_order_id.clone(), slot.clone());
                    }
                    marked.push(action);
                }
                OrderAction::Cancel { order_id, .. } => {
                    let Some(slot) = ledger.order_index.get(order_id).cloned() else {
                        debug!(symbol = %self.symbol, order_id, "cancel target no longer tracked");
                        continue;
                    };

                    let mut cells = slot.lock();
                    if cells.slot_status != SlotStatus::Locked {
                        debug!(
                            symbol = %self.symbol,
                            order_id,
                            status = ?cells.slot_status,
                            "cancel target not locked; dropping cancel"
                        );
                        continue;
                    }
                    cells.slot_status = SlotStatus::Pending;
                    cells.pending_since = Some(Instant::now());
                    drop(cells);
                    marked.push(action);
                }
            }
        }

        marked
    }

    /// Applies executor outcomes, in order, under the lock hierarchy.
    pub fn apply_action_results(&self, outcomes: &[ActionOutcome]) {
        if outcomes.is_empty() {
            return;
        }

        let mut ledger = self.ledger.write();

        for outcome in outcomes {
            match &outcome.action {
                OrderAction::Place { slot_key, request } => {
                    let slot = ledger
                        .client_index
                        .get(&request.client_order_id)
                        .cloned()
                        .or_else(|| ledger.slots.get(slot_key).cloned());
                    let Some(slot) = slot else {
                        warn!(symbol = %self.symbol, slot_key, "place outcome for unknown slot");
                        continue;
                    };

                    match (&outcome.order, &outcome.error) {
                        (Some(order), None) => {
                            let mut cells = slot.lock();
                            // The order stream may already have advanced
                            // this slot (ack or even a fill); only a
                            // still-pending slot adopts the response.
                            if cells.slot_status == SlotStatus::Pending {
                                cells.adopt_order(order);
                                drop(cells);
                                ledger.order_index.insert(order.order_id, slot.clone());
                                if !order.client_order_id.is_empty()
                                    && order.client_order_id != request.client_order_id
                                {
                                    ledger
                                        .client_index
                                        .insert(order.client_order_id.clone(), slot.clone());
                                }
                            }
                        }
                        _ => {
                            let mut cells = slot.lock();
                            if cells.slot_status == SlotStatus::Pending {
                                let stale_oid = cells.client_oid.clone();
                                cells.clear_order_fields();
                                cells.slot_status = SlotStatus::Free;
                                drop(cells);
                                ledger.client_index.remove(&stale_oid);
                            }
                        }
                    }
                }
                // Cancel confirmations arrive on the order stream; an
                // error here changes nothing either (pending sweep and
                // reconcile own the cleanup).
                OrderAction::Cancel { .. } => {}
            }
        }
    }

    /// Applies an order-stream update. The stream is authoritative for
    /// fills; updates racing `apply_action_results` match by client oid.
    pub fn on_order_update(&self, update: &Order) -> Result<UpdateOutcome, LedgerError> {
        let mut ledger = self.ledger.write();

        let slot = if update.order_id != 0 {
            ledger.order_index.get(&update.order_id).cloned()
        } else {
            None
        };
        let slot = slot.or_else(|| {
            if update.client_order_id.is_empty() {
                None
            } else {
                ledger.client_index.get(&update.client_order_id).cloned()
            }
        });
        let Some(slot) = slot else {
            return Err(LedgerError::SlotNotFound {
                order_id: update.order_id,
                client_oid: update.client_order_id.clone(),
            });
        };

        let mut cells = slot.lock();

        // A client-oid match may precede apply_action_results; bind the
        // venue id now so later cancels can reference it.
        if update.order_id != 0 && cells.order_id != update.order_id {
            cells.order_id = update.order_id;
            let slot_ref = slot.clone();
            ledger.order_index.insert(update.order_id, slot_ref);
        }

        let outcome = match update.status {
            OrderStatus::New => {
                cells.order_status = update.status;
                if cells.slot_status == SlotStatus::Pending {
                    cells.slot_status = SlotStatus::Locked;
                    cells.pending_since = None;
                }
                UpdateOutcome::Acknowledged
            }
            OrderStatus::PartiallyFilled => {
                cells.order_status = update.status;
                cells.order_filled_qty = update.executed_qty;
                UpdateOutcome::PartialFill
            }
            OrderStatus::Filled => {
                match update.side {
                    Side::Buy => {
                        cells.position_status = PositionStatus::Filled;
                        cells.position_qty = update.executed_qty;
                    }
                    Side::Sell => {
                        cells.position_status = PositionStatus::Empty;
                        cells.position_qty = Decimal::ZERO;
                    }
                }
                let (order_id, client_oid) = (cells.order_id, cells.client_oid.clone());
                cells.clear_order_fields();
                cells.slot_status = SlotStatus::Free;
                drop(cells);
                detach_indexes(&mut ledger, order_id, &client_oid);
                info!(
                    symbol = %self.symbol,
                    slot_key = slot.key,
                    side = update.side.as_str(),
                    qty = %update.executed_qty,
                    "fill applied to slot"
                );
                return Ok(UpdateOutcome::Filled);
            }
            OrderStatus::Canceled => {
                let (order_id, client_oid) = (cells.order_id, cells.client_oid.clone());
                cells.clear_order_fields();
                cells.slot_status = SlotStatus::Free;
                drop(cells);
                detach_indexes(&mut ledger, order_id, &client_oid);
                return Ok(UpdateOutcome::Canceled);
            }
            OrderStatus::Unspecified => UpdateOutcome::Ignored,
        };

        Ok(outcome)
    }

    /// CANCEL actions for every LOCKED slot resting on the given side.
    pub fn cancel_all_side(&self, side: Side) -> Vec<OrderAction> {
        let ledger = self.ledger.read();
        let mut actions = Vec::new();
        for slot in ledger.slots.values() {
            let cells = slot.lock();
            if cells.slot_status == SlotStatus::Locked
                && cells.order_side == Some(side)
                && cells.order_id != 0
            {
                actions.push(OrderAction::Cancel {
                    symbol: self.symbol.clone(),
                    order_id: cells.order_id,
                });
            }
        }
        actions
    }

    pub fn cancel_all_buy_orders(&self) -> Vec<OrderAction> {
        self.cancel_all_side(Side::Buy)
    }

    pub fn cancel_all_sell_orders(&self) -> Vec<OrderAction> {
        self.cancel_all_side(Side::Sell)
    }

    /// Folds the exchange's authoritative open-orders and net-position
    /// snapshot into the ledger. Idempotent: a second fold against the
    /// same snapshot is a no-op. Runs under the map write lock, so
    /// concurrent fills serialize against it.
    pub fn sync_orders(&self, open_orders: &[Order], exchange_position: Decimal) -> SyncReport {
        let mut ledger = self.ledger.write();
        let mut report = SyncReport {
            exchange_position,
            ..SyncReport::default()
        };

        let mut active_prices: HashMap<i64, &Order> = open_orders
            .iter()
            .map(|order| (price_key(order.price, self.price_decimals), order))
            .collect();

        let mut local_filled = Decimal::ZERO;
        for slot in ledger.slots.values() {
            let cells = slot.lock();
            if cells.position_status == PositionStatus::Filled {
                local_filled += cells.position_qty;
            }
        }

        let slots: Vec<Arc<Slot>> = ledger.slots.values().cloned().collect();
        let mut adopted = vec![false; slots.len()];

        // Pass 1: slots with a live order claim the venue order resting
        // at their order's price level. A close order rests one interval
        // away from the slot that owns it, so this must run before bare
        // slots get to match on their own key.
        for (idx, slot) in slots.iter().enumerate() {
            let mut cells = slot.lock();
            if cells.order_side.is_none()
                || !matches!(cells.slot_status, SlotStatus::Locked | SlotStatus::Pending)
            {
                continue;
            }
            let match_key = price_key(cells.order_price, self.price_decimals);
            if let Some(order) = active_prices.remove(&match_key) {
                let (stale_id, stale_oid) = (cells.order_id, cells.client_oid.clone());
                cells.adopt_order(order);
                let (order_id, client_oid) = (cells.order_id, cells.client_oid.clone());
                drop(cells);

                if stale_id != order_id || stale_oid != client_oid {
                    detach_indexes(&mut ledger, stale_id, &stale_oid);
                }
                ledger.order_index.insert(order_id, slot.clone());
                if !client_oid.is_empty() {
                    ledger.client_index.insert(client_oid, slot.clone());
                }
                adopted[idx] = true;
                report.matched += 1;
            }
        }

        // Pass 2: remaining venue orders fold into the slot at their
        // price; remaining locally-live slots are orphans.
        for (idx, slot) in slots.iter().enumerate() {
            if adopted[idx] {
                continue;
            }
            let mut cells = slot.lock();

            if let Some(order) = active_prices.remove(&slot.key) {
                let (stale_id, stale_oid) = (cells.order_id, cells.client_oid.clone());
                cells.adopt_order(order);
                let (order_id, client_oid) = (cells.order_id, cells.client_oid.clone());
                drop(cells);

                if stale_id != order_id || stale_oid != client_oid {
                    detach_indexes(&mut ledger, stale_id, &stale_oid);
                }
                ledger.order_index.insert(order_id, slot.clone());
                if !client_oid.is_empty() {
                    ledger.client_index.insert(client_oid, slot.clone());
                }
                report.matched += 1;
                continue;
            }

            if !matches!(cells.slot_status, SlotStatus::Locked | SlotStatus::Pending) {
                continue;
            }

            // In-flight placements may not be visible in the venue
            // snapshot yet; give them their bounded window.
            if let Some(since) = cells.pending_since {
                if since.elapsed() < PENDING_GRACE {
                    continue;
                }
            }

            // Orphaned: locally live, unknown to the exchange.
            let side = cells.order_side;
            if side == Some(Side::Buy) && exchange_position > local_filled {
                let credited = cells.original_qty;
                cells.position_status = PositionStatus::Filled;
                cells.position_qty = credited;
                local_filled += credited;
                let (order_id, client_oid) = (cells.order_id, cells.client_oid.clone());
                cells.clear_order_fields();
                cells.slot_status = SlotStatus::Free;
                drop(cells);
                detach_indexes(&mut ledger, order_id, &client_oid);
                warn!(
                    symbol = %self.symbol,
                    slot_key = slot.key,
                    qty = %credited,
                    "ghost buy fill adopted"
                );
                report.ghost_buys += 1;
            } else if side == Some(Side::Sell) && exchange_position < local_filled {
                local_filled -= cells.position_qty;
                cells.position_status = PositionStatus::Empty;
                cells.position_qty = Decimal::ZERO;
                let (order_id, client_oid) = (cells.order_id, cells.client_oid.clone());
                cells.clear_order_fields();
                cells.slot_status = SlotStatus::Free;
                drop(cells);
                detach_indexes(&mut ledger, order_id, &client_oid);
                warn!(symbol = %self.symbol, slot_key = slot.key, "ghost sell fill adopted");
                report.ghost_sells += 1;
            } else {
                let (order_id, client_oid) = (cells.order_id, cells.client_oid.clone());
                cells.clear_order_fields();
                cells.slot_status = SlotStatus::Free;
                drop(cells);
                detach_indexes(&mut ledger, order_id, &client_oid);
                warn!(symbol = %self.symbol, slot_key = slot.key, order_id, "zombie slot cleared");
                report.zombies += 1;
            }
        }

        // Exchange orders at prices the ledger has never heard of: the
        // engine did not place them (or lost all record); surface only.
        for (key, order) in active_prices {
            warn!(
                symbol = %self.symbol,
                slot_key = key,
                order_id = order.order_id,
                side = order.side.as_str(),
                "unmatched exchange order"
            );
            report.unmatched_keys.push(key);
        }
        report.unmatched_keys.sort_unstable();

        report.local_filled = local_filled;
        if report.has_drift() {
            tracing::error!(
                symbol = %self.symbol,
                local = %report.local_filled,
                exchange = %report.exchange_position,
                "position drift after reconcile fold"
            );
        }

        report
    }

    /// Rebuilds the ledger from a persisted snapshot; idempotent.
    pub fn restore_state(&self, slots: &BTreeMap<String, PersistedSlot>) {
        let mut ledger = self.ledger.write();
        ledger.slots.clear();
        ledger.order_index.clear();
        ledger.client_index.clear();

        for persisted in slots.values() {
            let slot = Arc::new(Slot::from_persisted(persisted, self.price_decimals));
            let key = slot.key;
            if persisted.order_id != 0 {
                ledger.order_index.insert(persisted.order_id, slot.clone());
            }
            if !persisted.client_oid.is_empty() {
                ledger.client_index.insert(persisted.client_oid.clone(), slot.clone());
            }
            ledger.slots.insert(key, slot);
        }
    }

    /// Compares the local filled sum against the venue's net position;
    /// returns the pair when they diverge (caller logs and continues,
    /// the live reconciler escalates).
    pub fn restore_from_exchange_position(
        &self,
        exchange_position: Decimal,
    ) -> Option<(Decimal, Decimal)> {
        let local = self.local_filled_sum();
        if local == exchange_position {
            None
        } else {
            Some((local, exchange_position))
        }
    }

    /// Rewrites the local net position to the exchange's figure by
    /// adjusting the largest held slot (or seeding one at the hint
    /// price). Returns the applied delta.
    pub fn force_sync(&self, exchange_position: Decimal, hint_price: Decimal) -> Decimal {
        let mut ledger = self.ledger.write();

        let mut local = Decimal::ZERO;
        let mut target: Option<Arc<Slot>> = None;
        let mut target_abs = Decimal::ZERO;
        for slot in ledger.slots.values() {
            let cells = slot.lock();
            if cells.position_status == PositionStatus::Filled {
                local += cells.position_qty;
                let abs = cells.position_qty.abs();
                if abs >= target_abs {
                    target_abs = abs;
                    target = Some(slot.clone());
                }
            }
        }

        let delta = exchange_position - local;
        if delta.is_zero() {
            return delta;
        }

        let slot = target.unwrap_or_else(|| {
            let key = price_key(hint_price, self.price_decimals);
            ledger
                .slots
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Slot::new(key, crate::slot::key_to_price(key, self.price_decimals)))
                })
                .clone()
        });

        let mut cells = slot.lock();
        let adjusted = cells.position_qty + delta;
        if adjusted.is_zero() {
            cells.position_status = PositionStatus::Empty;
            cells.position_qty = Decimal::ZERO;
        } else {
            cells.position_status = PositionStatus::Filled;
            cells.position_qty = adjusted;
        }
        info!(
            symbol = %self.symbol,
            slot_key = slot.key,
            %delta,
            "force-synced local position to exchange"
        );

        delta
    }

    /// Copies a consistent view for the strategy, reusing the caller's
    /// buffer when its capacity suffices.
    pub fn get_strategy_slots(&self, buf: &mut Vec<SlotView>) {
        let ledger = self.ledger.read();
        buf.clear();
        buf.reserve(ledger.slots.len());
        for slot in ledger.slots.values() {
            buf.push(slot.view());
        }
    }

    /// Deep copy for persistence, keyed by canonical decimal price.
    pub fn get_snapshot(&self) -> BTreeMap<String, PersistedSlot> {
        let ledger = self.ledger.read();
        ledger
            .slots
            .values()
            .map(|slot| (slot.price.to_string(), slot.to_persisted()))
            .collect()
    }

    /// Releases PENDING slots older than `max_age` back to FREE; the
    /// next reconcile re-adopts any that were live on the venue.
    pub fn release_stale_pending(&self, max_age: Duration) -> usize {
        let mut ledger = self.ledger.write();
        let slots: Vec<Arc<Slot>> = ledger.slots.values().cloned().collect();
        let mut released = 0;

        for slot in slots {
            let mut cells = slot.lock();
            if cells.slot_status != SlotStatus::Pending {
                continue;
            }
            let stale = cells
                .pending_since
                .map(|since| since.elapsed() > max_age)
                .unwrap_or(true);
            if !stale {
                continue;
            }
            let (order_id, client_oid) = (cells.order_id, cells.client_oid.clone());
            cells.clear_order_fields();
            cells.slot_status = SlotStatus::Free;
            drop(cells);
            detach_indexes(&mut ledger, order_id, &client_oid);
            warn!(symbol = %self.symbol, slot_key = slot.key, "stale pending slot released");
            released += 1;
        }

        released
    }

    pub fn local_filled_sum(&self) -> Decimal {
        let ledger = self.ledger.read();
        let mut sum = Decimal::ZERO;
        for slot in ledger.slots.values() {
            let cells = slot.lock();
            if cells.position_status == PositionStatus::Filled {
                sum += cells.position_qty;
            }
        }
        sum
    }

    pub fn counts(&self) -> SlotCounts {
        let ledger = self.ledger.read();
        let mut counts = SlotCounts::default();
        for slot in ledger.slots.values() {
            let cells = slot.lock();
            match cells.slot_status {
                SlotStatus::Free => counts.free += 1,
                SlotStatus::Pending => counts.pending += 1,
                SlotStatus::Locked => counts.locked += 1,
            }
            if cells.position_status == PositionStatus::Filled {
                counts.filled += 1;
            }
        }
        counts
    }

    /// True when a live order with this venue id is tracked.
    pub fn contains_order(&self, order_id: i64) -> bool {
        self.ledger.read().order_index.contains_key(&order_id)
    }

    /// True when a live order with this client oid is tracked.
    pub fn contains_client_oid(&self, client_oid: &str) -> bool {
        self.ledger.read().client_index.contains_key(client_oid)
    }
}

fn detach_indexes(ledger: &mut Ledger, order_id: i64, client_oid: &str) {
    if order_id != 0 {
        ledger.order_index.remove(&order_id);
    }
    if !client_oid.is_empty() {
        ledger.client_index.remove(client_oid);
    }
}
