/*
[INPUT]:  Runtime events from executor, coordinator, and reconciler
[OUTPUT]: Snapshot-friendly engine counters for the status endpoint
[POS]:    Shared runtime metrics between task loops and operations
[UPDATE]: When adding/removing engine-level runtime signals
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Engine-wide counters, shared across components.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub orders_placed: Counter,
    pub orders_canceled: Counter,
    pub place_failures: Counter,
    pub cancel_failures: Counter,
    pub retry_attempts: Counter,
    pub executor_overflow: Counter,
    pub ticks_processed: Counter,
    pub fills_applied: Counter,
    pub saves_completed: Counter,
    pub save_failures: Counter,
    pub reconcile_sweeps: Counter,
    pub ghost_fills: Counter,
    pub zombie_slots: Counter,
    pub unmatched_orders: Counter,
    pub drift_corrections: Counter,
    pub breaker_trips: Counter,
}

impl EngineMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            orders_placed: self.orders_placed.get(),
            orders_canceled: self.orders_canceled.get(),
            place_failures: self.place_failures.get(),
            cancel_failures: self.cancel_failures.get(),
            retry_attempts: self.retry_attempts.get(),
            executor_overflow: self.executor_overflow.get(),
            ticks_processed: self.ticks_processed.get(),
            fills_applied: self.fills_applied.get(),
            saves_completed: self.saves_completed.get(),
            save_failures: self.save_failures.get(),
            reconcile_sweeps: self.reconcile_sweeps.get(),
            ghost_fills: self.ghost_fills.get(),
            zombie_slots: self.zombie_slots.get(),
            unmatched_orders: self.unmatched_orders.get(),
            drift_corrections: self.drift_corrections.get(),
            breaker_trips: self.breaker_trips.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub orders_placed: u64,
    pub orders_canceled: u64,
    pub place_failures: u64,
    pub cancel_failures: u64,
    pub retry_attempts: u64,
    pub executor_overflow: u64,
    pub ticks_processed: u64,
    pub fills_applied: u64,
    pub saves_completed: u64,
    pub save_failures: u64,
    pub reconcile_sweeps: u64,
    pub ghost_fills: u64,
    pub zombie_slots: u64,
    pub unmatched_orders: u64,
    pub drift_corrections: u64,
    pub breaker_trips: u64,
}
