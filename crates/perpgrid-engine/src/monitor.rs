/*
[INPUT]:  Price ticks from the market stream
[OUTPUT]: ATR, volatility factor, risk trigger, and market regime
[POS]:    Risk layer - monitors the coordinator polls every tick
[UPDATE]: When trigger thresholds or window lengths change
*/

use std::collections::VecDeque;

use parking_lot::Mutex;
use rust_decimal::Decimal;

/// Coarse market state; masks one grid side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bull,
    Bear,
    Range,
}

/// Volatility and stress signals consumed by the coordinator. The
/// engine feeds every tick through `record_price` before reading.
pub trait RiskMonitor: Send + Sync {
    fn record_price(&self, price: Decimal);
    /// Average true range over the rolling window; zero until warm.
    fn atr(&self) -> Decimal;
    /// ATR relative to the last price; used to damp order sizing.
    fn volatility_factor(&self) -> Decimal;
    fn is_triggered(&self) -> bool;
}

/// Market regime classifier.
pub trait RegimeMonitor: Send + Sync {
    fn record_price(&self, price: Decimal);
    fn regime(&self) -> Regime;
}

const DEFAULT_ATR_WINDOW: usize = 32;

#[derive(Debug)]
struct RollingState {
    prices: VecDeque<Decimal>,
    window_max: Decimal,
    last_price: Decimal,
}

/// Rolling-window risk monitor: ATR as the mean absolute tick move,
/// triggered while drawdown from the window high exceeds the
/// configured fraction.
#[derive(Debug)]
pub struct RollingRiskMonitor {
    window: usize,
    drawdown_trigger: Decimal,
    state: Mutex<RollingState>,
}

impl RollingRiskMonitor {
    pub fn new(drawdown_trigger: Decimal) -> Self {
        Self::with_window(DEFAULT_ATR_WINDOW, drawdown_trigger)
    }

    pub fn with_window(window: usize, drawdown_trigger: Decimal) -> Self {
        Self {
            window: window.max(2),
            drawdown_trigger,
            state: Mutex::new(RollingState {
                prices: VecDeque::new(),
                window_max: Decimal::ZERO,
                last_price: Decimal::ZERO,
            }),
        }
    }
}

impl RiskMonitor for RollingRiskMonitor {
    fn record_price(&self, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        let mut state = self.state.lock();
        state.prices.push_back(price);
        while state.prices.len() > self.window {
            state.prices.pop_front();
        }
        state.last_price = price;
        state.window_max = state.prices.iter().copied().max().unwrap_or(price);
    }

    fn atr(&self) -> Decimal {
        let state = self.state.lock();
        if state.prices.len() < 2 {
            return Decimal::ZERO;
        }
        let mut sum = Decimal::ZERO;
        let mut prev: Option<Decimal> = None;
        for price in &state.prices {
            if let Some(prev) = prev {
                sum += (*price - prev).abs();
            }
            prev = Some(*price);
        }
        sum / Decimal::from(state.prices.len() - 1)
    }

    fn volatility_factor(&self) -> Decimal {
        let last = self.state.lock().last_price;
        if last.is_zero() {
            return Decimal::ZERO;
        }
        self.atr() / last
    }

    fn is_triggered(&self) -> bool {
        if self.drawdown_trigger <= Decimal::ZERO {
            return false;
        }
        let state = self.state.lock();
        if state.window_max.is_zero() || state.last_price.is_zero() {
            return false;
        }
        let drawdown = (state.window_max - state.last_price) / state.window_max;
        drawdown >= self.drawdown_trigger
    }
}

const FAST_WINDOW: usize = 8;
const SLOW_WINDOW: usize = 32;

#[derive(Debug, Default)]
struct MeanState {
    prices: VecDeque<Decimal>,
}

impl MeanState {
    fn mean(&self, len: usize) -> Option<Decimal> {
        if self.prices.len() < len {
            return None;
        }
        let sum: Decimal = self.prices.iter().rev().take(len).copied().sum();
        Some(sum / Decimal::from(len))
    }
}

/// Regime from a fast mean against a slow mean with a neutral band.
#[derive(Debug)]
pub struct DualMeanRegimeMonitor {
    band: Decimal,
    state: Mutex<MeanState>,
}

impl DualMeanRegimeMonitor {
    /// `band` is the fractional separation the fast mean must show
    /// before leaving RANGE (e.g. 0.002 = 20 bps).
    pub fn new(band: Decimal) -> Self {
        Self {
            band,
            state: Mutex::new(MeanState::default()),
        }
    }
}

impl RegimeMonitor for DualMeanRegimeMonitor {
    fn record_price(&self, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        let mut state = self.state.lock();
        state.prices.push_back(price);
        while state.prices.len() > SLOW_WINDOW {
            state.prices.pop_front();
        }
    }

    fn regime(&self) -> Regime {
        let state = self.state.lock();
        let (Some(fast), Some(slow)) = (state.mean(FAST_WINDOW), state.mean(SLOW_WINDOW)) else {
            return Regime::Range;
        };
        if slow.is_zero() {
            return Regime::Range;
        }
        let spread = (fast - slow) / slow;
        if spread > self.band {
            Regime::Bull
        } else if spread < -self.band {
            Regime::Bear
        } else {
            Regime::Range
        }
    }
}

/// Fixed-regime monitor for tests and pinned configurations.
#[derive(Debug)]
pub struct StaticRegimeMonitor(pub Regime);

impl RegimeMonitor for StaticRegimeMonitor {
    fn record_price(&self, _price: Decimal) {}

    fn regime(&self) -> Regime {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    #[test]
    fn atr_is_mean_absolute_move() {
        let monitor = RollingRiskMonitor::with_window(8, Decimal::ZERO);
        for price in ["100", "101", "100", "102"] {
            monitor.record_price(dec(price));
        }
        // moves: 1, 1, 2 -> atr 4/3
        assert_eq!(monitor.atr(), dec("4") / dec("3"));
        assert!(monitor.volatility_factor() > Decimal::ZERO);
    }

    #[test]
    fn drawdown_from_window_high_trips_the_trigger() {
        let monitor = RollingRiskMonitor::with_window(8, dec("0.03"));
        monitor.record_price(dec("100"));
        assert!(!monitor.is_triggered());

        monitor.record_price(dec("98"));
        assert!(!monitor.is_triggered());

        monitor.record_price(dec("96.9"));
        assert!(monitor.is_triggered());

        // Recovery clears the trigger once the high rolls out.
        for _ in 0..8 {
            monitor.record_price(dec("97"));
        }
        assert!(!monitor.is_triggered());
    }

    #[test]
    fn zero_threshold_never_triggers() {
        let monitor = RollingRiskMonitor::with_window(8, Decimal::ZERO);
        monitor.record_price(dec("100"));
        monitor.record_price(dec("50"));
        assert!(!monitor.is_triggered());
    }

    #[test]
    fn regime_tracks_fast_mean_against_slow() {
        let monitor = DualMeanRegimeMonitor::new(dec("0.002"));
        assert_eq!(monitor.regime(), Regime::Range);

        for _ in 0..SLOW_WINDOW {
            monitor.record_price(dec("100"));
        }
        assert_eq!(monitor.regime(), Regime::Range);

        for _ in 0..FAST_WINDOW {
            monitor.record_price(dec("103"));
        }
        assert_eq!(monitor.regime(), Regime::Bull);

        for _ in 0..FAST_WINDOW {
            monitor.record_price(dec("95"));
        }
        assert_eq!(monitor.regime(), Regime::Bear);
    }
}
