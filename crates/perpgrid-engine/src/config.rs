/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed engine configuration with per-symbol grid parameters
[POS]:    Configuration layer - task setup
[UPDATE]: When adding new configuration options
*/

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the grid engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Directory holding per-symbol state databases.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Health/status HTTP listen address; `None` disables the server.
    #[serde(default = "default_health_listen")]
    pub health_listen: Option<String>,
    /// One grid task per symbol.
    pub tasks: Vec<TaskConfig>,
}

/// Configuration for a single per-symbol grid task.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    /// Trading symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// Venue name; "paper" runs against the in-memory gateway.
    pub exchange: String,
    pub price_decimals: u32,
    pub quantity_decimals: u32,
    pub grid: GridConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Venue credentials; absent for the paper gateway.
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
}

/// Grid shape and sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GridConfig {
    /// Base distance between grid levels.
    #[serde(with = "rust_decimal::serde::str")]
    pub price_interval: Decimal,
    /// Base quantity per opening order.
    #[serde(with = "rust_decimal::serde::str")]
    pub order_quantity: Decimal,
    /// Actions below this notional are dropped.
    #[serde(with = "rust_decimal::serde::str")]
    pub min_order_value: Decimal,
    pub buy_window_size: u32,
    pub sell_window_size: u32,
    /// Neutral quotes both sides; directional opens buys only.
    #[serde(default)]
    pub is_neutral: bool,
    /// Widens the interval to `atr * volatility_scale` when positive.
    #[serde(default = "decimal_zero", with = "rust_decimal::serde::str")]
    pub volatility_scale: Decimal,
    /// Shifts quoting against held inventory when positive.
    #[serde(default = "decimal_zero", with = "rust_decimal::serde::str")]
    pub inventory_skew_factor: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Divergence below this fraction auto-corrects; at or above it the
    /// symbol's circuit breaker opens.
    #[serde(default = "default_drift_small_threshold", with = "rust_decimal::serde::str")]
    pub drift_small_threshold: Decimal,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            drift_small_threshold: default_drift_small_threshold(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
    /// Saturated pool spawns overflow tasks instead of blocking.
    #[serde(default)]
    pub non_blocking: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_capacity: default_max_capacity(),
            non_blocking: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialsConfig {
    pub api_key: String,
    pub api_secret: String,
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tasks.is_empty() {
            anyhow::bail!("configuration has no tasks");
        }
        for task in &self.tasks {
            if task.symbol.is_empty() {
                anyhow::bail!("task symbol cannot be empty");
            }
            if task.grid.price_interval <= Decimal::ZERO {
                anyhow::bail!("{}: price_interval must be positive", task.symbol);
            }
            if task.grid.order_quantity <= Decimal::ZERO {
                anyhow::bail!("{}: order_quantity must be positive", task.symbol);
            }
            if task.grid.buy_window_size == 0 {
                anyhow::bail!("{}: buy_window_size must be at least 1", task.symbol);
            }
            if task.exchange != "paper" && task.credentials.is_none() {
                anyhow::bail!("{}: venue {} requires credentials", task.symbol, task.exchange);
            }
        }
        Ok(())
    }
}

fn decimal_zero() -> Decimal {
    Decimal::ZERO
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_health_listen() -> Option<String> {
    Some("127.0.0.1:9102".to_string())
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_drift_small_threshold() -> Decimal {
    Decimal::new(5, 2)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_workers() -> usize {
    10
}

fn default_max_capacity() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
state_dir: /tmp/perpgrid
tasks:
  - symbol: BTCUSDT
    exchange: paper
    price_decimals: 1
    quantity_decimals: 3
    grid:
      price_interval: "1"
      order_quantity: "0.01"
      min_order_value: "5"
      buy_window_size: 2
      sell_window_size: 2
      is_neutral: true
"#;

    #[test]
    fn sample_config_parses_with_defaults() {
        let config: EngineConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        let task = &config.tasks[0];
        assert_eq!(task.symbol, "BTCUSDT");
        assert_eq!(task.reconcile.interval_secs, 30);
        assert_eq!(task.reconcile.drift_small_threshold, Decimal::new(5, 2));
        assert_eq!(task.retry.max_attempts, 5);
        assert_eq!(task.pool.max_workers, 10);
        assert_eq!(task.pool.max_capacity, 1000);
        assert!(!task.pool.non_blocking);
        assert!(task.grid.volatility_scale.is_zero());
    }

    #[test]
    fn live_venue_without_credentials_is_rejected() {
        let yaml = SAMPLE.replace("exchange: paper", "exchange: bitmart");
        let config: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let yaml = SAMPLE.replace("price_interval: \"1\"", "price_interval: \"0\"");
        let config: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
