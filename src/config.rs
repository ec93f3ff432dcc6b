//! Application configuration.
//!
//! Values layer environment variables (prefix `PEBBLE__`, `__` separator)
//! over the defaults below. `.env` files are honoured in development.

use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct OrderServiceConfig {
    #[serde(default = "default_max_quantity")]
    pub max_quantity: Decimal,
    #[serde(default = "default_max_pending_orders_per_user")]
    pub max_pending_orders_per_user: i64,
    #[serde(default = "default_admin_party")]
    pub pebble_admin_party: String,
}

impl Default for OrderServiceConfig {
    fn default() -> Self {
        Self {
            max_quantity: default_max_quantity(),
            max_pending_orders_per_user: default_max_pending_orders_per_user(),
            pebble_admin_party: default_admin_party(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_round_delay_ms")]
    pub round_delay_ms: u64,
    #[serde(default = "default_proposal_timeout_ms")]
    pub proposal_timeout_ms: u64,
    #[serde(default = "default_admin_party")]
    pub pebble_admin_party: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            max_batch_size: default_max_batch_size(),
            max_retries: default_max_retries(),
            round_delay_ms: default_round_delay_ms(),
            proposal_timeout_ms: default_proposal_timeout_ms(),
            pebble_admin_party: default_admin_party(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_reconciliation_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_stale_threshold_minutes")]
    pub stale_threshold_minutes: u64,
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance_percentage: Decimal,
    #[serde(default = "default_admin_party")]
    pub pebble_admin_party: String,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_reconciliation_interval_ms(),
            stale_threshold_minutes: default_stale_threshold_minutes(),
            drift_tolerance_percentage: default_drift_tolerance(),
            pebble_admin_party: default_admin_party(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_ledger_api_url")]
    pub ledger_api_url: String,
    /// Run against the synthetic offline ledger façade.
    #[serde(default)]
    pub ledger_offline: bool,
    #[serde(default)]
    pub order: OrderServiceConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("PEBBLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}

fn default_database_url() -> String {
    "postgres://localhost/pebble".to_string()
}

fn default_ledger_api_url() -> String {
    "http://localhost:7575".to_string()
}

fn default_admin_party() -> String {
    "pebbleAdmin".to_string()
}

fn default_max_quantity() -> Decimal {
    Decimal::from(1_000_000)
}

fn default_max_pending_orders_per_user() -> i64 {
    100
}

fn default_batch_interval_ms() -> u64 {
    2000
}

fn default_max_batch_size() -> usize {
    25
}

fn default_max_retries() -> i32 {
    3
}

fn default_round_delay_ms() -> u64 {
    50
}

fn default_proposal_timeout_ms() -> u64 {
    300_000
}

fn default_reconciliation_interval_ms() -> u64 {
    60_000
}

fn default_stale_threshold_minutes() -> u64 {
    5
}

fn default_drift_tolerance() -> Decimal {
    Decimal::new(1, 3)
}
