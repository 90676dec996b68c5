use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::types::{OrderType, Side};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mode: Mode,
    /// Whether this connector places orders at all. When false, placement
    /// calls are rejected and only tracking runs.
    #[serde(default = "default_true")]
    pub trading_required: bool,
    pub venue: VenueConfig,
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub trading_pairs: Vec<TradingPairConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Order types the venue accepts.
    #[serde(default = "default_order_types")]
    pub order_types: Vec<OrderType>,
    #[serde(default = "default_id_prefix")]
    pub client_order_id_prefix: String,
    #[serde(default = "default_id_max_length")]
    pub client_order_id_max_length: usize,
}

fn default_true() -> bool {
    true
}
fn default_order_types() -> Vec<OrderType> {
    vec![OrderType::Limit, OrderType::LimitMaker]
}
fn default_id_prefix() -> String {
    "BX".to_string()
}
fn default_id_max_length() -> usize {
    32
}

#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Status/fill polling cadence while the user stream is healthy.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    /// Rate-limit floor; no polling cadence may be faster than this.
    #[serde(default = "default_min_poll_interval")]
    pub min_poll_interval_secs: f64,
    /// Tightened cadence used while the user stream is down.
    #[serde(default = "default_stream_down_poll_interval")]
    pub stream_down_poll_interval_secs: f64,
    /// Consecutive "order not found" answers before a PENDING_CREATE order is failed.
    #[serde(default = "default_max_not_found")]
    pub max_not_found_retries: u32,
    /// How long a venue FILLED status may wait for its trades before it is forced.
    #[serde(default = "default_fill_grace")]
    pub fill_grace_period_secs: f64,
    /// Terminal orders older than this are drained from the tracker.
    #[serde(default = "default_retention")]
    pub terminal_retention_secs: f64,
    #[serde(default = "default_time_sync")]
    pub time_sync_interval_secs: f64,
}

fn default_poll_interval() -> f64 {
    10.0
}
fn default_min_poll_interval() -> f64 {
    1.0
}
fn default_stream_down_poll_interval() -> f64 {
    2.0
}
fn default_max_not_found() -> u32 {
    3
}
fn default_fill_grace() -> f64 {
    30.0
}
fn default_retention() -> f64 {
    300.0
}
fn default_time_sync() -> f64 {
    60.0
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            min_poll_interval_secs: default_min_poll_interval(),
            stream_down_poll_interval_secs: default_stream_down_poll_interval(),
            max_not_found_retries: default_max_not_found(),
            fill_grace_period_secs: default_fill_grace(),
            terminal_retention_secs: default_retention(),
            time_sync_interval_secs: default_time_sync(),
        }
    }
}

impl ReconciliationConfig {
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs.max(self.min_poll_interval_secs))
    }

    /// Cadence while the stream is down: tighter, but never below the floor.
    pub fn stream_down_poll_interval(&self) -> Duration {
        let tightened = self.stream_down_poll_interval_secs.min(self.poll_interval_secs);
        secs(tightened.max(self.min_poll_interval_secs))
    }

    pub fn min_poll_interval(&self) -> Duration {
        secs(self.min_poll_interval_secs)
    }

    pub fn fill_grace_period(&self) -> Duration {
        secs(self.fill_grace_period_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        secs(self.terminal_retention_secs)
    }

    pub fn time_sync_interval(&self) -> Duration {
        secs(self.time_sync_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_delay_ms: u64,
}

fn default_request_timeout() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base() -> u64 {
    250
}
fn default_retry_max() -> u64 {
    5_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base(),
            retry_max_delay_ms: default_retry_max(),
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Exponential backoff before retry number `attempt` (1-based), capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

/// Flat fee schedule. `LimitMaker` orders pay the maker rate, everything
/// else the taker rate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeeConfig {
    #[serde(default)]
    pub maker_percent: Decimal,
    #[serde(default)]
    pub taker_percent: Decimal,
}

impl FeeConfig {
    /// Quote-denominated fee for a hypothetical fill.
    pub fn estimate(&self, order_type: OrderType, amount: Decimal, price: Decimal) -> Decimal {
        let pct = if order_type.is_maker() {
            self.maker_percent
        } else {
            self.taker_percent
        };
        amount * price * pct / Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingPairConfig {
    /// e.g. "SOL-USDC"
    pub symbol: String,
    #[serde(default)]
    pub min_order_size: Decimal,
    /// Zero disables price quantization.
    #[serde(default)]
    pub price_increment: Decimal,
    /// Zero disables amount quantization.
    #[serde(default)]
    pub amount_increment: Decimal,
}

impl TradingPairConfig {
    /// Round a price to the tick: buys down, sells up, so quantization never
    /// makes the order more aggressive.
    pub fn quantize_price(&self, side: Side, price: Decimal) -> Decimal {
        if self.price_increment <= Decimal::ZERO {
            return price;
        }
        let ticks = price / self.price_increment;
        let ticks = match side {
            Side::Buy => ticks.floor(),
            Side::Sell => ticks.ceil(),
        };
        ticks * self.price_increment
    }

    pub fn quantize_amount(&self, amount: Decimal) -> Decimal {
        if self.amount_increment <= Decimal::ZERO {
            return amount;
        }
        (amount / self.amount_increment).floor() * self.amount_increment
    }
}

/// Longest interval any reconciliation setting may take: one year.
const MAX_INTERVAL_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn secs(value: f64) -> Duration {
    let clamped = if value.is_nan() { 0.0 } else { value.clamp(0.0, MAX_INTERVAL_SECS) };
    Duration::from_secs_f64(clamped)
}

impl Config {
    /// Read and validate.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read without validating, for callers that layer overrides on top
    /// before calling [`Config::validate`].
    pub fn read(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.trading_pairs.is_empty() {
            return Err(crate::Error::Config(
                "No trading pairs configured. Add [[trading_pairs]] entries to config.".into(),
            ));
        }

        let mut seen = HashSet::new();
        for pair in &self.trading_pairs {
            if !seen.insert(pair.symbol.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Trading pair '{}' configured twice",
                    pair.symbol
                )));
            }
            if pair.min_order_size < Decimal::ZERO
                || pair.price_increment < Decimal::ZERO
                || pair.amount_increment < Decimal::ZERO
            {
                return Err(crate::Error::Config(format!(
                    "Trading pair '{}' has a negative size or increment",
                    pair.symbol
                )));
            }
        }

        let recon = &self.reconciliation;
        for (name, value) in [
            ("poll_interval_secs", recon.poll_interval_secs),
            ("min_poll_interval_secs", recon.min_poll_interval_secs),
            ("stream_down_poll_interval_secs", recon.stream_down_poll_interval_secs),
            ("fill_grace_period_secs", recon.fill_grace_period_secs),
            ("terminal_retention_secs", recon.terminal_retention_secs),
            ("time_sync_interval_secs", recon.time_sync_interval_secs),
        ] {
            if !value.is_finite() || !(0.0..=MAX_INTERVAL_SECS).contains(&value) {
                return Err(crate::Error::Config(format!(
                    "{name} must be between 0 and {MAX_INTERVAL_SECS} seconds, got {value}"
                )));
            }
        }
        if recon.min_poll_interval_secs <= 0.0 {
            return Err(crate::Error::Config(
                "min_poll_interval_secs must be positive".into(),
            ));
        }
        if recon.poll_interval_secs < recon.min_poll_interval_secs {
            return Err(crate::Error::Config(format!(
                "poll_interval_secs ({}) is below min_poll_interval_secs ({})",
                recon.poll_interval_secs, recon.min_poll_interval_secs
            )));
        }

        if self.venue.order_types.is_empty() {
            return Err(crate::Error::Config(format!(
                "Venue '{}' lists no supported order types",
                self.venue.name
            )));
        }

        if self.mode == Mode::Live {
            if self.transport.request_timeout_ms == 0 {
                return Err(crate::Error::Config(
                    "Live mode requires a positive transport.request_timeout_ms".into(),
                ));
            }
            if self.venue.rest_url.is_none() || self.venue.ws_url.is_none() {
                return Err(crate::Error::Config(
                    "Live mode requires venue.rest_url and venue.ws_url".into(),
                ));
            }
            match &self.credentials {
                Some(c) if !c.api_key.is_empty() && !c.api_secret.is_empty() => {}
                _ => {
                    return Err(crate::Error::Config(
                        "Live mode requires [credentials] api_key and api_secret".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn trading_pair(&self, symbol: &str) -> Option<&TradingPairConfig> {
        self.trading_pairs.iter().find(|p| p.symbol == symbol)
    }
}
