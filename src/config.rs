//! Configuration management for the ethpilot client
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{ClientError, ClientResult};

use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const CONFIG_ENV_VAR: &str = "ETHPILOT_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub network: NetworkConfig,
    #[serde(default)]
    pub tracing_level: String,
    #[serde(default)]
    pub trace_to_json: bool,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub pending_nonce_protection_enabled: bool,
    #[serde(default)]
    pub check_rpc_health_on_start: bool,
    /// Number of throwaway keys to create and fund from the root key
    #[serde(default)]
    pub ephemeral_addresses: u64,
    /// Ether left on the root key when splitting funds between ephemeral keys
    #[serde(default)]
    pub root_key_funds_buffer: u64,
    #[serde(default)]
    pub key_sync: KeySyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default)]
    pub simulated: bool,
    pub urls: Vec<String>,
    #[serde(default)]
    pub private_keys: Vec<String>,
    /// Fallback legacy gas price (wei)
    #[serde(default)]
    pub gas_price: u64,
    /// Fallback EIP-1559 fee cap (wei)
    #[serde(default)]
    pub gas_fee_cap: u64,
    /// Fallback EIP-1559 tip cap (wei)
    #[serde(default)]
    pub gas_tip_cap: u64,
    /// Overrides node gas limit estimation when non-zero
    #[serde(default)]
    pub gas_limit: u64,
    #[serde(default = "default_transfer_gas_fee")]
    pub transfer_gas_fee: u64,
    #[serde(default = "default_txn_timeout_secs")]
    pub txn_timeout_secs: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    #[serde(default, rename = "eip_1559_dynamic_fees")]
    pub eip1559_dynamic_fees: bool,
    #[serde(default)]
    pub gas_price_estimation_enabled: bool,
    #[serde(default)]
    pub gas_price_estimation_blocks: u64,
    #[serde(default)]
    pub gas_price_estimation_tx_priority: String,
    #[serde(default)]
    pub priority_tiers: PriorityTiers,
    /// Upper bound for suggested EIP-1559 fee caps, 0 disables the cap
    #[serde(default)]
    pub max_gas_price_gwei: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeySyncConfig {
    pub timeout_secs: u64,
    pub retry_delay_ms: u64,
}

impl Default for KeySyncConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            retry_delay_ms: 1_000,
        }
    }
}

/// Gate controlling when full call traces are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TracingLevel {
    None = 0,
    Reverted = 1,
    All = 2,
}

impl TracingLevel {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TracingLevel::None,
            1 => TracingLevel::Reverted,
            _ => TracingLevel::All,
        }
    }
}

impl FromStr for TracingLevel {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "" | "REVERTED" => Ok(TracingLevel::Reverted),
            "NONE" => Ok(TracingLevel::None),
            "ALL" => Ok(TracingLevel::All),
            _ => Err(ClientError::Config(
                "tracing level must be one of: NONE, REVERTED, ALL".to_string(),
            )),
        }
    }
}

impl fmt::Display for TracingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TracingLevel::None => "NONE",
            TracingLevel::Reverted => "REVERTED",
            TracingLevel::All => "ALL",
        };
        f.write_str(name)
    }
}

/// Transaction priority tier used to pick a gas statistics bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Degen,
    Fast,
    Standard,
    Slow,
}

impl FromStr for Priority {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "standard" => Ok(Priority::Standard),
            "degen" => Ok(Priority::Degen),
            "fast" => Ok(Priority::Fast),
            "slow" => Ok(Priority::Slow),
            _ => Err(ClientError::Config(
                "when automating gas estimation is enabled priority must be degen, fast, standard or slow"
                    .to_string(),
            )),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Degen => "degen",
            Priority::Fast => "fast",
            Priority::Standard => "standard",
            Priority::Slow => "slow",
        };
        f.write_str(name)
    }
}

/// Percentile bucket of the gas statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Max,
    P99,
    P75,
    P50,
    P25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TierConfig {
    pub bucket: Bucket,
    /// Applied to the node's legacy gas price suggestion, 100 = unchanged
    pub legacy_multiplier_percent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PriorityTiers {
    pub degen: TierConfig,
    pub fast: TierConfig,
    pub standard: TierConfig,
    pub slow: TierConfig,
}

impl Default for PriorityTiers {
    fn default() -> Self {
        Self {
            degen: TierConfig {
                bucket: Bucket::Max,
                legacy_multiplier_percent: 150,
            },
            fast: TierConfig {
                bucket: Bucket::P75,
                legacy_multiplier_percent: 120,
            },
            standard: TierConfig {
                bucket: Bucket::P50,
                legacy_multiplier_percent: 100,
            },
            slow: TierConfig {
                bucket: Bucket::P25,
                legacy_multiplier_percent: 80,
            },
        }
    }
}

impl PriorityTiers {
    pub fn tier(&self, priority: Priority) -> TierConfig {
        match priority {
            Priority::Degen => self.degen,
            Priority::Fast => self.fast,
            Priority::Standard => self.standard,
            Priority::Slow => self.slow,
        }
    }
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_transfer_gas_fee() -> u64 {
    21_000
}

fn default_txn_timeout_secs() -> u64 {
    180
}

fn default_receipt_poll_interval_ms() -> u64 {
    1_000
}

impl Settings {
    /// Load settings from the file named by `ETHPILOT_CONFIG`
    pub fn load() -> ClientResult<Self> {
        let config_path = env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            ClientError::Config(format!("Failed to read config file {:?}: {}", config_path, e))
        })?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(input: &str) -> ClientResult<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(input);

        let mut settings: Settings = toml::from_str(&config_str)
            .map_err(|e| ClientError::Config(format!("Failed to parse configuration: {}", e)))?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate and normalise configuration
    pub fn validate(&mut self) -> ClientResult<()> {
        let network = &mut self.network;

        if network.urls.is_empty() {
            return Err(ClientError::Config(
                "at least one url should be present in network.urls".to_string(),
            ));
        }
        if network.urls.len() > 1 {
            warn!("Multiple RPC URLs provided, the first one is primary and the rest are failover");
        }

        if network.gas_price_estimation_enabled {
            if network.gas_price_estimation_blocks == 0 {
                return Err(ClientError::Config(
                    "when automating gas estimation is enabled blocks must be greater than 0. fix it or disable gas estimation"
                        .to_string(),
                ));
            }
            let priority: Priority = network.gas_price_estimation_tx_priority.parse()?;
            network.gas_price_estimation_tx_priority = priority.to_string();
        }

        if network.gas_limit != 0 {
            warn!(
                "Gas limit is set, this will override the gas limit estimated by the node. Use it only if the node cannot estimate gas itself"
            );
        }

        let level: TracingLevel = self.tracing_level.parse()?;
        self.tracing_level = level.to_string();

        Ok(())
    }

    pub fn tracing_level(&self) -> TracingLevel {
        self.tracing_level.parse().unwrap_or(TracingLevel::Reverted)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_addresses > 0
    }
}

impl NetworkConfig {
    /// Local development networks get static gas values and no contract map
    pub fn is_simulated(&self) -> bool {
        self.simulated
            || self.name.eq_ignore_ascii_case("geth")
            || self.name.eq_ignore_ascii_case("anvil")
    }

    pub fn txn_timeout(&self) -> Duration {
        Duration::from_secs(self.txn_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn priority(&self) -> Priority {
        self.gas_price_estimation_tx_priority
            .parse()
            .unwrap_or(Priority::Standard)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings::from_toml(
        r#"
        tracing_level = "none"

        [network]
        name = "Sepolia"
        urls = ["http://localhost:8545"]
        gas_price = 1000000000
        gas_fee_cap = 30000000000
        gas_tip_cap = 1800000000
        txn_timeout_secs = 2
        receipt_poll_interval_ms = 10
        "#,
    )
    .expect("valid test settings")
}
