//! Configuration for the transaction engine
//!
//! Loads configuration from TOML files with environment variable substitution.
//! The resulting [`Settings`] value is passed down explicitly; nothing here is
//! global.

use crate::tx::types::ChainFamily;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "IDENTITY_ENGINE_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

/// Engine-wide submission, retry and confirmation tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub confirmation_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Blocks examined by the backward search for a missing transaction
    pub search_window: u64,
    /// Consecutive polls a transaction may be absent from both the pool and
    /// the searched window before it is declared dropped
    pub drop_grace_polls: u32,
    /// Padding applied to live fee estimates
    pub fee_multiplier: f64,
    /// Compute limit used when live estimation fails
    pub fallback_compute_limit: u64,
    /// Price per compute unit used when live estimation fails
    pub fallback_fee_per_unit: u64,
    pub health_check_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            confirmation_timeout_ms: 120_000,
            poll_interval_ms: 2_000,
            search_window: 10,
            drop_grace_polls: 2,
            fee_multiplier: 1.2,
            fallback_compute_limit: 300_000,
            fallback_fee_per_unit: 20_000_000_000,
            health_check_interval_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            anyhow::bail!("backoff_multiplier must be >= 1.0");
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            anyhow::bail!("max_retry_delay_ms must be >= base_retry_delay_ms");
        }
        if self.fee_multiplier < 1.0 {
            anyhow::bail!("fee_multiplier must be >= 1.0");
        }
        if self.search_window == 0 {
            anyhow::bail!("search_window must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub family: ChainFamily,
    pub rpc_urls: Vec<String>,
    /// EIP-155 chain id (EVM only)
    pub chain_id: Option<u64>,
    /// Confirmation count treated as final (EVM only)
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    /// First runtime spec version using the current call layout (substrate only)
    pub current_runtime_spec_version: Option<u32>,
    #[serde(default = "default_utility_pallet_index")]
    pub utility_pallet_index: u8,
    #[serde(default = "default_mortal_era_period")]
    pub mortal_era_period: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    #[default]
    Eip1559,
}

fn default_required_confirmations() -> u64 {
    12
}

fn default_max_gas_price_gwei() -> u64 {
    500
}

fn default_utility_pallet_index() -> u8 {
    26
}

fn default_mortal_era_period() -> u64 {
    64
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Load settings from the file named by `IDENTITY_ENGINE_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            match chain.family {
                ChainFamily::Evm => {
                    if chain.chain_id.is_none() {
                        anyhow::bail!("EVM chain {} needs a chain_id", name);
                    }
                    if chain.required_confirmations == 0 {
                        anyhow::bail!("Chain {} needs at least one confirmation", name);
                    }
                }
                ChainFamily::Substrate => {
                    if chain.current_runtime_spec_version.is_none() {
                        tracing::warn!(
                            "Chain {} has no current_runtime_spec_version - assuming current runtime",
                            name
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| env::var(&cap[1]).unwrap_or_default())
        .into_owned()
}
