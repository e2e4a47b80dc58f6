//! Configuration management for the swap coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{SwapError, SwapResult};
use crate::timelock::{RecoveryPolicy, TimeLockSet};
use crate::types::Hash32;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "SWAP_COORDINATOR_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorSettings,
    pub timelocks: TimeLockSet,
    #[serde(default)]
    pub recovery: RecoverySettings,
    pub auction: AuctionSettings,
    pub chains: ChainsSettings,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSettings {
    pub confirmation_timeout_ms: u64,
    pub confirmation_poll_ms: u64,
    pub max_parts: u32,
    #[serde(default = "default_true")]
    pub require_src_safety_deposit: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySettings {
    pub maker_cancellation_delay_secs: u64,
    pub dst_public_cancellation_delay_secs: u64,
    pub expiry_delay_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        let policy = RecoveryPolicy::default();
        Self {
            maker_cancellation_delay_secs: policy.maker_cancellation_delay_secs,
            dst_public_cancellation_delay_secs: policy.dst_public_cancellation_delay_secs,
            expiry_delay_secs: policy.expiry_delay_secs,
        }
    }
}

/// Pricing of the rehearsal order
#[derive(Debug, Clone, Deserialize)]
pub struct AuctionSettings {
    pub start_price: u64,
    pub reserve_price: u64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainsSettings {
    pub source: ChainSettings,
    pub destination: ChainSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
    pub chain_id: u64,
    pub name: String,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    pub confirmation_blocks: u64,
    /// Hex id of the escrow implementation used for address derivation
    pub escrow_implementation: String,
}

impl ChainSettings {
    pub fn implementation_id(&self) -> SwapResult<Hash32> {
        Hash32::from_hex(&self.escrow_implementation).ok_or_else(|| {
            SwapError::Config(format!(
                "chain {} escrow_implementation is not a 32-byte hex id",
                self.name
            ))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_true() -> bool {
    true
}

/// Runtime parameters of the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub confirmation_timeout_ms: u64,
    pub confirmation_poll_ms: u64,
    pub max_parts: u32,
    pub require_src_safety_deposit: bool,
    pub src_confirmation_blocks: u64,
    pub dst_confirmation_blocks: u64,
    pub src_implementation: Hash32,
    pub dst_implementation: Hash32,
    pub recovery: RecoveryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: 30_000,
            confirmation_poll_ms: 250,
            max_parts: 1_024,
            require_src_safety_deposit: true,
            src_confirmation_blocks: 1,
            dst_confirmation_blocks: 1,
            src_implementation: Hash32::ZERO,
            dst_implementation: Hash32::ZERO,
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl Settings {
    /// Load settings from `$SWAP_COORDINATOR_CONFIG` or `config/default.toml`
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

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.coordinator.confirmation_timeout_ms == 0 {
            anyhow::bail!("coordinator.confirmation_timeout_ms must be positive");
        }
        if self.coordinator.confirmation_poll_ms == 0 {
            anyhow::bail!("coordinator.confirmation_poll_ms must be positive");
        }

        self.timelocks
            .validate()
            .map_err(|e| anyhow::anyhow!("timelocks: {}", e))?;

        // Anchored at the same instant the destination must become cancellable first
        if self.timelocks.dst_cancellation >= self.timelocks.src_cancellation {
            anyhow::bail!(
                "timelocks.dst_cancellation ({}) must be below timelocks.src_cancellation ({})",
                self.timelocks.dst_cancellation,
                self.timelocks.src_cancellation
            );
        }

        if self.auction.reserve_price > self.auction.start_price {
            anyhow::bail!("auction.reserve_price must not exceed auction.start_price");
        }

        for chain in [&self.chains.source, &self.chains.destination] {
            chain.implementation_id()?;
            if chain.rpc_urls.is_empty() {
                tracing::warn!("Chain {} has no RPC URLs configured - will not be probed", chain.name);
            }
        }
        if self.chains.source.chain_id == self.chains.destination.chain_id {
            anyhow::bail!("source and destination chains must differ");
        }

        Ok(())
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            maker_cancellation_delay_secs: self.recovery.maker_cancellation_delay_secs,
            dst_public_cancellation_delay_secs: self.recovery.dst_public_cancellation_delay_secs,
            expiry_delay_secs: self.recovery.expiry_delay_secs,
        }
    }

    /// Build the coordinator runtime parameters
    pub fn coordinator_config(&self) -> SwapResult<CoordinatorConfig> {
        Ok(CoordinatorConfig {
            confirmation_timeout_ms: self.coordinator.confirmation_timeout_ms,
            confirmation_poll_ms: self.coordinator.confirmation_poll_ms,
            max_parts: self.coordinator.max_parts,
            require_src_safety_deposit: self.coordinator.require_src_safety_deposit,
            src_confirmation_blocks: self.chains.source.confirmation_blocks,
            dst_confirmation_blocks: self.chains.destination.confirmation_blocks,
            src_implementation: self.chains.source.implementation_id()?,
            dst_implementation: self.chains.destination.implementation_id()?,
            recovery: self.recovery_policy(),
        })
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
