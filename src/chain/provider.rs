//! JSON-RPC chain provider with multi-RPC support and automatic failover
//!
//! Used to read chain height and block time from live networks. All swap
//! timing decisions are made against these block timestamps.

use crate::config::ChainSettings;
use crate::error::{ChainError, SwapError, SwapResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    config: ChainSettings,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a provider over every parseable RPC URL of the chain
    pub fn new(config: ChainSettings) -> SwapResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SwapError::chain(
                config.chain_id,
                ChainError::Transport("No valid RPC providers".to_string()),
            ));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> SwapResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.all_failed())
    }

    /// Height and timestamp of the latest block, with failover
    pub async fn latest_block_time(&self) -> SwapResult<(u64, u64)> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block(BlockNumber::Latest).await {
                Ok(Some(block)) => {
                    let height = block.number.map(|n| n.as_u64()).unwrap_or_default();
                    let timestamp = block.timestamp.as_u64();
                    return Ok((height, timestamp));
                }
                Ok(None) => {
                    warn!("Chain {} returned no latest block", self.config.chain_id);
                    self.failover();
                }
                Err(e) => {
                    warn!(
                        "Failed to get latest block from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.all_failed())
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }

    fn all_failed(&self) -> SwapError {
        SwapError::chain(
            self.config.chain_id,
            ChainError::Transport("All providers failed".to_string()),
        )
    }
}
