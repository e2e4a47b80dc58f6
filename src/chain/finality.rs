//! Confirmation waiting for submitted escrow calls
//!
//! The coordinator only advances a swap once a call's receipt is buried
//! under the configured number of blocks. Waiting is bounded: when the
//! deadline passes the caller gets `ConfirmationTimeout` and decides whether
//! to resubmit or investigate. Nothing is resubmitted here.

use super::{EscrowLedger, Receipt};
use crate::error::{SwapError, SwapResult};
use crate::types::TxHash;

use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Waits for receipts to reach the required depth
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationWaiter {
    /// Blocks including the inclusion block
    confirmation_blocks: u64,
    /// Upper bound on the whole wait
    timeout: Duration,
    /// Delay between receipt polls
    poll_interval: Duration,
}

impl ConfirmationWaiter {
    pub fn new(confirmation_blocks: u64, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            confirmation_blocks: confirmation_blocks.max(1),
            timeout,
            poll_interval,
        }
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    /// Wait until `tx_hash` has `confirmation_blocks` confirmations
    pub async fn wait(&self, ledger: &dyn EscrowLedger, tx_hash: TxHash) -> SwapResult<Receipt> {
        let chain_id = ledger.chain_id();
        let started = Instant::now();

        match timeout(self.timeout, self.poll(ledger, tx_hash)).await {
            Ok(Ok(receipt)) => {
                let latency = started.elapsed().as_secs_f64();
                crate::metrics::record_confirmation_latency(chain_id, latency);
                info!(
                    "Transaction {} confirmed on chain {} at block {} (t={})",
                    tx_hash, chain_id, receipt.block_number, receipt.block_timestamp
                );
                Ok(receipt)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "Confirmation timeout for {} on chain {} after {:?}",
                    tx_hash, chain_id, self.timeout
                );
                crate::metrics::record_confirmation_timeout(chain_id);
                Err(SwapError::ConfirmationTimeout {
                    chain_id,
                    tx_hash,
                    waited_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn poll(&self, ledger: &dyn EscrowLedger, tx_hash: TxHash) -> SwapResult<Receipt> {
        let chain_id = ledger.chain_id();
        loop {
            let receipt = ledger
                .receipt(tx_hash)
                .await
                .map_err(|e| SwapError::chain(chain_id, e))?;

            if let Some(receipt) = receipt {
                let current_block = ledger
                    .block_number()
                    .await
                    .map_err(|e| SwapError::chain(chain_id, e))?;
                let confirmations = current_block.saturating_sub(receipt.block_number) + 1;

                if confirmations >= self.confirmation_blocks {
                    return Ok(receipt);
                }

                debug!(
                    "Transaction {} has {} / {} confirmations on chain {}",
                    tx_hash, confirmations, self.confirmation_blocks, chain_id
                );
            } else {
                debug!("Transaction {} not yet included on chain {}", tx_hash, chain_id);
            }

            sleep(self.poll_interval).await;
        }
    }
}
