//! Error types for the swap coordinator

use crate::timelock::Phase;
use crate::types::{ChainId, Hash32, OrderId, Side};

use thiserror::Error;

/// Errors reported by an escrow ledger for a single call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("call rejected by escrow contract: {reason}")]
    Rejected { reason: String },

    #[error("escrow already recovered by another party")]
    AlreadyRecovered,

    #[error("unknown on-chain object {id}")]
    UnknownObject { id: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Main error type for coordinator operations
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bid price {bid} for order {order_id} is below the current auction price {current}")]
    PriceTooLow {
        order_id: OrderId,
        bid: u64,
        current: u64,
    },

    #[error("Disclosure index mismatch for order {order_id}: expected {expected}, supplied {supplied}")]
    IndexMismatch {
        order_id: OrderId,
        expected: u32,
        supplied: u32,
    },

    #[error("Merkle proof for index {index} does not verify against the root of order {order_id}")]
    InvalidProof { order_id: OrderId, index: u32 },

    #[error("Fill of {fill} on order {order_id} would exceed total {total} (already filled {filled})")]
    Overfill {
        order_id: OrderId,
        fill: u64,
        filled: u64,
        total: u64,
    },

    #[error("Timelock invariant violated: dst private cancellation {dst} must be strictly before src private cancellation {src}")]
    TimelockInvariantViolation { dst: u64, src: u64 },

    #[error("Escrow identity mismatch on {side} chain: expected {expected}, observed {observed}")]
    EscrowIdentityMismatch {
        side: Side,
        expected: Hash32,
        observed: Hash32,
    },

    #[error("{operation} on {side} escrow not allowed in phase {phase}")]
    PhaseViolation {
        operation: &'static str,
        side: Side,
        phase: Phase,
    },

    #[error("Timed out after {waited_ms}ms waiting for confirmation of {tx_hash} on chain {chain_id}")]
    ConfirmationTimeout {
        chain_id: ChainId,
        tx_hash: Hash32,
        waited_ms: u64,
    },

    #[error("Invalid state transition for {subject} from {from} to {to}")]
    InvalidStateTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("Order {0} not found")]
    OrderNotFound(OrderId),

    #[error("Swap leg {0} not found")]
    LegNotFound(String),

    #[error("Chain {chain_id} error: {source}")]
    Chain {
        chain_id: ChainId,
        #[source]
        source: ChainError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    pub(crate) fn chain(chain_id: ChainId, source: ChainError) -> Self {
        SwapError::Chain { chain_id, source }
    }

    /// Check if the caller may safely try the same operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::PriceTooLow { .. }
                | SwapError::ConfirmationTimeout { .. }
                | SwapError::Chain {
                    source: ChainError::Transport(_),
                    ..
                }
        )
    }

    /// Check if the error means funds must not be trusted and the leg aborted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SwapError::TimelockInvariantViolation { .. } | SwapError::EscrowIdentityMismatch { .. }
        )
    }

    /// Check if the caller should move to the cancel/recover branch
    pub fn redirects_to_cancel(&self) -> bool {
        matches!(self, SwapError::PhaseViolation { .. }) || self.is_fatal()
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SwapError::Validation(_) => "validation",
            SwapError::PriceTooLow { .. } => "price_too_low",
            SwapError::IndexMismatch { .. } => "index_mismatch",
            SwapError::InvalidProof { .. } => "invalid_proof",
            SwapError::Overfill { .. } => "overfill",
            SwapError::TimelockInvariantViolation { .. } => "timelock_invariant",
            SwapError::EscrowIdentityMismatch { .. } => "escrow_identity",
            SwapError::PhaseViolation { .. } => "phase_violation",
            SwapError::ConfirmationTimeout { .. } => "confirmation_timeout",
            SwapError::InvalidStateTransition { .. } => "invalid_transition",
            SwapError::OrderNotFound(_) => "order_not_found",
            SwapError::LegNotFound(_) => "leg_not_found",
            SwapError::Chain { .. } => "chain",
            SwapError::Config(_) => "config",
            SwapError::Internal(_) => "internal",
        }
    }
}

/// Result type for coordinator operations
pub type SwapResult<T> = Result<T, SwapError>;
