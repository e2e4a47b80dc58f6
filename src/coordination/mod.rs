//! Swap coordination
//!
//! The coordinator:
//! 1. Announces orders and owns their secrets
//! 2. Prices and accepts fills against the Dutch auction and disclosure index
//! 3. Drives each fill's escrows through both ledgers
//! 4. Releases secrets only after both escrows are final, and recovers funds otherwise

pub mod engine;
pub mod state;

pub use engine::{
    AnnounceRequest, Bid, Disclosure, DstEscrowParams, FillAccepted, LegId, PendingStep, PendingTx,
    RecoverOutcome, SrcEscrowParams, SwapContext, SwapCoordinator, SwapLeg,
};
pub use state::{LegState, OrderState};
