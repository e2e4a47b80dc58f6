//! HTLC swap coordinator
//!
//! Coordinates cross-chain atomic swaps between two independently operated
//! ledgers using hashed-timelock escrows, Dutch-auction pricing and
//! Merkle-indexed secrets for partial fills.

pub mod auction;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod escrow;
pub mod merkle;
pub mod metrics;
pub mod rehearsal;
pub mod timelock;
pub mod types;

pub use coordination::{SwapContext, SwapCoordinator};
pub use error::{ChainError, SwapError, SwapResult};
