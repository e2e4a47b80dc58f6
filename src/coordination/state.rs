//! Order and swap-leg state machines

use crate::error::{SwapError, SwapResult};

use serde::Serialize;
use std::fmt;

/// Order lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderState {
    Announced,
    AuctionActive,
    PartiallyFilled,
    FullyFilled,
}

impl OrderState {
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Announced, AuctionActive)
                | (AuctionActive, PartiallyFilled)
                | (AuctionActive, FullyFilled)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, FullyFilled)
        )
    }

    pub fn accepts_fills(&self) -> bool {
        !matches!(self, OrderState::FullyFilled)
    }
}

/// Per-fill swap leg lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LegState {
    Filled,
    SrcEscrowCreated,
    SafetyDeposited,
    DstEscrowCreated,
    FinalityElapsed,
    DstWithdrawn,
    SecretRevealed,
    SrcClaimed,
    Completed,
    CancelWindow,
    Cancelled,
    Recovered,
}

impl LegState {
    /// Position on the happy path, `None` for the cancel branch
    fn happy_path_rank(&self) -> Option<u8> {
        use LegState::*;
        let rank = match self {
            Filled => 0,
            SrcEscrowCreated => 1,
            SafetyDeposited => 2,
            DstEscrowCreated => 3,
            FinalityElapsed => 4,
            DstWithdrawn => 5,
            SecretRevealed => 6,
            SrcClaimed => 7,
            Completed => 8,
            CancelWindow | Cancelled | Recovered => return None,
        };
        Some(rank)
    }

    /// True once the happy path has reached `milestone`
    pub fn has_reached(&self, milestone: LegState) -> bool {
        match (self.happy_path_rank(), milestone.happy_path_rank()) {
            (Some(current), Some(target)) => current >= target,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LegState::Completed | LegState::Recovered)
    }

    pub fn is_cancel_branch(&self) -> bool {
        matches!(
            self,
            LegState::CancelWindow | LegState::Cancelled | LegState::Recovered
        )
    }

    pub fn can_transition_to(&self, next: LegState) -> bool {
        use LegState::*;
        match (self, next) {
            (Filled, SrcEscrowCreated)
            | (SrcEscrowCreated, SafetyDeposited)
            | (SrcEscrowCreated, DstEscrowCreated)
            | (SafetyDeposited, DstEscrowCreated)
            | (DstEscrowCreated, FinalityElapsed)
            | (FinalityElapsed, DstWithdrawn)
            | (DstWithdrawn, SecretRevealed)
            | (SecretRevealed, SrcClaimed)
            | (SrcClaimed, Completed) => true,
            (CancelWindow, Cancelled) | (CancelWindow, Recovered) | (Cancelled, Recovered) => true,
            // One escrow recovered while the other is still live
            (Cancelled, Cancelled) => true,
            (current, CancelWindow) => !current.is_terminal() && !current.is_cancel_branch(),
            _ => false,
        }
    }
}

impl fmt::Display for LegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error for a refused transition
pub fn invalid_transition(subject: impl ToString, from: impl fmt::Display, to: impl fmt::Display) -> SwapError {
    SwapError::InvalidStateTransition {
        subject: subject.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Check a leg transition without applying it
pub fn check_leg_transition(subject: impl ToString, from: LegState, to: LegState) -> SwapResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(invalid_transition(subject, from, to))
    }
}
