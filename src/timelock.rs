//! Timelock scheduling for source and destination escrows
//!
//! A `TimeLockSet` holds seven relative offsets. Anchored to the escrow's
//! chain-confirmed `deployed_at` they give the absolute phase boundaries:
//!
//! - src: private withdrawal, public withdrawal, private cancellation, public cancellation
//! - dst: private withdrawal, public withdrawal, private cancellation
//!
//! The maker-cancellation and expiry boundaries (and the dst public
//! cancellation) come from the `RecoveryPolicy`.

use crate::error::{SwapError, SwapResult};
use crate::types::Side;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Seven relative lock durations, in seconds from `deployed_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeLockSet {
    pub src_withdrawal: u64,
    pub src_public_withdrawal: u64,
    pub src_cancellation: u64,
    pub src_public_cancellation: u64,
    pub dst_withdrawal: u64,
    pub dst_public_withdrawal: u64,
    pub dst_cancellation: u64,
}

impl TimeLockSet {
    /// Check that each side's offsets do not go backwards
    pub fn validate(&self) -> SwapResult<()> {
        let src = [
            self.src_withdrawal,
            self.src_public_withdrawal,
            self.src_cancellation,
            self.src_public_cancellation,
        ];
        let dst = [
            self.dst_withdrawal,
            self.dst_public_withdrawal,
            self.dst_cancellation,
        ];
        if !src.windows(2).all(|w| w[0] <= w[1]) {
            return Err(SwapError::Validation(format!(
                "src timelock offsets must be non-decreasing: {:?}",
                src
            )));
        }
        if !dst.windows(2).all(|w| w[0] <= w[1]) {
            return Err(SwapError::Validation(format!(
                "dst timelock offsets must be non-decreasing: {:?}",
                dst
            )));
        }
        Ok(())
    }

    pub fn to_src(&self, deployed_at: u64) -> SrcTimelocks {
        SrcTimelocks {
            private_withdrawal: deployed_at.saturating_add(self.src_withdrawal),
            public_withdrawal: deployed_at.saturating_add(self.src_public_withdrawal),
            private_cancellation: deployed_at.saturating_add(self.src_cancellation),
            public_cancellation: deployed_at.saturating_add(self.src_public_cancellation),
        }
    }

    pub fn to_dst(&self, deployed_at: u64) -> DstTimelocks {
        DstTimelocks {
            private_withdrawal: deployed_at.saturating_add(self.dst_withdrawal),
            public_withdrawal: deployed_at.saturating_add(self.dst_public_withdrawal),
            private_cancellation: deployed_at.saturating_add(self.dst_cancellation),
        }
    }

    /// Seven offsets as big-endian words, used by escrow identity encoding
    pub fn encode(&self) -> [u8; 56] {
        let mut out = [0u8; 56];
        let words = [
            self.src_withdrawal,
            self.src_public_withdrawal,
            self.src_cancellation,
            self.src_public_cancellation,
            self.dst_withdrawal,
            self.dst_public_withdrawal,
            self.dst_cancellation,
        ];
        for (i, w) in words.iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&w.to_be_bytes());
        }
        out
    }
}

/// Absolute source boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcTimelocks {
    pub private_withdrawal: u64,
    pub public_withdrawal: u64,
    pub private_cancellation: u64,
    pub public_cancellation: u64,
}

/// Absolute destination boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstTimelocks {
    pub private_withdrawal: u64,
    pub public_withdrawal: u64,
    pub private_cancellation: u64,
}

/// Windows that have no dedicated offset in `TimeLockSet`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RecoveryPolicy {
    /// Seconds after private cancellation before the maker may recover
    pub maker_cancellation_delay_secs: u64,
    /// Seconds after dst private cancellation before anyone may recover dst
    pub dst_public_cancellation_delay_secs: u64,
    /// Seconds after public cancellation before an escrow counts as expired
    pub expiry_delay_secs: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            maker_cancellation_delay_secs: 30,
            dst_public_cancellation_delay_secs: 60,
            expiry_delay_secs: 3600,
        }
    }
}

/// Escrow lifecycle phases, in chronological order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Phase {
    Locked,
    ResolverExclusiveWithdrawal,
    PublicWithdrawal,
    ResolverCancellation,
    MakerCancellation,
    PublicCancellationIncentive,
    Expired,
}

impl Phase {
    pub fn allows_withdrawal(&self) -> bool {
        matches!(
            self,
            Phase::ResolverExclusiveWithdrawal | Phase::PublicWithdrawal
        )
    }

    pub fn is_cancellation(&self) -> bool {
        *self >= Phase::ResolverCancellation
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Party attempting a recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoverCaller {
    Resolver,
    Maker,
    Anyone,
}

impl RecoverCaller {
    /// First phase in which this caller may recover
    pub fn opens_at(&self) -> Phase {
        match self {
            RecoverCaller::Resolver => Phase::ResolverCancellation,
            RecoverCaller::Maker => Phase::MakerCancellation,
            RecoverCaller::Anyone => Phase::PublicCancellationIncentive,
        }
    }

    pub fn may_recover(&self, phase: Phase) -> bool {
        phase >= self.opens_at()
    }
}

/// Absolute boundaries of the full phase ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseBoundaries {
    pub private_withdrawal: u64,
    pub public_withdrawal: u64,
    pub private_cancellation: u64,
    pub maker_cancellation: u64,
    pub public_cancellation: u64,
    pub expiry: u64,
}

impl PhaseBoundaries {
    /// Phase at `now`; a boundary is entered when `now >= boundary`
    pub fn phase_at(&self, now: u64) -> Phase {
        let ladder = [
            (self.expiry, Phase::Expired),
            (self.public_cancellation, Phase::PublicCancellationIncentive),
            (self.maker_cancellation, Phase::MakerCancellation),
            (self.private_cancellation, Phase::ResolverCancellation),
            (self.public_withdrawal, Phase::PublicWithdrawal),
            (self.private_withdrawal, Phase::ResolverExclusiveWithdrawal),
        ];
        ladder
            .iter()
            .find(|(boundary, _)| now >= *boundary)
            .map(|(_, phase)| *phase)
            .unwrap_or(Phase::Locked)
    }
}

impl SrcTimelocks {
    pub fn boundaries(&self, policy: &RecoveryPolicy) -> PhaseBoundaries {
        let maker = self
            .private_cancellation
            .saturating_add(policy.maker_cancellation_delay_secs)
            .min(self.public_cancellation);
        PhaseBoundaries {
            private_withdrawal: self.private_withdrawal,
            public_withdrawal: self.public_withdrawal,
            private_cancellation: self.private_cancellation,
            maker_cancellation: maker,
            public_cancellation: self.public_cancellation,
            expiry: self
                .public_cancellation
                .saturating_add(policy.expiry_delay_secs),
        }
    }
}

impl DstTimelocks {
    pub fn boundaries(&self, policy: &RecoveryPolicy) -> PhaseBoundaries {
        let maker = self
            .private_cancellation
            .saturating_add(policy.maker_cancellation_delay_secs);
        let public = self
            .private_cancellation
            .saturating_add(policy.dst_public_cancellation_delay_secs)
            .max(maker);
        PhaseBoundaries {
            private_withdrawal: self.private_withdrawal,
            public_withdrawal: self.public_withdrawal,
            private_cancellation: self.private_cancellation,
            maker_cancellation: maker,
            public_cancellation: public,
            expiry: public.saturating_add(policy.expiry_delay_secs),
        }
    }
}

/// Phase schedule of one escrow
#[derive(Debug, Clone, Copy)]
pub struct TimelockScheduler {
    side: Side,
    time_locks: TimeLockSet,
    deployed_at: u64,
    boundaries: PhaseBoundaries,
}

impl TimelockScheduler {
    pub fn new(side: Side, time_locks: TimeLockSet, deployed_at: u64, policy: &RecoveryPolicy) -> Self {
        let boundaries = match side {
            Side::Src => time_locks.to_src(deployed_at).boundaries(policy),
            Side::Dst => time_locks.to_dst(deployed_at).boundaries(policy),
        };
        Self {
            side,
            time_locks,
            deployed_at,
            boundaries,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn deployed_at(&self) -> u64 {
        self.deployed_at
    }

    pub fn src(&self) -> SrcTimelocks {
        self.time_locks.to_src(self.deployed_at)
    }

    pub fn dst(&self) -> DstTimelocks {
        self.time_locks.to_dst(self.deployed_at)
    }

    pub fn boundaries(&self) -> &PhaseBoundaries {
        &self.boundaries
    }

    pub fn phase_at(&self, now: u64) -> Phase {
        self.boundaries.phase_at(now)
    }
}

/// Destination funds must become cancellable strictly before source funds,
/// otherwise a resolver could release the destination leg and then be unable
/// to claim the source leg.
pub fn validate_cross_chain_ordering(src: &SrcTimelocks, dst: &DstTimelocks) -> SwapResult<()> {
    if dst.private_cancellation < src.private_cancellation {
        Ok(())
    } else {
        Err(SwapError::TimelockInvariantViolation {
            dst: dst.private_cancellation,
            src: src.private_cancellation,
        })
    }
}
