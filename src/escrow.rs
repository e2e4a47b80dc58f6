//! Escrow records and deterministic escrow identity

use crate::timelock::{Phase, RecoveryPolicy, TimeLockSet, TimelockScheduler};
use crate::types::{keccak256, Address, ChainId, EscrowAddress, HashLock, Hash32, OrderId, Side};

use serde::Serialize;

/// Immutable escrow parameters fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Immutables {
    pub order_id: OrderId,
    pub hash_lock: HashLock,
    pub maker: Address,
    pub taker: Address,
    pub amount: u64,
    pub safety_deposit: u64,
    pub time_locks: TimeLockSet,
}

impl Immutables {
    /// Canonical encoding: 32-byte big-endian words, time locks packed at the end
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * 6 + 64 + 56);
        out.extend_from_slice(self.order_id.0.as_bytes());
        out.extend_from_slice(&self.hash_lock.encode());
        out.extend_from_slice(self.maker.as_bytes());
        out.extend_from_slice(self.taker.as_bytes());
        out.extend_from_slice(&word(self.amount));
        out.extend_from_slice(&word(self.safety_deposit));
        out.extend_from_slice(&self.time_locks.encode());
        out
    }
}

fn word(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

/// Expected escrow identity for `immutables` deployed at `deployed_at`
/// through the implementation identified by `implementation_id`.
pub fn derive_address(immutables: &Immutables, deployed_at: u64, implementation_id: &Hash32) -> EscrowAddress {
    let mut buf = immutables.encode();
    buf.extend_from_slice(&word(deployed_at));
    buf.extend_from_slice(implementation_id.as_bytes());
    keccak256(&buf)
}

/// Lifecycle of funds held in one escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EscrowStatus {
    Active,
    Withdrawn,
    Recovered,
}

/// A deployed escrow as tracked by the coordinator
#[derive(Debug, Clone)]
pub struct Escrow {
    pub id: EscrowAddress,
    pub chain: ChainId,
    pub side: Side,
    pub locked_amount: u64,
    pub safety_deposit: u64,
    pub immutables: Immutables,
    pub deployed_at: u64,
    /// Last phase observed on the escrow's chain; only moves forward
    pub phase: Phase,
    pub status: EscrowStatus,
}

impl Escrow {
    pub fn hash_lock(&self) -> &HashLock {
        &self.immutables.hash_lock
    }

    pub fn time_locks(&self) -> &TimeLockSet {
        &self.immutables.time_locks
    }

    pub fn scheduler(&self, policy: &RecoveryPolicy) -> TimelockScheduler {
        TimelockScheduler::new(self.side, self.immutables.time_locks, self.deployed_at, policy)
    }

    /// Compute the phase at `now` and record it if it advanced
    pub fn observe_phase(&mut self, now: u64, policy: &RecoveryPolicy) -> Phase {
        let phase = self.scheduler(policy).phase_at(now);
        if phase > self.phase {
            self.phase = phase;
        }
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn immutables() -> Immutables {
        Immutables {
            order_id: OrderId(Hash32([1u8; 32])),
            hash_lock: HashLock::Single(Hash32([2u8; 32])),
            maker: Hash32([3u8; 32]),
            taker: Hash32([4u8; 32]),
            amount: 100,
            safety_deposit: 10,
            time_locks: TimeLockSet {
                src_withdrawal: 1,
                src_public_withdrawal: 2,
                src_cancellation: 3,
                src_public_cancellation: 4,
                dst_withdrawal: 1,
                dst_public_withdrawal: 2,
                dst_cancellation: 3,
            },
        }
    }

    #[test]
    fn test_derive_is_deterministic() {
        let imm = immutables();
        let implementation = Hash32([9u8; 32]);
        assert_eq!(
            derive_address(&imm, 1_000, &implementation),
            derive_address(&imm, 1_000, &implementation)
        );
    }

    #[test]
    fn test_derive_binds_every_input() {
        let imm = immutables();
        let implementation = Hash32([9u8; 32]);
        let base = derive_address(&imm, 1_000, &implementation);

        assert_ne!(base, derive_address(&imm, 1_001, &implementation));
        assert_ne!(base, derive_address(&imm, 1_000, &Hash32([8u8; 32])));

        let mut other = imm;
        other.amount = 101;
        assert_ne!(base, derive_address(&other, 1_000, &implementation));

        let mut other = imm;
        other.hash_lock = HashLock::Merkle {
            root: Hash32([2u8; 32]),
            index: 0,
        };
        assert_ne!(base, derive_address(&other, 1_000, &implementation));

        let mut other = imm;
        other.time_locks.dst_cancellation = 2;
        assert_ne!(base, derive_address(&other, 1_000, &implementation));
    }

    #[test]
    fn test_observed_phase_is_monotonic() {
        let imm = immutables();
        let mut escrow = Escrow {
            id: Hash32::ZERO,
            chain: 1,
            side: Side::Src,
            locked_amount: imm.amount,
            safety_deposit: 0,
            immutables: imm,
            deployed_at: 100,
            phase: Phase::Locked,
            status: EscrowStatus::Active,
        };
        let policy = RecoveryPolicy::default();
        assert_eq!(escrow.observe_phase(103, &policy), Phase::ResolverCancellation);
        // A stale clock reading never moves the phase back
        assert_eq!(escrow.observe_phase(100, &policy), Phase::ResolverCancellation);
    }
}
