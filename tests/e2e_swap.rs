//! End-to-end swaps over two simulated ledgers

use futures::future::join_all;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use htlc_swap_coordinator::chain::{EscrowCall, EscrowLedger, SimulatedLedger};
use htlc_swap_coordinator::config::CoordinatorConfig;
use htlc_swap_coordinator::coordination::{
    AnnounceRequest, Bid, DstEscrowParams, FillAccepted, LegId, LegState, OrderState, RecoverOutcome,
    SrcEscrowParams, SwapContext, SwapCoordinator,
};
use htlc_swap_coordinator::escrow::{EscrowStatus, Immutables};
use htlc_swap_coordinator::timelock::{RecoverCaller, RecoveryPolicy, TimeLockSet};
use htlc_swap_coordinator::types::{EscrowAddress, Hash32, OrderId, Side};
use htlc_swap_coordinator::{SwapError, SwapResult};

const SRC_IMPL: Hash32 = Hash32([0xA1; 32]);
const DST_IMPL: Hash32 = Hash32([0xB2; 32]);
const MAKER: Hash32 = Hash32([0x11; 32]);
const RESOLVER: Hash32 = Hash32([0x22; 32]);
const GENESIS: u64 = 1_700_000_000;

struct Harness {
    src: Arc<SimulatedLedger>,
    dst: Arc<SimulatedLedger>,
    coordinator: SwapCoordinator,
}

fn time_locks() -> TimeLockSet {
    TimeLockSet {
        src_withdrawal: 10,
        src_public_withdrawal: 120,
        src_cancellation: 200,
        src_public_cancellation: 300,
        dst_withdrawal: 10,
        dst_public_withdrawal: 100,
        dst_cancellation: 150,
    }
}

fn harness() -> Harness {
    let policy = RecoveryPolicy::default();
    let src = Arc::new(SimulatedLedger::new(1, SRC_IMPL, policy, GENESIS));
    let dst = Arc::new(SimulatedLedger::new(2, DST_IMPL, policy, GENESIS));
    let config = CoordinatorConfig {
        confirmation_timeout_ms: 200,
        confirmation_poll_ms: 1,
        max_parts: 64,
        src_implementation: SRC_IMPL,
        dst_implementation: DST_IMPL,
        recovery: policy,
        ..CoordinatorConfig::default()
    };
    let coordinator = SwapCoordinator::new(SwapContext::new(src.clone(), dst.clone(), config));
    Harness {
        src,
        dst,
        coordinator,
    }
}

fn announce_request(total_amount: u64, parts_count: u32) -> AnnounceRequest {
    AnnounceRequest {
        maker: MAKER,
        total_amount,
        start_price: 1_000,
        reserve_price: 900,
        auction_duration_secs: 100,
        parts_count,
    }
}

impl Harness {
    /// Fill `amount` at the current price and lock both escrows
    async fn open_leg(&self, order_id: OrderId, amount: u64, multi: bool) -> LegId {
        let leg_id = assert_ok!(self.fill(order_id, amount, multi).await).leg_id;
        self.lock_src(leg_id).await;
        let immutables = assert_ok!(self.coordinator.dst_immutables(leg_id, 10, time_locks()).await);
        assert_ok!(self.create_dst(leg_id, immutables).await);
        leg_id
    }

    async fn fill(&self, order_id: OrderId, amount: u64, multi: bool) -> SwapResult<FillAccepted> {
        let c = &self.coordinator;
        let price = c.current_price(order_id).await?;
        let disclosure = if multi {
            Some(c.disclosure_for(order_id, amount).await?)
        } else {
            None
        };
        c.fill(
            order_id,
            Bid {
                amount,
                price,
                resolver: RESOLVER,
                disclosure,
            },
        )
        .await
    }

    /// Source escrow plus safety deposit
    async fn lock_src(&self, leg_id: LegId) {
        let c = &self.coordinator;
        let amount = assert_ok!(c.leg(leg_id).await).fill.fill_amount;
        assert_ok!(
            c.create_src_escrow(
                leg_id,
                SrcEscrowParams {
                    amount,
                    time_locks: time_locks(),
                    resolver: RESOLVER,
                },
            )
            .await
        );
        assert_ok!(c.add_safety_deposit(leg_id, 10).await);
    }

    async fn create_dst(&self, leg_id: LegId, immutables: Immutables) -> SwapResult<EscrowAddress> {
        let c = &self.coordinator;
        let leg = c.leg(leg_id).await?;
        let src_cancellation = leg.src.as_ref().map(|e| e.deployed_at).unwrap() + time_locks().src_cancellation;
        let planned = c.context().now(Side::Dst).await?;
        c.create_dst_escrow(
            leg_id,
            DstEscrowParams {
                immutables,
                planned_deployed_at: planned,
            },
            src_cancellation,
        )
        .await
    }

    async fn advance(&self, secs: u64) {
        self.src.advance_time(secs).await;
        self.dst.advance_time(secs).await;
    }

    /// Release the secret, withdraw the destination and claim the source
    async fn settle(&self, leg_id: LegId) {
        let c = &self.coordinator;
        assert!(assert_ok!(c.check_finality(leg_id).await));
        let secret = assert_ok!(c.release_secret(leg_id).await);
        let unlock = assert_ok!(c.unlock_for(leg_id, secret).await);
        let observed = assert_ok!(c.withdraw(Side::Dst, leg_id, unlock).await);
        assert_ok!(c.claim_src(leg_id, observed).await);
    }
}

#[tokio::test]
async fn test_single_fill_swap_completes() {
    let h = harness();
    let order_id = assert_ok!(h.coordinator.announce(announce_request(100, 0)).await);
    assert_eq!(assert_ok!(h.coordinator.order_state(order_id).await), OrderState::Announced);

    let leg_id = h.open_leg(order_id, 100, false).await;
    assert_eq!(assert_ok!(h.coordinator.leg(leg_id).await).state, LegState::DstEscrowCreated);

    // Secret stays with the coordinator until both escrows are past finality
    assert_err!(h.coordinator.release_secret(leg_id).await);

    h.advance(11).await;
    h.settle(leg_id).await;

    let leg = assert_ok!(h.coordinator.leg(leg_id).await);
    assert_eq!(leg.state, LegState::Completed);
    let src_escrow = leg.src.as_ref().map(|e| e.id).unwrap();
    let dst_escrow = leg.dst.as_ref().map(|e| e.id).unwrap();
    assert_eq!(h.src.escrow_status(&src_escrow).await, Some(EscrowStatus::Withdrawn));
    assert_eq!(h.dst.escrow_status(&dst_escrow).await, Some(EscrowStatus::Withdrawn));
    assert_eq!(assert_ok!(h.coordinator.order_state(order_id).await), OrderState::FullyFilled);
}

#[tokio::test]
async fn test_partial_fills_disclose_increasing_indices() {
    let h = harness();
    let order_id = assert_ok!(h.coordinator.announce(announce_request(100_000_000, 10)).await);

    let first = h.open_leg(order_id, 10_000_000, true).await;
    let second = h.open_leg(order_id, 10_000_000, true).await;

    let fills = assert_ok!(h.coordinator.fills(order_id).await);
    let indices: Vec<u32> = fills.iter().map(|f| f.disclosed_index).collect();
    assert_eq!(indices, vec![2, 3]);
    assert_eq!(fills[1].cumulative_filled, 20_000_000);
    assert_eq!(h.src.filled_amount(&order_id).await, Some(20_000_000));
    assert_eq!(assert_ok!(h.coordinator.order_state(order_id).await), OrderState::PartiallyFilled);

    // Each leg settles with its own secret
    h.advance(11).await;
    h.settle(first).await;
    h.settle(second).await;

    let legs = assert_ok!(h.coordinator.legs(order_id).await);
    assert!(legs.iter().all(|leg| leg.state == LegState::Completed));
    assert_ne!(legs[0].revealed_secret, legs[1].revealed_secret);
}

#[tokio::test]
async fn test_cancelled_leg_recovers_both_escrows() {
    let h = harness();
    let order_id = assert_ok!(h.coordinator.announce(announce_request(100, 0)).await);
    let leg_id = h.open_leg(order_id, 100, false).await;

    // Too early for the resolver to cancel
    let early = h.coordinator.recover(Side::Dst, leg_id, RecoverCaller::Resolver).await;
    assert!(matches!(early, Err(SwapError::PhaseViolation { .. })));

    h.advance(151).await;
    let outcome = assert_ok!(h.coordinator.recover(Side::Dst, leg_id, RecoverCaller::Resolver).await);
    assert_eq!(outcome, RecoverOutcome::Recovered);
    assert_eq!(assert_ok!(h.coordinator.leg(leg_id).await).state, LegState::Cancelled);

    h.advance(50).await;
    let outcome = assert_ok!(h.coordinator.recover(Side::Src, leg_id, RecoverCaller::Resolver).await);
    assert_eq!(outcome, RecoverOutcome::Recovered);

    let leg = assert_ok!(h.coordinator.leg(leg_id).await);
    assert_eq!(leg.state, LegState::Recovered);
    let src_escrow = leg.src.as_ref().map(|e| e.id).unwrap();
    assert_eq!(h.src.escrow_status(&src_escrow).await, Some(EscrowStatus::Recovered));

    let again = assert_ok!(h.coordinator.recover(Side::Src, leg_id, RecoverCaller::Resolver).await);
    assert_eq!(again, RecoverOutcome::AlreadyRecovered);

    // Recovered funds can no longer be withdrawn
    assert_err!(h.coordinator.release_secret(leg_id).await);
}

#[tokio::test]
async fn test_recovery_raced_by_maker_is_idempotent() {
    let h = harness();
    let order_id = assert_ok!(h.coordinator.announce(announce_request(100, 0)).await);
    let leg_id = h.open_leg(order_id, 100, false).await;
    let dst_escrow = assert_ok!(h.coordinator.leg(leg_id).await).dst.map(|e| e.id).unwrap();

    // Past the maker's window on the destination
    h.advance(150 + RecoveryPolicy::default().maker_cancellation_delay_secs + 1).await;
    assert_ok!(
        h.dst
            .submit(EscrowCall::Recover {
                escrow: dst_escrow,
                caller: RecoverCaller::Maker,
            })
            .await
    );

    let outcome = assert_ok!(h.coordinator.recover(Side::Dst, leg_id, RecoverCaller::Resolver).await);
    assert_eq!(outcome, RecoverOutcome::AlreadyRecovered);
    assert_eq!(assert_ok!(h.coordinator.leg(leg_id).await).state, LegState::Cancelled);
}

#[tokio::test]
async fn test_concurrent_orders_settle_independently() {
    let h = harness();

    let order_ids: Vec<OrderId> = join_all((0..4).map(|_| h.coordinator.announce(announce_request(1_000, 4))))
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let mut unique = order_ids.clone();
    unique.sort_by_key(|id| id.0);
    unique.dedup();
    assert_eq!(unique.len(), 4);

    let legs: Vec<LegId> = join_all(order_ids.iter().map(|id| h.open_leg(*id, 500, true))).await;

    h.advance(11).await;
    join_all(legs.iter().map(|leg_id| h.settle(*leg_id))).await;

    for order_id in &order_ids {
        let legs = assert_ok!(h.coordinator.legs(*order_id).await);
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].state, LegState::Completed);
        assert_eq!(assert_ok!(h.coordinator.order_state(*order_id).await), OrderState::PartiallyFilled);
    }
}

#[tokio::test]
async fn test_dst_escrow_must_match_accepted_fill() {
    let h = harness();
    let order_id = assert_ok!(h.coordinator.announce(announce_request(100, 0)).await);
    let leg_id = assert_ok!(h.fill(order_id, 100, false).await).leg_id;
    h.lock_src(leg_id).await;

    let src_escrow = assert_ok!(h.coordinator.leg(leg_id).await).src.map(|e| e.id).unwrap();
    assert_eq!(h.src.escrow_deposit(&src_escrow).await, Some(10));

    let immutables = assert_ok!(h.coordinator.dst_immutables(leg_id, 10, time_locks()).await);
    let underfunded = Immutables {
        amount: 99,
        ..immutables
    };
    let foreign_taker = Immutables {
        taker: Hash32([0x33; 32]),
        ..immutables
    };
    for bad in [underfunded, foreign_taker] {
        let err = h.create_dst(leg_id, bad).await.unwrap_err();
        assert!(matches!(err, SwapError::Validation(_)), "{}", err);
    }
    let leg = assert_ok!(h.coordinator.leg(leg_id).await);
    assert_eq!(leg.state, LegState::SafetyDeposited);
    assert!(leg.dst.is_none());

    // The matching escrow still goes through
    assert_ok!(h.create_dst(leg_id, immutables).await);
    h.advance(11).await;
    h.settle(leg_id).await;
    assert_eq!(assert_ok!(h.coordinator.leg(leg_id).await).state, LegState::Completed);
}

#[tokio::test]
async fn test_fill_confirmed_after_timeout_is_resumed() {
    let h = harness();
    let order_id = assert_ok!(h.coordinator.announce(announce_request(100_000_000, 10)).await);

    h.src.withhold_receipts(true).await;
    let err = h.fill(order_id, 10_000_000, true).await.unwrap_err();
    assert!(matches!(err, SwapError::ConfirmationTimeout { .. }), "{}", err);
    assert_eq!(h.src.filled_amount(&order_id).await, Some(10_000_000));
    assert!(assert_ok!(h.coordinator.fills(order_id).await).is_empty());

    // No further fill while the first one is unaccounted for
    assert_err!(h.coordinator.disclosure_for(order_id, 10_000_000).await);

    h.src.withhold_receipts(false).await;
    h.src.release_receipts().await;
    let accepted = assert_ok!(h.coordinator.resume_fill(order_id).await);
    assert_eq!(accepted.accepted_index, 2);
    assert_eq!(accepted.record.cumulative_filled, 10_000_000);
    assert_eq!(assert_ok!(h.coordinator.order_state(order_id).await), OrderState::PartiallyFilled);

    let leg_id = accepted.leg_id;
    h.lock_src(leg_id).await;
    let immutables = assert_ok!(h.coordinator.dst_immutables(leg_id, 10, time_locks()).await);
    assert_ok!(h.create_dst(leg_id, immutables).await);

    // The next fill picks up where the resumed one left off
    let next = assert_ok!(h.fill(order_id, 10_000_000, true).await);
    assert_eq!(next.accepted_index, 3);

    h.advance(11).await;
    h.settle(leg_id).await;
    assert_eq!(assert_ok!(h.coordinator.leg(leg_id).await).state, LegState::Completed);
}

#[tokio::test]
async fn test_dst_escrow_confirmed_after_timeout_is_recoverable() {
    let h = harness();
    let order_id = assert_ok!(h.coordinator.announce(announce_request(100, 0)).await);
    let leg_id = assert_ok!(h.fill(order_id, 100, false).await).leg_id;
    h.lock_src(leg_id).await;

    h.dst.withhold_receipts(true).await;
    let immutables = assert_ok!(h.coordinator.dst_immutables(leg_id, 10, time_locks()).await);
    let err = h.create_dst(leg_id, immutables).await.unwrap_err();
    assert!(matches!(err, SwapError::ConfirmationTimeout { .. }), "{}", err);

    let leg = assert_ok!(h.coordinator.leg(leg_id).await);
    assert_eq!(leg.state, LegState::SafetyDeposited);
    assert!(matches!(leg.pending.as_ref().map(|p| p.side), Some(Side::Dst)));

    // Nothing else moves until the escrow is accounted for
    h.advance(151).await;
    let blocked = h.coordinator.recover(Side::Dst, leg_id, RecoverCaller::Resolver).await;
    assert!(matches!(blocked, Err(SwapError::Validation(_))));
    assert_err!(h.create_dst(leg_id, immutables).await);

    h.dst.withhold_receipts(false).await;
    h.dst.release_receipts().await;
    assert_eq!(assert_ok!(h.coordinator.resume(leg_id).await), LegState::DstEscrowCreated);
    let dst_escrow = assert_ok!(h.coordinator.leg(leg_id).await).dst.map(|e| e.id).unwrap();
    assert_eq!(h.dst.escrow_status(&dst_escrow).await, Some(EscrowStatus::Active));

    let outcome = assert_ok!(h.coordinator.recover(Side::Dst, leg_id, RecoverCaller::Resolver).await);
    assert_eq!(outcome, RecoverOutcome::Recovered);
    h.advance(50).await;
    let outcome = assert_ok!(h.coordinator.recover(Side::Src, leg_id, RecoverCaller::Resolver).await);
    assert_eq!(outcome, RecoverOutcome::Recovered);

    assert_eq!(assert_ok!(h.coordinator.leg(leg_id).await).state, LegState::Recovered);
    assert_eq!(h.dst.escrow_status(&dst_escrow).await, Some(EscrowStatus::Recovered));
}

#[tokio::test]
async fn test_dst_withdrawal_confirmed_after_timeout_lets_source_be_claimed() {
    let h = harness();
    let order_id = assert_ok!(h.coordinator.announce(announce_request(100, 0)).await);
    let leg_id = h.open_leg(order_id, 100, false).await;
    h.advance(11).await;

    let c = &h.coordinator;
    assert!(assert_ok!(c.check_finality(leg_id).await));
    let secret = assert_ok!(c.release_secret(leg_id).await);
    let unlock = assert_ok!(c.unlock_for(leg_id, secret.clone()).await);

    h.dst.withhold_receipts(true).await;
    let err = c.withdraw(Side::Dst, leg_id, unlock.clone()).await.unwrap_err();
    assert!(matches!(err, SwapError::ConfirmationTimeout { .. }), "{}", err);
    assert_eq!(assert_ok!(c.leg(leg_id).await).state, LegState::FinalityElapsed);

    // Retrying would submit a second withdrawal of a spent escrow
    let retry = c.withdraw(Side::Dst, leg_id, unlock).await;
    assert!(matches!(retry, Err(SwapError::Validation(_))));
    assert_err!(c.claim_src(leg_id, secret).await);

    h.dst.withhold_receipts(false).await;
    h.dst.release_receipts().await;
    assert_eq!(assert_ok!(c.resume(leg_id).await), LegState::SecretRevealed);

    let leg = assert_ok!(c.leg(leg_id).await);
    let observed = leg.revealed_secret.clone().unwrap();
    assert_ok!(c.claim_src(leg_id, observed).await);

    let leg = assert_ok!(c.leg(leg_id).await);
    assert_eq!(leg.state, LegState::Completed);
    let dst_escrow = leg.dst.as_ref().map(|e| e.id).unwrap();
    assert_eq!(h.dst.escrow_status(&dst_escrow).await, Some(EscrowStatus::Withdrawn));
}
