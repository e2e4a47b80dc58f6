//! In-memory escrow ledger
//!
//! Behaves like the deployed escrow contracts from the coordinator's point of
//! view: every accepted call mines one block, time only moves through block
//! production or `advance_time`, and the contract rules (auction price,
//! disclosure index, cancellation ordering, withdrawal and recovery windows)
//! are enforced on-chain style by rejecting the call.

use super::{
    AnnounceOrderRequest, CallOutcome, CreateEscrowDstRequest, CreateEscrowSrcRequest,
    EscrowCall, EscrowLedger, FillOrderPartialRequest, FillOrderRequest, Receipt, Unlock,
};
use crate::auction::AuctionCurve;
use crate::error::ChainError;
use crate::escrow::{derive_address, EscrowStatus, Immutables};
use crate::merkle::expected_index;
use crate::timelock::{RecoverCaller, RecoveryPolicy, TimelockScheduler};
use crate::types::{
    keccak256, Address, ChainId, EscrowAddress, Hash32, HashLock, HashLockCommitment, OrderId,
    Side, TxHash,
};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Order as stored by the simulated contract
#[derive(Debug, Clone)]
struct StoredOrder {
    maker: Address,
    commitment: HashLockCommitment,
    curve: AuctionCurve,
    total_amount: u64,
    filled_amount: u64,
    last_index: Option<u32>,
}

/// Escrow as stored by the simulated contract
#[derive(Debug, Clone)]
struct StoredEscrow {
    side: Side,
    immutables: Immutables,
    deployed_at: u64,
    deposit: u64,
    status: EscrowStatus,
}

#[derive(Debug, Default)]
struct LedgerState {
    block_number: u64,
    timestamp: u64,
    tx_count: u64,
    order_nonce: u64,
    orders: HashMap<OrderId, StoredOrder>,
    escrows: HashMap<EscrowAddress, StoredEscrow>,
    receipts: HashMap<TxHash, Receipt>,
    /// Included but not yet visible to `receipt`
    withheld: Vec<Receipt>,
    withhold_receipts: bool,
}

/// Seconds added to the clock by every mined block
const BLOCK_TIME_SECS: u64 = 1;

/// Simulated escrow-contract ledger
pub struct SimulatedLedger {
    chain_id: ChainId,
    implementation_id: Hash32,
    policy: RecoveryPolicy,
    state: RwLock<LedgerState>,
}

impl SimulatedLedger {
    /// Create a ledger whose clock starts at `genesis_timestamp`
    pub fn new(
        chain_id: ChainId,
        implementation_id: Hash32,
        policy: RecoveryPolicy,
        genesis_timestamp: u64,
    ) -> Self {
        let state = LedgerState {
            timestamp: genesis_timestamp,
            ..LedgerState::default()
        };
        Self {
            chain_id,
            implementation_id,
            policy,
            state: RwLock::new(state),
        }
    }

    /// Move the chain clock forward without mining
    pub async fn advance_time(&self, secs: u64) {
        let mut state = self.state.write().await;
        state.timestamp = state.timestamp.saturating_add(secs);
        debug!("Chain {} clock advanced to {}", self.chain_id, state.timestamp);
    }

    /// Keep new receipts hidden until `release_receipts`
    pub async fn withhold_receipts(&self, withhold: bool) {
        self.state.write().await.withhold_receipts = withhold;
    }

    /// Publish every withheld receipt
    pub async fn release_receipts(&self) {
        let mut state = self.state.write().await;
        let withheld: Vec<Receipt> = state.withheld.drain(..).collect();
        for receipt in withheld {
            state.receipts.insert(receipt.tx_hash, receipt);
        }
    }

    pub async fn escrow_status(&self, escrow: &EscrowAddress) -> Option<EscrowStatus> {
        self.state.read().await.escrows.get(escrow).map(|e| e.status)
    }

    pub async fn escrow_deposit(&self, escrow: &EscrowAddress) -> Option<u64> {
        self.state.read().await.escrows.get(escrow).map(|e| e.deposit)
    }

    pub async fn filled_amount(&self, order_id: &OrderId) -> Option<u64> {
        self.state
            .read()
            .await
            .orders
            .get(order_id)
            .map(|o| o.filled_amount)
    }

    fn execute(&self, state: &mut LedgerState, call: EscrowCall) -> Result<CallOutcome, ChainError> {
        call.validate().map_err(|e| reject(e.to_string()))?;
        // The call executes in the block it is mined in
        let now = state.timestamp.saturating_add(BLOCK_TIME_SECS);

        match call {
            EscrowCall::AnnounceOrder(req) => self.announce(state, req, now),
            EscrowCall::AuctionTick { order_id } => {
                let order = find_order(state, &order_id)?;
                Ok(CallOutcome::AuctionTicked {
                    price: order.curve.price(now),
                })
            }
            EscrowCall::FillOrder(req) => fill_full(state, req, now),
            EscrowCall::FillOrderPartial(req) => fill_partial(state, req, now),
            EscrowCall::CreateEscrowSrc(req) => self.create_src(state, req, now),
            EscrowCall::CreateEscrowDst(req) => self.create_dst(state, req, now),
            EscrowCall::AddSafetyDeposit { escrow, amount } => {
                let stored = find_escrow(state, &escrow)?;
                if stored.status != EscrowStatus::Active {
                    return Err(reject("escrow is not active"));
                }
                stored.deposit = stored.deposit.saturating_add(amount);
                Ok(CallOutcome::SafetyDepositAdded {
                    total: stored.deposit,
                })
            }
            EscrowCall::Withdraw { escrow, unlock } => self.withdraw(state, escrow, unlock, now),
            EscrowCall::Recover { escrow, caller } => self.recover(state, escrow, caller, now),
        }
    }

    fn announce(
        &self,
        state: &mut LedgerState,
        req: AnnounceOrderRequest,
        now: u64,
    ) -> Result<CallOutcome, ChainError> {
        state.order_nonce += 1;
        let mut seed = Vec::with_capacity(48);
        seed.extend_from_slice(&self.chain_id.to_be_bytes());
        seed.extend_from_slice(&state.order_nonce.to_be_bytes());
        seed.extend_from_slice(req.maker.as_bytes());
        let order_id = OrderId(keccak256(&seed));

        state.orders.insert(
            order_id,
            StoredOrder {
                maker: req.maker,
                commitment: req.commitment,
                curve: AuctionCurve {
                    start_price: req.start_price,
                    reserve_price: req.reserve_price,
                    start_time: now,
                    duration: req.duration_secs,
                },
                total_amount: req.total_amount,
                filled_amount: 0,
                last_index: None,
            },
        );
        Ok(CallOutcome::OrderAnnounced { order_id })
    }

    fn create_src(
        &self,
        state: &mut LedgerState,
        req: CreateEscrowSrcRequest,
        now: u64,
    ) -> Result<CallOutcome, ChainError> {
        let order = find_order(state, &req.order_id)?;
        let lock_ok = match (&order.commitment, &req.hash_lock) {
            (HashLockCommitment::Single { hash }, HashLock::Single(lock)) => hash == lock,
            (HashLockCommitment::Multi { merkle_root, .. }, HashLock::Merkle { root, .. }) => {
                merkle_root == root
            }
            _ => false,
        };
        if !lock_ok {
            return Err(reject("hash lock does not match order commitment"));
        }
        if order.maker != req.maker {
            return Err(reject("maker does not match order"));
        }

        let immutables = Immutables {
            order_id: req.order_id,
            hash_lock: req.hash_lock,
            maker: req.maker,
            taker: req.resolver,
            amount: req.amount,
            safety_deposit: 0,
            time_locks: req.time_locks,
        };
        self.deploy(state, Side::Src, immutables, 0, now)
    }

    fn create_dst(
        &self,
        state: &mut LedgerState,
        req: CreateEscrowDstRequest,
        now: u64,
    ) -> Result<CallOutcome, ChainError> {
        let dst_cancellation = req.time_locks.to_dst(now).private_cancellation;
        if dst_cancellation >= req.src_cancellation_timestamp {
            return Err(reject(format!(
                "invalid creation time: dst cancellation {} not before src cancellation {}",
                dst_cancellation, req.src_cancellation_timestamp
            )));
        }

        let immutables = Immutables {
            order_id: req.source_order,
            hash_lock: req.hash_lock,
            maker: req.maker,
            taker: req.resolver,
            amount: req.amount,
            safety_deposit: req.safety_deposit,
            time_locks: req.time_locks,
        };
        self.deploy(state, Side::Dst, immutables, req.safety_deposit, now)
    }

    fn deploy(
        &self,
        state: &mut LedgerState,
        side: Side,
        immutables: Immutables,
        deposit: u64,
        now: u64,
    ) -> Result<CallOutcome, ChainError> {
        let escrow = derive_address(&immutables, now, &self.implementation_id);
        if state.escrows.contains_key(&escrow) {
            return Err(reject("escrow already deployed"));
        }
        state.escrows.insert(
            escrow,
            StoredEscrow {
                side,
                immutables,
                deployed_at: now,
                deposit,
                status: EscrowStatus::Active,
            },
        );
        info!(
            "Chain {} deployed {} escrow {} locking {}",
            self.chain_id, side, escrow, immutables.amount
        );
        Ok(CallOutcome::EscrowCreated { escrow })
    }

    fn withdraw(
        &self,
        state: &mut LedgerState,
        escrow: EscrowAddress,
        unlock: Unlock,
        now: u64,
    ) -> Result<CallOutcome, ChainError> {
        let policy = self.policy;
        let stored = find_escrow(state, &escrow)?;
        if stored.status != EscrowStatus::Active {
            return Err(reject(format!("escrow is {:?}", stored.status)));
        }
        let phase = TimelockScheduler::new(stored.side, stored.immutables.time_locks, stored.deployed_at, &policy)
            .phase_at(now);
        if !phase.allows_withdrawal() {
            return Err(reject(format!("withdrawal not allowed in phase {}", phase)));
        }
        if !unlock.matches(&stored.immutables.hash_lock) {
            return Err(reject("invalid secret"));
        }
        stored.status = EscrowStatus::Withdrawn;
        Ok(CallOutcome::Withdrawn {
            secret: unlock.secret().clone(),
        })
    }

    fn recover(
        &self,
        state: &mut LedgerState,
        escrow: EscrowAddress,
        caller: RecoverCaller,
        now: u64,
    ) -> Result<CallOutcome, ChainError> {
        let policy = self.policy;
        let stored = find_escrow(state, &escrow)?;
        match stored.status {
            EscrowStatus::Recovered => return Err(ChainError::AlreadyRecovered),
            EscrowStatus::Withdrawn => return Err(reject("escrow already withdrawn")),
            EscrowStatus::Active => {}
        }
        let phase = TimelockScheduler::new(stored.side, stored.immutables.time_locks, stored.deployed_at, &policy)
            .phase_at(now);
        if !caller.may_recover(phase) {
            return Err(reject(format!("{:?} may not recover in phase {}", caller, phase)));
        }
        stored.status = EscrowStatus::Recovered;
        Ok(CallOutcome::Recovered)
    }
}

fn reject(reason: impl Into<String>) -> ChainError {
    ChainError::Rejected {
        reason: reason.into(),
    }
}

fn find_order<'a>(state: &'a mut LedgerState, order_id: &OrderId) -> Result<&'a mut StoredOrder, ChainError> {
    state
        .orders
        .get_mut(order_id)
        .ok_or_else(|| ChainError::UnknownObject {
            id: order_id.0.to_string(),
        })
}

fn find_escrow<'a>(
    state: &'a mut LedgerState,
    escrow: &EscrowAddress,
) -> Result<&'a mut StoredEscrow, ChainError> {
    state
        .escrows
        .get_mut(escrow)
        .ok_or_else(|| ChainError::UnknownObject {
            id: escrow.to_string(),
        })
}

fn fill_full(state: &mut LedgerState, req: FillOrderRequest, now: u64) -> Result<CallOutcome, ChainError> {
    let order = find_order(state, &req.order_id)?;
    if !matches!(order.commitment, HashLockCommitment::Single { .. }) {
        return Err(reject("order requires partial fills"));
    }
    if order.filled_amount != 0 {
        return Err(reject("order already filled"));
    }
    let price = order.curve.price(now);
    if req.bid_price < price {
        return Err(reject(format!("bid {} below price {}", req.bid_price, price)));
    }
    order.filled_amount = order.total_amount;
    Ok(CallOutcome::OrderFilled {
        fill_amount: order.total_amount,
        disclosed_index: 0,
    })
}

fn fill_partial(
    state: &mut LedgerState,
    req: FillOrderPartialRequest,
    now: u64,
) -> Result<CallOutcome, ChainError> {
    let order = find_order(state, &req.order_id)?;
    let (root, parts) = match order.commitment {
        HashLockCommitment::Multi {
            merkle_root,
            leaf_count,
        } => (merkle_root, leaf_count.saturating_sub(1)),
        HashLockCommitment::Single { .. } => return Err(reject("order does not allow partial fills")),
    };

    let remaining = order.total_amount - order.filled_amount;
    if req.fill_amount > remaining {
        return Err(reject("fill exceeds remaining amount"));
    }
    let price = order.curve.price(now);
    if req.bid_price < price {
        return Err(reject(format!("bid {} below price {}", req.bid_price, price)));
    }
    let expected = expected_index(order.total_amount, remaining, req.fill_amount, parts);
    if req.disclosed_index != expected {
        return Err(reject(format!(
            "invalid secret index: expected {}, got {}",
            expected, req.disclosed_index
        )));
    }
    if order.last_index.map_or(false, |last| expected < last) {
        return Err(reject("secret index went backwards"));
    }
    if !req.proof.verify_secret_hash(&root, &req.disclosed_hash) {
        return Err(reject("invalid merkle proof"));
    }

    order.filled_amount += req.fill_amount;
    order.last_index = Some(expected);
    Ok(CallOutcome::OrderFilled {
        fill_amount: req.fill_amount,
        disclosed_index: expected,
    })
}

#[async_trait]
impl EscrowLedger for SimulatedLedger {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn submit(&self, call: EscrowCall) -> Result<TxHash, ChainError> {
        let name = call.name();
        let mut state = self.state.write().await;

        let outcome = match self.execute(&mut state, call) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Chain {} rejected {}: {}", self.chain_id, name, e);
                return Err(e);
            }
        };

        state.block_number += 1;
        state.timestamp = state.timestamp.saturating_add(BLOCK_TIME_SECS);
        state.tx_count += 1;

        let mut seed = [0u8; 16];
        seed[..8].copy_from_slice(&self.chain_id.to_be_bytes());
        seed[8..].copy_from_slice(&state.tx_count.to_be_bytes());
        let tx_hash = keccak256(&seed);

        let receipt = Receipt {
            tx_hash,
            block_number: state.block_number,
            block_timestamp: state.timestamp,
            outcome,
        };
        debug!(
            "Chain {} included {} as {} in block {}",
            self.chain_id, name, tx_hash, state.block_number
        );
        if state.withhold_receipts {
            state.withheld.push(receipt);
        } else {
            state.receipts.insert(tx_hash, receipt);
        }
        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        Ok(self.state.read().await.receipts.get(&tx_hash).cloned())
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.state.read().await.block_number)
    }

    async fn block_timestamp(&self) -> Result<u64, ChainError> {
        Ok(self.state.read().await.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::MerkleSecretIndex;
    use crate::timelock::TimeLockSet;
    use crate::types::Secret;

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

    fn ledger() -> SimulatedLedger {
        SimulatedLedger::new(1, Hash32([0xEE; 32]), RecoveryPolicy::default(), 1_000)
    }

    async fn outcome(ledger: &SimulatedLedger, call: EscrowCall) -> CallOutcome {
        let tx = ledger.submit(call).await.unwrap();
        ledger.receipt(tx).await.unwrap().unwrap().outcome
    }

    async fn announce_single(ledger: &SimulatedLedger, secret: &Secret) -> OrderId {
        let call = EscrowCall::AnnounceOrder(AnnounceOrderRequest {
            maker: Hash32([1u8; 32]),
            commitment: HashLockCommitment::Single { hash: secret.hash() },
            total_amount: 100,
            start_price: 1_000,
            reserve_price: 900,
            duration_secs: 100,
        });
        match outcome(ledger, call).await {
            CallOutcome::OrderAnnounced { order_id } => order_id,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_each_call_mines_a_block() {
        let ledger = ledger();
        let secret = Secret([3u8; 32]);
        announce_single(&ledger, &secret).await;
        assert_eq!(ledger.block_number().await.unwrap(), 1);
        assert_eq!(ledger.block_timestamp().await.unwrap(), 1_001);
    }

    #[tokio::test]
    async fn test_fill_below_price_rejected() {
        let ledger = ledger();
        let secret = Secret([3u8; 32]);
        let order_id = announce_single(&ledger, &secret).await;

        let err = ledger
            .submit(EscrowCall::FillOrder(FillOrderRequest {
                order_id,
                bid_price: 800,
                resolver: Hash32([2u8; 32]),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Rejected { .. }));
        assert_eq!(ledger.filled_amount(&order_id).await, Some(0));
    }

    #[tokio::test]
    async fn test_partial_fill_checks_index_and_proof() {
        let ledger = ledger();
        let secrets = MerkleSecretIndex::generate(4);
        let call = EscrowCall::AnnounceOrder(AnnounceOrderRequest {
            maker: Hash32([1u8; 32]),
            commitment: HashLockCommitment::Multi {
                merkle_root: secrets.root(),
                leaf_count: 5,
            },
            total_amount: 100,
            start_price: 10,
            reserve_price: 10,
            duration_secs: 10,
        });
        let order_id = match outcome(&ledger, call).await {
            CallOutcome::OrderAnnounced { order_id } => order_id,
            other => panic!("unexpected outcome {:?}", other),
        };

        let request = |index: u32| FillOrderPartialRequest {
            order_id,
            fill_amount: 40,
            bid_price: 10,
            disclosed_hash: secrets.secret_hash(index).unwrap(),
            disclosed_index: index,
            proof: secrets.proof(index).unwrap(),
            resolver: Hash32([2u8; 32]),
        };

        // ceil(40 * 5 / 100) = 2
        assert!(ledger
            .submit(EscrowCall::FillOrderPartial(request(1)))
            .await
            .is_err());
        let filled = outcome(&ledger, EscrowCall::FillOrderPartial(request(2))).await;
        assert!(matches!(
            filled,
            CallOutcome::OrderFilled {
                fill_amount: 40,
                disclosed_index: 2
            }
        ));

        // Correct index but a proof for another leaf
        let mut forged = request(4);
        forged.disclosed_hash = secrets.secret_hash(3).unwrap();
        assert!(ledger
            .submit(EscrowCall::FillOrderPartial(forged))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dst_creation_enforces_cancellation_ordering() {
        let ledger = ledger();
        let request = |src_cancellation_timestamp: u64| CreateEscrowDstRequest {
            amount: 100,
            safety_deposit: 5,
            hash_lock: HashLock::Single(Hash32([7u8; 32])),
            time_locks: time_locks(),
            maker: Hash32([1u8; 32]),
            resolver: Hash32([2u8; 32]),
            source_order: OrderId(Hash32([9u8; 32])),
            src_cancellation_timestamp,
        };
        // Mined at 1_001, so dst cancellation lands on 1_151
        let err = ledger
            .submit(EscrowCall::CreateEscrowDst(request(1_151)))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Rejected { .. }));

        let created = outcome(&ledger, EscrowCall::CreateEscrowDst(request(1_152))).await;
        assert!(matches!(created, CallOutcome::EscrowCreated { .. }));
    }

    #[tokio::test]
    async fn test_withdraw_and_recover_windows() {
        let ledger = ledger();
        let secret = Secret([3u8; 32]);
        let order_id = announce_single(&ledger, &secret).await;
        let escrow = match outcome(
            &ledger,
            EscrowCall::CreateEscrowSrc(CreateEscrowSrcRequest {
                order_id,
                amount: 100,
                hash_lock: HashLock::Single(secret.hash()),
                time_locks: time_locks(),
                maker: Hash32([1u8; 32]),
                resolver: Hash32([2u8; 32]),
            }),
        )
        .await
        {
            CallOutcome::EscrowCreated { escrow } => escrow,
            other => panic!("unexpected outcome {:?}", other),
        };

        // Still locked
        let withdraw = EscrowCall::Withdraw {
            escrow,
            unlock: Unlock::Secret(secret.clone()),
        };
        assert!(ledger.submit(withdraw.clone()).await.is_err());

        // Cancellation opens for the resolver only
        ledger.advance_time(200).await;
        assert!(ledger.submit(withdraw).await.is_err());
        let maker_recover = EscrowCall::Recover {
            escrow,
            caller: RecoverCaller::Maker,
        };
        assert!(ledger.submit(maker_recover).await.is_err());
        let recover = EscrowCall::Recover {
            escrow,
            caller: RecoverCaller::Resolver,
        };
        assert!(matches!(outcome(&ledger, recover.clone()).await, CallOutcome::Recovered));
        assert_eq!(ledger.submit(recover).await.unwrap_err(), ChainError::AlreadyRecovered);
        assert_eq!(ledger.escrow_status(&escrow).await, Some(EscrowStatus::Recovered));
    }

    #[tokio::test]
    async fn test_withheld_receipts() {
        let ledger = ledger();
        ledger.withhold_receipts(true).await;
        let tx = ledger
            .submit(EscrowCall::AnnounceOrder(AnnounceOrderRequest {
                maker: Hash32([1u8; 32]),
                commitment: HashLockCommitment::Single { hash: Hash32::ZERO },
                total_amount: 1,
                start_price: 1,
                reserve_price: 1,
                duration_secs: 1,
            }))
            .await
            .unwrap();
        assert!(ledger.receipt(tx).await.unwrap().is_none());
        ledger.release_receipts().await;
        assert!(ledger.receipt(tx).await.unwrap().is_some());
    }
}
