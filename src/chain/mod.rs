//! Chain module - the escrow ledger interface consumed by the coordinator
//!
//! This module provides:
//! - `EscrowLedger`, a single awaitable submission abstraction per ledger
//! - One strongly typed request per escrow-contract entry point
//! - Confirmation waiting bounded by a timeout
//! - An in-memory escrow ledger for rehearsals and tests
//! - A JSON-RPC provider reporting chain block time

pub mod finality;
pub mod provider;
pub mod simulated;

pub use finality::ConfirmationWaiter;
pub use provider::ChainProvider;
pub use simulated::SimulatedLedger;

use crate::error::{ChainError, SwapError, SwapResult};
use crate::merkle::MerkleProof;
use crate::timelock::{RecoverCaller, TimeLockSet};
use crate::types::{
    Address, ChainId, EscrowAddress, HashLock, HashLockCommitment, OrderId, Secret, SecretHash,
    TxHash,
};

use async_trait::async_trait;

/// `announceOrder`
#[derive(Debug, Clone)]
pub struct AnnounceOrderRequest {
    pub maker: Address,
    pub commitment: HashLockCommitment,
    pub total_amount: u64,
    pub start_price: u64,
    pub reserve_price: u64,
    pub duration_secs: u64,
}

/// `fillOrder` (single-secret orders, always the full amount)
#[derive(Debug, Clone)]
pub struct FillOrderRequest {
    pub order_id: OrderId,
    pub bid_price: u64,
    pub resolver: Address,
}

/// `fillOrderPartial`
#[derive(Debug, Clone)]
pub struct FillOrderPartialRequest {
    pub order_id: OrderId,
    pub fill_amount: u64,
    pub bid_price: u64,
    pub disclosed_hash: SecretHash,
    pub disclosed_index: u32,
    pub proof: MerkleProof,
    pub resolver: Address,
}

/// `createEscrowSrc`
#[derive(Debug, Clone)]
pub struct CreateEscrowSrcRequest {
    pub order_id: OrderId,
    pub amount: u64,
    pub hash_lock: HashLock,
    pub time_locks: TimeLockSet,
    pub maker: Address,
    pub resolver: Address,
}

/// `createEscrowDst`
#[derive(Debug, Clone)]
pub struct CreateEscrowDstRequest {
    pub amount: u64,
    pub safety_deposit: u64,
    pub hash_lock: HashLock,
    pub time_locks: TimeLockSet,
    pub maker: Address,
    pub resolver: Address,
    pub source_order: OrderId,
    /// The contract refuses deployment if dst cancellation would not precede this
    pub src_cancellation_timestamp: u64,
}

/// Withdrawal payload
#[derive(Debug, Clone)]
pub enum Unlock {
    Secret(Secret),
    MerkleSecret { secret: Secret, proof: MerkleProof },
}

impl Unlock {
    pub fn secret(&self) -> &Secret {
        match self {
            Unlock::Secret(secret) => secret,
            Unlock::MerkleSecret { secret, .. } => secret,
        }
    }

    /// Check the payload against an escrow hash lock
    pub fn matches(&self, hash_lock: &HashLock) -> bool {
        match (self, hash_lock) {
            (Unlock::Secret(secret), HashLock::Single(hash)) => secret.hash() == *hash,
            (Unlock::MerkleSecret { secret, proof }, HashLock::Merkle { root, index }) => {
                proof.index == *index && proof.verify_secret_hash(root, &secret.hash())
            }
            _ => false,
        }
    }
}

/// One call to an escrow contract entry point
#[derive(Debug, Clone)]
pub enum EscrowCall {
    AnnounceOrder(AnnounceOrderRequest),
    AuctionTick { order_id: OrderId },
    FillOrder(FillOrderRequest),
    FillOrderPartial(FillOrderPartialRequest),
    CreateEscrowSrc(CreateEscrowSrcRequest),
    CreateEscrowDst(CreateEscrowDstRequest),
    AddSafetyDeposit { escrow: EscrowAddress, amount: u64 },
    Withdraw { escrow: EscrowAddress, unlock: Unlock },
    Recover { escrow: EscrowAddress, caller: RecoverCaller },
}

impl EscrowCall {
    pub fn name(&self) -> &'static str {
        match self {
            EscrowCall::AnnounceOrder(_) => "announceOrder",
            EscrowCall::AuctionTick { .. } => "auctionTick",
            EscrowCall::FillOrder(_) => "fillOrder",
            EscrowCall::FillOrderPartial(_) => "fillOrderPartial",
            EscrowCall::CreateEscrowSrc(_) => "createEscrowSrc",
            EscrowCall::CreateEscrowDst(_) => "createEscrowDst",
            EscrowCall::AddSafetyDeposit { .. } => "addSafetyDeposit",
            EscrowCall::Withdraw { .. } => "withdraw",
            EscrowCall::Recover { .. } => "recover",
        }
    }

    /// Shape checks applied before anything is submitted
    pub fn validate(&self) -> SwapResult<()> {
        let fail = |msg: &str| Err(SwapError::Validation(format!("{}: {}", self.name(), msg)));
        match self {
            EscrowCall::AnnounceOrder(req) => {
                if req.total_amount == 0 || req.start_price == 0 || req.reserve_price == 0 {
                    return fail("amounts and prices must be positive");
                }
                if req.reserve_price > req.start_price {
                    return fail("reserve price above start price");
                }
                if req.duration_secs == 0 {
                    return fail("auction duration must be positive");
                }
            }
            EscrowCall::FillOrderPartial(req) => {
                if req.fill_amount == 0 {
                    return fail("fill amount must be positive");
                }
                if req.proof.index != req.disclosed_index {
                    return fail("proof index differs from disclosed index");
                }
            }
            EscrowCall::CreateEscrowSrc(req) => {
                if req.amount == 0 {
                    return fail("escrow amount must be positive");
                }
                req.time_locks.validate()?;
            }
            EscrowCall::CreateEscrowDst(req) => {
                if req.amount == 0 {
                    return fail("escrow amount must be positive");
                }
                req.time_locks.validate()?;
            }
            EscrowCall::AddSafetyDeposit { amount: 0, .. } => {
                return fail("safety deposit must be positive");
            }
            _ => {}
        }
        Ok(())
    }
}

/// Typed result of a confirmed call
#[derive(Debug, Clone)]
pub enum CallOutcome {
    OrderAnnounced { order_id: OrderId },
    AuctionTicked { price: u64 },
    OrderFilled { fill_amount: u64, disclosed_index: u32 },
    EscrowCreated { escrow: EscrowAddress },
    SafetyDepositAdded { total: u64 },
    /// The secret becomes public through the withdrawal transaction
    Withdrawn { secret: Secret },
    Recovered,
}

/// Receipt of an included transaction
#[derive(Debug, Clone)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// Block timestamp assigned by the chain, in seconds
    pub block_timestamp: u64,
    pub outcome: CallOutcome,
}

/// An escrow-contract ledger.
///
/// `submit` hands a call to the ledger and returns once it is accepted for
/// inclusion; callers must wait for the receipt to reach the required depth
/// before treating the effect as final. All times are chain block times.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EscrowLedger: Send + Sync {
    fn chain_id(&self) -> ChainId;

    async fn submit(&self, call: EscrowCall) -> Result<TxHash, ChainError>;

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn block_timestamp(&self) -> Result<u64, ChainError>;
}
