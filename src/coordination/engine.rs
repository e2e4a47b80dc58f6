//! Swap coordinator
//!
//! Drives orders and their per-fill swap legs across the source and
//! destination ledgers. Each order lives behind its own mutex, held across
//! submission and confirmation, so operations on one order are strictly
//! sequential while different orders proceed concurrently. Every time check
//! uses the block time of the ledger the escrow lives on.

use super::state::{check_leg_transition, invalid_transition, LegState, OrderState};
use crate::auction;
use crate::chain::{
    AnnounceOrderRequest, CallOutcome, ConfirmationWaiter, CreateEscrowDstRequest,
    CreateEscrowSrcRequest, EscrowCall, EscrowLedger, FillOrderPartialRequest, FillOrderRequest,
    Receipt, Unlock,
};
use crate::config::CoordinatorConfig;
use crate::error::{ChainError, SwapError, SwapResult};
use crate::escrow::{derive_address, Escrow, EscrowStatus, Immutables};
use crate::merkle::{expected_index, MerkleProof, MerkleSecretIndex};
use crate::timelock::{validate_cross_chain_ordering, Phase, RecoverCaller, SrcTimelocks, TimeLockSet};
use crate::types::{
    Address, EscrowAddress, FillRecord, Hash32, HashLock, HashLockCommitment, Order, OrderId,
    Secret, SecretHash, Side, TxHash,
};

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Ledgers and parameters shared by every coordinator operation
#[derive(Clone)]
pub struct SwapContext {
    pub src: Arc<dyn EscrowLedger>,
    pub dst: Arc<dyn EscrowLedger>,
    pub config: CoordinatorConfig,
}

impl SwapContext {
    pub fn new(src: Arc<dyn EscrowLedger>, dst: Arc<dyn EscrowLedger>, config: CoordinatorConfig) -> Self {
        Self { src, dst, config }
    }

    pub fn ledger(&self, side: Side) -> &dyn EscrowLedger {
        match side {
            Side::Src => self.src.as_ref(),
            Side::Dst => self.dst.as_ref(),
        }
    }

    fn implementation(&self, side: Side) -> Hash32 {
        match side {
            Side::Src => self.config.src_implementation,
            Side::Dst => self.config.dst_implementation,
        }
    }

    fn waiter(&self, side: Side) -> ConfirmationWaiter {
        let blocks = match side {
            Side::Src => self.config.src_confirmation_blocks,
            Side::Dst => self.config.dst_confirmation_blocks,
        };
        ConfirmationWaiter::new(
            blocks,
            Duration::from_millis(self.config.confirmation_timeout_ms),
            Duration::from_millis(self.config.confirmation_poll_ms),
        )
    }

    /// Current block time of one side
    pub async fn now(&self, side: Side) -> SwapResult<u64> {
        let ledger = self.ledger(side);
        ledger
            .block_timestamp()
            .await
            .map_err(|e| SwapError::chain(ledger.chain_id(), e))
    }
}

/// Identifies one fill's swap leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LegId {
    pub order_id: OrderId,
    pub seq: u32,
}

impl fmt::Display for LegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.order_id, self.seq)
    }
}

/// Maker request to open an order
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub maker: Address,
    pub total_amount: u64,
    pub start_price: u64,
    pub reserve_price: u64,
    pub auction_duration_secs: u64,
    /// 0 for a single-secret order, otherwise the number of parts
    pub parts_count: u32,
}

/// Public part of a Merkle secret a resolver presents with a partial fill
#[derive(Debug, Clone)]
pub struct Disclosure {
    pub index: u32,
    pub secret_hash: SecretHash,
    pub proof: MerkleProof,
}

/// Resolver bid for (part of) an order
#[derive(Debug, Clone)]
pub struct Bid {
    pub amount: u64,
    pub price: u64,
    pub resolver: Address,
    pub disclosure: Option<Disclosure>,
}

/// Accepted fill and the leg it opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillAccepted {
    pub leg_id: LegId,
    pub accepted_index: u32,
    pub record: FillRecord,
}

/// Parameters of the source escrow
#[derive(Debug, Clone)]
pub struct SrcEscrowParams {
    pub amount: u64,
    pub time_locks: TimeLockSet,
    pub resolver: Address,
}

/// Destination escrow to deploy and the anchor the resolver plans for
#[derive(Debug, Clone)]
pub struct DstEscrowParams {
    pub immutables: Immutables,
    pub planned_deployed_at: u64,
}

/// Result of a recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoverOutcome {
    Recovered,
    /// Another party recovered the escrow first
    AlreadyRecovered,
}

/// What to record once a submitted leg transaction is confirmed
#[derive(Debug, Clone)]
pub enum PendingStep {
    SrcEscrow { immutables: Immutables },
    SafetyDeposit,
    DstEscrow {
        immutables: Immutables,
        src_schedule: SrcTimelocks,
    },
    Withdraw,
    Recover,
}

/// A leg transaction accepted by a ledger whose confirmation was not observed
#[derive(Debug, Clone)]
pub struct PendingTx {
    pub side: Side,
    pub tx_hash: TxHash,
    pub step: PendingStep,
}

/// A fill submitted to the source ledger but not yet confirmed
#[derive(Debug, Clone)]
struct PendingFill {
    tx_hash: TxHash,
    amount: u64,
    resolver: Address,
    hash_lock: HashLock,
    index: u32,
}

/// Secrets owned for one order
enum OrderSecrets {
    Single(Secret),
    Merkle(MerkleSecretIndex),
}

impl OrderSecrets {
    fn commitment(&self) -> HashLockCommitment {
        match self {
            OrderSecrets::Single(secret) => HashLockCommitment::Single { hash: secret.hash() },
            OrderSecrets::Merkle(tree) => HashLockCommitment::Multi {
                merkle_root: tree.root(),
                leaf_count: tree.len() as u32,
            },
        }
    }

    fn secret_for(&self, hash_lock: &HashLock) -> SwapResult<Secret> {
        let secret = match (self, hash_lock) {
            (OrderSecrets::Single(secret), HashLock::Single(hash)) if secret.hash() == *hash => {
                Some(secret.clone())
            }
            (OrderSecrets::Merkle(tree), HashLock::Merkle { root, index }) if tree.root() == *root => {
                tree.secret(*index).cloned()
            }
            _ => None,
        };
        secret.ok_or_else(|| SwapError::Internal("no owned secret opens this hash lock".to_string()))
    }

    /// Withdrawal payload for `secret` under `hash_lock`
    fn unlock(&self, order_id: OrderId, hash_lock: &HashLock, secret: Secret) -> SwapResult<Unlock> {
        let unlock = match (self, hash_lock) {
            (OrderSecrets::Merkle(tree), HashLock::Merkle { index, .. }) => {
                let proof = tree
                    .proof(*index)
                    .ok_or(SwapError::InvalidProof { order_id, index: *index })?;
                Unlock::MerkleSecret { secret, proof }
            }
            _ => Unlock::Secret(secret),
        };
        if unlock.matches(hash_lock) {
            Ok(unlock)
        } else {
            Err(unlock_mismatch(order_id, hash_lock))
        }
    }
}

/// One fill's progress across both ledgers
#[derive(Debug, Clone)]
pub struct SwapLeg {
    pub id: LegId,
    pub state: LegState,
    pub fill: FillRecord,
    pub hash_lock: HashLock,
    pub maker: Address,
    pub resolver: Address,
    pub src: Option<Escrow>,
    pub dst: Option<Escrow>,
    /// Secret observed in the destination withdrawal
    pub revealed_secret: Option<Secret>,
    /// Submitted transaction awaiting `resume`
    pub pending: Option<PendingTx>,
}

impl SwapLeg {
    pub fn escrow(&self, side: Side) -> Option<&Escrow> {
        match side {
            Side::Src => self.src.as_ref(),
            Side::Dst => self.dst.as_ref(),
        }
    }

    fn escrow_mut(&mut self, side: Side) -> SwapResult<&mut Escrow> {
        let id = self.id;
        let escrow = match side {
            Side::Src => self.src.as_mut(),
            Side::Dst => self.dst.as_mut(),
        };
        escrow.ok_or_else(|| SwapError::Validation(format!("leg {} has no {} escrow", id, side)))
    }

    /// Refuse new submissions while an earlier one is unconfirmed
    fn ensure_settled(&self) -> SwapResult<()> {
        match &self.pending {
            Some(pending) => Err(pending_error(self.id, pending)),
            None => Ok(()),
        }
    }

    fn transition(&mut self, next: LegState) -> SwapResult<()> {
        check_leg_transition(self.id, self.state, next)?;
        info!("Leg {} {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Move to the cancel branch; no-op when already there or finished
    fn redirect_to_cancel(&mut self, reason: &str) {
        if self.state.can_transition_to(LegState::CancelWindow) {
            warn!("Leg {} moved to cancel window from {}: {}", self.id, self.state, reason);
            self.state = LegState::CancelWindow;
        }
    }

    fn all_deployed_recovered(&self) -> bool {
        [&self.src, &self.dst]
            .iter()
            .filter_map(|e| e.as_ref())
            .all(|e| e.status == EscrowStatus::Recovered)
    }
}

struct OrderRecord {
    order: Order,
    state: OrderState,
    secrets: OrderSecrets,
    fills: Vec<FillRecord>,
    legs: Vec<SwapLeg>,
    pending_fill: Option<PendingFill>,
}

impl OrderRecord {
    fn filled(&self) -> u64 {
        self.fills.last().map(|f| f.cumulative_filled).unwrap_or(0)
    }

    fn set_state(&mut self, next: OrderState) -> SwapResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(invalid_transition(self.order.order_id, self.state, next));
        }
        if self.state != next {
            info!("Order {} {} -> {}", self.order.order_id, self.state, next);
        }
        self.state = next;
        Ok(())
    }

    fn ensure_no_pending_fill(&self) -> SwapResult<()> {
        match &self.pending_fill {
            Some(pending) => Err(SwapError::Validation(format!(
                "order {} has unconfirmed fill {}; resume it first",
                self.order.order_id, pending.tx_hash
            ))),
            None => Ok(()),
        }
    }

    /// Record a confirmed fill and open its swap leg
    fn apply_fill(&mut self, pending: &PendingFill, receipt: &Receipt) -> SwapResult<FillAccepted> {
        match &receipt.outcome {
            CallOutcome::OrderFilled {
                fill_amount,
                disclosed_index,
            } if *fill_amount == pending.amount && *disclosed_index == pending.index => {}
            other => return Err(unexpected_outcome("fillOrder", other)),
        }

        let order_id = self.order.order_id;
        let total = self.order.total_amount;
        let cumulative = self.filled() + pending.amount;
        let fill = FillRecord {
            order_id,
            fill_amount: pending.amount,
            cumulative_filled: cumulative,
            disclosed_index: pending.index,
        };

        if self.state == OrderState::Announced {
            self.set_state(OrderState::AuctionActive)?;
        }
        let next = if cumulative == total {
            OrderState::FullyFilled
        } else {
            OrderState::PartiallyFilled
        };
        self.set_state(next)?;

        let leg_id = LegId {
            order_id,
            seq: self.legs.len() as u32,
        };
        self.fills.push(fill.clone());
        self.legs.push(SwapLeg {
            id: leg_id,
            state: LegState::Filled,
            fill: fill.clone(),
            hash_lock: pending.hash_lock,
            maker: self.order.maker,
            resolver: pending.resolver,
            src: None,
            dst: None,
            revealed_secret: None,
            pending: None,
        });

        Ok(FillAccepted {
            leg_id,
            accepted_index: pending.index,
            record: fill,
        })
    }

    fn leg_index(&self, leg_id: &LegId) -> SwapResult<usize> {
        let idx = leg_id.seq as usize;
        if idx < self.legs.len() {
            Ok(idx)
        } else {
            Err(SwapError::LegNotFound(leg_id.to_string()))
        }
    }
}

/// Cross-chain swap coordinator
pub struct SwapCoordinator {
    ctx: SwapContext,
    orders: DashMap<OrderId, Arc<Mutex<OrderRecord>>>,
}

impl SwapCoordinator {
    /// Create a new coordinator over two ledgers
    pub fn new(ctx: SwapContext) -> Self {
        Self {
            ctx,
            orders: DashMap::new(),
        }
    }

    pub fn context(&self) -> &SwapContext {
        &self.ctx
    }

    fn handle(&self, order_id: &OrderId) -> SwapResult<Arc<Mutex<OrderRecord>>> {
        self.orders
            .get(order_id)
            .map(|entry| entry.value().clone())
            .ok_or(SwapError::OrderNotFound(*order_id))
    }

    /// Validate and submit one call
    async fn submit(&self, side: Side, call: EscrowCall) -> SwapResult<TxHash> {
        call.validate()?;
        let ledger = self.ctx.ledger(side);
        let chain_id = ledger.chain_id();
        let name = call.name();

        info!("Submitting {} to {} chain {}", name, side, chain_id);
        ledger.submit(call).await.map_err(|e| {
            warn!("{} rejected by chain {}: {}", name, chain_id, e);
            crate::metrics::record_chain_rejection(chain_id, name);
            SwapError::chain(chain_id, e)
        })
    }

    async fn confirm(&self, side: Side, tx_hash: TxHash) -> SwapResult<Receipt> {
        self.ctx.waiter(side).wait(self.ctx.ledger(side), tx_hash).await
    }

    /// Submit one call and wait for its confirmation
    async fn submit_and_confirm(&self, side: Side, call: EscrowCall) -> SwapResult<Receipt> {
        let tx_hash = self.submit(side, call).await?;
        self.confirm(side, tx_hash).await
    }

    /// Submit a leg call, keeping it on the leg as pending until confirmed
    async fn submit_for_leg(
        &self,
        leg: &mut SwapLeg,
        side: Side,
        call: EscrowCall,
        step: PendingStep,
    ) -> SwapResult<Receipt> {
        let leg_id = leg.id;
        let tx_hash = self.submit(side, call).await?;
        leg.pending = Some(PendingTx { side, tx_hash, step });

        let receipt = self.confirm(side, tx_hash).await.map_err(|e| {
            warn!("Leg {} left with unconfirmed {} transaction {}: {}", leg_id, side, tx_hash, e);
            e
        })?;
        leg.pending = None;
        Ok(receipt)
    }

    // ---- orders ----

    /// Announce a new order on the source ledger
    pub async fn announce(&self, request: AnnounceRequest) -> SwapResult<OrderId> {
        self.validate_announce(&request)?;

        let secrets = if request.parts_count == 0 {
            OrderSecrets::Single(Secret::random())
        } else {
            OrderSecrets::Merkle(MerkleSecretIndex::generate(request.parts_count))
        };
        let commitment = secrets.commitment();

        let receipt = self
            .submit_and_confirm(
                Side::Src,
                EscrowCall::AnnounceOrder(AnnounceOrderRequest {
                    maker: request.maker,
                    commitment,
                    total_amount: request.total_amount,
                    start_price: request.start_price,
                    reserve_price: request.reserve_price,
                    duration_secs: request.auction_duration_secs,
                }),
            )
            .await?;

        let order_id = match receipt.outcome {
            CallOutcome::OrderAnnounced { order_id } => order_id,
            other => return Err(unexpected_outcome("announceOrder", &other)),
        };
        if self.orders.contains_key(&order_id) {
            return Err(SwapError::Internal(format!("order {} announced twice", order_id)));
        }

        let order = Order {
            order_id,
            maker: request.maker,
            total_amount: request.total_amount,
            start_price: request.start_price,
            reserve_price: request.reserve_price,
            auction_duration: request.auction_duration_secs,
            created_at: receipt.block_timestamp,
            parts_count: request.parts_count,
            commitment,
        };

        info!(
            "Order {} announced at {}: {} units, {} parts, price {} -> {}",
            order_id,
            order.created_at,
            order.total_amount,
            order.parts_count,
            order.start_price,
            order.reserve_price
        );
        crate::metrics::record_order_announced(self.ctx.src.chain_id());

        self.orders.insert(
            order_id,
            Arc::new(Mutex::new(OrderRecord {
                order,
                state: OrderState::Announced,
                secrets,
                fills: Vec::new(),
                legs: Vec::new(),
                pending_fill: None,
            })),
        );
        Ok(order_id)
    }

    fn validate_announce(&self, request: &AnnounceRequest) -> SwapResult<()> {
        if request.total_amount == 0 || request.start_price == 0 || request.reserve_price == 0 {
            return Err(SwapError::Validation(
                "amounts and prices must be positive".to_string(),
            ));
        }
        if request.reserve_price > request.start_price {
            return Err(SwapError::Validation(format!(
                "reserve price {} above start price {}",
                request.reserve_price, request.start_price
            )));
        }
        if request.auction_duration_secs == 0 {
            return Err(SwapError::Validation(
                "auction duration must be positive".to_string(),
            ));
        }
        if request.parts_count > self.ctx.config.max_parts {
            return Err(SwapError::Validation(format!(
                "parts count {} above maximum {}",
                request.parts_count, self.ctx.config.max_parts
            )));
        }
        if request.parts_count as u64 > request.total_amount {
            return Err(SwapError::Validation(format!(
                "parts count {} above total amount {}",
                request.parts_count, request.total_amount
            )));
        }
        Ok(())
    }

    /// Auction price of an order at chain time `now`
    pub async fn tick(&self, order_id: OrderId, now: u64) -> SwapResult<u64> {
        let handle = self.handle(&order_id)?;
        let record = handle.lock().await;
        Ok(auction::tick(&record.order, now))
    }

    /// Auction price at the current source block time
    pub async fn current_price(&self, order_id: OrderId) -> SwapResult<u64> {
        let handle = self.handle(&order_id)?;
        let mut record = handle.lock().await;
        let now = self.ctx.now(Side::Src).await?;
        if record.state == OrderState::Announced {
            record.set_state(OrderState::AuctionActive)?;
        }
        let price = auction::tick(&record.order, now);
        debug!("Order {} price at {}: {}", order_id, now, price);
        Ok(price)
    }

    /// Price as computed by the source contract's `auctionTick`
    pub async fn onchain_price(&self, order_id: OrderId) -> SwapResult<u64> {
        let handle = self.handle(&order_id)?;
        let _record = handle.lock().await;
        let receipt = self
            .submit_and_confirm(Side::Src, EscrowCall::AuctionTick { order_id })
            .await?;
        match receipt.outcome {
            CallOutcome::AuctionTicked { price } => Ok(price),
            other => Err(unexpected_outcome("auctionTick", &other)),
        }
    }

    /// Disclosure a resolver must present to fill `amount` next
    pub async fn disclosure_for(&self, order_id: OrderId, amount: u64) -> SwapResult<Disclosure> {
        let handle = self.handle(&order_id)?;
        let record = handle.lock().await;
        let tree = match &record.secrets {
            OrderSecrets::Merkle(tree) => tree,
            OrderSecrets::Single(_) => {
                return Err(SwapError::Validation(format!(
                    "order {} has a single secret and takes no disclosure",
                    order_id
                )))
            }
        };

        record.ensure_no_pending_fill()?;
        let total = record.order.total_amount;
        let filled = record.filled();
        if amount == 0 {
            return Err(SwapError::Validation("fill amount must be positive".to_string()));
        }
        if filled.saturating_add(amount) > total {
            return Err(SwapError::Overfill {
                order_id,
                fill: amount,
                filled,
                total,
            });
        }

        let index = expected_index(total, total - filled, amount, record.order.parts_count);
        let secret_hash = tree
            .secret_hash(index)
            .ok_or_else(|| SwapError::Internal(format!("no secret at index {}", index)))?;
        let proof = tree
            .proof(index)
            .ok_or_else(|| SwapError::Internal(format!("no proof at index {}", index)))?;
        Ok(Disclosure {
            index,
            secret_hash,
            proof,
        })
    }

    /// Accept a resolver bid
    pub async fn fill(&self, order_id: OrderId, bid: Bid) -> SwapResult<FillAccepted> {
        let result = self.fill_order(order_id, bid).await;
        match &result {
            Ok(accepted) => {
                crate::metrics::record_fill_accepted();
                info!(
                    "Fill of {} on order {} accepted at index {} (leg {})",
                    accepted.record.fill_amount, order_id, accepted.accepted_index, accepted.leg_id
                );
            }
            Err(e) => {
                crate::metrics::record_fill_rejected(e.kind());
                warn!("Fill on order {} rejected: {}", order_id, e);
            }
        }
        result
    }

    async fn fill_order(&self, order_id: OrderId, bid: Bid) -> SwapResult<FillAccepted> {
        let handle = self.handle(&order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;

        record.ensure_no_pending_fill()?;
        if bid.amount == 0 {
            return Err(SwapError::Validation("fill amount must be positive".to_string()));
        }
        let total = record.order.total_amount;
        let filled = record.filled();
        if !record.state.accepts_fills() || filled.saturating_add(bid.amount) > total {
            return Err(SwapError::Overfill {
                order_id,
                fill: bid.amount,
                filled,
                total,
            });
        }

        let now = self.ctx.now(Side::Src).await?;
        let current = auction::tick(&record.order, now);
        if bid.price < current {
            return Err(SwapError::PriceTooLow {
                order_id,
                bid: bid.price,
                current,
            });
        }

        let (call, hash_lock, index) = match &record.secrets {
            OrderSecrets::Single(secret) => {
                if bid.amount != total {
                    return Err(SwapError::Validation(format!(
                        "single-secret order {} must be filled in one fill of {}",
                        order_id, total
                    )));
                }
                let call = EscrowCall::FillOrder(FillOrderRequest {
                    order_id,
                    bid_price: bid.price,
                    resolver: bid.resolver,
                });
                (call, HashLock::Single(secret.hash()), 0)
            }
            OrderSecrets::Merkle(tree) => {
                let disclosure = bid.disclosure.as_ref().ok_or_else(|| {
                    SwapError::Validation(format!(
                        "order {} is multi-fill and requires a disclosure",
                        order_id
                    ))
                })?;
                let expected =
                    expected_index(total, total - filled, bid.amount, record.order.parts_count);
                if disclosure.index != expected {
                    return Err(SwapError::IndexMismatch {
                        order_id,
                        expected,
                        supplied: disclosure.index,
                    });
                }
                let root = tree.root();
                if disclosure.proof.index != disclosure.index
                    || !disclosure.proof.verify_secret_hash(&root, &disclosure.secret_hash)
                {
                    return Err(SwapError::InvalidProof {
                        order_id,
                        index: disclosure.index,
                    });
                }
                let call = EscrowCall::FillOrderPartial(FillOrderPartialRequest {
                    order_id,
                    fill_amount: bid.amount,
                    bid_price: bid.price,
                    disclosed_hash: disclosure.secret_hash,
                    disclosed_index: disclosure.index,
                    proof: disclosure.proof.clone(),
                    resolver: bid.resolver,
                });
                (call, HashLock::Merkle { root, index: expected }, expected)
            }
        };

        let tx_hash = self.submit(Side::Src, call).await?;
        let pending = PendingFill {
            tx_hash,
            amount: bid.amount,
            resolver: bid.resolver,
            hash_lock,
            index,
        };
        record.pending_fill = Some(pending.clone());
        let receipt = self.confirm(Side::Src, tx_hash).await?;
        record.pending_fill = None;

        record.apply_fill(&pending, &receipt)
    }

    /// Apply a fill whose confirmation failed, once its receipt is visible
    pub async fn resume_fill(&self, order_id: OrderId) -> SwapResult<FillAccepted> {
        let handle = self.handle(&order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;

        let pending = record.pending_fill.clone().ok_or_else(|| {
            SwapError::Validation(format!("order {} has no unconfirmed fill", order_id))
        })?;
        info!("Resuming fill {} on order {}", pending.tx_hash, order_id);
        let receipt = self.confirm(Side::Src, pending.tx_hash).await?;
        record.pending_fill = None;

        let accepted = record.apply_fill(&pending, &receipt)?;
        crate::metrics::record_fill_accepted();
        Ok(accepted)
    }

    // ---- escrows ----

    /// Lock the filled amount in a source escrow
    pub async fn create_src_escrow(&self, leg_id: LegId, params: SrcEscrowParams) -> SwapResult<EscrowAddress> {
        let handle = self.handle(&leg_id.order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;
        let idx = record.leg_index(&leg_id)?;
        let leg = &mut record.legs[idx];

        leg.ensure_settled()?;
        check_leg_transition(leg_id, leg.state, LegState::SrcEscrowCreated)?;
        if params.amount != leg.fill.fill_amount {
            return Err(SwapError::Validation(format!(
                "source escrow amount {} differs from accepted fill {}",
                params.amount, leg.fill.fill_amount
            )));
        }
        if params.resolver != leg.resolver {
            return Err(SwapError::Validation(format!(
                "resolver {} did not fill leg {}",
                params.resolver, leg_id
            )));
        }
        params.time_locks.validate()?;

        let immutables = Immutables {
            order_id: leg_id.order_id,
            hash_lock: leg.hash_lock,
            maker: leg.maker,
            taker: params.resolver,
            amount: params.amount,
            safety_deposit: 0,
            time_locks: params.time_locks,
        };
        let call = EscrowCall::CreateEscrowSrc(CreateEscrowSrcRequest {
            order_id: leg_id.order_id,
            amount: params.amount,
            hash_lock: leg.hash_lock,
            time_locks: params.time_locks,
            maker: leg.maker,
            resolver: params.resolver,
        });
        let receipt = self
            .submit_for_leg(leg, Side::Src, call, PendingStep::SrcEscrow { immutables })
            .await?;
        self.record_src_escrow(leg, immutables, &receipt)
    }

    fn record_src_escrow(
        &self,
        leg: &mut SwapLeg,
        immutables: Immutables,
        receipt: &Receipt,
    ) -> SwapResult<EscrowAddress> {
        leg.src = Some(Escrow {
            id: escrow_created(receipt, "createEscrowSrc")?,
            chain: self.ctx.src.chain_id(),
            side: Side::Src,
            locked_amount: immutables.amount,
            safety_deposit: 0,
            immutables,
            deployed_at: receipt.block_timestamp,
            phase: Phase::Locked,
            status: EscrowStatus::Active,
        });
        let address = self.verify_identity(leg, Side::Src)?;

        leg.transition(LegState::SrcEscrowCreated)?;
        crate::metrics::record_escrow_created(Side::Src);
        Ok(address)
    }

    /// Add the resolver safety deposit to the source escrow
    pub async fn add_safety_deposit(&self, leg_id: LegId, amount: u64) -> SwapResult<u64> {
        let handle = self.handle(&leg_id.order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;
        let idx = record.leg_index(&leg_id)?;
        let leg = &mut record.legs[idx];

        leg.ensure_settled()?;
        check_leg_transition(leg_id, leg.state, LegState::SafetyDeposited)?;
        let escrow = leg.escrow_mut(Side::Src)?.id;

        let receipt = self
            .submit_for_leg(
                leg,
                Side::Src,
                EscrowCall::AddSafetyDeposit { escrow, amount },
                PendingStep::SafetyDeposit,
            )
            .await?;
        record_safety_deposit(leg, &receipt)
    }

    /// Immutables of the destination escrow matching a leg's source escrow
    pub async fn dst_immutables(
        &self,
        leg_id: LegId,
        safety_deposit: u64,
        time_locks: TimeLockSet,
    ) -> SwapResult<Immutables> {
        let handle = self.handle(&leg_id.order_id)?;
        let record = handle.lock().await;
        let leg = &record.legs[record.leg_index(&leg_id)?];
        let src = leg
            .escrow(Side::Src)
            .ok_or_else(|| SwapError::Validation(format!("leg {} has no src escrow", leg_id)))?;
        Ok(Immutables {
            safety_deposit,
            time_locks,
            ..src.immutables
        })
    }

    /// Deploy the destination escrow.
    ///
    /// The cancellation ordering is checked three times: against the planned
    /// anchor before touching any chain, against the observed destination
    /// clock before submitting, and against the confirmed deployment time.
    pub async fn create_dst_escrow(
        &self,
        leg_id: LegId,
        params: DstEscrowParams,
        src_cancellation_timestamp: u64,
    ) -> SwapResult<EscrowAddress> {
        let handle = self.handle(&leg_id.order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;
        let idx = record.leg_index(&leg_id)?;
        let leg = &mut record.legs[idx];
        let policy = self.ctx.config.recovery;

        leg.ensure_settled()?;
        check_leg_transition(leg_id, leg.state, LegState::DstEscrowCreated)?;
        if self.ctx.config.require_src_safety_deposit && leg.state != LegState::SafetyDeposited {
            return Err(invalid_transition(leg_id, leg.state, LegState::DstEscrowCreated));
        }

        let immutables = params.immutables;
        if immutables.order_id != leg_id.order_id || immutables.hash_lock != leg.hash_lock {
            return Err(SwapError::Validation(format!(
                "destination immutables do not belong to leg {}",
                leg_id
            )));
        }
        if immutables.maker != leg.maker {
            return Err(SwapError::Validation("destination maker differs from order maker".to_string()));
        }
        if immutables.amount != leg.fill.fill_amount {
            return Err(SwapError::Validation(format!(
                "destination escrow amount {} differs from accepted fill {}",
                immutables.amount, leg.fill.fill_amount
            )));
        }
        if immutables.taker != leg.resolver {
            return Err(SwapError::Validation(format!(
                "destination taker {} did not fill leg {}",
                immutables.taker, leg_id
            )));
        }
        immutables.time_locks.validate()?;

        let src_schedule = leg.escrow_mut(Side::Src)?.scheduler(&policy).src();
        if src_cancellation_timestamp != src_schedule.private_cancellation {
            return Err(SwapError::Validation(format!(
                "src cancellation timestamp {} differs from deployed source escrow ({})",
                src_cancellation_timestamp, src_schedule.private_cancellation
            )));
        }

        check_ordering(leg_id, &src_schedule, &immutables.time_locks, params.planned_deployed_at, "planned")?;

        let observed = self.ctx.now(Side::Dst).await?;
        let anchor = params.planned_deployed_at.max(observed);
        check_ordering(leg_id, &src_schedule, &immutables.time_locks, anchor, "observed")?;

        let call = EscrowCall::CreateEscrowDst(CreateEscrowDstRequest {
            amount: immutables.amount,
            safety_deposit: immutables.safety_deposit,
            hash_lock: immutables.hash_lock,
            time_locks: immutables.time_locks,
            maker: immutables.maker,
            resolver: immutables.taker,
            source_order: immutables.order_id,
            src_cancellation_timestamp,
        });
        let step = PendingStep::DstEscrow {
            immutables,
            src_schedule,
        };
        let receipt = self.submit_for_leg(leg, Side::Dst, call, step).await?;
        self.record_dst_escrow(leg, immutables, &src_schedule, &receipt)
    }

    /// Record a confirmed destination escrow, re-checking the ordering at its
    /// actual deployment time
    fn record_dst_escrow(
        &self,
        leg: &mut SwapLeg,
        immutables: Immutables,
        src_schedule: &SrcTimelocks,
        receipt: &Receipt,
    ) -> SwapResult<EscrowAddress> {
        let deployed_at = receipt.block_timestamp;
        leg.dst = Some(Escrow {
            id: escrow_created(receipt, "createEscrowDst")?,
            chain: self.ctx.dst.chain_id(),
            side: Side::Dst,
            locked_amount: immutables.amount,
            safety_deposit: immutables.safety_deposit,
            immutables,
            deployed_at,
            phase: Phase::Locked,
            status: EscrowStatus::Active,
        });

        if let Err(e) = check_ordering(leg.id, src_schedule, &immutables.time_locks, deployed_at, "deployed") {
            leg.redirect_to_cancel("destination deployed too late");
            return Err(e);
        }
        let address = self.verify_identity(leg, Side::Dst)?;

        leg.transition(LegState::DstEscrowCreated)?;
        crate::metrics::record_escrow_created(Side::Dst);
        Ok(address)
    }

    /// Compare a recorded escrow with the address derived from its immutables
    fn verify_identity(&self, leg: &mut SwapLeg, side: Side) -> SwapResult<EscrowAddress> {
        let implementation = self.ctx.implementation(side);
        let (expected, observed) = match leg.escrow(side) {
            Some(escrow) => (
                derive_address(&escrow.immutables, escrow.deployed_at, &implementation),
                escrow.id,
            ),
            None => return Err(SwapError::Internal(format!("leg {} has no {} escrow", leg.id, side))),
        };

        if expected != observed {
            error!(
                "Escrow identity mismatch on {} chain for leg {}: expected {}, observed {}",
                side, leg.id, expected, observed
            );
            crate::metrics::record_invariant_violation("escrow_identity");
            leg.redirect_to_cancel("escrow identity mismatch");
            return Err(SwapError::EscrowIdentityMismatch {
                side,
                expected,
                observed,
            });
        }

        debug!("Leg {} {} escrow verified at {}", leg.id, side, observed);
        Ok(observed)
    }

    // ---- settlement ----

    /// Check whether both escrows have left their finality lock
    pub async fn check_finality(&self, leg_id: LegId) -> SwapResult<bool> {
        let handle = self.handle(&leg_id.order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;
        let idx = record.leg_index(&leg_id)?;
        let leg = &mut record.legs[idx];

        if leg.state.has_reached(LegState::FinalityElapsed) {
            return Ok(true);
        }
        check_leg_transition(leg_id, leg.state, LegState::FinalityElapsed)?;

        let policy = self.ctx.config.recovery;
        let src_now = self.ctx.now(Side::Src).await?;
        let dst_now = self.ctx.now(Side::Dst).await?;
        let src_phase = leg.escrow_mut(Side::Src)?.observe_phase(src_now, &policy);
        let dst_phase = leg.escrow_mut(Side::Dst)?.observe_phase(dst_now, &policy);

        for (side, phase) in [(Side::Src, src_phase), (Side::Dst, dst_phase)] {
            if phase.is_cancellation() {
                leg.redirect_to_cancel("cancellation opened before finality");
                return Err(SwapError::PhaseViolation {
                    operation: "check_finality",
                    side,
                    phase,
                });
            }
        }

        if src_phase >= Phase::ResolverExclusiveWithdrawal && dst_phase >= Phase::ResolverExclusiveWithdrawal {
            leg.transition(LegState::FinalityElapsed)?;
            Ok(true)
        } else {
            debug!(
                "Leg {} awaiting finality: src {} at {}, dst {} at {}",
                leg_id, src_phase, src_now, dst_phase, dst_now
            );
            Ok(false)
        }
    }

    /// Maker-side secret disclosure, only once both escrows are final
    pub async fn release_secret(&self, leg_id: LegId) -> SwapResult<Secret> {
        let handle = self.handle(&leg_id.order_id)?;
        let record = handle.lock().await;
        let leg = &record.legs[record.leg_index(&leg_id)?];

        if !leg.state.has_reached(LegState::FinalityElapsed) {
            return Err(invalid_transition(leg_id, leg.state, "SecretReleased"));
        }
        let secret = record.secrets.secret_for(&leg.hash_lock)?;
        info!("Secret for leg {} released to resolver", leg_id);
        Ok(secret)
    }

    /// Withdrawal payload for a leg, with the Merkle proof when needed
    pub async fn unlock_for(&self, leg_id: LegId, secret: Secret) -> SwapResult<Unlock> {
        let handle = self.handle(&leg_id.order_id)?;
        let record = handle.lock().await;
        let leg = &record.legs[record.leg_index(&leg_id)?];
        record.secrets.unlock(leg_id.order_id, &leg.hash_lock, secret)
    }

    /// Withdraw one side of a leg. Returns the secret as published by the chain.
    pub async fn withdraw(&self, side: Side, leg_id: LegId, unlock: Unlock) -> SwapResult<Secret> {
        let handle = self.handle(&leg_id.order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;
        let idx = record.leg_index(&leg_id)?;
        self.withdraw_leg(&mut record.legs[idx], side, unlock).await
    }

    /// Claim the source escrow with the secret observed on the destination
    pub async fn claim_src(&self, leg_id: LegId, secret: Secret) -> SwapResult<()> {
        let handle = self.handle(&leg_id.order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;
        let idx = record.leg_index(&leg_id)?;

        if let Some(revealed) = &record.legs[idx].revealed_secret {
            if *revealed != secret {
                return Err(SwapError::Validation(format!(
                    "secret differs from the one revealed for leg {}",
                    leg_id
                )));
            }
        }
        let unlock = record
            .secrets
            .unlock(leg_id.order_id, &record.legs[idx].hash_lock, secret)?;
        self.withdraw_leg(&mut record.legs[idx], Side::Src, unlock).await?;
        Ok(())
    }

    async fn withdraw_leg(&self, leg: &mut SwapLeg, side: Side, unlock: Unlock) -> SwapResult<Secret> {
        let (required, next) = match side {
            Side::Dst => (LegState::FinalityElapsed, LegState::DstWithdrawn),
            Side::Src => (LegState::SecretRevealed, LegState::SrcClaimed),
        };
        leg.ensure_settled()?;
        if leg.state != required {
            return Err(invalid_transition(leg.id, leg.state, next));
        }

        let now = self.ctx.now(side).await?;
        let policy = self.ctx.config.recovery;
        let order_id = leg.id.order_id;
        let escrow = leg.escrow_mut(side)?;
        let phase = escrow.observe_phase(now, &policy);
        if !phase.allows_withdrawal() {
            if phase.is_cancellation() {
                leg.redirect_to_cancel("withdrawal window closed");
            }
            warn!("Withdrawal of {} escrow rejected in phase {}", side, phase);
            return Err(SwapError::PhaseViolation {
                operation: "withdraw",
                side,
                phase,
            });
        }
        if !unlock.matches(escrow.hash_lock()) {
            return Err(unlock_mismatch(order_id, escrow.hash_lock()));
        }
        let escrow_id = escrow.id;

        let receipt = self
            .submit_for_leg(
                leg,
                side,
                EscrowCall::Withdraw { escrow: escrow_id, unlock },
                PendingStep::Withdraw,
            )
            .await?;
        record_withdrawal(leg, side, &receipt)
    }

    /// Re-poll the unconfirmed transaction of a leg and apply its effect
    pub async fn resume(&self, leg_id: LegId) -> SwapResult<LegState> {
        let handle = self.handle(&leg_id.order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;
        let idx = record.leg_index(&leg_id)?;
        let leg = &mut record.legs[idx];

        let pending = leg.pending.clone().ok_or_else(|| {
            SwapError::Validation(format!("leg {} has no unconfirmed transaction", leg_id))
        })?;
        info!(
            "Resuming {} transaction {} of leg {}",
            pending.side, pending.tx_hash, leg_id
        );
        let receipt = self.confirm(pending.side, pending.tx_hash).await?;
        leg.pending = None;

        match pending.step {
            PendingStep::SrcEscrow { immutables } => {
                self.record_src_escrow(leg, immutables, &receipt)?;
            }
            PendingStep::SafetyDeposit => {
                record_safety_deposit(leg, &receipt)?;
            }
            PendingStep::DstEscrow {
                immutables,
                src_schedule,
            } => {
                self.record_dst_escrow(leg, immutables, &src_schedule, &receipt)?;
            }
            PendingStep::Withdraw => {
                record_withdrawal(leg, pending.side, &receipt)?;
            }
            PendingStep::Recover => {
                record_recovery(leg, pending.side, recovered(&receipt)?)?;
            }
        }
        Ok(leg.state)
    }

    /// Recover one side of a leg once `caller`'s cancellation window is open
    pub async fn recover(&self, side: Side, leg_id: LegId, caller: RecoverCaller) -> SwapResult<RecoverOutcome> {
        let handle = self.handle(&leg_id.order_id)?;
        let mut guard = handle.lock().await;
        let record = &mut *guard;
        let idx = record.leg_index(&leg_id)?;
        let leg = &mut record.legs[idx];

        if leg.state == LegState::Completed {
            return Err(invalid_transition(leg_id, leg.state, LegState::CancelWindow));
        }
        leg.ensure_settled()?;
        let escrow = leg.escrow_mut(side)?;
        match escrow.status {
            EscrowStatus::Withdrawn => {
                return Err(invalid_transition(escrow.id, "Withdrawn", "Recovered"));
            }
            EscrowStatus::Recovered => return Ok(RecoverOutcome::AlreadyRecovered),
            EscrowStatus::Active => {}
        }

        let now = self.ctx.now(side).await?;
        let policy = self.ctx.config.recovery;
        let escrow = leg.escrow_mut(side)?;
        let phase = escrow.observe_phase(now, &policy);
        if !caller.may_recover(phase) {
            return Err(SwapError::PhaseViolation {
                operation: "recover",
                side,
                phase,
            });
        }
        let escrow_id = escrow.id;

        if !matches!(leg.state, LegState::CancelWindow | LegState::Cancelled) {
            leg.transition(LegState::CancelWindow)?;
        }

        let ledger = self.ctx.ledger(side);
        let chain_id = ledger.chain_id();
        info!("Submitting recover of {} escrow {} as {:?}", side, escrow_id, caller);
        let outcome = match ledger
            .submit(EscrowCall::Recover {
                escrow: escrow_id,
                caller,
            })
            .await
        {
            Ok(tx_hash) => {
                leg.pending = Some(PendingTx {
                    side,
                    tx_hash,
                    step: PendingStep::Recover,
                });
                let receipt = self.confirm(side, tx_hash).await?;
                leg.pending = None;
                recovered(&receipt)?
            }
            Err(ChainError::AlreadyRecovered) => {
                info!("{} escrow {} was already recovered", side, escrow_id);
                RecoverOutcome::AlreadyRecovered
            }
            Err(e) => {
                crate::metrics::record_chain_rejection(chain_id, "recover");
                return Err(SwapError::chain(chain_id, e));
            }
        };

        record_recovery(leg, side, outcome)
    }

    // ---- accessors ----

    pub async fn order(&self, order_id: OrderId) -> SwapResult<Order> {
        let handle = self.handle(&order_id)?;
        let record = handle.lock().await;
        Ok(record.order.clone())
    }

    pub async fn order_state(&self, order_id: OrderId) -> SwapResult<OrderState> {
        let handle = self.handle(&order_id)?;
        let record = handle.lock().await;
        Ok(record.state)
    }

    pub async fn fills(&self, order_id: OrderId) -> SwapResult<Vec<FillRecord>> {
        let handle = self.handle(&order_id)?;
        let record = handle.lock().await;
        Ok(record.fills.clone())
    }

    pub async fn leg(&self, leg_id: LegId) -> SwapResult<SwapLeg> {
        let handle = self.handle(&leg_id.order_id)?;
        let record = handle.lock().await;
        Ok(record.legs[record.leg_index(&leg_id)?].clone())
    }

    pub async fn legs(&self, order_id: OrderId) -> SwapResult<Vec<SwapLeg>> {
        let handle = self.handle(&order_id)?;
        let record = handle.lock().await;
        Ok(record.legs.clone())
    }
}

/// Ordering check with logging and metrics on violation
fn check_ordering(
    leg_id: LegId,
    src: &SrcTimelocks,
    time_locks: &TimeLockSet,
    anchor: u64,
    stage: &str,
) -> SwapResult<()> {
    validate_cross_chain_ordering(src, &time_locks.to_dst(anchor)).map_err(|e| {
        error!("Leg {} destination ordering violated ({} anchor {}): {}", leg_id, stage, anchor, e);
        crate::metrics::record_invariant_violation("timelock_ordering");
        e
    })
}

fn record_safety_deposit(leg: &mut SwapLeg, receipt: &Receipt) -> SwapResult<u64> {
    let total = match receipt.outcome {
        CallOutcome::SafetyDepositAdded { total } => total,
        ref other => return Err(unexpected_outcome("addSafetyDeposit", other)),
    };
    leg.escrow_mut(Side::Src)?.safety_deposit = total;
    leg.transition(LegState::SafetyDeposited)?;
    Ok(total)
}

fn record_withdrawal(leg: &mut SwapLeg, side: Side, receipt: &Receipt) -> SwapResult<Secret> {
    let secret = match &receipt.outcome {
        CallOutcome::Withdrawn { secret } => secret.clone(),
        other => return Err(unexpected_outcome("withdraw", other)),
    };

    leg.escrow_mut(side)?.status = EscrowStatus::Withdrawn;
    crate::metrics::record_withdrawal(side);
    match side {
        Side::Dst => {
            leg.transition(LegState::DstWithdrawn)?;
            leg.revealed_secret = Some(secret.clone());
            leg.transition(LegState::SecretRevealed)?;
        }
        Side::Src => {
            leg.transition(LegState::SrcClaimed)?;
            leg.transition(LegState::Completed)?;
        }
    }
    Ok(secret)
}

fn recovered(receipt: &Receipt) -> SwapResult<RecoverOutcome> {
    match &receipt.outcome {
        CallOutcome::Recovered => Ok(RecoverOutcome::Recovered),
        other => Err(unexpected_outcome("recover", other)),
    }
}

fn record_recovery(leg: &mut SwapLeg, side: Side, outcome: RecoverOutcome) -> SwapResult<RecoverOutcome> {
    leg.escrow_mut(side)?.status = EscrowStatus::Recovered;
    crate::metrics::record_recovery(outcome);

    let next = if leg.all_deployed_recovered() {
        LegState::Recovered
    } else {
        LegState::Cancelled
    };
    leg.transition(next)?;
    Ok(outcome)
}

fn pending_error(leg_id: LegId, pending: &PendingTx) -> SwapError {
    SwapError::Validation(format!(
        "leg {} has unconfirmed {} transaction {}; resume it first",
        leg_id, pending.side, pending.tx_hash
    ))
}

fn escrow_created(receipt: &Receipt, call: &str) -> SwapResult<EscrowAddress> {
    match &receipt.outcome {
        CallOutcome::EscrowCreated { escrow } => Ok(*escrow),
        other => Err(unexpected_outcome(call, other)),
    }
}

fn unexpected_outcome(call: &str, outcome: &CallOutcome) -> SwapError {
    SwapError::Internal(format!("unexpected outcome for {}: {:?}", call, outcome))
}

fn unlock_mismatch(order_id: OrderId, hash_lock: &HashLock) -> SwapError {
    match hash_lock {
        HashLock::Merkle { index, .. } => SwapError::InvalidProof {
            order_id,
            index: *index,
        },
        HashLock::Single(_) => SwapError::Validation("secret does not open the hash lock".to_string()),
    }
}
