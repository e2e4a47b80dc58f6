//! End-to-end rehearsal on simulated ledgers
//!
//! Runs one partially filled order through every leg step with the configured
//! timelocks, recovery windows and escrow implementation ids, so a deployment
//! can check its parameters before pointing the coordinator at real chains.

use crate::chain::{EscrowLedger, SimulatedLedger};
use crate::config::Settings;
use crate::coordination::{
    AnnounceRequest, Bid, DstEscrowParams, LegState, OrderState, SrcEscrowParams, SwapContext,
    SwapCoordinator,
};
use crate::error::{SwapError, SwapResult};
use crate::types::{FillRecord, Hash32, OrderId, Side};

use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const MAKER: Hash32 = Hash32([0x4d; 32]);
const RESOLVER: Hash32 = Hash32([0x52; 32]);
const TOTAL_AMOUNT: u64 = 1_000_000;
const PARTS: u32 = 4;
const SAFETY_DEPOSIT: u64 = 1_000;

#[derive(Debug, Serialize)]
pub struct LegReport {
    pub leg: String,
    pub state: LegState,
    pub src_escrow: Option<String>,
    pub dst_escrow: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RehearsalReport {
    pub order_id: OrderId,
    pub order_state: OrderState,
    pub fills: Vec<FillRecord>,
    pub legs: Vec<LegReport>,
}

/// Run the rehearsal swap
pub async fn run(settings: &Settings) -> SwapResult<RehearsalReport> {
    let mut config = settings.coordinator_config()?;
    // Simulated ledgers only mine on submission
    config.src_confirmation_blocks = 1;
    config.dst_confirmation_blocks = 1;
    let policy = config.recovery;
    let genesis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| SwapError::Internal(e.to_string()))?;

    let src = Arc::new(SimulatedLedger::new(
        settings.chains.source.chain_id,
        config.src_implementation,
        policy,
        genesis,
    ));
    let dst = Arc::new(SimulatedLedger::new(
        settings.chains.destination.chain_id,
        config.dst_implementation,
        policy,
        genesis,
    ));
    debug!(
        "Rehearsal ledgers started at {} (src chain {}, dst chain {})",
        genesis,
        src.chain_id(),
        dst.chain_id()
    );

    let parts = PARTS.min(config.max_parts);
    let coordinator = SwapCoordinator::new(SwapContext::new(src.clone(), dst.clone(), config));

    let order_id = coordinator
        .announce(AnnounceRequest {
            maker: MAKER,
            total_amount: TOTAL_AMOUNT,
            start_price: settings.auction.start_price,
            reserve_price: settings.auction.reserve_price,
            auction_duration_secs: settings.auction.duration_secs,
            parts_count: parts,
        })
        .await?;

    let time_locks = settings.timelocks;
    let warmup = time_locks.src_withdrawal.max(time_locks.dst_withdrawal) + 1;

    for amount in [TOTAL_AMOUNT / 2, TOTAL_AMOUNT - TOTAL_AMOUNT / 2] {
        let price = coordinator.current_price(order_id).await?;
        let disclosure = if parts == 0 {
            None
        } else {
            Some(coordinator.disclosure_for(order_id, amount).await?)
        };
        let accepted = coordinator
            .fill(
                order_id,
                Bid {
                    amount: if parts == 0 { TOTAL_AMOUNT } else { amount },
                    price,
                    resolver: RESOLVER,
                    disclosure,
                },
            )
            .await?;
        let leg_id = accepted.leg_id;

        coordinator
            .create_src_escrow(
                leg_id,
                SrcEscrowParams {
                    amount: accepted.record.fill_amount,
                    time_locks,
                    resolver: RESOLVER,
                },
            )
            .await?;
        coordinator.add_safety_deposit(leg_id, SAFETY_DEPOSIT).await?;

        let src_cancellation = coordinator
            .leg(leg_id)
            .await?
            .escrow(Side::Src)
            .map(|e| e.deployed_at + time_locks.src_cancellation)
            .ok_or_else(|| SwapError::Internal("source escrow missing".to_string()))?;
        let immutables = coordinator
            .dst_immutables(leg_id, SAFETY_DEPOSIT, time_locks)
            .await?;
        let planned = dst
            .block_timestamp()
            .await
            .map_err(|e| SwapError::chain(dst.chain_id(), e))?;
        coordinator
            .create_dst_escrow(
                leg_id,
                DstEscrowParams {
                    immutables,
                    planned_deployed_at: planned,
                },
                src_cancellation,
            )
            .await?;

        src.advance_time(warmup).await;
        dst.advance_time(warmup).await;
        if !coordinator.check_finality(leg_id).await? {
            return Err(SwapError::Internal(format!("leg {} not final after warmup", leg_id)));
        }

        let secret = coordinator.release_secret(leg_id).await?;
        let unlock = coordinator.unlock_for(leg_id, secret).await?;
        let observed = coordinator.withdraw(Side::Dst, leg_id, unlock).await?;
        coordinator.claim_src(leg_id, observed).await?;
        info!("Rehearsal leg {} completed", leg_id);

        if parts == 0 {
            break;
        }
    }

    let legs = coordinator
        .legs(order_id)
        .await?
        .into_iter()
        .map(|leg| LegReport {
            leg: leg.id.to_string(),
            state: leg.state,
            src_escrow: leg.src.as_ref().map(|e| e.id.to_string()),
            dst_escrow: leg.dst.as_ref().map(|e| e.id.to_string()),
        })
        .collect();

    Ok(RehearsalReport {
        order_id,
        order_state: coordinator.order_state(order_id).await?,
        fills: coordinator.fills(order_id).await?,
        legs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"
[coordinator]
confirmation_timeout_ms = 2000
confirmation_poll_ms = 1
max_parts = 16

[timelocks]
src_withdrawal = 10
src_public_withdrawal = 120
src_cancellation = 200
src_public_cancellation = 300
dst_withdrawal = 10
dst_public_withdrawal = 100
dst_cancellation = 150

[auction]
start_price = 1000
reserve_price = 900
duration_secs = 60

[chains.source]
chain_id = 1
name = "source"
confirmation_blocks = 12
escrow_implementation = "0x1111111111111111111111111111111111111111111111111111111111111111"

[chains.destination]
chain_id = 2
name = "destination"
confirmation_blocks = 20
escrow_implementation = "0x2222222222222222222222222222222222222222222222222222222222222222"

[metrics]
enabled = false
port = 9090
"#;

    #[tokio::test]
    async fn test_rehearsal_fills_order_completely() {
        let settings: Settings = toml::from_str(SETTINGS).unwrap();
        let report = run(&settings).await.unwrap();

        assert_eq!(report.order_state, OrderState::FullyFilled);
        let indices: Vec<u32> = report.fills.iter().map(|f| f.disclosed_index).collect();
        assert_eq!(indices, vec![3, 4]);
        assert_eq!(report.legs.len(), 2);
        assert!(report.legs.iter().all(|leg| leg.state == LegState::Completed));
        assert!(report.legs.iter().all(|leg| leg.dst_escrow.is_some()));
    }
}
