// ============================================================================
// Auto-Settlement
// ============================================================================
//
// After an option resolves, every unclaimed position on it is closed in one
// unit of work: winners are paid their winning-side shares from the shared
// pool, losers book their cost basis as a realized loss. A winner the pool
// cannot cover is skipped and left unclaimed for `claim_winnings`.
//
// A holder whose wallet is held by another unit of work is deferred rather
// than failing the whole pass; the dispatcher keeps re-running the option
// until nothing is deferred.
//
// Lock order: Market → Option → holders' wallets (by user id) → positions.
//
// ============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{Market, MarketOption, PositionKey, Side, UserPosition, Wallet};
use crate::store::{RetryPolicy, Store, Tx};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSummary {
    pub winners_paid: usize,
    pub losers_closed: usize,
    /// Winners left unclaimed because the pool could not cover them
    pub skipped: usize,
    /// Holders whose wallet was busy; settled on a later pass
    pub deferred: usize,
    pub total_paid: u64,
}

impl SettlementSummary {
    pub fn is_noop(&self) -> bool {
        self.winners_paid == 0 && self.losers_closed == 0 && self.skipped == 0
    }

    /// Every unclaimed holder was visited
    pub fn is_complete(&self) -> bool {
        self.deferred == 0
    }
}

/// Payout of one position, if it was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReceipt {
    pub payout: u64,
    pub realized_pnl: i64,
    pub balance_after: u64,
}

/// Close every unclaimed position on a resolved option
pub async fn settle_option(store: &Store, policy: &RetryPolicy, option_id: &str) -> EngineResult<SettlementSummary> {
    let snapshot = store.require::<MarketOption>(&option_id.to_string()).await?;

    let summary = store
        .transaction(policy, |tx| {
            let (mut market, mut option, winning_side) = lock_resolved(tx, &snapshot.market_id, option_id)?;

            // Holders are read from the index; new positions cannot appear while the market is held
            let mut holders: Vec<String> = store
                .keys::<UserPosition>()
                .into_iter()
                .filter(|k| k.option_id == option.id)
                .map(|k| k.user_id)
                .collect();
            holders.sort();
            holders.dedup();

            let mut summary = SettlementSummary::default();
            let mut wallets = Vec::with_capacity(holders.len());
            for user_id in &holders {
                match tx.try_lock::<Wallet>(user_id)? {
                    Some(wallet) => wallets.push(wallet),
                    None => {
                        tracing::debug!(option_id = %option.id, user_id = %user_id, "wallet busy, deferring position");
                        summary.deferred += 1;
                    }
                }
            }

            for wallet in wallets.iter_mut() {
                let Some(mut position) = tx.find::<UserPosition>(&PositionKey::new(&wallet.user_id, &option.id))? else {
                    continue;
                };
                if position.is_claimed {
                    continue;
                }
                let payout = position.shares(winning_side);
                if payout > market.shared_pool_liquidity {
                    tracing::warn!(
                        option_id = %option.id,
                        user_id = %wallet.user_id,
                        payout,
                        pool = market.shared_pool_liquidity,
                        "pool cannot cover payout, leaving position unclaimed"
                    );
                    summary.skipped += 1;
                    continue;
                }
                close_position(&mut market, &mut option, wallet, &mut position, winning_side)?;
                if payout > 0 {
                    summary.winners_paid += 1;
                    summary.total_paid += payout;
                } else {
                    summary.losers_closed += 1;
                }
                tx.update(position)?;
            }

            if summary.is_noop() {
                return Ok(summary);
            }
            for wallet in wallets {
                tx.update(wallet)?;
            }
            tx.emit(DomainEvent::OptionSettled {
                market_id: market.id.clone(),
                option_id: option.id.clone(),
                winners: summary.winners_paid,
                total_payout: summary.total_paid,
                skipped: summary.skipped,
            });
            tx.update(option)?;
            tx.update(market)?;
            Ok(summary)
        })
        .await?;

    if !summary.is_noop() {
        tracing::info!(
            option_id,
            winners = summary.winners_paid,
            losers = summary.losers_closed,
            skipped = summary.skipped,
            deferred = summary.deferred,
            total_paid = summary.total_paid,
            "option settled"
        );
    }
    Ok(summary)
}

/// Manual claim for a position that automatic settlement skipped
pub async fn claim_winnings(
    store: &Store,
    policy: &RetryPolicy,
    user_id: &str,
    option_id: &str,
) -> EngineResult<ClaimReceipt> {
    let snapshot = store.require::<MarketOption>(&option_id.to_string()).await?;
    let key = PositionKey::new(user_id, option_id);

    let receipt = store
        .transaction(policy, |tx| {
            let (mut market, mut option, winning_side) = lock_resolved(tx, &snapshot.market_id, option_id)?;
            let mut wallet = tx.lock::<Wallet>(&user_id.to_string())?;
            let mut position = tx.lock::<UserPosition>(&key)?;
            if position.is_claimed {
                return Err(EngineError::Conflict(format!("position {} is already claimed", key)));
            }
            let payout = position.shares(winning_side);
            if payout > market.shared_pool_liquidity {
                return Err(EngineError::InsufficientLiquidity {
                    required: payout,
                    available: market.shared_pool_liquidity,
                });
            }
            let realized_pnl = close_position(&mut market, &mut option, &mut wallet, &mut position, winning_side)?;
            let receipt = ClaimReceipt { payout, realized_pnl, balance_after: wallet.balance_usdc };

            tx.emit(DomainEvent::OptionSettled {
                market_id: market.id.clone(),
                option_id: option.id.clone(),
                winners: usize::from(payout > 0),
                total_payout: payout,
                skipped: 0,
            });
            tx.update(position)?;
            tx.update(wallet)?;
            tx.update(option)?;
            tx.update(market)?;
            Ok(receipt)
        })
        .await?;

    tracing::info!(user_id, option_id, payout = receipt.payout, "winnings claimed");
    Ok(receipt)
}

fn lock_resolved(tx: &mut Tx<'_>, market_id: &str, option_id: &str) -> EngineResult<(Market, MarketOption, Side)> {
    let market = tx.lock::<Market>(&market_id.to_string())?;
    let option = tx.lock::<MarketOption>(&option_id.to_string())?;
    if option.market_id != market.id {
        return Err(EngineError::not_found("option", option_id));
    }
    let winning_side = match (option.is_resolved, option.winning_side) {
        (true, Some(side)) => side,
        _ => return Err(EngineError::Conflict(format!("option {} is not resolved", option.id))),
    };
    Ok((market, option, winning_side))
}

/// Pay out and zero one position; returns the realized PnL booked
fn close_position(
    market: &mut Market,
    option: &mut MarketOption,
    wallet: &mut Wallet,
    position: &mut UserPosition,
    winning_side: Side,
) -> EngineResult<i64> {
    let yes = position.yes_shares;
    let no = position.no_shares;
    let (payout, pnl) = position.close(winning_side);

    market.shared_pool_liquidity = market
        .shared_pool_liquidity
        .checked_sub(payout)
        .ok_or(EngineError::InsufficientLiquidity { required: payout, available: market.shared_pool_liquidity })?;
    wallet.credit(payout)?;

    option.yes_quantity = option.yes_quantity.saturating_sub(yes);
    option.no_quantity = option.no_quantity.saturating_sub(no);
    market.outstanding_shares = market.outstanding_shares.saturating_sub(yes + no);
    Ok(pnl)
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Settle each option as soon as its resolution commits
pub fn spawn_settlement_dispatcher(store: Arc<Store>, policy: RetryPolicy) -> JoinHandle<()> {
    let mut rx = store.events().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(DomainEvent::OptionResolved { option_id, .. }) => {
                    let store = Arc::clone(&store);
                    tokio::spawn(async move { settle_until_complete(&store, &policy, &option_id).await });
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "settlement dispatcher lagged; run settle_option manually for missed options");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Re-run `settle_option` with backoff until no holder is deferred.
/// Lock contention never ends the loop; only a permanent error does.
pub async fn settle_until_complete(store: &Store, policy: &RetryPolicy, option_id: &str) -> Option<SettlementSummary> {
    let mut total = SettlementSummary::default();
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        match settle_option(store, policy, option_id).await {
            Ok(pass) => {
                total.winners_paid += pass.winners_paid;
                total.losers_closed += pass.losers_closed;
                total.skipped = pass.skipped;
                total.total_paid += pass.total_paid;
                total.deferred = pass.deferred;
                if pass.is_complete() {
                    return Some(total);
                }
                tracing::debug!(option_id, attempt, deferred = pass.deferred, "settlement incomplete, retrying");
            }
            Err(e) if e.is_transient() => {
                tracing::debug!(option_id, attempt, error = %e, "settlement hit lock contention, retrying");
            }
            Err(e) => {
                tracing::error!(option_id, error = %e, "auto-settlement failed");
                return None;
            }
        }
        tokio::time::sleep(policy.backoff(attempt)).await;
    }
}
