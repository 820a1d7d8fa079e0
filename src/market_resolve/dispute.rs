// Disputes against a resolved option
//
// Filing costs a fixed fee (booked as protocol fee) and flips the market to
// DISPUTED. An admin adjudicates: upheld refunds the fee, dismissed keeps it.
// Once no dispute is pending the market returns to where it was.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amm::FeeSplit;
use crate::config::OperationContext;
use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{Actor, Dispute, DisputeStatus, Market, MarketOption, MarketStatus, RecordKey, Wallet};
use crate::store::{Store, Tx};

pub const MAX_REASON_LEN: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeRequest {
    pub market_id: String,
    pub option_id: String,
    pub reason: String,
    #[serde(default)]
    pub evidence: Option<String>,
}

pub async fn file_dispute(
    store: &Store,
    ctx: &OperationContext<'_>,
    user_id: &str,
    request: DisputeRequest,
) -> EngineResult<Dispute> {
    ctx.ensure_available()?;
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(EngineError::Validation("a dispute needs a reason".into()));
    }
    if reason.chars().count() > MAX_REASON_LEN {
        return Err(EngineError::Validation(format!("reason exceeds {} characters", MAX_REASON_LEN)));
    }
    let dispute_id = format!("dsp_{}", Uuid::new_v4().simple());
    let fee = ctx.config.dispute_fee;

    let dispute = store
        .transaction(&ctx.config.transaction_retry, |tx| {
            let mut market = tx.lock::<Market>(&request.market_id)?;
            let option = tx.lock::<MarketOption>(&request.option_id)?;
            if option.market_id != market.id {
                return Err(EngineError::not_found("option", &request.option_id));
            }
            if !option.is_resolved {
                return Err(EngineError::Conflict(format!("option {} is not resolved", option.id)));
            }
            let deadline = option.dispute_deadline.ok_or_else(|| {
                EngineError::Conflict(format!("option {} cannot be disputed", option.id))
            })?;
            if ctx.now >= deadline {
                return Err(EngineError::Conflict(format!(
                    "dispute window for option {} closed at {}",
                    option.id,
                    deadline.to_rfc3339()
                )));
            }

            let mut wallet = tx.lock::<Wallet>(&user_id.to_string())?;
            let already_pending = tx
                .lock_where::<Dispute>(|k: &RecordKey| k.option_id == option.id)?
                .into_iter()
                .any(|d| d.user_id == user_id && d.status == DisputeStatus::Pending);
            if already_pending {
                return Err(EngineError::Conflict(format!(
                    "{} already has a pending dispute on option {}",
                    user_id, option.id
                )));
            }

            wallet.debit(fee)?;
            let split = FeeSplit::protocol_only(fee);
            market.protocol_fees = market.protocol_fees.saturating_add(split.protocol);

            let dispute = Dispute {
                id: dispute_id.clone(),
                market_id: market.id.clone(),
                option_id: option.id.clone(),
                user_id: user_id.to_string(),
                reason: reason.to_string(),
                evidence: request.evidence.clone(),
                resolution_fee_paid: fee,
                status: DisputeStatus::Pending,
                created_at: ctx.now,
                adjudicated_by: None,
                adjudicated_at: None,
            };
            tx.insert(dispute.clone())?;

            let before = market.status;
            market.transition(MarketStatus::Disputed)?;
            if before != market.status {
                tx.emit(DomainEvent::MarketStatusChanged {
                    market_id: market.id.clone(),
                    from: before,
                    to: market.status,
                });
            }
            tx.emit(DomainEvent::DisputeFiled {
                dispute_id: dispute.id.clone(),
                market_id: market.id.clone(),
                option_id: option.id.clone(),
                user_id: user_id.to_string(),
            });
            tx.update(wallet)?;
            tx.update(market)?;
            Ok(dispute)
        })
        .await?;

    tracing::info!(dispute_id = %dispute.id, market_id = %dispute.market_id, user_id, "dispute filed");
    Ok(dispute)
}

/// Admin decision on a pending dispute
pub async fn adjudicate_dispute(
    store: &Store,
    ctx: &OperationContext<'_>,
    actor: &Actor,
    dispute_id: &str,
    upheld: bool,
) -> EngineResult<Dispute> {
    ctx.ensure_available()?;
    if !actor.is_admin() {
        return Err(EngineError::Unauthorized("only admins can adjudicate disputes".into()));
    }
    let key = store.record_key::<Dispute>(dispute_id)?;
    let snapshot = store.require::<Dispute>(&key).await?;
    let option_ids = store.option_ids(&snapshot.market_id);

    let dispute = store
        .transaction(&ctx.config.transaction_retry, |tx| {
            let mut market = tx.lock::<Market>(&snapshot.market_id)?;
            let mut wallet = tx.lock::<Wallet>(&snapshot.user_id)?;
            let mut dispute = tx.lock::<Dispute>(&key)?;
            if dispute.status != DisputeStatus::Pending {
                return Err(EngineError::Conflict(format!("dispute {} is already adjudicated", dispute.id)));
            }

            if upheld {
                wallet.credit(dispute.resolution_fee_paid)?;
                market.protocol_fees = market.protocol_fees.saturating_sub(dispute.resolution_fee_paid);
                dispute.status = DisputeStatus::Upheld;
            } else {
                dispute.status = DisputeStatus::Dismissed;
            }
            dispute.adjudicated_by = Some(actor.user_id.clone());
            dispute.adjudicated_at = Some(ctx.now);
            tx.update(dispute.clone())?;

            settle_market_status(tx, &mut market, &option_ids)?;
            tx.emit(DomainEvent::DisputeAdjudicated {
                dispute_id: dispute.id.clone(),
                market_id: market.id.clone(),
                status: dispute.status,
            });
            tx.update(wallet)?;
            tx.update(market)?;
            Ok(dispute)
        })
        .await?;

    tracing::info!(dispute_id, status = ?dispute.status, admin = %actor.user_id, "dispute adjudicated");
    Ok(dispute)
}

/// Leave DISPUTED once no dispute on the market is pending
fn settle_market_status(tx: &mut Tx<'_>, market: &mut Market, option_ids: &[String]) -> EngineResult<()> {
    if market.status != MarketStatus::Disputed {
        return Ok(());
    }
    let still_pending = tx
        .lock_where::<Dispute>(|k: &RecordKey| option_ids.contains(&k.option_id))?
        .into_iter()
        .any(|d| d.status == DisputeStatus::Pending);
    if still_pending {
        return Ok(());
    }
    let before = market.status;
    market.transition(market.settled_status())?;
    tx.emit(DomainEvent::MarketStatusChanged {
        market_id: market.id.clone(),
        from: before,
        to: market.status,
    });
    Ok(())
}

/// Pending disputes on a market, oldest first
pub async fn pending_disputes(store: &Store, market_id: &str) -> Vec<Dispute> {
    let mut disputes: Vec<Dispute> = store
        .all::<Dispute>()
        .await
        .into_iter()
        .filter(|d| d.market_id == market_id && d.status == DisputeStatus::Pending)
        .collect();
    disputes.sort_by_key(|d| d.created_at);
    disputes
}
