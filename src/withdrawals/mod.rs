// ============================================================================
// Withdrawals - Settlement Queue
// ============================================================================
//
//   - queue: task queue contract with idempotent enqueue and backoff retries
//   - provider: custodial wallet provider trait and HTTP client
//   - worker: moves a withdrawal pending → processing → completed | failed
//
// A request reserves the amount from the wallet and enqueues one job keyed by
// the caller's idempotency key. Funds leave only from the worker, outside any
// row lock.
//
// ============================================================================

pub mod provider;
pub mod queue;
pub mod worker;

pub use provider::{provision_wallet, CustodialClient, CustodialWallet, CustodialWalletProvider, ProviderError};
pub use queue::{JobRetryPolicy, MemoryTaskQueue, TaskQueue};
pub use worker::{WithdrawalJob, WithdrawalWorker};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::OperationContext;
use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{IdempotencyClaim, Wallet, Withdrawal, WithdrawalStatus};
use crate::store::Store;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub amount: u64,
    pub destination_address: String,
    pub idempotency_key: String,
}

/// Reserve funds and queue a withdrawal. Repeating a key returns the
/// original withdrawal without debiting again.
pub async fn request_withdrawal(
    store: &Store,
    queue: &dyn TaskQueue<WithdrawalJob>,
    ctx: &OperationContext<'_>,
    user_id: &str,
    request: WithdrawalRequest,
) -> EngineResult<Withdrawal> {
    ctx.ensure_available()?;
    if user_id.trim().is_empty() {
        return Err(EngineError::Unauthorized("missing user".into()));
    }
    if request.amount == 0 {
        return Err(EngineError::Validation("amount must be positive".into()));
    }
    if request.destination_address.trim().is_empty() {
        return Err(EngineError::Validation("destination address is required".into()));
    }
    let key = request.idempotency_key.trim();
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(EngineError::Validation(format!(
            "idempotency key must be 1-{} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    let withdrawal_id = format!("wd_{}", Uuid::new_v4().simple());

    let (withdrawal, created) = store
        .transaction(&ctx.config.transaction_retry, |tx| {
            let mut wallet = tx.lock::<Wallet>(&user_id.to_string())?;

            if let Some(claim) = tx.find::<IdempotencyClaim>(&key.to_string())? {
                let existing = tx.lock::<Withdrawal>(&claim.withdrawal_id)?;
                if existing.user_id != user_id {
                    return Err(EngineError::Conflict(format!("idempotency key {} is already in use", key)));
                }
                return Ok((existing, false));
            }

            wallet.debit(request.amount)?;
            let withdrawal = Withdrawal {
                id: withdrawal_id.clone(),
                user_id: user_id.to_string(),
                wallet_id: wallet.id.clone(),
                destination_address: request.destination_address.trim().to_string(),
                amount: request.amount,
                status: WithdrawalStatus::Pending,
                idempotency_key: key.to_string(),
                job_id: Some(key.to_string()),
                transfer_id: None,
                transaction_id: None,
                failure_reason: None,
                attempts: 0,
                created_at: ctx.now,
                updated_at: ctx.now,
            };
            tx.insert(IdempotencyClaim {
                idempotency_key: key.to_string(),
                withdrawal_id: withdrawal.id.clone(),
            })?;
            tx.insert(withdrawal.clone())?;
            tx.update(wallet)?;
            tx.emit(DomainEvent::WithdrawalRequested {
                withdrawal_id: withdrawal.id.clone(),
                user_id: user_id.to_string(),
                amount: withdrawal.amount,
            });
            Ok((withdrawal, true))
        })
        .await?;

    if withdrawal.status == WithdrawalStatus::Pending {
        // duplicate keys collapse in the queue, so re-enqueueing a replay is harmless
        let enqueued = queue.enqueue(&withdrawal.idempotency_key, WithdrawalJob::from(&withdrawal)).await;
        tracing::debug!(withdrawal_id = %withdrawal.id, enqueued, "withdrawal job submitted");
    }
    if created {
        tracing::info!(withdrawal_id = %withdrawal.id, user_id, amount = withdrawal.amount, "withdrawal requested");
    }
    Ok(withdrawal)
}
