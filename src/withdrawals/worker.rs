// ============================================================================
// Withdrawal Worker
// ============================================================================
//
//   1. unit of work: wallet + withdrawal → processing (re-reserving funds if a
//      previous attempt refunded them)
//   2. no locks held: provider send_funds, bounded by the provider timeout;
//      a failure refunds and marks the withdrawal failed
//   3. unit of work: record the provider transfer id on the withdrawal
//   4. no locks held: get_transaction_reference
//   5. unit of work: completed with the reference
//
// Once a transfer id is recorded the funds are out of custody: later failures
// never refund, and a retried job resumes at step 4 without sending again.
//
// A failed provider call is returned as ExternalService so the queue retries
// the job; anything else is permanent and dead-letters it.
//
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::provider::{CustodialWalletProvider, ProviderError, TransferRequest};
use super::queue::TaskQueue;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{Wallet, Withdrawal, WithdrawalStatus};
use crate::store::Store;

/// Idle wait between empty queue polls
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalJob {
    pub withdrawal_id: String,
    pub wallet_id: String,
    pub user_id: String,
    pub destination_address: String,
    pub amount: u64,
    pub idempotency_key: String,
}

impl From<&Withdrawal> for WithdrawalJob {
    fn from(w: &Withdrawal) -> Self {
        Self {
            withdrawal_id: w.id.clone(),
            wallet_id: w.wallet_id.clone(),
            user_id: w.user_id.clone(),
            destination_address: w.destination_address.clone(),
            amount: w.amount,
            idempotency_key: w.idempotency_key.clone(),
        }
    }
}

impl WithdrawalJob {
    pub fn job_id(&self) -> &str {
        &self.idempotency_key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { transaction_id: String },
    /// An earlier run already finished this withdrawal
    AlreadyCompleted,
}

enum Reservation {
    Send { source_wallet_id: String },
    /// Funds already sent by an earlier attempt
    Sent { transfer_id: String },
    Done,
}

pub struct WithdrawalWorker {
    store: Arc<Store>,
    queue: Arc<dyn TaskQueue<WithdrawalJob>>,
    provider: Arc<dyn CustodialWalletProvider>,
    config: Arc<EngineConfig>,
    provider_timeout: Duration,
}

impl WithdrawalWorker {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<dyn TaskQueue<WithdrawalJob>>,
        provider: Arc<dyn CustodialWalletProvider>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let provider_timeout = Duration::from_secs(config.provider_timeout_secs);
        Self { store, queue, provider, config, provider_timeout }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    /// Run one job through every step, resuming where an earlier attempt stopped
    pub async fn process(&self, job: &WithdrawalJob) -> EngineResult<JobOutcome> {
        let transfer_id = match self.reserve(job).await? {
            Reservation::Done => return Ok(JobOutcome::AlreadyCompleted),
            Reservation::Sent { transfer_id } => {
                tracing::info!(withdrawal_id = %job.withdrawal_id, transfer_id = %transfer_id, "resuming sent withdrawal");
                transfer_id
            }
            Reservation::Send { source_wallet_id } => self.send(job, source_wallet_id).await?,
        };

        let transaction_id = tokio::time::timeout(self.provider_timeout, self.provider.get_transaction_reference(&transfer_id))
            .await
            .unwrap_or(Err(ProviderError::Timeout))
            .map_err(|e| {
                tracing::warn!(withdrawal_id = %job.withdrawal_id, transfer_id = %transfer_id, error = %e, "transaction reference unavailable");
                EngineError::from(e)
            })?;

        self.complete(job, &transaction_id).await?;
        tracing::info!(withdrawal_id = %job.withdrawal_id, transaction_id = %transaction_id, "withdrawal completed");
        Ok(JobOutcome::Completed { transaction_id })
    }

    /// Hand the funds to the provider and record the transfer id
    async fn send(&self, job: &WithdrawalJob, source_wallet_id: String) -> EngineResult<String> {
        let transfer = TransferRequest {
            source_wallet_id,
            destination_address: job.destination_address.clone(),
            amount: job.amount,
            idempotency_key: job.idempotency_key.clone(),
        };
        let sent = tokio::time::timeout(self.provider_timeout, self.provider.send_funds(&transfer))
            .await
            .unwrap_or(Err(ProviderError::Timeout));

        match sent {
            Ok(transfer_id) => {
                self.record_transfer(job, &transfer_id).await?;
                Ok(transfer_id)
            }
            Err(e) => {
                let reason = e.to_string();
                self.refund(job, &reason).await?;
                tracing::warn!(withdrawal_id = %job.withdrawal_id, error = %reason, "withdrawal attempt failed, funds returned");
                Err(e.into())
            }
        }
    }

    async fn reserve(&self, job: &WithdrawalJob) -> EngineResult<Reservation> {
        let treasury = self.config.treasury_wallet_id.clone();
        self.store
            .transaction(&self.config.transaction_retry, |tx| {
                let mut wallet = tx.lock::<Wallet>(&job.user_id)?;
                let mut withdrawal = tx.lock::<Withdrawal>(&job.withdrawal_id)?;
                match withdrawal.status {
                    WithdrawalStatus::Completed => return Ok(Reservation::Done),
                    WithdrawalStatus::Processing if withdrawal.job_id.as_deref() != Some(job.job_id()) => {
                        return Err(EngineError::Conflict(format!(
                            "withdrawal {} is being processed by another job",
                            withdrawal.id
                        )));
                    }
                    // resumed after an interrupted attempt; funds are still reserved
                    WithdrawalStatus::Processing | WithdrawalStatus::Pending => {}
                    WithdrawalStatus::Failed => {
                        wallet.debit(withdrawal.amount)?;
                        withdrawal.transfer_id = None;
                    }
                }
                withdrawal.status = WithdrawalStatus::Processing;
                withdrawal.job_id = Some(job.job_id().to_string());
                withdrawal.attempts += 1;
                withdrawal.failure_reason = None;
                withdrawal.updated_at = Utc::now();

                let reservation = match &withdrawal.transfer_id {
                    Some(transfer_id) => Reservation::Sent { transfer_id: transfer_id.clone() },
                    None => Reservation::Send {
                        source_wallet_id: wallet.provider_wallet_id.clone().unwrap_or_else(|| treasury.clone()),
                    },
                };
                tx.update(wallet)?;
                tx.update(withdrawal)?;
                Ok(reservation)
            })
            .await
    }

    async fn record_transfer(&self, job: &WithdrawalJob, transfer_id: &str) -> EngineResult<()> {
        self.store
            .transaction(&self.config.transaction_retry, |tx| {
                let mut withdrawal = tx.lock::<Withdrawal>(&job.withdrawal_id)?;
                if withdrawal.status != WithdrawalStatus::Processing || withdrawal.job_id.as_deref() != Some(job.job_id()) {
                    return Err(EngineError::Conflict(format!(
                        "withdrawal {} changed while funds were in flight",
                        withdrawal.id
                    )));
                }
                withdrawal.transfer_id = Some(transfer_id.to_string());
                withdrawal.updated_at = Utc::now();
                tx.update(withdrawal)
            })
            .await
    }

    async fn complete(&self, job: &WithdrawalJob, transaction_id: &str) -> EngineResult<()> {
        self.store
            .transaction(&self.config.transaction_retry, |tx| {
                let mut withdrawal = tx.lock::<Withdrawal>(&job.withdrawal_id)?;
                if withdrawal.status != WithdrawalStatus::Processing || withdrawal.job_id.as_deref() != Some(job.job_id()) {
                    return Err(EngineError::Conflict(format!(
                        "withdrawal {} changed while funds were in flight",
                        withdrawal.id
                    )));
                }
                withdrawal.status = WithdrawalStatus::Completed;
                withdrawal.transaction_id = Some(transaction_id.to_string());
                withdrawal.updated_at = Utc::now();
                tx.update(withdrawal)?;
                tx.emit(DomainEvent::WithdrawalCompleted {
                    withdrawal_id: job.withdrawal_id.clone(),
                    transaction_id: transaction_id.to_string(),
                });
                Ok(())
            })
            .await
    }

    async fn refund(&self, job: &WithdrawalJob, reason: &str) -> EngineResult<()> {
        self.store
            .transaction(&self.config.transaction_retry, |tx| {
                let mut wallet = tx.lock::<Wallet>(&job.user_id)?;
                let mut withdrawal = tx.lock::<Withdrawal>(&job.withdrawal_id)?;
                if withdrawal.status != WithdrawalStatus::Processing || withdrawal.job_id.as_deref() != Some(job.job_id()) {
                    return Ok(());
                }
                wallet.credit(withdrawal.amount)?;
                withdrawal.status = WithdrawalStatus::Failed;
                withdrawal.failure_reason = Some(reason.to_string());
                withdrawal.updated_at = Utc::now();
                tx.update(wallet)?;
                tx.update(withdrawal)?;
                tx.emit(DomainEvent::WithdrawalFailed {
                    withdrawal_id: job.withdrawal_id.clone(),
                    reason: reason.to_string(),
                });
                Ok(())
            })
            .await
    }

    /// Claim and process the next due job; None when nothing is due
    pub async fn process_next(&self) -> Option<EngineResult<JobOutcome>> {
        let job = self.queue.claim().await?;
        let result = self.process(&job.payload).await;
        match &result {
            Ok(_) => self.queue.complete(&job.id).await,
            Err(e) => {
                let retryable = matches!(e, EngineError::ExternalService(_) | EngineError::TransientConflict(_));
                self.queue.fail(&job.id, &e.to_string(), retryable).await;
            }
        }
        Some(result)
    }

    /// Drain the queue forever
    pub async fn run(self: Arc<Self>) {
        tracing::info!("withdrawal worker started");
        loop {
            match self.process_next().await {
                Some(Err(e)) => tracing::debug!(error = %e, "withdrawal job did not complete"),
                Some(Ok(_)) => {}
                None => self.queue.wait(WORKER_POLL_INTERVAL).await,
            }
        }
    }
}
