// ============================================================================
// Resolution Submission Workflow
// ============================================================================
//
// submit_resolution → validate → lock market, option → authorize → verify
// evidence → record submission → (approval gate | opinion quorum | apply)
//
// Applying a resolution marks the option, records the audit trace, moves the
// market forward and emits OptionResolved. Paying winners happens later, in
// its own unit of work, when the settlement dispatcher sees that event.
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::engine::{self, EngineSubmission, Resolution, ResolutionContext};
use super::evidence::Evidence;
use crate::config::OperationContext;
use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{
    Actor, ApprovalKey, Market, MarketOption, MarketResolution, MarketStatus, RecordKey, ResolutionApproval,
    ResolutionMode, ResolutionSubmission, Side, SubmissionStatus,
};
use crate::store::{Store, Tx};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRequest {
    pub market_id: String,
    pub option_id: String,
    pub outcome: String,
    pub evidence: Evidence,
    /// Defaults to YES
    #[serde(default)]
    pub winning_side: Option<Side>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Resolved {
        submission_id: String,
        option_id: String,
        winning_side: Side,
        canonical_hash: String,
        dispute_deadline: Option<DateTime<Utc>>,
    },
    PendingApproval {
        submission_id: String,
        current: usize,
        needed: usize,
    },
    AwaitingQuorum {
        submission_id: String,
        votes: usize,
        needed: usize,
    },
}

impl ResolutionOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ResolutionOutcome::Resolved { .. })
    }
}

// ============================================================================
// SUBMIT
// ============================================================================

pub async fn submit_resolution(
    store: &Store,
    ctx: &OperationContext<'_>,
    actor: &Actor,
    request: ResolutionRequest,
) -> EngineResult<ResolutionOutcome> {
    ctx.ensure_available()?;
    if request.market_id.is_empty() || request.option_id.is_empty() {
        return Err(EngineError::Validation("market and option ids are required".into()));
    }
    if request.outcome.trim().is_empty() {
        return Err(EngineError::Validation("outcome is required".into()));
    }
    request.evidence.validate()?;
    let evidence_hash = request.evidence.hash()?;
    let evidence_json = serde_json::to_value(&request.evidence)
        .map_err(|e| EngineError::Internal(format!("evidence serialization failed: {}", e)))?;
    let submission_id = format!("sub_{}", Uuid::new_v4().simple());

    let outcome = store
        .transaction(&ctx.config.transaction_retry, |tx| {
            let (market, option) = lock_for_resolution(tx, &request.market_id, &request.option_id)?;
            let mode = market.effective_mode();
            request.evidence.ensure_mode(mode)?;
            if option.label != request.outcome {
                return Err(EngineError::Validation(format!(
                    "outcome '{}' does not match option '{}'",
                    request.outcome, option.label
                )));
            }
            authorize(ctx, actor, &market, mode)?;
            request.evidence.verify(ctx.config)?;

            let requires_approval =
                mode != ResolutionMode::Opinion && market.total_volume > ctx.config.approval_volume_threshold;

            let mut submission = ResolutionSubmission {
                id: submission_id.clone(),
                market_id: market.id.clone(),
                option_id: option.id.clone(),
                user_id: actor.user_id.clone(),
                outcome: request.outcome.clone(),
                winning_side: request.winning_side.unwrap_or(Side::Yes),
                evidence: evidence_json.clone(),
                evidence_hash: evidence_hash.clone(),
                requires_approval,
                status: SubmissionStatus::PendingApproval,
                submitted_at: ctx.now,
            };

            if requires_approval {
                tx.insert(submission.clone())?;
                if actor.is_admin() {
                    tx.insert(ResolutionApproval {
                        market_id: market.id.clone(),
                        submission_id: submission.id.clone(),
                        admin_user_id: actor.user_id.clone(),
                        approved_at: ctx.now,
                    })?;
                }
                return gate_on_approvals(tx, ctx, market, option, submission);
            }

            if mode == ResolutionMode::Opinion {
                let mut votes = open_submissions(tx, &option.id)?;
                if votes.iter().any(|v| v.user_id == actor.user_id) {
                    return Err(EngineError::Conflict(format!(
                        "{} has already voted on option {}",
                        actor.user_id, option.id
                    )));
                }
                let needed = ctx.config.opinion_quorum.max(1);
                if votes.len() + 1 < needed {
                    submission.status = SubmissionStatus::AwaitingQuorum;
                    tx.insert(submission.clone())?;
                    emit_submitted(tx, &submission);
                    return Ok(ResolutionOutcome::AwaitingQuorum {
                        submission_id: submission.id,
                        votes: votes.len() + 1,
                        needed,
                    });
                }
                submission.status = SubmissionStatus::AwaitingQuorum;
                tx.insert(submission.clone())?;
                votes.push(submission.clone());
                return apply(tx, ctx, market, option, &submission.id, votes, &actor.user_id);
            }

            tx.insert(submission.clone())?;
            apply(tx, ctx, market, option, &submission.id, vec![submission.clone()], &actor.user_id)
        })
        .await?;

    tracing::info!(
        market_id = %request.market_id,
        option_id = %request.option_id,
        user_id = %actor.user_id,
        resolved = outcome.is_resolved(),
        "resolution submitted"
    );
    Ok(outcome)
}

// ============================================================================
// APPROVE
// ============================================================================

/// Record one admin approval; applies the submission once enough have been given
pub async fn approve_submission(
    store: &Store,
    ctx: &OperationContext<'_>,
    actor: &Actor,
    market_id: &str,
    submission_id: &str,
) -> EngineResult<ResolutionOutcome> {
    ctx.ensure_available()?;
    if !actor.is_admin() {
        return Err(EngineError::Unauthorized("only admins can approve resolutions".into()));
    }
    let key = store.record_key::<ResolutionSubmission>(submission_id)?;

    let outcome = store
        .transaction(&ctx.config.transaction_retry, |tx| {
            let (market, option) = lock_for_resolution(tx, market_id, &key.option_id)?;
            let submission = tx.lock::<ResolutionSubmission>(&key)?;
            if submission.market_id != market.id {
                return Err(EngineError::not_found("submission", submission_id));
            }
            if submission.status != SubmissionStatus::PendingApproval {
                return Err(EngineError::Conflict(format!(
                    "submission {} is not awaiting approval",
                    submission_id
                )));
            }

            let approval = ResolutionApproval {
                market_id: market.id.clone(),
                submission_id: submission.id.clone(),
                admin_user_id: actor.user_id.clone(),
                approved_at: ctx.now,
            };
            if tx.find::<ResolutionApproval>(&approval.key())?.is_some() {
                return Err(EngineError::Conflict(format!(
                    "{} already approved submission {}",
                    actor.user_id, submission_id
                )));
            }
            tx.insert(approval)?;
            gate_on_approvals(tx, ctx, market, option, submission)
        })
        .await?;

    tracing::info!(market_id, submission_id, admin = %actor.user_id, resolved = outcome.is_resolved(), "approval recorded");
    Ok(outcome)
}

// ============================================================================
// HELPERS
// ============================================================================

fn lock_for_resolution(tx: &mut Tx<'_>, market_id: &str, option_id: &str) -> EngineResult<(Market, MarketOption)> {
    let market = tx.lock::<Market>(&market_id.to_string())?;
    if !market.status.accepts_resolution() {
        return Err(EngineError::Conflict(format!(
            "market {} is {} and cannot accept resolutions",
            market.id, market.status
        )));
    }
    let option = tx.lock::<MarketOption>(&option_id.to_string())?;
    if option.market_id != market.id {
        return Err(EngineError::not_found("option", option_id));
    }
    if option.is_resolved {
        return Err(EngineError::Conflict(format!("option {} is already resolved", option.id)));
    }
    Ok((market, option))
}

fn authorize(ctx: &OperationContext<'_>, actor: &Actor, market: &Market, mode: ResolutionMode) -> EngineResult<()> {
    match mode {
        ResolutionMode::Oracle => {
            if !actor.is_admin() {
                return Err(EngineError::Unauthorized("oracle markets are resolved by the platform".into()));
            }
        }
        ResolutionMode::Authority => {
            if !actor.is_admin() && actor.user_id != market.creator_id {
                return Err(EngineError::Unauthorized(
                    "only the market creator or an admin can resolve this market".into(),
                ));
            }
        }
        ResolutionMode::Opinion => {
            if ctx.now < market.expires_at {
                return Err(EngineError::Forbidden(format!(
                    "opinion voting opens when the market expires at {}",
                    market.expires_at.to_rfc3339()
                )));
            }
        }
    }
    Ok(())
}

fn gate_on_approvals(
    tx: &mut Tx<'_>,
    ctx: &OperationContext<'_>,
    market: Market,
    option: MarketOption,
    submission: ResolutionSubmission,
) -> EngineResult<ResolutionOutcome> {
    let current = tx
        .lock_where::<ResolutionApproval>(|k: &ApprovalKey| {
            k.market_id == submission.market_id && k.submission_id == submission.id
        })?
        .len();
    let needed = ctx.config.required_approvals;
    if current < needed {
        emit_submitted(tx, &submission);
        return Ok(ResolutionOutcome::PendingApproval { submission_id: submission.id, current, needed });
    }
    let resolved_by = submission.user_id.clone();
    let submission_id = submission.id.clone();
    apply(tx, ctx, market, option, &submission_id, vec![submission], &resolved_by)
}

fn open_submissions(tx: &mut Tx<'_>, option_id: &str) -> EngineResult<Vec<ResolutionSubmission>> {
    Ok(tx
        .lock_where::<ResolutionSubmission>(|k: &RecordKey| k.option_id == option_id)?
        .into_iter()
        .filter(|s| matches!(s.status, SubmissionStatus::AwaitingQuorum | SubmissionStatus::PendingApproval))
        .collect())
}

fn emit_submitted(tx: &mut Tx<'_>, submission: &ResolutionSubmission) {
    tx.emit(DomainEvent::ResolutionSubmitted {
        market_id: submission.market_id.clone(),
        option_id: submission.option_id.clone(),
        submission_id: submission.id.clone(),
        requires_approval: submission.requires_approval,
    });
}

/// Run the engine over `inputs` and write the result
fn apply(
    tx: &mut Tx<'_>,
    ctx: &OperationContext<'_>,
    mut market: Market,
    mut option: MarketOption,
    submission_id: &str,
    mut inputs: Vec<ResolutionSubmission>,
    resolved_by: &str,
) -> EngineResult<ResolutionOutcome> {
    let mode = market.effective_mode();
    inputs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
    let engine_inputs: Vec<EngineSubmission> = inputs
        .iter()
        .map(|s| EngineSubmission {
            submitter: s.user_id.clone(),
            outcome: s.outcome.clone(),
            winning_side: s.winning_side,
            evidence_hash: s.evidence_hash.clone(),
            submitted_at: s.submitted_at,
        })
        .collect();
    let context = ResolutionContext {
        market_id: market.id.clone(),
        option_id: option.id.clone(),
        mode,
        declared_outcomes: vec![option.label.clone()],
    };
    let resolution: Resolution = engine::resolve(&context, &engine_inputs)?;

    option.is_resolved = true;
    option.winning_side = Some(resolution.winning_side);
    option.resolved_at = Some(ctx.now);
    option.resolved_by = Some(resolved_by.to_string());
    option.resolved_reason = Some(format!("{} resolution: {}", mode, resolution.final_outcome));
    if mode != ResolutionMode::Opinion {
        option.set_dispute_deadline(ctx.now + ctx.config.dispute_window())?;
    }

    tx.insert(MarketResolution {
        market_id: market.id.clone(),
        option_id: option.id.clone(),
        final_outcome: resolution.final_outcome.clone(),
        winning_side: resolution.winning_side,
        resolution_mode: mode,
        resolution_trace: resolution.trace.clone(),
        canonical_hash: resolution.canonical_hash.clone(),
        created_at: ctx.now,
    })?;

    // Inputs were applied; any other open submission on this option is moot
    let used: Vec<&str> = inputs.iter().map(|s| s.id.as_str()).collect();
    for mut other in open_submissions(tx, &option.id)? {
        other.status = if used.contains(&other.id.as_str()) {
            SubmissionStatus::Applied
        } else {
            SubmissionStatus::Superseded
        };
        tx.update(other)?;
    }

    market.resolved_options = (market.resolved_options + 1).min(market.option_count);
    let before = market.status;
    if market.status == MarketStatus::Open {
        market.transition(MarketStatus::Resolving)?;
    }
    if market.all_options_resolved() {
        market.transition(MarketStatus::Resolved)?;
        market.is_resolved = true;
    }
    if market.status != before {
        tx.emit(DomainEvent::MarketStatusChanged {
            market_id: market.id.clone(),
            from: before,
            to: market.status,
        });
    }

    let outcome = ResolutionOutcome::Resolved {
        submission_id: submission_id.to_string(),
        option_id: option.id.clone(),
        winning_side: resolution.winning_side,
        canonical_hash: resolution.canonical_hash,
        dispute_deadline: option.dispute_deadline,
    };
    tx.emit(DomainEvent::OptionResolved {
        market_id: market.id.clone(),
        option_id: option.id.clone(),
        winning_side: resolution.winning_side,
        resolved_by: resolved_by.to_string(),
        at: ctx.now,
    });
    tx.update(option)?;
    tx.update(market)?;
    Ok(outcome)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PlatformFlags};
    use crate::models::UNIT;
    use chrono::Duration;

    fn seed(store: &Store, mode: ResolutionMode, volume: u64, expires_in: Duration) {
        let now = Utc::now();
        let market = Market {
            id: "m1".into(),
            question: "Will it rain?".into(),
            creator_id: "carol".into(),
            resolution_mode: Some(mode),
            status: MarketStatus::Open,
            liquidity_parameter: UNIT,
            base_liquidity_parameter: 1_000,
            shared_pool_liquidity: 500 * UNIT,
            outstanding_shares: 0,
            total_volume: volume,
            creator_fees: 0,
            protocol_fees: 0,
            lp_fees: 0,
            option_count: 0,
            resolved_options: 0,
            is_resolved: false,
            is_initialized: true,
            expires_at: now + expires_in,
            created_at: now,
        };
        store
            .seed_market(
                market,
                vec![MarketOption::new("o1", "m1", "Rain"), MarketOption::new("o2", "m1", "Snow")],
            )
            .unwrap();
    }

    fn authority(outcome: &str, option: &str) -> ResolutionRequest {
        ResolutionRequest {
            market_id: "m1".into(),
            option_id: option.into(),
            outcome: outcome.into(),
            evidence: Evidence::Authority { statement: "Weather service report".into(), attachments: vec![] },
            winning_side: None,
        }
    }

    fn opinion(option: &str, side: Side) -> ResolutionRequest {
        ResolutionRequest {
            market_id: "m1".into(),
            option_id: option.into(),
            outcome: "Rain".into(),
            evidence: Evidence::Opinion { comment: None },
            winning_side: Some(side),
        }
    }

    #[tokio::test]
    async fn test_creator_resolves_authority_market() {
        let store = Store::new();
        seed(&store, ResolutionMode::Authority, 0, Duration::days(1));
        let config = EngineConfig::default();
        let ctx = OperationContext::new(&config, PlatformFlags::default(), Utc::now());

        let outcome = submit_resolution(&store, &ctx, &Actor::user("carol"), authority("Rain", "o1"))
            .await
            .unwrap();
        let ResolutionOutcome::Resolved { winning_side, dispute_deadline, .. } = outcome else {
            panic!("expected a resolution, got {:?}", outcome);
        };
        assert_eq!(winning_side, Side::Yes);
        assert_eq!(dispute_deadline, Some(ctx.now + Duration::hours(2)));

        let market = store.require::<Market>(&"m1".to_string()).await.unwrap();
        assert_eq!(market.status, MarketStatus::Resolving);
        assert_eq!(market.resolved_options, 1);
        assert!(store.get::<MarketResolution>(&"o1".to_string()).await.is_some());

        submit_resolution(&store, &ctx, &Actor::admin("root"), authority("Snow", "o2")).await.unwrap();
        let market = store.require::<Market>(&"m1".to_string()).await.unwrap();
        assert_eq!(market.status, MarketStatus::Resolved);
        assert!(market.is_resolved);
    }

    #[tokio::test]
    async fn test_strangers_cannot_resolve() {
        let store = Store::new();
        seed(&store, ResolutionMode::Authority, 0, Duration::days(1));
        let config = EngineConfig::default();
        let ctx = OperationContext::new(&config, PlatformFlags::default(), Utc::now());

        let err = submit_resolution(&store, &ctx, &Actor::user("mallory"), authority("Rain", "o1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
        assert!(store.keys::<ResolutionSubmission>().is_empty());
    }

    #[tokio::test]
    async fn test_second_resolution_conflicts() {
        let store = Store::new();
        seed(&store, ResolutionMode::Authority, 0, Duration::days(1));
        let config = EngineConfig::default();
        let ctx = OperationContext::new(&config, PlatformFlags::default(), Utc::now());

        submit_resolution(&store, &ctx, &Actor::user("carol"), authority("Rain", "o1")).await.unwrap();
        let err = submit_resolution(&store, &ctx, &Actor::user("carol"), authority("Rain", "o1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_mismatched_evidence_is_rejected() {
        let store = Store::new();
        seed(&store, ResolutionMode::Authority, 0, Duration::days(1));
        let config = EngineConfig::default();
        let ctx = OperationContext::new(&config, PlatformFlags::default(), Utc::now());

        let err = submit_resolution(&store, &ctx, &Actor::user("carol"), opinion("o1", Side::Yes))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_high_volume_needs_two_admins() {
        let store = Store::new();
        seed(&store, ResolutionMode::Authority, 20_000 * UNIT, Duration::days(1));
        let config = EngineConfig::default();
        let ctx = OperationContext::new(&config, PlatformFlags::default(), Utc::now());

        let outcome = submit_resolution(&store, &ctx, &Actor::admin("root"), authority("Rain", "o1"))
            .await
            .unwrap();
        let ResolutionOutcome::PendingApproval { submission_id, current, needed } = outcome else {
            panic!("expected pending approval, got {:?}", outcome);
        };
        assert_eq!((current, needed), (1, 2));

        let err = approve_submission(&store, &ctx, &Actor::admin("root"), "m1", &submission_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let err = approve_submission(&store, &ctx, &Actor::user("carol"), "m1", &submission_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));

        let outcome = approve_submission(&store, &ctx, &Actor::admin("ops"), "m1", &submission_id)
            .await
            .unwrap();
        assert!(outcome.is_resolved());

        let option = store.require::<MarketOption>(&"o1".to_string()).await.unwrap();
        assert_eq!(option.resolved_by.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn test_opinion_waits_for_expiry_and_has_no_deadline() {
        let store = Store::new();
        seed(&store, ResolutionMode::Opinion, 0, Duration::hours(1));
        let config = EngineConfig::default();
        let now = Utc::now();

        let early = OperationContext::new(&config, PlatformFlags::default(), now);
        let err = submit_resolution(&store, &early, &Actor::user("voter"), opinion("o1", Side::No))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        let later = OperationContext::new(&config, PlatformFlags::default(), now + Duration::hours(2));
        let outcome = submit_resolution(&store, &later, &Actor::user("voter"), opinion("o1", Side::No))
            .await
            .unwrap();
        let ResolutionOutcome::Resolved { winning_side, dispute_deadline, .. } = outcome else {
            panic!("expected a resolution, got {:?}", outcome);
        };
        assert_eq!(winning_side, Side::No);
        assert_eq!(dispute_deadline, None);
    }

    #[tokio::test]
    async fn test_opinion_quorum() {
        let store = Store::new();
        seed(&store, ResolutionMode::Opinion, 0, -Duration::hours(1));
        let config = EngineConfig { opinion_quorum: 3, ..Default::default() };
        let ctx = OperationContext::new(&config, PlatformFlags::default(), Utc::now());

        let first = submit_resolution(&store, &ctx, &Actor::user("a"), opinion("o1", Side::Yes)).await.unwrap();
        assert!(matches!(first, ResolutionOutcome::AwaitingQuorum { votes: 1, needed: 3, .. }));

        let dup = submit_resolution(&store, &ctx, &Actor::user("a"), opinion("o1", Side::Yes)).await;
        assert!(matches!(dup, Err(EngineError::Conflict(_))));

        submit_resolution(&store, &ctx, &Actor::user("b"), opinion("o1", Side::No)).await.unwrap();
        let last = submit_resolution(&store, &ctx, &Actor::user("c"), opinion("o1", Side::Yes)).await.unwrap();
        let ResolutionOutcome::Resolved { winning_side, .. } = last else {
            panic!("expected a resolution, got {:?}", last);
        };
        assert_eq!(winning_side, Side::Yes);

        let submissions = store.all::<ResolutionSubmission>().await;
        assert!(submissions.iter().all(|s| s.status == SubmissionStatus::Applied));
    }
}
