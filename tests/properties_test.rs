/// Invariants that must hold across any sequence of engine operations

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};

use common::{seeded_store, total_value, MARKET, OPTION, OUTCOME};
use prediction_settlement_engine::amm::liquidity::MAX_STEP;
use prediction_settlement_engine::market_resolve::engine::{resolve, EngineSubmission, ResolutionContext};
use prediction_settlement_engine::models::IdempotencyClaim;
use prediction_settlement_engine::withdrawals::queue::{JobRetryPolicy, MemoryTaskQueue};
use prediction_settlement_engine::withdrawals::{TaskQueue, WithdrawalJob};
use prediction_settlement_engine::*;
use rust_decimal::Decimal;

fn ctx_at(config: &EngineConfig, now: chrono::DateTime<Utc>) -> OperationContext<'_> {
    OperationContext::new(config, PlatformFlags::default(), now)
}

async fn resolve_yes(store: &Store, config: &EngineConfig, now: chrono::DateTime<Utc>) {
    let request = ResolutionRequest {
        market_id: MARKET.into(),
        option_id: OPTION.into(),
        outcome: OUTCOME.into(),
        evidence: Evidence::Authority { statement: "Confirmed by the weather service".into(), attachments: vec![] },
        winning_side: Some(Side::Yes),
    };
    submit_resolution(store, &ctx_at(config, now), &Actor::user("carol"), request).await.unwrap();
}

#[tokio::test]
async fn test_value_is_conserved_through_the_lifecycle() {
    let users = [("alice", 1_000 * UNIT), ("bob", 1_000 * UNIT), ("dan", 500 * UNIT)];
    let store = seeded_store(ResolutionMode::Authority, &users);
    let config = EngineConfig::default();
    let now = Utc::now();
    let ctx = ctx_at(&config, now);
    let initial = total_value(&store).await;

    buy(&store, &ctx, "alice", MARKET, OPTION, Side::Yes, 120 * UNIT, None).await.unwrap();
    buy(&store, &ctx, "bob", MARKET, OPTION, Side::No, 75 * UNIT, None).await.unwrap();
    sell(&store, &ctx, "alice", MARKET, OPTION, Side::Yes, 20 * UNIT, None).await.unwrap();
    buy(&store, &ctx, "bob", MARKET, OPTION, Side::Yes, 3_333_333, None).await.unwrap();
    assert_eq!(total_value(&store).await, initial);

    resolve_yes(&store, &config, now).await;
    let dispute = DisputeRequest {
        market_id: MARKET.into(),
        option_id: OPTION.into(),
        reason: "Forecast source was wrong".into(),
        evidence: None,
    };
    file_dispute(&store, &ctx_at(&config, now + Duration::minutes(1)), "dan", dispute).await.unwrap();
    assert_eq!(total_value(&store).await, initial);

    settle_option(&store, &config.transaction_retry, OPTION).await.unwrap();
    assert_eq!(total_value(&store).await, initial);
}

#[tokio::test]
async fn test_liquidity_parameter_moves_at_most_ten_percent_per_trade() {
    let store = seeded_store(ResolutionMode::Authority, &[("alice", 100_000 * UNIT)]);
    let config = EngineConfig::default();
    let ctx = ctx_at(&config, Utc::now());

    let mut prior = store.require::<Market>(&MARKET.to_string()).await.unwrap().liquidity_parameter;
    for (i, shares) in [500u64, 2_000, 50, 5_000, 10].into_iter().enumerate() {
        let side = if i % 2 == 0 { Side::Yes } else { Side::No };
        let receipt = buy(&store, &ctx, "alice", MARKET, OPTION, side, shares * UNIT, None).await.unwrap();
        let next = receipt.liquidity_parameter;
        let limit = Decimal::from(prior) * MAX_STEP;
        assert!(
            Decimal::from(next.abs_diff(prior)) <= limit,
            "b moved from {} to {} in one trade",
            prior,
            next
        );
        assert!(next >= 1_000 * 1_000);
        prior = next;
    }
}

#[tokio::test]
async fn test_settlement_runs_once() {
    let store = seeded_store(ResolutionMode::Authority, &[("alice", 500 * UNIT), ("bob", 500 * UNIT)]);
    let config = EngineConfig::default();
    let now = Utc::now();
    let ctx = ctx_at(&config, now);
    buy(&store, &ctx, "alice", MARKET, OPTION, Side::Yes, 10 * UNIT, None).await.unwrap();
    buy(&store, &ctx, "bob", MARKET, OPTION, Side::No, 10 * UNIT, None).await.unwrap();
    resolve_yes(&store, &config, now).await;

    let first = settle_option(&store, &config.transaction_retry, OPTION).await.unwrap();
    assert_eq!(first.winners_paid, 1);
    assert_eq!(first.losers_closed, 1);
    assert_eq!(first.total_paid, 10 * UNIT);
    let mut balances: Vec<u64> = store.all::<Wallet>().await.iter().map(|w| w.balance_usdc).collect();
    balances.sort();

    let second = settle_option(&store, &config.transaction_retry, OPTION).await.unwrap();
    assert!(second.is_noop());
    let mut after: Vec<u64> = store.all::<Wallet>().await.iter().map(|w| w.balance_usdc).collect();
    after.sort();
    assert_eq!(balances, after);

    let claim = claim_winnings(&store, &config.transaction_retry, "alice", OPTION).await;
    assert!(matches!(claim, Err(EngineError::Conflict(_))));
}

#[test]
fn test_resolution_is_deterministic() {
    let context = ResolutionContext {
        market_id: MARKET.into(),
        option_id: OPTION.into(),
        mode: ResolutionMode::Opinion,
        declared_outcomes: vec![OUTCOME.into()],
    };
    let at = Utc::now();
    let vote = |who: &str, side: Side, offset: i64| EngineSubmission {
        submitter: who.into(),
        outcome: OUTCOME.into(),
        winning_side: side,
        evidence_hash: format!("h-{}", who),
        submitted_at: at + Duration::seconds(offset),
    };
    let votes = vec![vote("a", Side::No, 0), vote("b", Side::Yes, 1), vote("c", Side::No, 2), vote("d", Side::Yes, 3)];

    let first = resolve(&context, &votes).unwrap();
    let again = resolve(&context, &votes).unwrap();
    assert_eq!(first, again);
    let reversed: Vec<EngineSubmission> = votes.iter().rev().cloned().collect();
    assert_eq!(resolve(&context, &reversed).unwrap().canonical_hash, first.canonical_hash);

    // two-two tie: "Rain:NO" sorts before "Rain:YES"
    assert_eq!(first.winning_side, Side::No);
    assert_eq!(first.canonical_hash.len(), 64);
}

#[tokio::test]
async fn test_dispute_window_closes() {
    let store = seeded_store(ResolutionMode::Authority, &[("dan", 500 * UNIT)]);
    let config = EngineConfig::default();
    let resolved_at = Utc::now();
    resolve_yes(&store, &config, resolved_at).await;

    let request = || DisputeRequest {
        market_id: MARKET.into(),
        option_id: OPTION.into(),
        reason: "Too late?".into(),
        evidence: None,
    };
    let late = ctx_at(&config, resolved_at + config.dispute_window());
    let err = file_dispute(&store, &late, "dan", request()).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let just_in_time = ctx_at(&config, resolved_at + config.dispute_window() - Duration::seconds(1));
    file_dispute(&store, &just_in_time, "dan", request()).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_withdrawals_with_one_key_debit_once() {
    let store = Arc::new(seeded_store(ResolutionMode::Authority, &[("erin", 100 * UNIT)]));
    let config = EngineConfig::default();
    let queue: Arc<MemoryTaskQueue<WithdrawalJob>> = Arc::new(MemoryTaskQueue::new(JobRetryPolicy::default()));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let queue = queue.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let ctx = OperationContext::new(&config, PlatformFlags::default(), Utc::now());
            let request = WithdrawalRequest {
                amount: 60 * UNIT,
                destination_address: "0xdest".into(),
                idempotency_key: "same-key".into(),
            };
            request_withdrawal(&store, queue.as_ref(), &ctx, "erin", request).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(withdrawal) => ids.push(withdrawal.id),
            // lock contention that outlasted the retry budget; never a second debit
            Err(e) => assert!(e.is_transient(), "unexpected error {}", e),
        }
    }
    assert!(!ids.is_empty());
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let wallet = store.require::<Wallet>(&"erin".to_string()).await.unwrap();
    assert_eq!(wallet.balance_usdc, 40 * UNIT);
    assert_eq!(store.keys::<IdempotencyClaim>().len(), 1);
    assert_eq!(queue.stats().await.queued, 1);
}
