//! Liquidity solvency monitor
//!
//! Compares each market's pool against the most it could owe: the larger of
//! what resolved options still owe unclaimed winners and the worst-case payout
//! of the options still open. Alerts are kept one row per (market, type) and
//! updated in place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::DomainEvent;
use crate::models::{AlertKey, AlertSeverity, AlertType, LiquidityAlert, Market, MarketOption};
use crate::store::{Store, Tx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolvencyStatus {
    Solvent,
    LowLiquidity,
    InsolvencyRisk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvencyReport {
    pub market_id: String,
    pub current_liquidity: u64,
    pub required_liquidity: u64,
    /// None when nothing is owed
    pub reserve_ratio: Option<Decimal>,
    pub status: SolvencyStatus,
    pub checked_at: DateTime<Utc>,
}

/// What the market's pool must be able to pay out
pub fn required_liquidity(options: &[MarketOption]) -> u64 {
    let mut already_winning = 0u64;
    let mut potential = 0u64;
    for option in options {
        match (option.is_resolved, option.winning_side) {
            // settlement burns paid shares, so what is left is still owed
            (true, Some(side)) => already_winning = already_winning.saturating_add(option.quantity(side)),
            (true, None) => {}
            (false, _) => potential = potential.saturating_add(option.yes_quantity.max(option.no_quantity)),
        }
    }
    already_winning.max(potential)
}

pub fn reserve_ratio(current: u64, required: u64) -> Option<Decimal> {
    if required == 0 {
        return None;
    }
    Decimal::from(current)
        .checked_div(Decimal::from(required))
        .map(|r| r.round_dp(4))
}

pub fn classify(ratio: Option<Decimal>, config: &EngineConfig) -> SolvencyStatus {
    match ratio {
        Some(r) if r < config.solvency_critical_ratio => SolvencyStatus::InsolvencyRisk,
        Some(r) if r < config.solvency_warning_ratio => SolvencyStatus::LowLiquidity,
        _ => SolvencyStatus::Solvent,
    }
}

/// Evaluate one market and bring its alerts in line.
///
/// Returns None when another unit of work holds the market; the next cycle
/// picks it up.
pub async fn evaluate_market(
    store: &Store,
    config: &EngineConfig,
    now: DateTime<Utc>,
    market_id: &str,
) -> EngineResult<Option<SolvencyReport>> {
    let option_ids = store.option_ids(market_id);
    store
        .transaction(&config.transaction_retry, |tx| {
            let Some(market) = tx.try_lock::<Market>(&market_id.to_string())? else {
                return Ok(None);
            };
            let mut options = Vec::with_capacity(option_ids.len());
            for id in &option_ids {
                options.push(tx.lock::<MarketOption>(id)?);
            }

            let required = required_liquidity(&options);
            let ratio = reserve_ratio(market.shared_pool_liquidity, required);
            let status = classify(ratio, config);
            let report = SolvencyReport {
                market_id: market.id.clone(),
                current_liquidity: market.shared_pool_liquidity,
                required_liquidity: required,
                reserve_ratio: ratio,
                status,
                checked_at: now,
            };

            match status {
                SolvencyStatus::InsolvencyRisk => {
                    raise(tx, &report, AlertType::InsolvencyRisk, AlertSeverity::Critical)?;
                    clear(tx, &market.id, AlertType::LowLiquidity, now)?;
                }
                SolvencyStatus::LowLiquidity => {
                    raise(tx, &report, AlertType::LowLiquidity, AlertSeverity::Warning)?;
                    clear(tx, &market.id, AlertType::InsolvencyRisk, now)?;
                }
                SolvencyStatus::Solvent => {
                    clear(tx, &market.id, AlertType::InsolvencyRisk, now)?;
                    clear(tx, &market.id, AlertType::LowLiquidity, now)?;
                }
            }
            Ok(Some(report))
        })
        .await
}

fn raise(tx: &mut Tx<'_>, report: &SolvencyReport, alert_type: AlertType, severity: AlertSeverity) -> EngineResult<()> {
    let key = AlertKey { market_id: report.market_id.clone(), alert_type };
    let ratio = report.reserve_ratio.unwrap_or_default();

    match tx.find::<LiquidityAlert>(&key)? {
        Some(mut alert) if !alert.is_resolved => {
            alert.current_liquidity = report.current_liquidity;
            alert.required_liquidity = report.required_liquidity;
            alert.reserve_ratio = ratio;
            alert.severity = severity;
            alert.updated_at = report.checked_at;
            tx.update(alert)
        }
        existing => {
            let alert = LiquidityAlert {
                id: format!("alert_{}", Uuid::new_v4().simple()),
                market_id: report.market_id.clone(),
                alert_type,
                current_liquidity: report.current_liquidity,
                required_liquidity: report.required_liquidity,
                reserve_ratio: ratio,
                severity,
                is_resolved: false,
                created_at: report.checked_at,
                updated_at: report.checked_at,
            };
            if existing.is_some() {
                tx.update(alert)?;
            } else {
                tx.insert(alert)?;
            }
            tx.emit(DomainEvent::LiquidityAlertRaised {
                market_id: report.market_id.clone(),
                alert_type,
                severity,
                reserve_ratio: ratio,
            });
            Ok(())
        }
    }
}

fn clear(tx: &mut Tx<'_>, market_id: &str, alert_type: AlertType, now: DateTime<Utc>) -> EngineResult<()> {
    let key = AlertKey { market_id: market_id.to_string(), alert_type };
    if let Some(mut alert) = tx.find::<LiquidityAlert>(&key)? {
        if !alert.is_resolved {
            alert.is_resolved = true;
            alert.updated_at = now;
            tx.update(alert)?;
            tx.emit(DomainEvent::LiquidityAlertCleared { market_id: market_id.to_string(), alert_type });
        }
    }
    Ok(())
}

/// One sweep over every unresolved, initialized market
pub async fn run_cycle(store: &Store, config: &EngineConfig, now: DateTime<Utc>) -> Vec<SolvencyReport> {
    let mut reports = Vec::new();
    for market_id in store.market_ids() {
        let Some(market) = store.get::<Market>(&market_id).await else {
            continue;
        };
        if market.is_resolved || !market.is_initialized {
            continue;
        }
        match evaluate_market(store, config, now, &market_id).await {
            Ok(Some(report)) => {
                if report.status != SolvencyStatus::Solvent {
                    tracing::warn!(
                        market_id = %report.market_id,
                        status = ?report.status,
                        current = report.current_liquidity,
                        required = report.required_liquidity,
                        "market below reserve target"
                    );
                }
                reports.push(report);
            }
            Ok(None) => tracing::debug!(market_id = %market_id, "market busy, skipped this cycle"),
            Err(e) => tracing::error!(market_id = %market_id, error = %e, "solvency check failed"),
        }
    }
    reports
}

pub fn spawn_monitor(store: Arc<Store>, config: Arc<EngineConfig>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(config.monitor_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let reports = run_cycle(&store, &config, Utc::now()).await;
            tracing::debug!(markets = reports.len(), "solvency cycle complete");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketStatus, Side, UNIT};
    use rust_decimal_macros::dec;

    fn seed(store: &Store, pool: u64, yes: u64, no: u64) {
        let now = Utc::now();
        let market = Market {
            id: "m1".into(),
            question: "Will it rain?".into(),
            creator_id: "carol".into(),
            resolution_mode: None,
            status: MarketStatus::Open,
            liquidity_parameter: UNIT,
            base_liquidity_parameter: 1_000,
            shared_pool_liquidity: pool,
            outstanding_shares: yes + no,
            total_volume: 0,
            creator_fees: 0,
            protocol_fees: 0,
            lp_fees: 0,
            option_count: 0,
            resolved_options: 0,
            is_resolved: false,
            is_initialized: true,
            expires_at: now,
            created_at: now,
        };
        let mut option = MarketOption::new("o1", "m1", "Rain");
        option.yes_quantity = yes;
        option.no_quantity = no;
        store.seed_market(market, vec![option]).unwrap();
    }

    async fn set_pool(store: &Store, pool: u64) {
        store
            .transaction(&Default::default(), |tx| {
                let mut market = tx.lock::<Market>(&"m1".to_string())?;
                market.shared_pool_liquidity = pool;
                tx.update(market)
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_required_liquidity_takes_worst_case() {
        let mut open = MarketOption::new("o1", "m1", "A");
        open.yes_quantity = 30;
        open.no_quantity = 70;
        let mut resolved = MarketOption::new("o2", "m1", "B");
        resolved.yes_quantity = 120;
        resolved.no_quantity = 5;
        resolved.is_resolved = true;
        resolved.winning_side = Some(Side::Yes);

        assert_eq!(required_liquidity(&[open.clone()]), 70);
        assert_eq!(required_liquidity(&[open, resolved]), 120);
        assert_eq!(reserve_ratio(1, 3), Some(dec!(0.3333)));
        assert_eq!(reserve_ratio(10, 0), None);
    }

    #[tokio::test]
    async fn test_alert_lifecycle() {
        let store = Store::new();
        seed(&store, 100 * UNIT, 100 * UNIT, 0);
        let config = EngineConfig::default();
        let now = Utc::now();

        let report = evaluate_market(&store, &config, now, "m1").await.unwrap().unwrap();
        assert_eq!(report.status, SolvencyStatus::InsolvencyRisk);
        assert_eq!(report.reserve_ratio, Some(dec!(1)));

        // a second pass updates the open alert instead of adding one
        evaluate_market(&store, &config, now, "m1").await.unwrap();
        assert_eq!(store.keys::<LiquidityAlert>().len(), 1);

        set_pool(&store, 110 * UNIT).await;
        let report = evaluate_market(&store, &config, now, "m1").await.unwrap().unwrap();
        assert_eq!(report.status, SolvencyStatus::LowLiquidity);
        let risk = store
            .require::<LiquidityAlert>(&AlertKey { market_id: "m1".into(), alert_type: AlertType::InsolvencyRisk })
            .await
            .unwrap();
        assert!(risk.is_resolved);

        set_pool(&store, 200 * UNIT).await;
        let reports = run_cycle(&store, &config, now).await;
        assert_eq!(reports[0].status, SolvencyStatus::Solvent);
        assert!(store.all::<LiquidityAlert>().await.iter().all(|a| a.is_resolved));
    }

    #[tokio::test]
    async fn test_empty_book_is_solvent() {
        let store = Store::new();
        seed(&store, 0, 0, 0);
        let report = evaluate_market(&store, &EngineConfig::default(), Utc::now(), "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.status, SolvencyStatus::Solvent);
        assert_eq!(report.reserve_ratio, None);
        assert!(store.keys::<LiquidityAlert>().is_empty());
    }
}
