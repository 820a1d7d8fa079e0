// ============================================================================
// Engine Configuration
// ============================================================================
//
// Static settings are loaded once from the environment (`.env` supported).
// Dynamic platform switches (maintenance, trading pause) are held by the
// application and snapshotted into an `OperationContext` for every call, so
// no operation ever reads ambient global state and tests can pin them.
//
// ============================================================================

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::amm::fees::FeeSchedule;
use crate::error::{EngineError, EngineResult};
use crate::models::UNIT;
use crate::store::RetryPolicy;
use crate::withdrawals::queue::JobRetryPolicy;

/// Default HTTP bind address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:1234";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fees: FeeSchedule,
    /// Floor for the liquidity parameter is `base_liquidity_parameter * 1000`
    pub base_liquidity_parameter: u64,
    pub min_trade_units: u64,
    pub max_trade_units: u64,
    /// Max YES+NO shares one user may hold on an option
    pub max_position_units: u64,
    /// Max traded notional per user per UTC day
    pub daily_volume_cap: u64,
    /// Markets with more volume than this need multi-admin approval to resolve
    pub approval_volume_threshold: u64,
    pub required_approvals: usize,
    pub opinion_quorum: usize,
    pub dispute_window_secs: i64,
    pub dispute_fee: u64,
    pub solvency_warning_ratio: Decimal,
    pub solvency_critical_ratio: Decimal,
    pub monitor_interval_secs: u64,
    pub transaction_retry: RetryPolicy,
    pub withdrawal_retry: JobRetryPolicy,
    pub provider_url: Option<String>,
    pub provider_api_key: Option<String>,
    pub provider_timeout_secs: u64,
    /// Custodial wallet funds are sent from when a user has no provider wallet
    pub treasury_wallet_id: String,
    /// Hosts accepted as verified ORACLE evidence sources
    pub trusted_oracle_sources: Vec<String>,
    /// Hex-encoded Ed25519 keys accepted for signed ORACLE evidence
    pub oracle_public_keys: Vec<String>,
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fees: FeeSchedule::default(),
            base_liquidity_parameter: 1_000,
            min_trade_units: 10_000,
            max_trade_units: 1_000_000 * UNIT,
            max_position_units: 1_000_000 * UNIT,
            daily_volume_cap: 1_000_000 * UNIT,
            approval_volume_threshold: 10_000 * UNIT,
            required_approvals: 2,
            opinion_quorum: 1,
            dispute_window_secs: 2 * 60 * 60,
            dispute_fee: 100 * UNIT,
            solvency_warning_ratio: dec!(1.20),
            solvency_critical_ratio: dec!(1.05),
            monitor_interval_secs: 300,
            transaction_retry: RetryPolicy::default(),
            withdrawal_retry: JobRetryPolicy::default(),
            provider_url: None,
            provider_api_key: None,
            provider_timeout_secs: 60,
            treasury_wallet_id: "platform-treasury".to_string(),
            trusted_oracle_sources: Vec::new(),
            oracle_public_keys: Vec::new(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ENGINE_*` environment variables
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        Self {
            fees: FeeSchedule {
                protocol_bps: env_or("ENGINE_PROTOCOL_FEE_BPS", defaults.fees.protocol_bps),
                creator_bps: env_or("ENGINE_CREATOR_FEE_BPS", defaults.fees.creator_bps),
                lp_bps: env_or("ENGINE_LP_FEE_BPS", defaults.fees.lp_bps),
            },
            base_liquidity_parameter: env_or(
                "ENGINE_BASE_LIQUIDITY_PARAMETER",
                defaults.base_liquidity_parameter,
            ),
            min_trade_units: env_or("ENGINE_MIN_TRADE_UNITS", defaults.min_trade_units),
            max_trade_units: env_or("ENGINE_MAX_TRADE_UNITS", defaults.max_trade_units),
            max_position_units: env_or("ENGINE_MAX_POSITION_UNITS", defaults.max_position_units),
            daily_volume_cap: env_or("ENGINE_DAILY_VOLUME_CAP", defaults.daily_volume_cap),
            approval_volume_threshold: env_or(
                "ENGINE_APPROVAL_VOLUME_THRESHOLD",
                defaults.approval_volume_threshold,
            ),
            required_approvals: env_or("ENGINE_REQUIRED_APPROVALS", defaults.required_approvals),
            opinion_quorum: env_or("ENGINE_OPINION_QUORUM", defaults.opinion_quorum),
            dispute_window_secs: env_or("ENGINE_DISPUTE_WINDOW_SECS", defaults.dispute_window_secs),
            dispute_fee: env_or("ENGINE_DISPUTE_FEE", defaults.dispute_fee),
            solvency_warning_ratio: env_or(
                "ENGINE_SOLVENCY_WARNING_RATIO",
                defaults.solvency_warning_ratio,
            ),
            solvency_critical_ratio: env_or(
                "ENGINE_SOLVENCY_CRITICAL_RATIO",
                defaults.solvency_critical_ratio,
            ),
            monitor_interval_secs: env_or(
                "ENGINE_MONITOR_INTERVAL_SECS",
                defaults.monitor_interval_secs,
            ),
            transaction_retry: RetryPolicy {
                max_attempts: env_or("ENGINE_TX_MAX_ATTEMPTS", defaults.transaction_retry.max_attempts),
                ..defaults.transaction_retry
            },
            withdrawal_retry: JobRetryPolicy {
                max_attempts: env_or(
                    "ENGINE_WITHDRAWAL_MAX_ATTEMPTS",
                    defaults.withdrawal_retry.max_attempts,
                ),
                ..defaults.withdrawal_retry
            },
            provider_url: std::env::var("CUSTODY_PROVIDER_URL").ok(),
            provider_api_key: std::env::var("CUSTODY_PROVIDER_API_KEY").ok(),
            provider_timeout_secs: env_or(
                "CUSTODY_PROVIDER_TIMEOUT_SECS",
                defaults.provider_timeout_secs,
            ),
            treasury_wallet_id: std::env::var("CUSTODY_TREASURY_WALLET_ID")
                .unwrap_or(defaults.treasury_wallet_id),
            trusted_oracle_sources: env_list("ENGINE_TRUSTED_ORACLE_SOURCES"),
            oracle_public_keys: env_list("ENGINE_ORACLE_PUBLIC_KEYS"),
            bind_addr: std::env::var("ENGINE_BIND_ADDR").unwrap_or(defaults.bind_addr),
        }
    }

    pub fn dispute_window(&self) -> Duration {
        Duration::seconds(self.dispute_window_secs)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// PLATFORM FLAGS & OPERATION CONTEXT
// ============================================================================

/// Runtime switches an operator can flip without a restart
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFlags {
    pub maintenance_mode: bool,
    pub trading_paused: bool,
}

/// Everything an operation needs besides the store and its own input
#[derive(Debug, Clone, Copy)]
pub struct OperationContext<'a> {
    pub config: &'a EngineConfig,
    pub flags: PlatformFlags,
    pub now: DateTime<Utc>,
}

impl<'a> OperationContext<'a> {
    pub fn new(config: &'a EngineConfig, flags: PlatformFlags, now: DateTime<Utc>) -> Self {
        Self { config, flags, now }
    }

    pub fn ensure_available(&self) -> EngineResult<()> {
        if self.flags.maintenance_mode {
            return Err(EngineError::Forbidden("platform is in maintenance mode".into()));
        }
        Ok(())
    }

    pub fn ensure_trading_open(&self) -> EngineResult<()> {
        self.ensure_available()?;
        if self.flags.trading_paused {
            return Err(EngineError::Forbidden("trading is paused".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dispute_fee, 100_000_000);
        assert_eq!(config.dispute_window(), Duration::hours(2));
        assert_eq!(config.required_approvals, 2);
        assert!(config.solvency_critical_ratio < config.solvency_warning_ratio);
    }

    #[test]
    fn test_flags_gate_trading() {
        let config = EngineConfig::default();
        let now = Utc::now();

        let open = OperationContext::new(&config, PlatformFlags::default(), now);
        assert!(open.ensure_trading_open().is_ok());

        let paused = PlatformFlags { trading_paused: true, ..Default::default() };
        let ctx = OperationContext::new(&config, paused, now);
        assert!(ctx.ensure_available().is_ok());
        assert!(matches!(ctx.ensure_trading_open(), Err(EngineError::Forbidden(_))));

        let maintenance = PlatformFlags { maintenance_mode: true, ..Default::default() };
        let ctx = OperationContext::new(&config, maintenance, now);
        assert!(matches!(ctx.ensure_available(), Err(EngineError::Forbidden(_))));
    }
}
