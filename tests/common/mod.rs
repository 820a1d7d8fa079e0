// Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use prediction_settlement_engine::withdrawals::provider::{CustodialWallet, TransferRequest};
use prediction_settlement_engine::withdrawals::{CustodialWalletProvider, ProviderError};
use prediction_settlement_engine::{Market, MarketOption, MarketStatus, ResolutionMode, Store, Wallet, UNIT};

pub const MARKET: &str = "m1";
pub const OPTION: &str = "o1";
pub const OUTCOME: &str = "Rain";

pub fn market(mode: ResolutionMode, pool: u64, expires_at: DateTime<Utc>) -> Market {
    Market {
        id: MARKET.into(),
        question: "Will it rain in Lisbon tomorrow?".into(),
        creator_id: "carol".into(),
        resolution_mode: Some(mode),
        status: MarketStatus::Open,
        liquidity_parameter: UNIT,
        base_liquidity_parameter: 1_000,
        shared_pool_liquidity: pool,
        outstanding_shares: 0,
        total_volume: 0,
        creator_fees: 0,
        protocol_fees: 0,
        lp_fees: 0,
        option_count: 0,
        resolved_options: 0,
        is_resolved: false,
        is_initialized: true,
        expires_at,
        created_at: Utc::now() - Duration::days(1),
    }
}

/// One-option market with a 500 USDC pool and funded wallets
pub fn seeded_store(mode: ResolutionMode, users: &[(&str, u64)]) -> Store {
    let store = Store::new();
    seed(&store, mode, users);
    store
}

pub fn seed(store: &Store, mode: ResolutionMode, users: &[(&str, u64)]) {
    let expires_at = Utc::now() + Duration::days(7);
    store
        .seed_market(market(mode, 500 * UNIT, expires_at), vec![MarketOption::new(OPTION, MARKET, OUTCOME)])
        .unwrap();
    for (user, balance) in users {
        store.create_wallet(Wallet::new(&format!("w-{}", user), user, *balance)).unwrap();
    }
}

/// Value held by users, the pool, and the fee accounts that leave the pool
pub async fn total_value(store: &Store) -> u64 {
    let wallets: u64 = store.all::<Wallet>().await.iter().map(|w| w.balance_usdc).sum();
    let market = store.require::<Market>(&MARKET.to_string()).await.unwrap();
    wallets + market.shared_pool_liquidity + market.protocol_fees + market.creator_fees
}

/// Fails the first `failures` transfers, then succeeds
pub struct FlakyProvider {
    pub failures: u32,
    pub calls: AtomicU32,
}

impl FlakyProvider {
    pub fn new(failures: u32) -> Self {
        Self { failures, calls: AtomicU32::new(0) }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustodialWalletProvider for FlakyProvider {
    async fn create_user_wallet(&self, user_id: &str) -> Result<CustodialWallet, ProviderError> {
        Ok(CustodialWallet { wallet_id: format!("cw_{}", user_id), address: format!("0x{:0>40}", user_id.len()) })
    }

    async fn send_funds(&self, request: &TransferRequest) -> Result<String, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ProviderError::RequestFailed("connection reset".into()));
        }
        Ok(format!("tr_{}", request.idempotency_key))
    }

    async fn get_transaction_reference(&self, transfer_id: &str) -> Result<String, ProviderError> {
        Ok(format!("0x{}", transfer_id))
    }
}
