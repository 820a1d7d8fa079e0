// Application state management

use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};

use crate::config::{EngineConfig, OperationContext, PlatformFlags};
use crate::error::EngineResult;
use crate::events::{ActivityLog, EventBus};
use crate::models::{Market, MarketOption, MarketStatus, ResolutionMode, Wallet, UNIT};
use crate::store::Store;
use crate::withdrawals::{CustodialClient, CustodialWalletProvider, MemoryTaskQueue, TaskQueue, WithdrawalJob};

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<EngineConfig>,
    /// Operator switches, snapshotted into every operation
    pub flags: RwLock<PlatformFlags>,
    pub activity: ActivityLog,
    pub queue: Arc<dyn TaskQueue<WithdrawalJob>>,
    pub provider: Arc<dyn CustodialWalletProvider>,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Self {
        println!("🚀 Initializing prediction settlement engine...");

        let client = CustodialClient::from_config(&config);
        client.log_status();

        let state = Self::with_provider(config, Arc::new(client));
        println!(
            "💵 Fees: protocol {} bps, creator {} bps, LP {} bps",
            state.config.fees.protocol_bps, state.config.fees.creator_bps, state.config.fees.lp_bps
        );
        println!(
            "⚖️  Dispute window: {}s, fee {} USDC",
            state.config.dispute_window_secs,
            state.config.dispute_fee / UNIT
        );
        state
    }

    /// Build state around an explicit provider (tests plug in their own)
    pub fn with_provider(config: EngineConfig, provider: Arc<dyn CustodialWalletProvider>) -> Self {
        if let Err(e) = config.fees.validate() {
            tracing::warn!(error = %e, "fee components will be clamped to the total");
        }
        let store = Arc::new(Store::with_events(EventBus::default()));
        let queue: Arc<dyn TaskQueue<WithdrawalJob>> = Arc::new(MemoryTaskQueue::new(config.withdrawal_retry));
        Self {
            store,
            config: Arc::new(config),
            flags: RwLock::new(PlatformFlags::default()),
            activity: ActivityLog::new(),
            queue,
            provider,
        }
    }

    pub fn flags(&self) -> PlatformFlags {
        *self.flags.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_flags(&self, flags: PlatformFlags) {
        *self.flags.write().unwrap_or_else(|e| e.into_inner()) = flags;
        tracing::warn!(
            maintenance_mode = flags.maintenance_mode,
            trading_paused = flags.trading_paused,
            "platform flags changed"
        );
    }

    /// Config and flags as of now, for a single operation
    pub fn context(&self) -> OperationContext<'_> {
        OperationContext::new(&self.config, self.flags(), Utc::now())
    }

    /// Demo market and funded wallets for local runs
    pub fn seed_demo(&self) -> EngineResult<()> {
        let now = Utc::now();
        let market = Market {
            id: "demo-election".into(),
            question: "Who wins the 2026 city election?".into(),
            creator_id: "carol".into(),
            resolution_mode: Some(ResolutionMode::Authority),
            status: MarketStatus::Open,
            liquidity_parameter: self.config.base_liquidity_parameter * 1_000,
            base_liquidity_parameter: self.config.base_liquidity_parameter,
            shared_pool_liquidity: 500 * UNIT,
            outstanding_shares: 0,
            total_volume: 0,
            creator_fees: 0,
            protocol_fees: 0,
            lp_fees: 0,
            option_count: 0,
            resolved_options: 0,
            is_resolved: false,
            is_initialized: true,
            expires_at: now + Duration::days(30),
            created_at: now,
        };
        let options = vec![
            MarketOption::new("demo-election-a", "demo-election", "Candidate A"),
            MarketOption::new("demo-election-b", "demo-election", "Candidate B"),
        ];
        self.store.seed_market(market, options)?;

        for user in ["alice", "bob", "carol"] {
            self.store.create_wallet(Wallet::new(&format!("w-{}", user), user, 1_000 * UNIT))?;
        }
        self.store.create_wallet(Wallet::new("w-admin", "admin", 0))?;

        println!("✅ Seeded demo market 'demo-election' and wallets alice, bob, carol");
        Ok(())
    }
}
