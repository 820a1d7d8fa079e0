/// Prediction market trading, resolution and settlement engine
/// Exports all modules for use as a library crate

pub mod amm;
pub mod app_state;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod market_resolve;
pub mod models;
pub mod settlement;
pub mod solvency;
pub mod store;
pub mod trading;
pub mod withdrawals;

pub use config::{EngineConfig, OperationContext, PlatformFlags};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use events::{ActivityLog, DomainEvent, EventBus};
pub use models::{Actor, Market, MarketOption, MarketStatus, ResolutionMode, Side, UserPosition, Wallet, Withdrawal, UNIT};
pub use store::{RetryPolicy, Store};

pub use market_resolve::{
    adjudicate_dispute, approve_submission, file_dispute, submit_resolution, DisputeRequest, Evidence,
    ResolutionOutcome, ResolutionRequest,
};
pub use settlement::{claim_winnings, settle_option, SettlementSummary};
pub use solvency::{evaluate_market, run_cycle, SolvencyReport, SolvencyStatus};
pub use trading::{buy, execute_trade, quote, sell, SlippageBound, TradeReceipt, TradeRequest};
pub use withdrawals::{request_withdrawal, WithdrawalRequest, WithdrawalWorker};
