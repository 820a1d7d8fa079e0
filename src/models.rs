// Ledger models for the prediction market engine
//
// All money and share quantities are u64 micro-units (1 USDC = 1 share =
// 1_000_000 units). Realised PnL is signed.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, EngineResult};

/// Micro-units per whole USDC / share
pub const UNIT: u64 = 1_000_000;

pub type MarketId = String;
pub type OptionId = String;
pub type UserId = String;

// ============================================================================
// ENUMS
// ============================================================================

/// Which side of an option a trade or resolution refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    /// Persisted code: 1 = YES, 2 = NO
    pub fn code(&self) -> u8 {
        match self {
            Side::Yes => 1,
            Side::No => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Side::Yes),
            2 => Some(Side::No),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Yes => write!(f, "YES"),
            Side::No => write!(f, "NO"),
        }
    }
}

/// Authority model governing who may declare a market's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionMode {
    /// Platform-only, evidence must be signed or from a verified source
    Oracle,
    /// Market creator or admin
    Authority,
    /// Crowd vote after expiry; never disputable
    Opinion,
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionMode::Oracle => write!(f, "ORACLE"),
            ResolutionMode::Authority => write!(f, "AUTHORITY"),
            ResolutionMode::Opinion => write!(f, "OPINION"),
        }
    }
}

/// Market lifecycle
///
/// Flow: Open → Resolving → Resolved ⇄ Disputed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketStatus {
    Open,
    Resolving,
    Resolved,
    Disputed,
}

impl MarketStatus {
    pub fn can_transition_to(&self, next: MarketStatus) -> bool {
        use MarketStatus::*;
        matches!(
            (self, next),
            (Open, Resolving)
                | (Resolving, Resolved)
                | (Resolving, Disputed)
                | (Resolved, Disputed)
                | (Disputed, Resolved)
                | (Disputed, Resolving)
        )
    }

    pub fn accepts_resolution(&self) -> bool {
        matches!(self, MarketStatus::Open | MarketStatus::Resolving)
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketStatus::Open => "OPEN",
            MarketStatus::Resolving => "RESOLVING",
            MarketStatus::Resolved => "RESOLVED",
            MarketStatus::Disputed => "DISPUTED",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// ACTORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Authenticated caller, as asserted by the upstream gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn user(user_id: &str) -> Self {
        Self { user_id: user_id.to_string(), role: Role::User }
    }

    pub fn admin(user_id: &str) -> Self {
        Self { user_id: user_id.to_string(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ============================================================================
// MARKET & OPTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub question: String,
    pub creator_id: UserId,
    /// Legacy markets have no mode and resolve like AUTHORITY
    pub resolution_mode: Option<ResolutionMode>,
    pub status: MarketStatus,
    /// AMM depth "b"
    pub liquidity_parameter: u64,
    pub base_liquidity_parameter: u64,
    /// Pool cash reserve backing payouts
    pub shared_pool_liquidity: u64,
    /// YES + NO quantities across all options
    pub outstanding_shares: u64,
    pub total_volume: u64,
    pub creator_fees: u64,
    pub protocol_fees: u64,
    pub lp_fees: u64,
    pub option_count: u32,
    pub resolved_options: u32,
    pub is_resolved: bool,
    pub is_initialized: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Market {
    pub fn effective_mode(&self) -> ResolutionMode {
        self.resolution_mode.unwrap_or(ResolutionMode::Authority)
    }

    pub fn transition(&mut self, next: MarketStatus) -> EngineResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Conflict(format!(
                "market {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn all_options_resolved(&self) -> bool {
        self.resolved_options >= self.option_count
    }

    /// Status to fall back to once a dispute is cleared
    pub fn settled_status(&self) -> MarketStatus {
        if self.all_options_resolved() {
            MarketStatus::Resolved
        } else {
            MarketStatus::Resolving
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOption {
    pub id: OptionId,
    pub market_id: MarketId,
    pub label: String,
    pub yes_quantity: u64,
    pub no_quantity: u64,
    pub is_resolved: bool,
    pub winning_side: Option<Side>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
    pub resolved_reason: Option<String>,
    /// None only for OPINION options, which cannot be disputed
    pub dispute_deadline: Option<DateTime<Utc>>,
}

impl MarketOption {
    pub fn new(id: &str, market_id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            market_id: market_id.to_string(),
            label: label.to_string(),
            yes_quantity: 0,
            no_quantity: 0,
            is_resolved: false,
            winning_side: None,
            resolved_at: None,
            resolved_by: None,
            resolved_reason: None,
            dispute_deadline: None,
        }
    }

    pub fn quantity(&self, side: Side) -> u64 {
        match side {
            Side::Yes => self.yes_quantity,
            Side::No => self.no_quantity,
        }
    }

    pub fn quantity_mut(&mut self, side: Side) -> &mut u64 {
        match side {
            Side::Yes => &mut self.yes_quantity,
            Side::No => &mut self.no_quantity,
        }
    }

    /// The deadline is write-once
    pub fn set_dispute_deadline(&mut self, deadline: DateTime<Utc>) -> EngineResult<()> {
        if self.dispute_deadline.is_some() {
            return Err(EngineError::Conflict(format!(
                "option {} already has a dispute deadline",
                self.id
            )));
        }
        self.dispute_deadline = Some(deadline);
        Ok(())
    }
}

// ============================================================================
// POSITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub user_id: UserId,
    pub option_id: OptionId,
}

impl PositionKey {
    pub fn new(user_id: &str, option_id: &str) -> Self {
        Self { user_id: user_id.to_string(), option_id: option_id.to_string() }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.option_id)
    }
}

/// A user's holdings on one option
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPosition {
    pub user_id: UserId,
    pub option_id: OptionId,
    pub market_id: MarketId,
    pub yes_shares: u64,
    pub no_shares: u64,
    /// Cost basis, fees included
    pub total_yes_cost: u64,
    pub total_no_cost: u64,
    /// Micro-units paid per whole share
    pub avg_yes_price: u64,
    pub avg_no_price: u64,
    pub realized_pnl: i64,
    pub is_claimed: bool,
}

impl UserPosition {
    pub fn new(user_id: &str, option_id: &str, market_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            option_id: option_id.to_string(),
            market_id: market_id.to_string(),
            yes_shares: 0,
            no_shares: 0,
            total_yes_cost: 0,
            total_no_cost: 0,
            avg_yes_price: 0,
            avg_no_price: 0,
            realized_pnl: 0,
            is_claimed: false,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(&self.user_id, &self.option_id)
    }

    pub fn shares(&self, side: Side) -> u64 {
        match side {
            Side::Yes => self.yes_shares,
            Side::No => self.no_shares,
        }
    }

    pub fn cost(&self, side: Side) -> u64 {
        match side {
            Side::Yes => self.total_yes_cost,
            Side::No => self.total_no_cost,
        }
    }

    pub fn total_shares(&self) -> u64 {
        self.yes_shares.saturating_add(self.no_shares)
    }

    pub fn total_cost(&self) -> u64 {
        self.total_yes_cost.saturating_add(self.total_no_cost)
    }

    fn slots(&mut self, side: Side) -> (&mut u64, &mut u64, &mut u64) {
        match side {
            Side::Yes => (&mut self.yes_shares, &mut self.total_yes_cost, &mut self.avg_yes_price),
            Side::No => (&mut self.no_shares, &mut self.total_no_cost, &mut self.avg_no_price),
        }
    }

    /// Add bought shares and re-weight the average price
    pub fn add_shares(&mut self, side: Side, shares: u64, cost: u64) -> EngineResult<()> {
        if self.is_claimed {
            return Err(EngineError::Conflict(format!("position {} is already claimed", self.key())));
        }
        let (held, basis, avg) = self.slots(side);
        *held = held.checked_add(shares).ok_or_else(|| overflow("position shares"))?;
        *basis = basis.checked_add(cost).ok_or_else(|| overflow("position cost"))?;
        *avg = average_price(*basis, *held);
        Ok(())
    }

    /// Remove sold shares, release the proportional basis, and book PnL.
    /// Returns the realized PnL of this sale.
    pub fn remove_shares(&mut self, side: Side, shares: u64, proceeds: u64) -> EngineResult<i64> {
        let (held, basis, avg) = self.slots(side);
        if shares > *held {
            return Err(EngineError::InsufficientShares { required: shares, available: *held });
        }
        let released = if shares == *held {
            *basis
        } else {
            mul_div(*basis, shares, *held)
        };
        *held -= shares;
        *basis -= released;
        *avg = average_price(*basis, *held);
        let pnl = proceeds as i64 - released as i64;
        self.realized_pnl += pnl;
        Ok(pnl)
    }

    /// Zero the position after resolution. Returns (payout, pnl).
    pub fn close(&mut self, winning_side: Side) -> (u64, i64) {
        let payout = self.shares(winning_side);
        let pnl = payout as i64 - self.total_cost() as i64;
        self.realized_pnl += pnl;
        self.yes_shares = 0;
        self.no_shares = 0;
        self.total_yes_cost = 0;
        self.total_no_cost = 0;
        self.avg_yes_price = 0;
        self.avg_no_price = 0;
        self.is_claimed = true;
        (payout, pnl)
    }
}

fn average_price(cost: u64, shares: u64) -> u64 {
    if shares == 0 {
        0
    } else {
        mul_div(cost, UNIT, shares)
    }
}

/// floor(a * b / c) without intermediate overflow
pub fn mul_div(a: u64, b: u64, c: u64) -> u64 {
    if c == 0 {
        return 0;
    }
    ((a as u128 * b as u128) / c as u128).min(u64::MAX as u128) as u64
}

fn overflow(what: &str) -> EngineError {
    EngineError::Internal(format!("{} overflow", what))
}

// ============================================================================
// WALLET
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub user_id: UserId,
    pub balance_usdc: u64,
    pub public_key: String,
    /// Custodial provider wallet funds leave from
    pub provider_wallet_id: Option<String>,
    pub daily_volume: u64,
    pub daily_volume_day: Option<NaiveDate>,
}

impl Wallet {
    pub fn new(id: &str, user_id: &str, balance_usdc: u64) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            balance_usdc,
            public_key: String::new(),
            provider_wallet_id: None,
            daily_volume: 0,
            daily_volume_day: None,
        }
    }

    pub fn debit(&mut self, amount: u64) -> EngineResult<()> {
        if self.balance_usdc < amount {
            return Err(EngineError::InsufficientFunds {
                required: amount,
                available: self.balance_usdc,
            });
        }
        self.balance_usdc -= amount;
        Ok(())
    }

    pub fn credit(&mut self, amount: u64) -> EngineResult<()> {
        self.balance_usdc = self
            .balance_usdc
            .checked_add(amount)
            .ok_or_else(|| overflow("wallet balance"))?;
        Ok(())
    }

    /// Volume already traded on `day`
    pub fn volume_on(&self, day: NaiveDate) -> u64 {
        if self.daily_volume_day == Some(day) {
            self.daily_volume
        } else {
            0
        }
    }

    pub fn record_volume(&mut self, day: NaiveDate, amount: u64, cap: u64) -> EngineResult<()> {
        let next = self.volume_on(day).saturating_add(amount);
        if next > cap {
            return Err(EngineError::LimitExceeded { limit: "daily_volume", value: next, max: cap });
        }
        self.daily_volume = next;
        self.daily_volume_day = Some(day);
        Ok(())
    }
}

// ============================================================================
// RESOLUTION RECORDS
// ============================================================================

/// Key for records filed against an option (submissions, disputes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub option_id: OptionId,
    pub id: String,
}

impl RecordKey {
    pub fn new(option_id: &str, id: &str) -> Self {
        Self { option_id: option_id.to_string(), id: id.to_string() }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    PendingApproval,
    AwaitingQuorum,
    Applied,
    Superseded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionSubmission {
    pub id: String,
    pub market_id: MarketId,
    pub option_id: OptionId,
    pub user_id: UserId,
    pub outcome: String,
    pub winning_side: Side,
    pub evidence: serde_json::Value,
    pub evidence_hash: String,
    pub requires_approval: bool,
    pub status: SubmissionStatus,
    pub submitted_at: DateTime<Utc>,
}

impl ResolutionSubmission {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.option_id, &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApprovalKey {
    pub market_id: MarketId,
    pub submission_id: String,
    pub admin_user_id: UserId,
}

impl fmt::Display for ApprovalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.market_id, self.submission_id, self.admin_user_id)
    }
}

/// One admin's vote on a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionApproval {
    pub market_id: MarketId,
    pub submission_id: String,
    pub admin_user_id: UserId,
    pub approved_at: DateTime<Utc>,
}

impl ResolutionApproval {
    pub fn key(&self) -> ApprovalKey {
        ApprovalKey {
            market_id: self.market_id.clone(),
            submission_id: self.submission_id.clone(),
            admin_user_id: self.admin_user_id.clone(),
        }
    }
}

/// Audit record of an applied resolution, one per option
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketResolution {
    pub market_id: MarketId,
    pub option_id: OptionId,
    pub final_outcome: String,
    pub winning_side: Side,
    pub resolution_mode: ResolutionMode,
    pub resolution_trace: serde_json::Value,
    pub canonical_hash: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// DISPUTES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeStatus {
    Pending,
    Upheld,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub market_id: MarketId,
    pub option_id: OptionId,
    pub user_id: UserId,
    pub reason: String,
    pub evidence: Option<String>,
    pub resolution_fee_paid: u64,
    pub status: DisputeStatus,
    pub created_at: DateTime<Utc>,
    pub adjudicated_by: Option<UserId>,
    pub adjudicated_at: Option<DateTime<Utc>>,
}

impl Dispute {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.option_id, &self.id)
    }
}

// ============================================================================
// LIQUIDITY ALERTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LowLiquidity,
    InsolvencyRisk,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertType::LowLiquidity => write!(f, "low_liquidity"),
            AlertType::InsolvencyRisk => write!(f, "insolvency_risk"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertKey {
    pub market_id: MarketId,
    pub alert_type: AlertType,
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.market_id, self.alert_type)
    }
}

/// Current alert for a (market, type); keyed so an open alert is never duplicated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityAlert {
    pub id: String,
    pub market_id: MarketId,
    pub alert_type: AlertType,
    pub current_liquidity: u64,
    pub required_liquidity: u64,
    pub reserve_ratio: Decimal,
    pub severity: AlertSeverity,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiquidityAlert {
    pub fn key(&self) -> AlertKey {
        AlertKey { market_id: self.market_id.clone(), alert_type: self.alert_type }
    }
}

// ============================================================================
// WITHDRAWALS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
        }
    }

    /// Whether the amount is currently held out of the wallet
    pub fn holds_funds(&self) -> bool {
        matches!(self, WithdrawalStatus::Pending | WithdrawalStatus::Processing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: String,
    pub user_id: UserId,
    pub wallet_id: String,
    pub destination_address: String,
    pub amount: u64,
    pub status: WithdrawalStatus,
    pub idempotency_key: String,
    pub job_id: Option<String>,
    /// Provider transfer id, recorded as soon as funds leave custody
    #[serde(default)]
    pub transfer_id: Option<String>,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Unique index entry: idempotency key → withdrawal id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyClaim {
    pub idempotency_key: String,
    pub withdrawal_id: String,
}

// ============================================================================
// TESTS
// ============================================================================
