// ============================================================================
// AMM Trade Executor
// ============================================================================
//
// One trade is one unit of work, locking Market → Option → Wallet → Position.
// Quantity is signed: positive buys shares of `side`, negative sells them.
//
// Money flow (see amm::fees):
//   buy:  user pays raw + fee; pool += raw + lp + dust
//   sell: user gets raw - fee; pool -= raw - lp - dust
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amm::fees::{FeeSplit, BPS_DENOMINATOR};
use crate::amm::{next_liquidity_parameter, LmsrPool};
use crate::config::OperationContext;
use crate::error::{EngineError, EngineResult};
use crate::events::DomainEvent;
use crate::models::{Market, MarketOption, MarketStatus, PositionKey, Side, UserPosition, Wallet};
use crate::store::{Store, Tx};

// ============================================================================
// REQUEST / RECEIPT
// ============================================================================

/// Caller's protection against price movement between quote and execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageBound {
    /// Reject if the actual total (fees included) differs from `expected_total` by more than `bps`
    Tolerance { expected_total: u64, bps: u32 },
    /// Max total cost for a buy, min net proceeds for a sell
    Limit(u64),
}

impl SlippageBound {
    pub fn check(&self, is_buy: bool, actual: u64) -> EngineResult<()> {
        match *self {
            SlippageBound::Tolerance { expected_total, bps } => {
                let tolerance = ((expected_total as u128 * bps as u128) / BPS_DENOMINATOR as u128) as u64;
                if actual.abs_diff(expected_total) > tolerance {
                    return Err(EngineError::SlippageExceeded { expected: expected_total, actual, tolerance });
                }
            }
            SlippageBound::Limit(limit) => {
                let breached = if is_buy { actual > limit } else { actual < limit };
                if breached {
                    return Err(EngineError::SlippageExceeded { expected: limit, actual, tolerance: 0 });
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> EngineResult<()> {
        if let SlippageBound::Tolerance { bps, .. } = self {
            if *bps as u64 > BPS_DENOMINATOR {
                return Err(EngineError::Validation(format!("slippage tolerance {} bps exceeds 100%", bps)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub market_id: String,
    pub option_id: String,
    pub side: Side,
    /// Micro-shares; positive buys, negative sells
    pub quantity: i64,
    #[serde(default)]
    pub slippage: Option<SlippageBound>,
}

impl TradeRequest {
    pub fn buy(market_id: &str, option_id: &str, side: Side, shares: u64) -> Self {
        Self {
            market_id: market_id.to_string(),
            option_id: option_id.to_string(),
            side,
            quantity: shares.min(i64::MAX as u64) as i64,
            slippage: None,
        }
    }

    pub fn sell(market_id: &str, option_id: &str, side: Side, shares: u64) -> Self {
        Self { quantity: -(shares.min(i64::MAX as u64) as i64), ..Self::buy(market_id, option_id, side, 0) }
    }

    pub fn with_slippage(mut self, slippage: SlippageBound) -> Self {
        self.slippage = Some(slippage);
        self
    }

    pub fn is_buy(&self) -> bool {
        self.quantity > 0
    }

    pub fn shares(&self) -> u64 {
        self.quantity.unsigned_abs()
    }
}

/// Price of a trade at the current book, without executing it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeQuote {
    pub raw_amount: u64,
    pub fees: FeeSplit,
    /// Buy: what the user pays. Sell: what the user receives.
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeReceipt {
    pub market_id: String,
    pub option_id: String,
    pub user_id: String,
    pub side: Side,
    pub quantity: i64,
    pub raw_amount: u64,
    pub fees: FeeSplit,
    pub total: u64,
    pub balance_after: u64,
    pub position_shares: u64,
    pub realized_pnl: i64,
    pub liquidity_parameter: u64,
    pub yes_price: u64,
    pub executed_at: DateTime<Utc>,
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Execute a buy or sell against the option's book
pub async fn execute_trade(
    store: &Store,
    ctx: &OperationContext<'_>,
    user_id: &str,
    request: TradeRequest,
) -> EngineResult<TradeReceipt> {
    ctx.ensure_trading_open()?;
    validate_request(ctx, user_id, &request)?;

    let receipt = store
        .transaction(&ctx.config.transaction_retry, |tx| apply_trade(tx, ctx, user_id, &request))
        .await?;

    tracing::info!(
        market_id = %receipt.market_id,
        option_id = %receipt.option_id,
        user_id = %receipt.user_id,
        side = %receipt.side,
        quantity = receipt.quantity,
        total = receipt.total,
        "trade executed"
    );
    Ok(receipt)
}

pub async fn buy(
    store: &Store,
    ctx: &OperationContext<'_>,
    user_id: &str,
    market_id: &str,
    option_id: &str,
    side: Side,
    shares: u64,
    slippage: Option<SlippageBound>,
) -> EngineResult<TradeReceipt> {
    let mut request = TradeRequest::buy(market_id, option_id, side, shares);
    request.slippage = slippage;
    execute_trade(store, ctx, user_id, request).await
}

pub async fn sell(
    store: &Store,
    ctx: &OperationContext<'_>,
    user_id: &str,
    market_id: &str,
    option_id: &str,
    side: Side,
    shares: u64,
    slippage: Option<SlippageBound>,
) -> EngineResult<TradeReceipt> {
    let mut request = TradeRequest::sell(market_id, option_id, side, shares);
    request.slippage = slippage;
    execute_trade(store, ctx, user_id, request).await
}

/// Read-only price check against committed state
pub async fn quote(store: &Store, ctx: &OperationContext<'_>, request: &TradeRequest) -> EngineResult<TradeQuote> {
    if request.quantity == 0 {
        return Err(EngineError::Validation("quantity must be non-zero".into()));
    }
    let market = store.require::<Market>(&request.market_id).await?;
    let option = store.require::<MarketOption>(&request.option_id).await?;
    if option.market_id != market.id {
        return Err(EngineError::not_found("option", &request.option_id));
    }
    let pool = LmsrPool::new(option.yes_quantity, option.no_quantity, market.liquidity_parameter);
    price(ctx, &pool, request)
}

fn price(ctx: &OperationContext<'_>, pool: &LmsrPool, request: &TradeRequest) -> EngineResult<TradeQuote> {
    let shares = request.shares();
    if request.is_buy() {
        let raw_amount = pool.buy_cost(request.side, shares)?;
        let fees = ctx.config.fees.split(raw_amount);
        Ok(TradeQuote { raw_amount, fees, total: raw_amount + fees.total })
    } else {
        let raw_amount = pool.sell_proceeds(request.side, shares)?;
        let fees = ctx.config.fees.split(raw_amount);
        Ok(TradeQuote { raw_amount, fees, total: raw_amount - fees.total })
    }
}

fn validate_request(ctx: &OperationContext<'_>, user_id: &str, request: &TradeRequest) -> EngineResult<()> {
    if user_id.trim().is_empty() {
        return Err(EngineError::Unauthorized("missing user".into()));
    }
    if request.market_id.is_empty() || request.option_id.is_empty() {
        return Err(EngineError::Validation("market and option ids are required".into()));
    }
    if request.quantity == 0 {
        return Err(EngineError::Validation("quantity must be non-zero".into()));
    }
    let shares = request.shares();
    let config = ctx.config;
    if shares < config.min_trade_units {
        return Err(EngineError::LimitExceeded {
            limit: "min_trade_size",
            value: shares,
            max: config.min_trade_units,
        });
    }
    if shares > config.max_trade_units {
        return Err(EngineError::LimitExceeded {
            limit: "max_trade_size",
            value: shares,
            max: config.max_trade_units,
        });
    }
    if let Some(slippage) = &request.slippage {
        slippage.validate()?;
    }
    Ok(())
}

fn apply_trade(
    tx: &mut Tx<'_>,
    ctx: &OperationContext<'_>,
    user_id: &str,
    request: &TradeRequest,
) -> EngineResult<TradeReceipt> {
    let config = ctx.config;

    let mut market = tx.lock::<Market>(&request.market_id)?;
    if market.is_resolved || market.status != MarketStatus::Open {
        return Err(EngineError::Conflict(format!(
            "market {} is {} and not accepting trades",
            market.id, market.status
        )));
    }
    if !market.is_initialized {
        return Err(EngineError::Conflict(format!("market {} is not initialized", market.id)));
    }

    let mut option = tx.lock::<MarketOption>(&request.option_id)?;
    if option.market_id != market.id {
        return Err(EngineError::not_found("option", &request.option_id));
    }
    if option.is_resolved {
        return Err(EngineError::Conflict(format!("option {} is already resolved", option.id)));
    }

    let mut wallet = tx.lock::<Wallet>(&user_id.to_string())?;
    let key = PositionKey::new(user_id, &option.id);
    let existing = tx.find::<UserPosition>(&key)?;
    let is_new_position = existing.is_none();

    let pool = LmsrPool::new(option.yes_quantity, option.no_quantity, market.liquidity_parameter);
    let shares = request.shares();
    let side = request.side;
    let is_buy = request.is_buy();
    let mut realized_pnl = 0;

    let (quote, position) = if is_buy {
        let mut position = existing.unwrap_or_else(|| UserPosition::new(user_id, &option.id, &market.id));
        if position.is_claimed {
            return Err(EngineError::Conflict(format!("position {} is already claimed", key)));
        }
        let held_after = position.total_shares().saturating_add(shares);
        if held_after > config.max_position_units {
            return Err(EngineError::LimitExceeded {
                limit: "position_cap",
                value: held_after,
                max: config.max_position_units,
            });
        }

        let quote = price(ctx, &pool, request)?;
        if let Some(slippage) = &request.slippage {
            slippage.check(true, quote.total)?;
        }
        wallet.debit(quote.total)?;
        position.add_shares(side, shares, quote.total)?;

        let qty = option.quantity_mut(side);
        *qty = qty.checked_add(shares).ok_or_else(|| overflow("option quantity"))?;
        market.outstanding_shares = market.outstanding_shares.saturating_add(shares);
        market.shared_pool_liquidity = market
            .shared_pool_liquidity
            .checked_add(quote.fees.buy_pool_inflow(quote.raw_amount))
            .ok_or_else(|| overflow("pool liquidity"))?;
        (quote, position)
    } else {
        let mut position = existing.ok_or_else(|| EngineError::not_found("position", &key))?;
        if position.is_claimed {
            return Err(EngineError::Conflict(format!("position {} is already claimed", key)));
        }
        let available = position.shares(side);
        if available < shares {
            return Err(EngineError::InsufficientShares { required: shares, available });
        }

        let quote = price(ctx, &pool, request)?;
        if let Some(slippage) = &request.slippage {
            slippage.check(false, quote.total)?;
        }
        let outflow = quote.fees.sell_pool_outflow(quote.raw_amount);
        if outflow > market.shared_pool_liquidity {
            return Err(EngineError::InsufficientLiquidity {
                required: outflow,
                available: market.shared_pool_liquidity,
            });
        }
        market.shared_pool_liquidity -= outflow;
        wallet.credit(quote.total)?;
        realized_pnl = position.remove_shares(side, shares, quote.total)?;

        let qty = option.quantity_mut(side);
        *qty = qty.saturating_sub(shares);
        market.outstanding_shares = market.outstanding_shares.saturating_sub(shares);
        (quote, position)
    };

    wallet.record_volume(ctx.now.date_naive(), quote.raw_amount, config.daily_volume_cap)?;

    market.total_volume = market.total_volume.saturating_add(quote.raw_amount);
    market.protocol_fees = market.protocol_fees.saturating_add(quote.fees.protocol);
    market.creator_fees = market.creator_fees.saturating_add(quote.fees.creator);
    market.lp_fees = market.lp_fees.saturating_add(quote.fees.lp);
    market.liquidity_parameter = next_liquidity_parameter(
        market.liquidity_parameter,
        market.base_liquidity_parameter,
        market.shared_pool_liquidity,
        market.outstanding_shares,
    );

    let yes_price = LmsrPool::new(option.yes_quantity, option.no_quantity, market.liquidity_parameter)
        .spot_price_units(Side::Yes)?;

    let receipt = TradeReceipt {
        market_id: market.id.clone(),
        option_id: option.id.clone(),
        user_id: user_id.to_string(),
        side,
        quantity: request.quantity,
        raw_amount: quote.raw_amount,
        fees: quote.fees,
        total: quote.total,
        balance_after: wallet.balance_usdc,
        position_shares: position.shares(side),
        realized_pnl,
        liquidity_parameter: market.liquidity_parameter,
        yes_price,
        executed_at: ctx.now,
    };

    tx.update(market)?;
    tx.update(option)?;
    tx.update(wallet)?;
    if is_new_position {
        tx.insert(position)?;
    } else {
        tx.update(position)?;
    }

    tx.emit(DomainEvent::TradeExecuted {
        market_id: receipt.market_id.clone(),
        option_id: receipt.option_id.clone(),
        user_id: receipt.user_id.clone(),
        side,
        quantity: receipt.quantity,
        total: receipt.total,
        fee: receipt.fees.total,
        at: ctx.now,
    });
    Ok(receipt)
}

fn overflow(what: &str) -> EngineError {
    EngineError::Internal(format!("{} overflow", what))
}

// ============================================================================
// TESTS
// ============================================================================
