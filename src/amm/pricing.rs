// ============================================================================
// LMSR PRICING
// ============================================================================
//
// Each option is an independent binary LMSR:
//
//   C(qy, qn) = b · ln(e^(qy/b) + e^(qn/b))
//
// Quantities and b are micro-units, so qy/b is dimensionless. Evaluated in
// Decimal with the log-sum-exp shift: the larger exponent is factored out
// and the remaining term lies in (0, 1], so nothing overflows however far
// the book is skewed.
//
// Rounding always favours the pool: buy costs round up, sell proceeds down.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};
use crate::models::{Side, UNIT};

/// Below this the smaller term is under Decimal precision
const NEGLIGIBLE_EXPONENT: i64 = -60;

/// Snapshot of one option's book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LmsrPool {
    pub yes_quantity: u64,
    pub no_quantity: u64,
    pub liquidity_parameter: u64,
}

impl LmsrPool {
    pub fn new(yes_quantity: u64, no_quantity: u64, liquidity_parameter: u64) -> Self {
        Self { yes_quantity, no_quantity, liquidity_parameter }
    }

    fn with_quantity(&self, side: Side, quantity: u64) -> Self {
        let mut next = *self;
        match side {
            Side::Yes => next.yes_quantity = quantity,
            Side::No => next.no_quantity = quantity,
        }
        next
    }

    fn quantity(&self, side: Side) -> u64 {
        match side {
            Side::Yes => self.yes_quantity,
            Side::No => self.no_quantity,
        }
    }

    fn exponents(&self) -> EngineResult<(Decimal, Decimal)> {
        if self.liquidity_parameter == 0 {
            return Err(EngineError::Internal("liquidity parameter is zero".into()));
        }
        let b = Decimal::from(self.liquidity_parameter);
        Ok((Decimal::from(self.yes_quantity) / b, Decimal::from(self.no_quantity) / b))
    }

    /// Cost function value in micro-units
    pub fn cost(&self) -> EngineResult<Decimal> {
        let (a, c) = self.exponents()?;
        let m = a.max(c);
        let sum = shifted_exp(a - m)? + shifted_exp(c - m)?;
        let ln = sum
            .checked_ln()
            .ok_or_else(|| EngineError::Internal("ln overflow in LMSR cost".into()))?;
        Ok(Decimal::from(self.liquidity_parameter) * (m + ln))
    }

    /// Price to buy `shares` of `side`, before fees
    pub fn buy_cost(&self, side: Side, shares: u64) -> EngineResult<u64> {
        let after = self
            .quantity(side)
            .checked_add(shares)
            .ok_or_else(|| EngineError::Internal("option quantity overflow".into()))?;
        let delta = self.with_quantity(side, after).cost()? - self.cost()?;
        to_units(delta.ceil())
    }

    /// Amount the pool pays for `shares` of `side`, before fees
    pub fn sell_proceeds(&self, side: Side, shares: u64) -> EngineResult<u64> {
        let available = self.quantity(side);
        let after = available.checked_sub(shares).ok_or(EngineError::InsufficientShares {
            required: shares,
            available,
        })?;
        let delta = self.cost()? - self.with_quantity(side, after).cost()?;
        to_units(delta.floor())
    }

    /// Instantaneous probability of `side`, in [0, 1]
    pub fn spot_price(&self, side: Side) -> EngineResult<Decimal> {
        let (a, c) = self.exponents()?;
        let m = a.max(c);
        let ey = shifted_exp(a - m)?;
        let en = shifted_exp(c - m)?;
        let p_yes = ey / (ey + en);
        Ok(match side {
            Side::Yes => p_yes,
            Side::No => Decimal::ONE - p_yes,
        })
    }

    /// Spot price in micro-units per whole share
    pub fn spot_price_units(&self, side: Side) -> EngineResult<u64> {
        let price = self.spot_price(side)? * Decimal::from(UNIT);
        to_units(price.round())
    }
}

/// e^x for x ≤ 0
fn shifted_exp(x: Decimal) -> EngineResult<Decimal> {
    if x < Decimal::from(NEGLIGIBLE_EXPONENT) {
        return Ok(Decimal::ZERO);
    }
    x.checked_exp()
        .ok_or_else(|| EngineError::Internal(format!("exp overflow at {}", x)))
}

fn to_units(value: Decimal) -> EngineResult<u64> {
    if value.is_sign_negative() {
        return Ok(0);
    }
    value
        .to_u64()
        .ok_or_else(|| EngineError::Internal(format!("{} does not fit in u64 units", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balanced_book_prices_at_half() {
        let pool = LmsrPool::new(0, 0, UNIT);
        assert_eq!(pool.spot_price(Side::Yes).unwrap(), dec!(0.5));
        assert_eq!(pool.spot_price_units(Side::No).unwrap(), 500_000);
    }

    #[test]
    fn test_empty_book_cost_is_b_ln2() {
        let pool = LmsrPool::new(0, 0, UNIT);
        let cost = pool.cost().unwrap().round().to_u64().unwrap();
        assert_eq!(cost, 693_147);
    }

    #[test]
    fn test_buy_cost_bounded_by_shares() {
        let pool = LmsrPool::new(0, 0, UNIT);
        let cost = pool.buy_cost(Side::Yes, 100 * UNIT).unwrap();
        // 100 shares pay out at most 100 USDC, and cost at least the half-price first share
        assert!(cost < 100 * UNIT);
        assert!(cost > 99 * UNIT);
    }

    #[test]
    fn test_skewed_book_does_not_overflow() {
        let pool = LmsrPool::new(500 * UNIT, 0, UNIT);
        let price = pool.spot_price(Side::Yes).unwrap();
        assert_eq!(price, Decimal::ONE);
        assert!(pool.buy_cost(Side::No, UNIT).unwrap() < 10);
    }

    #[test]
    fn test_round_trip_never_profits() {
        let pool = LmsrPool::new(3 * UNIT, 7 * UNIT, 2 * UNIT);
        let cost = pool.buy_cost(Side::Yes, 5 * UNIT).unwrap();
        let after = LmsrPool::new(8 * UNIT, 7 * UNIT, 2 * UNIT);
        let proceeds = after.sell_proceeds(Side::Yes, 5 * UNIT).unwrap();
        assert!(proceeds <= cost);
    }

    #[test]
    fn test_selling_more_than_book_fails() {
        let pool = LmsrPool::new(UNIT, 0, UNIT);
        assert!(matches!(
            pool.sell_proceeds(Side::Yes, 2 * UNIT),
            Err(EngineError::InsufficientShares { .. })
        ));
    }

    #[test]
    fn test_zero_liquidity_parameter_is_rejected() {
        let pool = LmsrPool::new(0, 0, 0);
        assert!(pool.cost().is_err());
    }
}
