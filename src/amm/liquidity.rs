// Liquidity parameter controller
//
// b follows pool depth: target = max(base × 1000, ⌊√max(pool, outstanding)⌋ × 10 000),
// then clamped to ±10% of the prior value so one trade cannot reshape the book.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Largest relative move of b per trade
pub const MAX_STEP: Decimal = dec!(0.10);

pub fn target_liquidity_parameter(base: u64, pool: u64, outstanding: u64) -> u64 {
    let floor = base.saturating_mul(1_000);
    let depth = isqrt(pool.max(outstanding)).saturating_mul(10_000);
    floor.max(depth)
}

pub fn next_liquidity_parameter(prior: u64, base: u64, pool: u64, outstanding: u64) -> u64 {
    let target = target_liquidity_parameter(base, pool, outstanding);
    if prior == 0 {
        return target;
    }
    let prior_dec = Decimal::from(prior);
    let lower = prior_dec * (Decimal::ONE - MAX_STEP);
    let upper = prior_dec * (Decimal::ONE + MAX_STEP);
    let clamped = Decimal::from(target).max(lower).min(upper);
    // Rounding to nearest could step past the bound; stay inside it
    let rounded = clamped.round();
    let rounded = if rounded > upper {
        upper.floor()
    } else if rounded < lower {
        lower.ceil()
    } else {
        rounded
    };
    rounded.to_u64().unwrap_or(prior).max(1)
}

/// ⌊√n⌋ by Newton's method
pub fn isqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let n = n as u128;
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UNIT;

    #[test]
    fn test_isqrt() {
        assert_eq!(isqrt(0), 0);
        assert_eq!(isqrt(15), 3);
        assert_eq!(isqrt(16), 4);
        assert_eq!(isqrt(500_000_000), 22_360);
        assert_eq!(isqrt(u64::MAX), 4_294_967_295);
    }

    #[test]
    fn test_target_uses_deeper_of_pool_and_outstanding() {
        assert_eq!(target_liquidity_parameter(1_000, 500 * UNIT, 0), 223_600_000);
        assert_eq!(target_liquidity_parameter(1_000, 0, 100 * UNIT), 100_000_000);
        assert_eq!(target_liquidity_parameter(1_000, 0, 0), 1_000_000);
    }

    #[test]
    fn test_step_is_clamped_to_ten_percent() {
        let prior = UNIT;
        let next = next_liquidity_parameter(prior, 1_000, 500 * UNIT, 0);
        assert_eq!(next, 1_100_000);

        let shrink = next_liquidity_parameter(10 * UNIT, 1_000, 0, 0);
        assert_eq!(shrink, 9_000_000);
    }

    #[test]
    fn test_step_bound_holds_for_odd_priors() {
        for prior in [7u64, 13, 999_999, 1_234_567] {
            let up = next_liquidity_parameter(prior, 1_000_000, 0, 0);
            let down = next_liquidity_parameter(prior, 0, 0, 0);
            assert!(up as f64 <= prior as f64 * 1.1 + 1e-9);
            assert!(down as f64 >= prior as f64 * 0.9 - 1e-9);
        }
    }

    #[test]
    fn test_within_band_target_is_adopted() {
        let next = next_liquidity_parameter(1_000_000, 1_050, 0, 0);
        assert_eq!(next, 1_050_000);
    }
}
