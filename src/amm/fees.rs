// Fee schedule and split
//
// Each component is floored on its own; the total is floored on the summed
// rate, capped at 100%. The difference (dust) is never paid out and stays in
// the pool. Components are clamped in protocol, creator, lp order so they
// never sum past the total, even for a schedule that skipped `validate`.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const BPS_DENOMINATOR: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub protocol_bps: u32,
    pub creator_bps: u32,
    pub lp_bps: u32,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self { protocol_bps: 100, creator_bps: 50, lp_bps: 50 }
    }
}

impl FeeSchedule {
    pub fn total_bps(&self) -> u64 {
        self.protocol_bps as u64 + self.creator_bps as u64 + self.lp_bps as u64
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.total_bps() > BPS_DENOMINATOR {
            return Err(EngineError::Validation(format!(
                "fee schedule totals {} bps",
                self.total_bps()
            )));
        }
        Ok(())
    }

    pub fn split(&self, amount: u64) -> FeeSplit {
        let total = bps_of(amount, self.total_bps().min(BPS_DENOMINATOR));
        let protocol = bps_of(amount, self.protocol_bps as u64).min(total);
        let creator = bps_of(amount, self.creator_bps as u64).min(total - protocol);
        let lp = bps_of(amount, self.lp_bps as u64).min(total - protocol - creator);
        FeeSplit { protocol, creator, lp, total }
    }
}

fn bps_of(amount: u64, bps: u64) -> u64 {
    ((amount as u128 * bps as u128) / BPS_DENOMINATOR as u128) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeSplit {
    pub protocol: u64,
    pub creator: u64,
    pub lp: u64,
    pub total: u64,
}

impl FeeSplit {
    /// The whole amount goes to the protocol (dispute fees)
    pub fn protocol_only(amount: u64) -> Self {
        Self { protocol: amount, creator: 0, lp: 0, total: amount }
    }

    /// Flooring remainder that stays in the pool
    pub fn dust(&self) -> u64 {
        self.total.saturating_sub(self.protocol + self.creator + self.lp)
    }

    /// Pool inflow on a buy of `raw` cost
    pub fn buy_pool_inflow(&self, raw: u64) -> u64 {
        raw + self.lp + self.dust()
    }

    /// Pool outflow on a sale of `raw` proceeds
    pub fn sell_pool_outflow(&self, raw: u64) -> u64 {
        raw.saturating_sub(self.lp + self.dust())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_components_never_exceed_total() {
        let schedule = FeeSchedule::default();
        for amount in [0u64, 1, 99, 199, 10_001, 123_456_789] {
            let split = schedule.split(amount);
            assert!(split.protocol + split.creator + split.lp <= split.total);
            assert!(split.total <= amount);
        }
    }

    #[test]
    fn test_dust_stays_with_pool() {
        let schedule = FeeSchedule::default();
        // 199 * 100bps = 1.99 → 1; 199 * 50bps = 0.995 → 0 (x2); 199 * 200bps = 3.98 → 3
        let split = schedule.split(199);
        assert_eq!(split, FeeSplit { protocol: 1, creator: 0, lp: 0, total: 3 });
        assert_eq!(split.dust(), 2);
        assert_eq!(split.buy_pool_inflow(199), 201);
        assert_eq!(split.sell_pool_outflow(199), 197);
    }

    #[test]
    fn test_buy_conserves_value() {
        let schedule = FeeSchedule::default();
        let raw = 99_306_853;
        let split = schedule.split(raw);
        let user_pays = raw + split.total;
        assert_eq!(user_pays, split.buy_pool_inflow(raw) + split.protocol + split.creator);
    }

    #[test]
    fn test_oversized_schedule_is_invalid() {
        let schedule = FeeSchedule { protocol_bps: 9_000, creator_bps: 900, lp_bps: 200 };
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_oversized_schedule_split_is_clamped() {
        let schedule = FeeSchedule { protocol_bps: 9_000, creator_bps: 900, lp_bps: 200 };
        let split = schedule.split(1_000_000);
        assert_eq!(split.total, 1_000_000);
        assert_eq!(split, FeeSplit { protocol: 900_000, creator: 90_000, lp: 10_000, total: 1_000_000 });
        assert_eq!(split.dust(), 0);

        let lopsided = FeeSchedule { protocol_bps: 20_000, creator_bps: 50, lp_bps: 50 };
        let split = lopsided.split(1_000);
        assert_eq!(split, FeeSplit { protocol: 1_000, creator: 0, lp: 0, total: 1_000 });
    }

    #[test]
    fn test_protocol_only() {
        let split = FeeSplit::protocol_only(100_000_000);
        assert_eq!(split.protocol, split.total);
        assert_eq!(split.dust(), 0);
    }
}
