//! Automated market maker: pricing, fee split and liquidity depth control

pub mod fees;
pub mod liquidity;
pub mod pricing;

pub use fees::{FeeSchedule, FeeSplit};
pub use liquidity::next_liquidity_parameter;
pub use pricing::LmsrPool;
