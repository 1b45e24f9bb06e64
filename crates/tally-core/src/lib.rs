//! # Tally Core
//!
//! Core data model of the reward and combat-power aggregation engine.
//!
//! - `MintBlock` - one discrete reward-emission event with a fixed pool
//! - `WeightSnapshot` - block-scoped capture of a participant's weights
//! - `RewardEntry` - a participant's claimable share of a block
//! - `CombatPowerRecord` - personal and downline (team) power
//!
//! ## Amounts
//!
//! All amounts and weights are `u128` integers in the reward token's minimum
//! unit. Shares are rounded down, so a distributed block never pays out more
//! than its pool.
//!
//! ```text
//!   MintBlock ──► WeightSnapshot (1 per participant) ──► RewardEntry ──► claim ──► BalanceLedger
//!                        ▲
//!   CombatPowerRecord ───┘ (lp + burn weight)
//! ```

pub mod clock;
pub mod error;
pub mod interfaces;
pub mod math;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, TallyError};
pub use interfaces::{BalanceLedger, MultiplierSource, NoMultipliers, ReferralForest, WeightSource};
pub use types::*;

/// Reward token constants
pub mod constants {
    use crate::types::Amount;

    /// Default reward token symbol
    pub const REWARD_SYMBOL: &str = "CAN";

    /// Decimal places of the reward token
    pub const DECIMALS: u8 = 18;

    /// One token in minimum units
    pub const ONE_TOKEN: Amount = 1_000_000_000_000_000_000; // 10^18

    /// Default reward pool per mint block: 1000 tokens
    pub const DEFAULT_BLOCK_REWARD: Amount = 1_000 * ONE_TOKEN;

    /// Default interval between mint blocks: 30 minutes
    pub const DEFAULT_BLOCK_INTERVAL_SECS: u64 = 30 * 60;

    /// Default hop limit when walking up the referral forest
    pub const DEFAULT_MAX_ANCESTOR_DEPTH: usize = 10_000;
}

pub use constants::*;
