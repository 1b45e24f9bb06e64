//! Core type definitions for Tally
//!
//! Identifiers, fixed-point amounts and the persisted rows owned by the
//! engine: mint blocks, weight snapshots, reward entries and combat power
//! records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Fixed-point amount in the reward token's minimum unit
pub type Amount = u128;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Generate a fresh random identifier
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Parse from the hyphenated string form
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $label, &self.0.simple().to_string()[..12])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.0.simple().to_string()[..12])
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(
    /// Participant identifier, owned by the identity subsystem
    ParticipantId,
    "ParticipantId"
);

define_id!(
    /// Mint block row identifier
    BlockId,
    "BlockId"
);

define_id!(
    /// Reward entry row identifier
    EntryId,
    "EntryId"
);

define_id!(
    /// Asset identifier as known to the balance ledger
    AssetId,
    "AssetId"
);

/// The three independent weight inputs of a participant
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weights {
    /// Transaction / holdings weight
    pub transaction: Amount,
    /// Liquidity-provision weight
    pub lp: Amount,
    /// Burn weight
    pub burn: Amount,
}

impl Weights {
    pub fn new(transaction: Amount, lp: Amount, burn: Amount) -> Self {
        Self {
            transaction,
            lp,
            burn,
        }
    }

    /// Combined weight, `None` on overflow
    pub fn checked_total(&self) -> Option<Amount> {
        self.transaction
            .checked_add(self.lp)?
            .checked_add(self.burn)
    }

    /// Combined weight, saturating at `Amount::MAX`
    pub fn total(&self) -> Amount {
        self.transaction
            .saturating_add(self.lp)
            .saturating_add(self.burn)
    }

    pub fn is_zero(&self) -> bool {
        self.transaction == 0 && self.lp == 0 && self.burn == 0
    }
}

/// A discrete reward-emission event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintBlock {
    /// Row identifier
    pub id: BlockId,
    /// Strictly increasing, unique block number
    pub number: u64,
    /// Reward pool for this block
    pub total_reward: Amount,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Set once, when entries have been recorded
    pub distributed: bool,
    /// Distribution time
    pub distributed_at: Option<DateTime<Utc>>,
}

impl MintBlock {
    /// Create a new, undistributed block
    pub fn new(number: u64, total_reward: Amount, created_at: DateTime<Utc>) -> Self {
        Self {
            id: BlockId::generate(),
            number,
            total_reward,
            created_at,
            distributed: false,
            distributed_at: None,
        }
    }

    /// Created but not yet distributed
    pub fn is_open(&self) -> bool {
        !self.distributed
    }
}

/// Immutable capture of one participant's weights for one block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub participant: ParticipantId,
    pub block: BlockId,
    pub weights: Weights,
    pub captured_at: DateTime<Utc>,
}

/// A participant's allotted share of a block's reward pool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEntry {
    /// Row identifier
    pub id: EntryId,
    /// Owner of the entry
    pub participant: ParticipantId,
    /// Block the entry was distributed from
    pub block: BlockId,
    /// Block number, denormalized for history views
    pub block_number: u64,
    /// Share of the block's reward pool
    pub amount: Amount,
    /// Total weight the share was computed from
    pub weight: Amount,
    /// Set once, by the claim ledger
    pub claimed: bool,
    /// Claim time
    pub claimed_at: Option<DateTime<Utc>>,
    /// Distribution time
    pub created_at: DateTime<Utc>,
}

impl RewardEntry {
    /// Create an unclaimed entry for a block
    pub fn new(
        participant: ParticipantId,
        block: &MintBlock,
        amount: Amount,
        weight: Amount,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            participant,
            block: block.id,
            block_number: block.number,
            amount,
            weight,
            claimed: false,
            claimed_at: None,
            created_at,
        }
    }
}

/// Per-participant recalculation state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Underlying weights changed, recalculation pending
    Stale,
    /// Recalculation in progress
    Recalculating,
    /// Personal power reflects the latest inputs
    #[default]
    Current,
}

/// Personal and team combat power of one participant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatPowerRecord {
    pub participant: ParticipantId,
    /// (holdings + lp + burn) x multiplier
    pub personal_power: Amount,
    /// Sum of personal power over the whole downline
    pub team_power: Amount,
    pub lp_weight: Amount,
    pub burn_weight: Amount,
    /// Participants in the downline
    pub team_members: u64,
    /// Participants directly invited
    pub direct_referrals: u64,
    pub state: PowerState,
    /// Set once the participant's join has been counted at its ancestors
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CombatPowerRecord {
    /// Zero-initialized record for a newly onboarded participant
    pub fn new(participant: ParticipantId, now: DateTime<Utc>) -> Self {
        Self {
            participant,
            personal_power: 0,
            team_power: 0,
            lp_weight: 0,
            burn_weight: 0,
            team_members: 0,
            direct_referrals: 0,
            state: PowerState::Current,
            joined_at: None,
            updated_at: now,
        }
    }

    /// Apply an additive team change, saturating at zero
    pub fn apply(&mut self, delta: &TeamDelta, now: DateTime<Utc>) {
        self.team_power = crate::math::apply_delta(self.team_power, delta.power);
        self.team_members = apply_count(self.team_members, delta.members);
        self.direct_referrals = apply_count(self.direct_referrals, delta.direct_referrals);
        self.updated_at = now;
    }
}

fn apply_count(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Additive change to an ancestor's team fields
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeamDelta {
    pub power: i128,
    pub members: i64,
    pub direct_referrals: i64,
}

impl TeamDelta {
    /// Power-only delta
    pub fn power(power: i128) -> Self {
        Self {
            power,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.power == 0 && self.members == 0 && self.direct_referrals == 0
    }
}

/// Result of a full downline recomputation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamStats {
    pub team_power: Amount,
    pub team_members: u64,
    pub direct_referrals: u64,
}

/// One point of a participant's combat power history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerHistoryPoint {
    pub participant: ParticipantId,
    pub personal_power: Amount,
    pub team_power: Amount,
    pub recorded_at: DateTime<Utc>,
}

/// An entry credited by a claim whose commit failed and whose credit could not be refunded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistencyRecord {
    pub entry: EntryId,
    pub participant: ParticipantId,
    pub amount: Amount,
    pub reason: String,
    pub observed_at: DateTime<Utc>,
}
