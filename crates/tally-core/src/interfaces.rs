//! External collaborator interfaces
//!
//! The engine reads weights, multipliers and the referral forest from other
//! subsystems and pays out through the shared balance ledger. All of them
//! are async and object-safe so they can be backed by a database, an RPC
//! client or the in-memory implementations in `tally-storage`.

use crate::error::Result;
use crate::types::{Amount, AssetId, ParticipantId};
use async_trait::async_trait;

/// Balance-mutation primitive shared with the rest of the system
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Resolve an asset symbol to the ledger's identifier
    async fn resolve_asset(&self, symbol: &str) -> Result<AssetId>;

    /// Add `amount` to a participant's balance
    async fn credit(&self, participant: ParticipantId, asset: AssetId, amount: Amount) -> Result<()>;

    /// Remove `amount` from a participant's balance
    async fn debit(&self, participant: ParticipantId, asset: AssetId, amount: Amount) -> Result<()>;

    /// Current balance of an asset, zero when the participant holds none
    async fn balance(&self, participant: ParticipantId, symbol: &str) -> Result<Amount>;
}

/// Weight inputs tracked by the holdings, liquidity and burn subsystems
#[async_trait]
pub trait WeightSource: Send + Sync {
    /// Holdings of tokens that contribute to combat power
    async fn holdings_weight(&self, participant: ParticipantId) -> Result<Amount>;

    /// Liquidity-provision weight
    async fn lp_weight(&self, participant: ParticipantId) -> Result<Amount>;

    /// Burn weight
    async fn burn_weight(&self, participant: ParticipantId) -> Result<Amount>;
}

/// Time-limited entitlements (badges) that scale combat power
#[async_trait]
pub trait MultiplierSource: Send + Sync {
    /// Product of all active multipliers, `None` when there are none
    async fn active_multiplier(&self, participant: ParticipantId) -> Result<Option<f64>>;
}

/// Multiplier source with no entitlements; every factor is 1.0
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMultipliers;

#[async_trait]
impl MultiplierSource for NoMultipliers {
    async fn active_multiplier(&self, _participant: ParticipantId) -> Result<Option<f64>> {
        Ok(None)
    }
}

/// Read-only view of the participant directory and its referral forest
///
/// Each participant has at most one inviter. Depth is unbounded.
#[async_trait]
pub trait ReferralForest: Send + Sync {
    /// Inviter of a participant, `None` for roots
    async fn inviter(&self, participant: ParticipantId) -> Result<Option<ParticipantId>>;

    /// Participants directly invited by `participant`
    async fn direct_referrals(&self, participant: ParticipantId) -> Result<Vec<ParticipantId>>;

    /// Every known participant
    async fn participants(&self) -> Result<Vec<ParticipantId>>;
}
