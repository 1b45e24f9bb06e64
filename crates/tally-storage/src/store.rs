//! Reward store interface
//!
//! Every mutation that guards an invariant is a single-row conditional
//! update: `mark_distributed`, `mark_claimed`, `mark_joined` and the combat
//! record writers never read-modify-write across rows.
//!
//! A claim spans the store and the balance ledger. `entry_lock` hands out
//! the row lock that a claim holds from its checks through the credit to
//! the `mark_claimed` commit, so no other claimant observes the entry
//! between the two.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tally_core::{
    Amount, BlockId, CombatPowerRecord, EntryId, InconsistencyRecord, MintBlock, ParticipantId,
    PowerHistoryPoint, PowerState, Result, RewardEntry, TeamDelta, TeamStats, WeightSnapshot,
};

/// Row lock serializing claims on one reward entry
pub type EntryLock = Arc<tokio::sync::Mutex<()>>;

/// Outcome of the conditional claim transition on one entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimTransition {
    /// This call flipped `claimed` from false to true
    Claimed(RewardEntry),
    /// Entry was already claimed
    AlreadyClaimed,
    /// Entry belongs to someone else
    NotOwner,
    /// No such entry
    NotFound,
}

/// Persistence for the engine's tables
pub trait RewardStore: Send + Sync {
    // === Mint Blocks ===

    /// Insert a block; rejects a taken block number with `DuplicateBlockNumber`
    fn insert_block(&self, block: MintBlock) -> Result<MintBlock>;

    /// Block by id
    fn block(&self, id: BlockId) -> Result<Option<MintBlock>>;

    /// Block with the highest number
    fn last_block(&self) -> Result<Option<MintBlock>>;

    /// Highest-numbered block that is not yet distributed
    fn open_block(&self) -> Result<Option<MintBlock>>;

    /// Flip `distributed` to true; `false` if it already was
    fn mark_distributed(&self, id: BlockId, at: DateTime<Utc>) -> Result<bool>;

    // === Weight Snapshots ===

    /// Append a snapshot; rejects a second one for the same participant and block
    fn insert_snapshot(&self, snapshot: WeightSnapshot) -> Result<()>;

    /// Snapshots of a block in capture order
    fn snapshots_for_block(&self, block: BlockId) -> Result<Vec<WeightSnapshot>>;

    // === Reward Entries ===

    /// Record all entries of a block at once
    ///
    /// Returns `false` without writing anything when the block already has
    /// entries.
    fn insert_block_entries(&self, block: BlockId, entries: Vec<RewardEntry>) -> Result<bool>;

    fn entries_for_block(&self, block: BlockId) -> Result<Vec<RewardEntry>>;

    fn entry(&self, id: EntryId) -> Result<Option<RewardEntry>>;

    /// All entries of a participant, oldest block first
    fn entries_for_participant(&self, participant: ParticipantId) -> Result<Vec<RewardEntry>>;

    fn unclaimed_entries(&self, participant: ParticipantId) -> Result<Vec<RewardEntry>>;

    /// Check ownership and flip `claimed` in one conditional update
    fn mark_claimed(
        &self,
        id: EntryId,
        participant: ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<ClaimTransition>;

    /// Lock for the row of entry `id`; every caller gets the same lock
    fn entry_lock(&self, id: EntryId) -> EntryLock;

    fn record_inconsistency(&self, record: InconsistencyRecord) -> Result<()>;

    fn inconsistencies(&self) -> Result<Vec<InconsistencyRecord>>;

    /// Whether an inconsistency was recorded against entry `id`
    fn has_inconsistency(&self, id: EntryId) -> Result<bool>;

    // === Combat Power ===

    fn combat_record(&self, participant: ParticipantId) -> Result<Option<CombatPowerRecord>>;

    /// Existing record, or a zero-initialized one
    fn ensure_combat_record(
        &self,
        participant: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<CombatPowerRecord>;

    fn set_power_state(
        &self,
        participant: ParticipantId,
        state: PowerState,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Write personal power and weights, mark `Current`, return the previous power
    fn store_personal(
        &self,
        participant: ParticipantId,
        personal_power: Amount,
        lp_weight: Amount,
        burn_weight: Amount,
        now: DateTime<Utc>,
    ) -> Result<Amount>;

    /// Mark the join of `participant` as counted; `false` if it already was
    fn mark_joined(&self, participant: ParticipantId, at: DateTime<Utc>) -> Result<bool>;

    /// Additive team update, creating the record when missing
    fn apply_team_delta(
        &self,
        participant: ParticipantId,
        delta: TeamDelta,
        now: DateTime<Utc>,
    ) -> Result<CombatPowerRecord>;

    /// Overwrite team fields with a full recomputation
    fn store_team_stats(
        &self,
        participant: ParticipantId,
        stats: TeamStats,
        now: DateTime<Utc>,
    ) -> Result<CombatPowerRecord>;

    fn combat_records(&self) -> Result<Vec<CombatPowerRecord>>;

    fn append_history(&self, point: PowerHistoryPoint) -> Result<()>;

    /// History points recorded at or after `since`, oldest first
    fn history(
        &self,
        participant: ParticipantId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PowerHistoryPoint>>;
}
