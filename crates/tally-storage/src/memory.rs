//! In-memory reward store
//!
//! Each table sits behind its own lock; combat records live in a `DashMap`
//! so per-participant updates only contend on their own shard.

use crate::store::{ClaimTransition, EntryLock, RewardStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tally_core::{
    Amount, BlockId, CombatPowerRecord, EntryId, InconsistencyRecord, MintBlock, ParticipantId,
    PowerHistoryPoint, PowerState, Result, RewardEntry, TallyError, TeamDelta, TeamStats,
    WeightSnapshot,
};

/// History points kept per participant
pub const MAX_HISTORY_POINTS: usize = 4096;

#[derive(Default)]
struct BlockTable {
    by_id: HashMap<BlockId, MintBlock>,
    by_number: BTreeMap<u64, BlockId>,
}

#[derive(Default)]
struct EntryTable {
    by_id: HashMap<EntryId, RewardEntry>,
    by_block: HashMap<BlockId, Vec<EntryId>>,
    by_participant: HashMap<ParticipantId, Vec<EntryId>>,
}

impl EntryTable {
    fn collect(&self, ids: Option<&Vec<EntryId>>) -> Vec<RewardEntry> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.by_id.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Reward store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    blocks: RwLock<BlockTable>,
    snapshots: RwLock<HashMap<BlockId, IndexMap<ParticipantId, WeightSnapshot>>>,
    entries: RwLock<EntryTable>,
    combat: DashMap<ParticipantId, CombatPowerRecord>,
    history: RwLock<HashMap<ParticipantId, VecDeque<PowerHistoryPoint>>>,
    inconsistencies: RwLock<Vec<InconsistencyRecord>>,
    entry_locks: DashMap<EntryId, EntryLock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mint blocks
    pub fn block_count(&self) -> usize {
        self.blocks.read().by_id.len()
    }

    /// Number of reward entries across all blocks
    pub fn entry_count(&self) -> usize {
        self.entries.read().by_id.len()
    }
}

impl RewardStore for MemoryStore {
    fn insert_block(&self, block: MintBlock) -> Result<MintBlock> {
        let mut table = self.blocks.write();
        if table.by_number.contains_key(&block.number) {
            return Err(TallyError::DuplicateBlockNumber(block.number));
        }
        table.by_number.insert(block.number, block.id);
        table.by_id.insert(block.id, block.clone());
        Ok(block)
    }

    fn block(&self, id: BlockId) -> Result<Option<MintBlock>> {
        Ok(self.blocks.read().by_id.get(&id).cloned())
    }

    fn last_block(&self) -> Result<Option<MintBlock>> {
        let table = self.blocks.read();
        Ok(table
            .by_number
            .values()
            .next_back()
            .and_then(|id| table.by_id.get(id).cloned()))
    }

    fn open_block(&self) -> Result<Option<MintBlock>> {
        let table = self.blocks.read();
        Ok(table
            .by_number
            .values()
            .rev()
            .filter_map(|id| table.by_id.get(id))
            .find(|block| block.is_open())
            .cloned())
    }

    fn mark_distributed(&self, id: BlockId, at: DateTime<Utc>) -> Result<bool> {
        let mut table = self.blocks.write();
        let block = table
            .by_id
            .get_mut(&id)
            .ok_or(TallyError::BlockNotFound(id))?;
        if block.distributed {
            return Ok(false);
        }
        block.distributed = true;
        block.distributed_at = Some(at);
        Ok(true)
    }

    fn insert_snapshot(&self, snapshot: WeightSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        let rows = snapshots.entry(snapshot.block).or_default();
        if rows.contains_key(&snapshot.participant) {
            return Err(TallyError::DuplicateSnapshot {
                participant: snapshot.participant,
                block: snapshot.block,
            });
        }
        rows.insert(snapshot.participant, snapshot);
        Ok(())
    }

    fn snapshots_for_block(&self, block: BlockId) -> Result<Vec<WeightSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .get(&block)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn insert_block_entries(&self, block: BlockId, entries: Vec<RewardEntry>) -> Result<bool> {
        let mut table = self.entries.write();
        if table.by_block.get(&block).is_some_and(|ids| !ids.is_empty()) {
            return Ok(false);
        }

        if let Some(stray) = entries.iter().find(|e| e.block != block) {
            return Err(TallyError::InvalidInput(format!(
                "entry {} belongs to block {}, not {}",
                stray.id, stray.block, block
            )));
        }

        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            ids.push(entry.id);
            table
                .by_participant
                .entry(entry.participant)
                .or_default()
                .push(entry.id);
            table.by_id.insert(entry.id, entry);
        }
        table.by_block.insert(block, ids);
        Ok(true)
    }

    fn entries_for_block(&self, block: BlockId) -> Result<Vec<RewardEntry>> {
        let table = self.entries.read();
        Ok(table.collect(table.by_block.get(&block)))
    }

    fn entry(&self, id: EntryId) -> Result<Option<RewardEntry>> {
        Ok(self.entries.read().by_id.get(&id).cloned())
    }

    fn entries_for_participant(&self, participant: ParticipantId) -> Result<Vec<RewardEntry>> {
        let table = self.entries.read();
        let mut entries = table.collect(table.by_participant.get(&participant));
        entries.sort_by_key(|e| e.block_number);
        Ok(entries)
    }

    fn unclaimed_entries(&self, participant: ParticipantId) -> Result<Vec<RewardEntry>> {
        Ok(self
            .entries_for_participant(participant)?
            .into_iter()
            .filter(|e| !e.claimed)
            .collect())
    }

    fn mark_claimed(
        &self,
        id: EntryId,
        participant: ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<ClaimTransition> {
        let mut table = self.entries.write();
        let Some(entry) = table.by_id.get_mut(&id) else {
            return Ok(ClaimTransition::NotFound);
        };
        if entry.participant != participant {
            return Ok(ClaimTransition::NotOwner);
        }
        if entry.claimed {
            return Ok(ClaimTransition::AlreadyClaimed);
        }
        entry.claimed = true;
        entry.claimed_at = Some(at);
        Ok(ClaimTransition::Claimed(entry.clone()))
    }

    fn entry_lock(&self, id: EntryId) -> EntryLock {
        self.entry_locks.entry(id).or_default().clone()
    }

    fn record_inconsistency(&self, record: InconsistencyRecord) -> Result<()> {
        self.inconsistencies.write().push(record);
        Ok(())
    }

    fn inconsistencies(&self) -> Result<Vec<InconsistencyRecord>> {
        Ok(self.inconsistencies.read().clone())
    }

    fn has_inconsistency(&self, id: EntryId) -> Result<bool> {
        Ok(self.inconsistencies.read().iter().any(|r| r.entry == id))
    }

    fn combat_record(&self, participant: ParticipantId) -> Result<Option<CombatPowerRecord>> {
        Ok(self.combat.get(&participant).map(|r| r.value().clone()))
    }

    fn ensure_combat_record(
        &self,
        participant: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<CombatPowerRecord> {
        Ok(self
            .combat
            .entry(participant)
            .or_insert_with(|| CombatPowerRecord::new(participant, now))
            .value()
            .clone())
    }

    fn set_power_state(
        &self,
        participant: ParticipantId,
        state: PowerState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut record = self
            .combat
            .entry(participant)
            .or_insert_with(|| CombatPowerRecord::new(participant, now));
        record.state = state;
        record.updated_at = now;
        Ok(())
    }

    fn store_personal(
        &self,
        participant: ParticipantId,
        personal_power: Amount,
        lp_weight: Amount,
        burn_weight: Amount,
        now: DateTime<Utc>,
    ) -> Result<Amount> {
        let mut record = self
            .combat
            .entry(participant)
            .or_insert_with(|| CombatPowerRecord::new(participant, now));
        let previous = record.personal_power;
        record.personal_power = personal_power;
        record.lp_weight = lp_weight;
        record.burn_weight = burn_weight;
        record.state = PowerState::Current;
        record.updated_at = now;
        Ok(previous)
    }

    fn mark_joined(&self, participant: ParticipantId, at: DateTime<Utc>) -> Result<bool> {
        let mut record = self
            .combat
            .entry(participant)
            .or_insert_with(|| CombatPowerRecord::new(participant, at));
        if record.joined_at.is_some() {
            return Ok(false);
        }
        record.joined_at = Some(at);
        Ok(true)
    }

    fn apply_team_delta(
        &self,
        participant: ParticipantId,
        delta: TeamDelta,
        now: DateTime<Utc>,
    ) -> Result<CombatPowerRecord> {
        let mut record = self
            .combat
            .entry(participant)
            .or_insert_with(|| CombatPowerRecord::new(participant, now));
        record.apply(&delta, now);
        Ok(record.value().clone())
    }

    fn store_team_stats(
        &self,
        participant: ParticipantId,
        stats: TeamStats,
        now: DateTime<Utc>,
    ) -> Result<CombatPowerRecord> {
        let mut record = self
            .combat
            .entry(participant)
            .or_insert_with(|| CombatPowerRecord::new(participant, now));
        record.team_power = stats.team_power;
        record.team_members = stats.team_members;
        record.direct_referrals = stats.direct_referrals;
        record.updated_at = now;
        Ok(record.value().clone())
    }

    fn combat_records(&self) -> Result<Vec<CombatPowerRecord>> {
        Ok(self.combat.iter().map(|r| r.value().clone()).collect())
    }

    fn append_history(&self, point: PowerHistoryPoint) -> Result<()> {
        let mut history = self.history.write();
        let points = history.entry(point.participant).or_default();
        if points.len() == MAX_HISTORY_POINTS {
            points.pop_front();
        }
        points.push_back(point);
        Ok(())
    }

    fn history(
        &self,
        participant: ParticipantId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PowerHistoryPoint>> {
        Ok(self
            .history
            .read()
            .get(&participant)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.recorded_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
