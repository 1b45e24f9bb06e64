//! # Reward Distribution
//!
//! Turns a block's weight snapshots into reward entries.
//!
//! Each participant receives `floor(total_reward * weight / W)` where `W` is
//! the summed weight of the block. Rounding residue is forfeited, so the
//! entries of a block never sum above its pool and fall short of it by less
//! than one minimum unit per participant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_core::math::mul_div_floor;
use tally_core::{Amount, BlockId, Clock, MintBlock, Result, RewardEntry, TallyError};
use tally_storage::RewardStore;

/// Proportional split of a reward pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Allocation {
    /// One share per input weight, same order
    pub shares: Vec<Amount>,

    /// Sum of all weights
    pub total_weight: Amount,

    /// Sum of all shares
    pub distributed: Amount,

    /// Pool left over after rounding down, or the whole pool when `total_weight` is zero
    pub residue: Amount,
}

/// Split `total` across `weights` in proportion, rounding every share down
pub fn allocate(total: Amount, weights: &[Amount]) -> Result<Allocation> {
    let total_weight = weights.iter().try_fold(0 as Amount, |acc, w| {
        acc.checked_add(*w)
            .ok_or_else(|| TallyError::InvalidInput("total weight overflows u128".into()))
    })?;

    if total_weight == 0 {
        return Ok(Allocation {
            shares: vec![0; weights.len()],
            total_weight,
            distributed: 0,
            residue: total,
        });
    }

    let mut shares = Vec::with_capacity(weights.len());
    let mut distributed: Amount = 0;
    for weight in weights {
        // weight <= total_weight, so the quotient never exceeds total
        let share = mul_div_floor(total, *weight, total_weight)
            .ok_or_else(|| TallyError::InvalidInput("share exceeds u128".into()))?;
        distributed += share;
        shares.push(share);
    }

    Ok(Allocation {
        shares,
        total_weight,
        distributed,
        residue: total - distributed,
    })
}

/// Outcome of distributing one block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionReport {
    pub block: BlockId,
    pub block_number: u64,
    /// Reward entries recorded
    pub entries: usize,
    pub total_weight: Amount,
    /// Sum of all entry amounts
    pub distributed: Amount,
    /// Forfeited remainder of the pool
    pub residue: Amount,
    pub distributed_at: DateTime<Utc>,
}

/// Records reward entries for a snapshotted block and marks it distributed
pub struct RewardDistributor {
    store: Arc<dyn RewardStore>,
    clock: Arc<dyn Clock>,
}

impl RewardDistributor {
    pub fn new(store: Arc<dyn RewardStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Distribute a block's pool over its snapshots
    ///
    /// Fails with `AlreadyDistributed` once the block has been distributed,
    /// including when a concurrent run wins the final flag update.
    pub async fn distribute(&self, block_id: BlockId) -> Result<DistributionReport> {
        let block = self
            .store
            .block(block_id)?
            .ok_or(TallyError::BlockNotFound(block_id))?;
        if block.distributed {
            return Err(TallyError::AlreadyDistributed(block_id));
        }

        let snapshots = self.store.snapshots_for_block(block_id)?;
        let weights = snapshots
            .iter()
            .map(|s| {
                s.weights.checked_total().ok_or_else(|| {
                    TallyError::InvalidInput(format!("weight of {} overflows", s.participant))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let allocation = allocate(block.total_reward, &weights)?;
        let now = self.clock.now();

        let entries: Vec<RewardEntry> = if allocation.total_weight > 0 {
            snapshots
                .iter()
                .zip(weights.iter().zip(&allocation.shares))
                .map(|(snapshot, (weight, share))| {
                    RewardEntry::new(snapshot.participant, &block, *share, *weight, now)
                })
                .collect()
        } else {
            Vec::new()
        };
        let entry_count = entries.len();

        let report = if self.store.insert_block_entries(block_id, entries)? {
            DistributionReport {
                block: block_id,
                block_number: block.number,
                entries: entry_count,
                total_weight: allocation.total_weight,
                distributed: allocation.distributed,
                residue: allocation.residue,
                distributed_at: now,
            }
        } else {
            tracing::debug!(block = block.number, "Entries already recorded, finishing distribution");
            self.report_existing(&block, now)?
        };

        if !self.store.mark_distributed(block_id, now)? {
            return Err(TallyError::AlreadyDistributed(block_id));
        }

        if report.total_weight == 0 {
            tracing::info!(
                block = block.number,
                pool = %block.total_reward,
                "Block had zero total weight, reward pool forfeited"
            );
        } else {
            tracing::info!(
                block = block.number,
                entries = report.entries,
                distributed = %report.distributed,
                residue = %report.residue,
                "Distributed mint block"
            );
        }
        Ok(report)
    }

    fn report_existing(&self, block: &MintBlock, now: DateTime<Utc>) -> Result<DistributionReport> {
        let existing = self.store.entries_for_block(block.id)?;
        let distributed: Amount = existing.iter().map(|e| e.amount).sum();
        Ok(DistributionReport {
            block: block.id,
            block_number: block.number,
            entries: existing.len(),
            total_weight: existing.iter().map(|e| e.weight).sum(),
            distributed,
            residue: block.total_reward.saturating_sub(distributed),
            distributed_at: now,
        })
    }
}
