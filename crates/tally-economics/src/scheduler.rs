//! # Mint Block Scheduler
//!
//! Owns the block lifecycle:
//!
//! ```text
//!   open ──snapshot──► snapshotted ──distribute──► distributed
//! ```
//!
//! A block that fails to snapshot or distribute stays open and is picked up
//! again by the next `tick`. While it stays open no new block is minted; a
//! non-retryable failure on a resumed block is reported as `Stuck`. Block
//! numbers come from the last persisted block and are protected only by the
//! store's unique constraint.

use crate::distributor::{DistributionReport, RewardDistributor};
use crate::snapshot::WeightSnapshotter;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    Amount, Clock, MintBlock, Result, TallyError, DEFAULT_BLOCK_INTERVAL_SECS,
    DEFAULT_BLOCK_REWARD,
};
use tally_storage::RewardStore;

/// Scheduler timing and pool size
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleSettings {
    /// Time between consecutive blocks
    pub interval: Duration,

    /// Reward pool of each block minted by `create_next_block`
    pub block_reward: Amount,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_BLOCK_INTERVAL_SECS),
            block_reward: DEFAULT_BLOCK_REWARD,
        }
    }
}

/// What a scheduler tick did
#[derive(Clone, Debug)]
pub enum TickOutcome {
    /// An open block was snapshotted and distributed again
    Resumed {
        block: MintBlock,
        report: Option<DistributionReport>,
    },
    /// A new block was minted
    Created {
        block: MintBlock,
        report: Option<DistributionReport>,
    },
    /// Next block not due yet
    Idle { remaining: Duration },
    /// The open block failed with an error retrying will not fix; the
    /// schedule halts until it is repaired
    Stuck { block: MintBlock, error: TallyError },
}

pub struct MintBlockScheduler {
    store: Arc<dyn RewardStore>,
    snapshotter: Arc<WeightSnapshotter>,
    distributor: Arc<RewardDistributor>,
    clock: Arc<dyn Clock>,
    settings: ScheduleSettings,
}

impl MintBlockScheduler {
    pub fn new(
        store: Arc<dyn RewardStore>,
        snapshotter: Arc<WeightSnapshotter>,
        distributor: Arc<RewardDistributor>,
        clock: Arc<dyn Clock>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            store,
            snapshotter,
            distributor,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &ScheduleSettings {
        &self.settings
    }

    /// Open block, if any, and the time until the next block is due
    ///
    /// With no blocks at all the full interval is returned.
    pub fn current_block(&self) -> Result<(Option<MintBlock>, Duration)> {
        let open = self.store.open_block()?;
        let remaining = match self.store.last_block()? {
            Some(last) => self.remaining_after(&last)?,
            None => self.settings.interval,
        };
        Ok((open, remaining))
    }

    /// Mint a block with `total_reward`, then snapshot and distribute it
    ///
    /// Fails with `BlockCreation` when the block row cannot be persisted.
    /// Snapshot or distribution failures are logged and leave the block open.
    pub async fn create_block(&self, total_reward: Amount) -> Result<MintBlock> {
        let (block, _) = self.mint(total_reward).await?;
        Ok(block)
    }

    /// Mint a block with the configured per-block reward
    pub async fn create_next_block(&self) -> Result<MintBlock> {
        self.create_block(self.settings.block_reward).await
    }

    /// Timer entry point: finish an open block, or mint one when due
    pub async fn tick(&self) -> Result<TickOutcome> {
        if let Some(open) = self.store.open_block()? {
            tracing::info!(block = open.number, "Resuming open mint block");
            let settled = self.settle(&open).await;
            let block = self.reload(open)?;
            return Ok(match settled {
                Err(error) if !error.is_retryable() => {
                    tracing::error!(block = block.number, error = %error, "Open mint block cannot be settled, schedule halted");
                    TickOutcome::Stuck { block, error }
                }
                settled => TickOutcome::Resumed {
                    block,
                    report: settled.ok().flatten(),
                },
            });
        }

        if let Some(last) = self.store.last_block()? {
            let remaining = self.remaining_after(&last)?;
            if !remaining.is_zero() {
                return Ok(TickOutcome::Idle { remaining });
            }
        }

        let (block, report) = self.mint(self.settings.block_reward).await?;
        Ok(TickOutcome::Created { block, report })
    }

    async fn mint(&self, total_reward: Amount) -> Result<(MintBlock, Option<DistributionReport>)> {
        let number = self
            .store
            .last_block()
            .map_err(|e| TallyError::BlockCreation {
                number: 0,
                reason: e.to_string(),
            })?
            .map(|b| b.number + 1)
            .unwrap_or(1);

        let block = self
            .store
            .insert_block(MintBlock::new(number, total_reward, self.clock.now()))
            .map_err(|e| TallyError::BlockCreation {
                number,
                reason: e.to_string(),
            })?;
        tracing::info!(block = number, reward = %total_reward, "Created mint block");

        let report = self.settle(&block).await.ok().flatten();
        let block = self.reload(block)?;
        Ok((block, report))
    }

    /// Snapshot then distribute, strictly in that order
    ///
    /// `Ok(None)` when another run already distributed the block.
    async fn settle(&self, block: &MintBlock) -> Result<Option<DistributionReport>> {
        match self.snapshotter.snapshot(block.id).await {
            Ok(_) => {}
            Err(TallyError::AlreadyDistributed(_)) => {
                tracing::debug!(block = block.number, "Block distributed by another run");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(block = block.number, error = %e, "Weight snapshot failed, block left open");
                return Err(e);
            }
        }

        match self.distributor.distribute(block.id).await {
            Ok(report) => Ok(Some(report)),
            Err(TallyError::AlreadyDistributed(_)) => {
                tracing::debug!(block = block.number, "Block distributed by another run");
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(block = block.number, error = %e, "Distribution failed, block left open");
                Err(e)
            }
        }
    }

    fn reload(&self, block: MintBlock) -> Result<MintBlock> {
        Ok(self.store.block(block.id)?.unwrap_or(block))
    }

    fn remaining_after(&self, last: &MintBlock) -> Result<Duration> {
        let interval = chrono::Duration::from_std(self.settings.interval)
            .map_err(|e| TallyError::Config(format!("block interval out of range: {e}")))?;
        let due = last.created_at + interval;
        Ok((due - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
    }
}
