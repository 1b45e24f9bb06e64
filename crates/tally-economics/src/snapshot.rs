//! Weight snapshots
//!
//! Captures every participant's weights for one block. Holdings weight comes
//! from the weight source; LP and burn weight come from the participant's
//! combat power record.

use std::sync::Arc;
use tally_core::{
    BlockId, Clock, ParticipantId, ReferralForest, Result, TallyError, WeightSnapshot, WeightSource,
    Weights,
};
use tally_storage::RewardStore;

pub struct WeightSnapshotter {
    forest: Arc<dyn ReferralForest>,
    weights: Arc<dyn WeightSource>,
    store: Arc<dyn RewardStore>,
    clock: Arc<dyn Clock>,
}

impl WeightSnapshotter {
    pub fn new(
        forest: Arc<dyn ReferralForest>,
        weights: Arc<dyn WeightSource>,
        store: Arc<dyn RewardStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            forest,
            weights,
            store,
            clock,
        }
    }

    /// Snapshot all participants for `block_id`, returning how many have a row
    ///
    /// A participant whose weights cannot be read or written is logged and
    /// skipped. Running it again only fills in the missing rows.
    pub async fn snapshot(&self, block_id: BlockId) -> Result<usize> {
        let block = self
            .store
            .block(block_id)?
            .ok_or(TallyError::BlockNotFound(block_id))?;
        if block.distributed {
            return Err(TallyError::AlreadyDistributed(block_id));
        }

        let participants = self.forest.participants().await?;
        let mut captured = 0usize;
        let mut existing = 0usize;
        let mut skipped = 0usize;

        for participant in participants {
            match self.capture(block_id, participant).await {
                Ok(()) => captured += 1,
                Err(TallyError::DuplicateSnapshot { .. }) => existing += 1,
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(
                        block = block.number,
                        %participant,
                        error = %e,
                        "Skipping participant in weight snapshot"
                    );
                }
            }
        }

        tracing::info!(
            block = block.number,
            captured,
            existing,
            skipped,
            "Captured weight snapshot"
        );
        Ok(captured + existing)
    }

    async fn capture(&self, block: BlockId, participant: ParticipantId) -> Result<()> {
        let holdings = self.weights.holdings_weight(participant).await?;
        let (lp, burn) = self
            .store
            .combat_record(participant)?
            .map(|r| (r.lp_weight, r.burn_weight))
            .unwrap_or((0, 0));

        self.store.insert_snapshot(WeightSnapshot {
            participant,
            block,
            weights: Weights::new(holdings, lp, burn),
            captured_at: self.clock.now(),
        })
    }
}
