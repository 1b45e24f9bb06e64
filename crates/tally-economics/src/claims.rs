//! # Claim Ledger
//!
//! Converts unclaimed reward entries into balance credits, at most once per
//! entry.
//!
//! ## Claim sequence
//!
//! A claim is one unit of work under the entry's row lock:
//!
//! 1. Take the row lock, then check existence, ownership and `claimed`.
//! 2. Credit the balance ledger. On failure nothing has been written and the
//!    entry stays claimable.
//! 3. Commit with the conditional flip of `claimed`.
//! 4. If the commit fails, refund the credit with a debit. If the refund
//!    fails too, the entry is credited but unclaimed: an inconsistency record
//!    is written, `FatalInconsistency` returned, and the entry refuses
//!    further claims until reconciled out of band.
//!
//! Concurrent claimants of one entry queue on the lock, so they only ever
//! see it unclaimed or claimed-and-credited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_core::{
    Amount, AssetId, BalanceLedger, Clock, EntryId, InconsistencyRecord, ParticipantId, Result,
    RewardEntry, TallyError,
};
use tally_storage::{ClaimTransition, RewardStore};

/// Result of a batch claim
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClaimReceipt {
    /// Sum credited by this call
    pub claimed_amount: Amount,

    /// Entries claimed by this call
    pub claimed: Vec<EntryId>,

    /// Entries not owned, unknown or already claimed
    pub skipped: Vec<(EntryId, TallyError)>,

    /// Entries whose claim failed and may be retried, or is fatal
    pub failed: Vec<(EntryId, TallyError)>,
}

impl ClaimReceipt {
    /// Every requested entry was either claimed or skipped
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Reward totals of one participant
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSummary {
    pub total_earned: Amount,
    pub claimed: Amount,
    pub pending: Amount,
    pub unclaimed_entries: usize,
    pub last_claimed_at: Option<DateTime<Utc>>,
}

/// One page of a listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Items across all pages
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}

pub struct ClaimLedger {
    store: Arc<dyn RewardStore>,
    ledger: Arc<dyn BalanceLedger>,
    clock: Arc<dyn Clock>,
    symbol: String,
    asset: AssetId,
}

impl ClaimLedger {
    /// Resolve the reward asset once and build the ledger
    pub async fn connect(
        store: Arc<dyn RewardStore>,
        ledger: Arc<dyn BalanceLedger>,
        clock: Arc<dyn Clock>,
        symbol: &str,
    ) -> Result<Self> {
        let asset = ledger.resolve_asset(symbol).await?;
        tracing::debug!(symbol, %asset, "Resolved reward asset");
        Ok(Self {
            store,
            ledger,
            clock,
            symbol: symbol.to_string(),
            asset,
        })
    }

    pub fn asset(&self) -> AssetId {
        self.asset
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Claim a single entry, returning the credited amount
    pub async fn claim_one(&self, participant: ParticipantId, entry_id: EntryId) -> Result<Amount> {
        let row = self.store.entry_lock(entry_id);
        let _row = row.lock().await;

        let entry = self
            .store
            .entry(entry_id)?
            .ok_or(TallyError::EntryNotFound(entry_id))?;
        if entry.participant != participant {
            return Err(TallyError::NotEntryOwner {
                entry: entry_id,
                participant,
            });
        }
        if entry.claimed {
            return Err(TallyError::AlreadyClaimed(entry_id));
        }
        if self.store.has_inconsistency(entry_id)? {
            return Err(TallyError::FatalInconsistency {
                entry: entry_id,
                reason: "entry awaits reconciliation".into(),
            });
        }

        if entry.amount > 0 {
            self.ledger
                .credit(participant, self.asset, entry.amount)
                .await?;
        }

        let commit = match self.store.mark_claimed(entry_id, participant, self.clock.now()) {
            Ok(ClaimTransition::Claimed(_)) => Ok(()),
            Ok(other) => Err(TallyError::Storage(format!(
                "claim commit rejected under row lock: {other:?}"
            ))),
            Err(e) => Err(e),
        };
        if let Err(cause) = commit {
            return Err(self.refund(&entry, cause).await);
        }

        tracing::debug!(%participant, entry = %entry_id, amount = %entry.amount, "Claimed reward entry");
        Ok(entry.amount)
    }

    /// Undo the credit of a claim whose commit failed
    async fn refund(&self, entry: &RewardEntry, cause: TallyError) -> TallyError {
        if entry.amount == 0 {
            return cause;
        }
        let e = match self.ledger.debit(entry.participant, self.asset, entry.amount).await {
            Ok(()) => {
                tracing::warn!(
                    participant = %entry.participant,
                    entry = %entry.id,
                    error = %cause,
                    "Claim commit failed, credit refunded"
                );
                return cause;
            }
            Err(e) => e,
        };

        let reason = format!("claim commit failed ({cause}) and refund failed ({e})");
        let record = InconsistencyRecord {
            entry: entry.id,
            participant: entry.participant,
            amount: entry.amount,
            reason: reason.clone(),
            observed_at: self.clock.now(),
        };
        if let Err(e) = self.store.record_inconsistency(record) {
            tracing::error!(entry = %entry.id, error = %e, "Failed to record claim inconsistency");
        }
        tracing::error!(
            participant = %entry.participant,
            entry = %entry.id,
            amount = %entry.amount,
            %reason,
            "Reward entry credited but not marked claimed"
        );
        TallyError::FatalInconsistency {
            entry: entry.id,
            reason,
        }
    }

    /// Claim a set of entries
    ///
    /// Entries that are unknown, owned by someone else or already claimed are
    /// skipped; `claimed_amount` counts only what this call credited.
    pub async fn claim(&self, participant: ParticipantId, entry_ids: &[EntryId]) -> ClaimReceipt {
        let mut receipt = ClaimReceipt::default();
        for &id in entry_ids {
            match self.claim_one(participant, id).await {
                Ok(amount) => {
                    receipt.claimed_amount = receipt.claimed_amount.saturating_add(amount);
                    receipt.claimed.push(id);
                }
                Err(e) if e.is_claim_skip() => receipt.skipped.push((id, e)),
                Err(e) => receipt.failed.push((id, e)),
            }
        }

        tracing::info!(
            %participant,
            claimed = receipt.claimed.len(),
            skipped = receipt.skipped.len(),
            failed = receipt.failed.len(),
            amount = %receipt.claimed_amount,
            "Processed reward claim"
        );
        receipt
    }

    /// Claim every currently unclaimed entry of `participant`
    pub async fn claim_all(&self, participant: ParticipantId) -> Result<ClaimReceipt> {
        let ids: Vec<EntryId> = self
            .store
            .unclaimed_entries(participant)?
            .iter()
            .map(|e| e.id)
            .collect();
        Ok(self.claim(participant, &ids).await)
    }

    pub fn unclaimed(&self, participant: ParticipantId) -> Result<Vec<RewardEntry>> {
        self.store.unclaimed_entries(participant)
    }

    pub fn summary(&self, participant: ParticipantId) -> Result<RewardSummary> {
        let entries = self.store.entries_for_participant(participant)?;
        let mut summary = RewardSummary::default();
        for entry in &entries {
            summary.total_earned = summary.total_earned.saturating_add(entry.amount);
            if entry.claimed {
                summary.claimed = summary.claimed.saturating_add(entry.amount);
                summary.last_claimed_at = summary.last_claimed_at.max(entry.claimed_at);
            } else {
                summary.pending = summary.pending.saturating_add(entry.amount);
                summary.unclaimed_entries += 1;
            }
        }
        Ok(summary)
    }

    /// Entries of `participant`, newest block first
    pub fn history(
        &self,
        participant: ParticipantId,
        limit: usize,
        offset: usize,
    ) -> Result<Page<RewardEntry>> {
        let mut entries = self.store.entries_for_participant(participant)?;
        entries.sort_by(|a, b| b.block_number.cmp(&a.block_number));
        let total = entries.len();
        let items = entries.into_iter().skip(offset).take(limit).collect();
        Ok(Page {
            items,
            total,
            limit,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{MintBlock, SystemClock};
    use tally_storage::{MemoryLedger, MemoryStore};

    async fn setup() -> (Arc<MemoryStore>, Arc<MemoryLedger>, ClaimLedger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MemoryLedger::with_assets(&["CAN"]));
        let claims = ClaimLedger::connect(store.clone(), ledger.clone(), Arc::new(SystemClock), "CAN")
            .await
            .unwrap();
        (store, ledger, claims)
    }

    fn seed(store: &MemoryStore, participant: ParticipantId, amounts: &[Amount]) -> Vec<EntryId> {
        let mut ids = Vec::new();
        for amount in amounts {
            let number = store.last_block().unwrap().map(|b| b.number + 1).unwrap_or(1);
            let block = store
                .insert_block(MintBlock::new(number, 1_000, Utc::now()))
                .unwrap();
            let entry = RewardEntry::new(participant, &block, *amount, *amount, Utc::now());
            ids.push(entry.id);
            store.insert_block_entries(block.id, vec![entry]).unwrap();
        }
        ids
    }

    #[tokio::test]
    async fn test_unknown_asset_fails_connect() {
        let result = ClaimLedger::connect(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::with_assets(&["LAN"])),
            Arc::new(SystemClock),
            "CAN",
        )
        .await;
        assert!(matches!(result, Err(TallyError::AssetNotFound(_))));
    }

    #[tokio::test]
    async fn test_claim_one_typed_errors() {
        let (store, ledger, claims) = setup().await;
        let owner = ParticipantId::generate();
        let ids = seed(&store, owner, &[50]);

        let stranger = ParticipantId::generate();
        assert!(matches!(
            claims.claim_one(stranger, ids[0]).await,
            Err(TallyError::NotEntryOwner { .. })
        ));
        assert_eq!(claims.claim_one(owner, ids[0]).await.unwrap(), 50);
        assert_eq!(
            claims.claim_one(owner, ids[0]).await.unwrap_err(),
            TallyError::AlreadyClaimed(ids[0])
        );
        let missing = EntryId::generate();
        assert_eq!(
            claims.claim_one(owner, missing).await.unwrap_err(),
            TallyError::EntryNotFound(missing)
        );
        assert_eq!(ledger.balance_of(owner, claims.asset()), 50);
    }

    #[tokio::test]
    async fn test_claim_skips_foreign_entries() {
        let (store, ledger, claims) = setup().await;
        let alice = ParticipantId::generate();
        let bob = ParticipantId::generate();
        let mut ids = seed(&store, alice, &[10, 20]);
        ids.extend(seed(&store, bob, &[99]));

        let receipt = claims.claim(alice, &ids).await;
        assert_eq!(receipt.claimed_amount, 30);
        assert_eq!(receipt.claimed.len(), 2);
        assert_eq!(receipt.skipped.len(), 1);
        assert!(receipt.is_complete());
        assert_eq!(ledger.balance_of(bob, claims.asset()), 0);
    }

    #[tokio::test]
    async fn test_claim_all_then_nothing_left() {
        let (store, ledger, claims) = setup().await;
        let p = ParticipantId::generate();
        seed(&store, p, &[1, 2, 3]);

        assert_eq!(claims.claim_all(p).await.unwrap().claimed_amount, 6);
        let again = claims.claim_all(p).await.unwrap();
        assert_eq!(again.claimed_amount, 0);
        assert!(again.claimed.is_empty());
        assert_eq!(ledger.balance(p, "CAN").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_claim_waits_for_row_lock() {
        let (store, ledger, claims) = setup().await;
        let claims = Arc::new(claims);
        let p = ParticipantId::generate();
        let ids = seed(&store, p, &[25]);

        let row = store.entry_lock(ids[0]);
        let held = row.lock().await;
        let handle = tokio::spawn({
            let claims = claims.clone();
            let id = ids[0];
            async move { claims.claim_one(p, id).await }
        });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        assert_eq!(ledger.balance_of(p, claims.asset()), 0);

        drop(held);
        assert_eq!(handle.await.unwrap().unwrap(), 25);
        assert!(store.entry(ids[0]).unwrap().unwrap().claimed);
    }

    #[tokio::test]
    async fn test_credit_failure_leaves_entry_unclaimed() {
        let (store, ledger, claims) = setup().await;
        let p = ParticipantId::generate();
        let ids = seed(&store, p, &[40]);

        ledger.freeze(p);
        let err = claims.claim_one(p, ids[0]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!store.entry(ids[0]).unwrap().unwrap().claimed);
        assert!(store.inconsistencies().unwrap().is_empty());

        ledger.unfreeze(p);
        assert_eq!(claims.claim_one(p, ids[0]).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_summary_and_history() {
        let (store, _, claims) = setup().await;
        let p = ParticipantId::generate();
        let ids = seed(&store, p, &[5, 7, 11]);
        claims.claim_one(p, ids[0]).await.unwrap();

        let summary = claims.summary(p).unwrap();
        assert_eq!(summary.total_earned, 23);
        assert_eq!(summary.claimed, 5);
        assert_eq!(summary.pending, 18);
        assert_eq!(summary.unclaimed_entries, 2);
        assert!(summary.last_claimed_at.is_some());

        let page = claims.history(p, 2, 0).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items[0].amount, 11);
        assert!(page.has_more());
        let rest = claims.history(p, 2, 2).unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(!rest.has_more());
        assert_eq!(claims.unclaimed(p).unwrap().len(), 2);
    }
}
