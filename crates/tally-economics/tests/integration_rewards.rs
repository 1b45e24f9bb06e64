//! Integration tests for the Tally reward pipeline
//!
//! These tests drive mint blocks through snapshot, distribution and claims
//! against the in-memory store, ledger and registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tally_core::{
    Amount, BalanceLedger, BlockId, CombatPowerRecord, EntryId, InconsistencyRecord, MintBlock,
    ParticipantId, PowerHistoryPoint, PowerState, Result, RewardEntry, SystemClock, TallyError,
    TeamDelta, TeamStats, WeightSnapshot,
};
use tally_economics::{allocate, ClaimLedger, RewardDistributor, WeightSnapshotter};
use tally_storage::{
    ClaimTransition, EntryLock, MemoryLedger, MemoryRegistry, MemoryStore, RewardStore,
};

struct Harness {
    registry: Arc<MemoryRegistry>,
    store: Arc<MemoryStore>,
    ledger: Arc<MemoryLedger>,
    snapshotter: WeightSnapshotter,
    distributor: Arc<RewardDistributor>,
    claims: Arc<ClaimLedger>,
}

impl Harness {
    async fn new() -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MemoryLedger::with_assets(&["CAN"]));
        let clock = Arc::new(SystemClock);
        let snapshotter =
            WeightSnapshotter::new(registry.clone(), registry.clone(), store.clone(), clock.clone());
        let distributor = Arc::new(RewardDistributor::new(store.clone(), clock.clone()));
        let claims = Arc::new(
            ClaimLedger::connect(store.clone(), ledger.clone(), clock, "CAN")
                .await
                .unwrap(),
        );
        Self {
            registry,
            store,
            ledger,
            snapshotter,
            distributor,
            claims,
        }
    }

    fn participant(&self, holdings: Amount) -> ParticipantId {
        let id = ParticipantId::generate();
        self.registry.register(id, None);
        self.registry.set_holdings(id, holdings);
        id
    }

    async fn snapshotted_block(&self, number: u64, total: Amount) -> MintBlock {
        let block = self
            .store
            .insert_block(MintBlock::new(number, total, Utc::now()))
            .unwrap();
        self.snapshotter.snapshot(block.id).await.unwrap();
        block
    }

    fn entry_of(&self, block: BlockId, participant: ParticipantId) -> RewardEntry {
        self.store
            .entries_for_block(block)
            .unwrap()
            .into_iter()
            .find(|e| e.participant == participant)
            .unwrap()
    }
}

mod distribution_tests {
    use super::*;

    #[tokio::test]
    async fn test_proportional_scenario() {
        let h = Harness::new().await;
        let a = h.participant(100);
        let b = h.participant(200);
        let c = h.participant(300);
        let block = h.snapshotted_block(1, 600).await;

        let report = h.distributor.distribute(block.id).await.unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.distributed, 600);
        assert_eq!(report.residue, 0);

        assert_eq!(h.entry_of(block.id, a).amount, 100);
        assert_eq!(h.entry_of(block.id, b).amount, 200);
        assert_eq!(h.entry_of(block.id, c).amount, 300);
        assert!(h.store.block(block.id).unwrap().unwrap().distributed);

        assert_eq!(
            h.distributor.distribute(block.id).await.unwrap_err(),
            TallyError::AlreadyDistributed(block.id)
        );
        assert_eq!(h.store.entries_for_block(block.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_lp_and_burn_count_towards_weight() {
        let h = Harness::new().await;
        let a = h.participant(100);
        let b = h.participant(0);
        h.store.store_personal(b, 0, 60, 40, Utc::now()).unwrap();
        let block = h.snapshotted_block(1, 1_000).await;

        h.distributor.distribute(block.id).await.unwrap();
        assert_eq!(h.entry_of(block.id, a).amount, 500);
        assert_eq!(h.entry_of(block.id, b).amount, 500);
    }

    #[tokio::test]
    async fn test_zero_total_weight_forfeits_pool() {
        let h = Harness::new().await;
        h.participant(0);
        h.participant(0);
        let block = h.snapshotted_block(1, 1_000).await;

        let report = h.distributor.distribute(block.id).await.unwrap();
        assert_eq!(report.entries, 0);
        assert_eq!(report.residue, 1_000);
        assert!(h.store.entries_for_block(block.id).unwrap().is_empty());
        assert!(h.store.block(block.id).unwrap().unwrap().distributed);
    }

    #[tokio::test]
    async fn test_zero_weight_participant_claims_zero() {
        let h = Harness::new().await;
        h.participant(10);
        let idle = h.participant(0);
        let block = h.snapshotted_block(1, 1_000).await;
        h.distributor.distribute(block.id).await.unwrap();

        let entry = h.entry_of(block.id, idle);
        assert_eq!(entry.amount, 0);

        let receipt = h.claims.claim(idle, &[entry.id]).await;
        assert_eq!(receipt.claimed_amount, 0);
        assert_eq!(receipt.claimed, vec![entry.id]);
        assert_eq!(h.ledger.balance(idle, "CAN").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_partial_failure_excludes_participant() {
        let h = Harness::new().await;
        let a = h.participant(50);
        let broken = h.participant(50);
        h.registry.set_unavailable(broken, true);
        let block = h.snapshotted_block(1, 900).await;

        h.distributor.distribute(block.id).await.unwrap();
        let entries = h.store.entries_for_block(block.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(h.entry_of(block.id, a).amount, 900);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distribution_runs_once() {
        let h = Harness::new().await;
        for weight in 1..=20 {
            h.participant(weight);
        }
        let block = h.snapshotted_block(1, 10_000).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let distributor = h.distributor.clone();
                tokio::spawn(async move { distributor.distribute(block.id).await })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(e) => assert_eq!(e, TallyError::AlreadyDistributed(block.id)),
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(h.store.entries_for_block(block.id).unwrap().len(), 20);
    }
}

mod claim_tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_claim_is_idempotent() {
        let h = Harness::new().await;
        let p = h.participant(1);
        let block = h.snapshotted_block(1, 77).await;
        h.distributor.distribute(block.id).await.unwrap();
        let entry = h.entry_of(block.id, p);

        assert_eq!(h.claims.claim(p, &[entry.id]).await.claimed_amount, 77);
        let second = h.claims.claim(p, &[entry.id]).await;
        assert_eq!(second.claimed_amount, 0);
        assert_eq!(second.skipped, vec![(entry.id, TallyError::AlreadyClaimed(entry.id))]);
        assert_eq!(h.ledger.balance(p, "CAN").await.unwrap(), 77);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_on_same_entry() {
        let h = Harness::new().await;
        let p = h.participant(1);
        let block = h.snapshotted_block(1, 500).await;
        h.distributor.distribute(block.id).await.unwrap();
        let entry = h.entry_of(block.id, p);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let claims = h.claims.clone();
                tokio::spawn(async move { claims.claim_one(p, entry.id).await })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(amount) => {
                    assert_eq!(amount, 500);
                    wins += 1;
                }
                Err(e) => assert_eq!(e, TallyError::AlreadyClaimed(entry.id)),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(h.ledger.balance(p, "CAN").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_claim_all_across_blocks() {
        let h = Harness::new().await;
        let p = h.participant(1);
        let other = h.participant(1);
        for number in 1..=3 {
            let block = h.snapshotted_block(number, 100).await;
            h.distributor.distribute(block.id).await.unwrap();
        }

        let receipt = h.claims.claim_all(p).await.unwrap();
        assert_eq!(receipt.claimed_amount, 150);
        assert_eq!(receipt.claimed.len(), 3);
        assert_eq!(h.claims.summary(other).unwrap().pending, 150);
    }
}

/// Store that delegates to `MemoryStore` but can refuse claim commits
struct CommitFailingStore {
    inner: MemoryStore,
    fail_commit: AtomicBool,
}

impl RewardStore for CommitFailingStore {
    fn insert_block(&self, block: MintBlock) -> Result<MintBlock> {
        self.inner.insert_block(block)
    }
    fn block(&self, id: BlockId) -> Result<Option<MintBlock>> {
        self.inner.block(id)
    }
    fn last_block(&self) -> Result<Option<MintBlock>> {
        self.inner.last_block()
    }
    fn open_block(&self) -> Result<Option<MintBlock>> {
        self.inner.open_block()
    }
    fn mark_distributed(&self, id: BlockId, at: DateTime<Utc>) -> Result<bool> {
        self.inner.mark_distributed(id, at)
    }
    fn insert_snapshot(&self, snapshot: WeightSnapshot) -> Result<()> {
        self.inner.insert_snapshot(snapshot)
    }
    fn snapshots_for_block(&self, block: BlockId) -> Result<Vec<WeightSnapshot>> {
        self.inner.snapshots_for_block(block)
    }
    fn insert_block_entries(&self, block: BlockId, entries: Vec<RewardEntry>) -> Result<bool> {
        self.inner.insert_block_entries(block, entries)
    }
    fn entries_for_block(&self, block: BlockId) -> Result<Vec<RewardEntry>> {
        self.inner.entries_for_block(block)
    }
    fn entry(&self, id: EntryId) -> Result<Option<RewardEntry>> {
        self.inner.entry(id)
    }
    fn entries_for_participant(&self, participant: ParticipantId) -> Result<Vec<RewardEntry>> {
        self.inner.entries_for_participant(participant)
    }
    fn unclaimed_entries(&self, participant: ParticipantId) -> Result<Vec<RewardEntry>> {
        self.inner.unclaimed_entries(participant)
    }
    fn mark_claimed(
        &self,
        id: EntryId,
        participant: ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<ClaimTransition> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(TallyError::Storage("connection reset".into()));
        }
        self.inner.mark_claimed(id, participant, at)
    }
    fn entry_lock(&self, id: EntryId) -> EntryLock {
        self.inner.entry_lock(id)
    }
    fn record_inconsistency(&self, record: InconsistencyRecord) -> Result<()> {
        self.inner.record_inconsistency(record)
    }
    fn inconsistencies(&self) -> Result<Vec<InconsistencyRecord>> {
        self.inner.inconsistencies()
    }
    fn has_inconsistency(&self, id: EntryId) -> Result<bool> {
        self.inner.has_inconsistency(id)
    }
    fn combat_record(&self, participant: ParticipantId) -> Result<Option<CombatPowerRecord>> {
        self.inner.combat_record(participant)
    }
    fn ensure_combat_record(
        &self,
        participant: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<CombatPowerRecord> {
        self.inner.ensure_combat_record(participant, now)
    }
    fn set_power_state(
        &self,
        participant: ParticipantId,
        state: PowerState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.set_power_state(participant, state, now)
    }
    fn store_personal(
        &self,
        participant: ParticipantId,
        personal_power: Amount,
        lp_weight: Amount,
        burn_weight: Amount,
        now: DateTime<Utc>,
    ) -> Result<Amount> {
        self.inner
            .store_personal(participant, personal_power, lp_weight, burn_weight, now)
    }
    fn mark_joined(&self, participant: ParticipantId, at: DateTime<Utc>) -> Result<bool> {
        self.inner.mark_joined(participant, at)
    }
    fn apply_team_delta(
        &self,
        participant: ParticipantId,
        delta: TeamDelta,
        now: DateTime<Utc>,
    ) -> Result<CombatPowerRecord> {
        self.inner.apply_team_delta(participant, delta, now)
    }
    fn store_team_stats(
        &self,
        participant: ParticipantId,
        stats: TeamStats,
        now: DateTime<Utc>,
    ) -> Result<CombatPowerRecord> {
        self.inner.store_team_stats(participant, stats, now)
    }
    fn combat_records(&self) -> Result<Vec<CombatPowerRecord>> {
        self.inner.combat_records()
    }
    fn append_history(&self, point: PowerHistoryPoint) -> Result<()> {
        self.inner.append_history(point)
    }
    fn history(
        &self,
        participant: ParticipantId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PowerHistoryPoint>> {
        self.inner.history(participant, since)
    }
}

/// Ledger whose credits or debits can be switched off
struct FlakyLedger {
    inner: MemoryLedger,
    credit_offline: AtomicBool,
    debit_offline: AtomicBool,
}

impl FlakyLedger {
    fn new() -> Self {
        Self {
            inner: MemoryLedger::with_assets(&["CAN"]),
            credit_offline: AtomicBool::new(false),
            debit_offline: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BalanceLedger for FlakyLedger {
    async fn resolve_asset(&self, symbol: &str) -> Result<tally_core::AssetId> {
        self.inner.resolve_asset(symbol).await
    }
    async fn credit(&self, participant: ParticipantId, asset: tally_core::AssetId, amount: Amount) -> Result<()> {
        if self.credit_offline.load(Ordering::SeqCst) {
            return Err(TallyError::Ledger("ledger offline".into()));
        }
        self.inner.credit(participant, asset, amount).await
    }
    async fn debit(&self, participant: ParticipantId, asset: tally_core::AssetId, amount: Amount) -> Result<()> {
        if self.debit_offline.load(Ordering::SeqCst) {
            return Err(TallyError::Ledger("ledger offline".into()));
        }
        self.inner.debit(participant, asset, amount).await
    }
    async fn balance(&self, participant: ParticipantId, symbol: &str) -> Result<Amount> {
        self.inner.balance(participant, symbol).await
    }
}

mod inconsistency_tests {
    use super::*;

    async fn setup() -> (Arc<CommitFailingStore>, Arc<FlakyLedger>, ClaimLedger) {
        let store = Arc::new(CommitFailingStore {
            inner: MemoryStore::new(),
            fail_commit: AtomicBool::new(false),
        });
        let ledger = Arc::new(FlakyLedger::new());
        let claims = ClaimLedger::connect(store.clone(), ledger.clone(), Arc::new(SystemClock), "CAN")
            .await
            .unwrap();
        (store, ledger, claims)
    }

    fn seed(store: &CommitFailingStore, participant: ParticipantId, amount: Amount) -> EntryId {
        let block = store
            .insert_block(MintBlock::new(1, amount, Utc::now()))
            .unwrap();
        let entry = RewardEntry::new(participant, &block, amount, 1, Utc::now());
        let entry_id = entry.id;
        store.insert_block_entries(block.id, vec![entry]).unwrap();
        entry_id
    }

    #[tokio::test]
    async fn test_offline_ledger_leaves_entry_claimable() {
        let (store, ledger, claims) = setup().await;
        let p = ParticipantId::generate();
        let entry_id = seed(&store, p, 60);

        ledger.credit_offline.store(true, Ordering::SeqCst);
        let receipt = claims.claim(p, &[entry_id]).await;
        assert_eq!(receipt.claimed_amount, 0);
        assert_eq!(receipt.failed.len(), 1);
        assert!(receipt.failed[0].1.is_retryable());
        assert!(!store.entry(entry_id).unwrap().unwrap().claimed);
        assert!(store.inconsistencies().unwrap().is_empty());

        ledger.credit_offline.store(false, Ordering::SeqCst);
        assert_eq!(claims.claim_one(p, entry_id).await.unwrap(), 60);
        assert_eq!(ledger.balance(p, "CAN").await.unwrap(), 60);
    }

    #[tokio::test]
    async fn test_failed_commit_refunds_credit() {
        let (store, ledger, claims) = setup().await;
        let p = ParticipantId::generate();
        let entry_id = seed(&store, p, 40);

        store.fail_commit.store(true, Ordering::SeqCst);
        let err = claims.claim_one(p, entry_id).await.unwrap_err();
        assert!(matches!(err, TallyError::Storage(_)));
        assert_eq!(ledger.balance(p, "CAN").await.unwrap(), 0);
        assert!(!store.entry(entry_id).unwrap().unwrap().claimed);
        assert!(store.inconsistencies().unwrap().is_empty());

        store.fail_commit.store(false, Ordering::SeqCst);
        assert_eq!(claims.claim_one(p, entry_id).await.unwrap(), 40);
        assert_eq!(ledger.balance(p, "CAN").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_failed_refund_records_inconsistency() {
        let (store, ledger, claims) = setup().await;
        let p = ParticipantId::generate();
        let entry_id = seed(&store, p, 100);

        store.fail_commit.store(true, Ordering::SeqCst);
        ledger.debit_offline.store(true, Ordering::SeqCst);
        let err = claims.claim_one(p, entry_id).await.unwrap_err();
        assert!(matches!(err, TallyError::FatalInconsistency { entry, .. } if entry == entry_id));
        assert!(!err.is_retryable());

        let records = store.inconsistencies().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, 100);
        assert_eq!(ledger.balance(p, "CAN").await.unwrap(), 100);

        // the entry is quarantined: no second credit once the store recovers
        store.fail_commit.store(false, Ordering::SeqCst);
        ledger.debit_offline.store(false, Ordering::SeqCst);
        let receipt = claims.claim(p, &[entry_id]).await;
        assert!(receipt.skipped.is_empty());
        assert!(matches!(receipt.failed[0].1, TallyError::FatalInconsistency { .. }));
        assert_eq!(ledger.balance(p, "CAN").await.unwrap(), 100);
        assert!(!store.entry(entry_id).unwrap().unwrap().claimed);
    }
}

mod allocation_properties {
    use super::*;

    proptest! {
        #[test]
        fn prop_conservation(
            total in 0u128..=1_000_000_000_000_000_000_000u128,
            weights in prop::collection::vec(0u128..=1_000_000_000_000_000_000_000u128, 0..64),
        ) {
            let allocation = allocate(total, &weights).unwrap();
            let sum: Amount = allocation.shares.iter().sum();
            prop_assert_eq!(sum, allocation.distributed);
            prop_assert!(sum <= total);
            prop_assert_eq!(sum + allocation.residue, total);
            if allocation.total_weight > 0 {
                prop_assert!(allocation.residue < weights.len() as Amount);
            }
        }

        #[test]
        fn prop_proportionality(
            total in 1u128..=1_000_000_000_000_000_000_000u128,
            weights in prop::collection::vec(1u128..=1_000_000_000_000u128, 2..32),
        ) {
            let allocation = allocate(total, &weights).unwrap();
            // share_i / w_i and share_j / w_j differ by less than one unit:
            // |s_i * w_j - s_j * w_i| < max(w_i, w_j)
            for i in 1..weights.len() {
                let (si, wi) = (allocation.shares[i], weights[i]);
                let (sj, wj) = (allocation.shares[i - 1], weights[i - 1]);
                prop_assert!((si * wj).abs_diff(sj * wi) < wi.max(wj));
            }
            // heavier weight never receives less
            for i in 0..weights.len() {
                for j in 0..weights.len() {
                    if weights[i] >= weights[j] {
                        prop_assert!(allocation.shares[i] >= allocation.shares[j]);
                    }
                }
            }
        }
    }
}
