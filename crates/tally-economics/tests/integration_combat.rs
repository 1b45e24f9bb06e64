//! Integration tests for combat power aggregation
//!
//! Incremental propagation over the referral forest is checked against
//! full recomputation, including corrupt forests with cycles and chains
//! deeper than the hop limit.

use async_trait::async_trait;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tally_core::{
    ParticipantId, PowerState, ReferralForest, Result, SystemClock, TallyError,
};
use tally_economics::{CombatPowerAggregator, WalkStop};
use tally_storage::{MemoryRegistry, MemoryStore, RewardStore};
use tokio_util::sync::CancellationToken;

fn aggregator(registry: &Arc<MemoryRegistry>, store: &Arc<MemoryStore>) -> CombatPowerAggregator {
    CombatPowerAggregator::new(
        store.clone(),
        registry.clone(),
        registry.clone(),
        registry.clone(),
        Arc::new(SystemClock),
    )
}

/// Build a forest where participant `i` is invited by `parents[i]` (an earlier index)
fn build_forest(parents: &[Option<usize>]) -> (Arc<MemoryRegistry>, Vec<ParticipantId>) {
    let registry = Arc::new(MemoryRegistry::new());
    let mut ids = Vec::with_capacity(parents.len());
    for parent in parents {
        let id = ParticipantId::generate();
        registry.register(id, parent.map(|p| ids[p]));
        ids.push(id);
    }
    (registry, ids)
}

mod consistency_tests {
    use super::*;

    async fn assert_consistent(
        aggregator: &CombatPowerAggregator,
        store: &MemoryStore,
        ids: &[ParticipantId],
    ) {
        for &id in ids {
            let incremental = store.combat_record(id).unwrap().unwrap();
            let stats = aggregator.recalculate_team_stats(id).await.unwrap();
            assert_eq!(incremental.team_power, stats.team_power);
            assert_eq!(incremental.team_members, stats.team_members);
            assert_eq!(incremental.direct_referrals, stats.direct_referrals);
        }
    }

    #[tokio::test]
    async fn test_joins_and_refreshes_converge() {
        // 0 ─┬─ 1 ─┬─ 3
        //    │     └─ 4 ── 6
        //    └─ 2 ── 5
        let parents = [None, Some(0), Some(0), Some(1), Some(1), Some(2), Some(4)];
        let (registry, ids) = build_forest(&parents);
        let store = Arc::new(MemoryStore::new());
        let aggregator = aggregator(&registry, &store);

        for (i, &id) in ids.iter().enumerate() {
            registry.set_holdings(id, (i as u128 + 1) * 10);
            aggregator.on_participant_joined(id).await.unwrap();
        }

        let root = store.combat_record(ids[0]).unwrap().unwrap();
        assert_eq!(root.team_power, 20 + 30 + 40 + 50 + 60 + 70);
        assert_eq!(root.team_members, 6);
        assert_eq!(root.direct_referrals, 2);

        // weights change, then settle
        registry.set_lp(ids[6], 500);
        registry.set_holdings(ids[3], 0);
        registry.set_multiplier(ids[5], Some(2.0));
        for id in [ids[6], ids[3], ids[5]] {
            aggregator.refresh(id).await.unwrap();
        }

        assert_consistent(&aggregator, &store, &ids).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refreshes_converge() {
        let parents: Vec<Option<usize>> = (0..40)
            .map(|i| if i == 0 { None } else { Some((i - 1) / 3) })
            .collect();
        let (registry, ids) = build_forest(&parents);
        let store = Arc::new(MemoryStore::new());
        let aggregator = Arc::new(aggregator(&registry, &store));

        for &id in &ids {
            aggregator.on_participant_joined(id).await.unwrap();
        }
        for (i, &id) in ids.iter().enumerate() {
            registry.set_burn(id, i as u128 * 7 + 1);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let aggregator = aggregator.clone();
                tokio::spawn(async move { aggregator.refresh(id).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_consistent(&aggregator, &store, &ids).await;
        let expected: u128 = (0..40u128).map(|i| i * 7 + 1).sum();
        assert_eq!(aggregator.network_power().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_lost_propagation() {
        let (registry, ids) = build_forest(&[None, Some(0), Some(1)]);
        let store = Arc::new(MemoryStore::new());
        let aggregator = aggregator(&registry, &store);
        for &id in &ids {
            aggregator.on_participant_joined(id).await.unwrap();
        }

        // personal power changed without propagating, as if a follow-up job was lost
        registry.set_holdings(ids[2], 1_000);
        aggregator.recalculate_personal(ids[2]).await.unwrap();
        assert_eq!(store.combat_record(ids[0]).unwrap().unwrap().team_power, 0);

        let report = aggregator.reconcile(&ids, &CancellationToken::new()).await;
        assert_eq!(report.processed, 3);
        assert_eq!(report.corrected, 2);
        assert_eq!(report.drift, 2_000);
        assert_eq!(store.combat_record(ids[0]).unwrap().unwrap().team_power, 1_000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_team_power_matches_recount(
            shape in prop::collection::vec((any::<prop::sample::Index>(), 0u128..1_000_000), 1..30)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let parents: Vec<Option<usize>> = shape
                    .iter()
                    .enumerate()
                    .map(|(i, (parent, _))| if i == 0 { None } else { Some(parent.index(i)) })
                    .collect();
                let (registry, ids) = build_forest(&parents);
                let store = Arc::new(MemoryStore::new());
                let aggregator = aggregator(&registry, &store);

                for (&id, (_, holdings)) in ids.iter().zip(&shape) {
                    registry.set_holdings(id, *holdings);
                    aggregator.on_participant_joined(id).await.unwrap();
                }

                for &id in &ids {
                    let record = store.combat_record(id).unwrap().unwrap();
                    let stats = aggregator.recalculate_team_stats(id).await.unwrap();
                    assert_eq!(record.team_power, stats.team_power);
                    assert_eq!(record.team_members, stats.team_members);
                }
            });
        }
    }
}

mod guard_tests {
    use super::*;

    #[tokio::test]
    async fn test_cycle_is_bounded_noop() {
        let (registry, ids) = build_forest(&[None, Some(0), Some(1)]);
        // corrupt the forest: the root now has an inviter below it
        registry.register(ids[0], Some(ids[2]));
        let store = Arc::new(MemoryStore::new());
        let aggregator = aggregator(&registry, &store);

        let report = aggregator.propagate_to_ancestors(ids[2], 5).await.unwrap();
        assert_eq!(report.stop, WalkStop::Cycle);
        assert_eq!(report.updated, 2);
        // the starting participant never receives its own delta
        assert!(store.combat_record(ids[2]).unwrap().is_none());

        let stats = aggregator.recalculate_team_stats(ids[0]).await.unwrap();
        assert_eq!(stats.team_members, 2);
    }

    #[tokio::test]
    async fn test_depth_guard_stops_propagation() {
        let parents: Vec<Option<usize>> = (0..50)
            .map(|i| if i == 0 { None } else { Some(i - 1) })
            .collect();
        let (registry, ids) = build_forest(&parents);
        let store = Arc::new(MemoryStore::new());
        let aggregator = aggregator(&registry, &store).with_max_depth(10);

        let report = aggregator.propagate_to_ancestors(ids[49], 3).await.unwrap();
        assert_eq!(report.stop, WalkStop::DepthLimit);
        assert_eq!(report.updated, 10);
        assert_eq!(store.combat_record(ids[39]).unwrap().unwrap().team_power, 3);
        assert!(store.combat_record(ids[38]).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deep_chain_without_recursion() {
        let parents: Vec<Option<usize>> = (0..5_000)
            .map(|i| if i == 0 { None } else { Some(i - 1) })
            .collect();
        let (registry, ids) = build_forest(&parents);
        let store = Arc::new(MemoryStore::new());
        let aggregator = aggregator(&registry, &store);

        let report = aggregator.propagate_to_ancestors(ids[4_999], 1).await.unwrap();
        assert_eq!(report.stop, WalkStop::Root);
        assert_eq!(report.updated, 4_999);
        assert_eq!(aggregator.tree_depth(ids[0]).await.unwrap(), 4_999);
    }
}

/// Forest whose `inviter` lookup fails once for one participant
struct FlakyForest {
    inner: Arc<MemoryRegistry>,
    failing: ParticipantId,
    armed: AtomicBool,
}

#[async_trait]
impl ReferralForest for FlakyForest {
    async fn inviter(&self, participant: ParticipantId) -> Result<Option<ParticipantId>> {
        if participant == self.failing && self.armed.swap(false, Ordering::SeqCst) {
            return Err(TallyError::Source("transient".into()));
        }
        self.inner.inviter(participant).await
    }

    async fn direct_referrals(&self, participant: ParticipantId) -> Result<Vec<ParticipantId>> {
        self.inner.direct_referrals(participant).await
    }

    async fn participants(&self) -> Result<Vec<ParticipantId>> {
        self.inner.participants().await
    }
}

mod retry_tests {
    use super::*;

    /// root <- mid <- leaf, with the lookup of mid's inviter failing once when armed
    fn flaky_chain() -> (
        Arc<MemoryRegistry>,
        Arc<FlakyForest>,
        Arc<MemoryStore>,
        CombatPowerAggregator,
        Vec<ParticipantId>,
    ) {
        let (registry, ids) = build_forest(&[None, Some(0), Some(1)]);
        let forest = Arc::new(FlakyForest {
            inner: registry.clone(),
            failing: ids[1],
            armed: AtomicBool::new(false),
        });
        let store = Arc::new(MemoryStore::new());
        let aggregator = CombatPowerAggregator::new(
            store.clone(),
            registry.clone(),
            registry.clone(),
            forest.clone(),
            Arc::new(SystemClock),
        );
        (registry, forest, store, aggregator, ids)
    }

    #[tokio::test]
    async fn test_refresh_retry_after_lookup_failure() {
        let (registry, forest, store, aggregator, ids) = flaky_chain();
        for &id in &ids {
            aggregator.on_participant_joined(id).await.unwrap();
        }

        registry.set_holdings(ids[2], 70);
        forest.armed.store(true, Ordering::SeqCst);
        let err = aggregator.refresh(ids[2]).await.unwrap_err();
        assert!(err.is_retryable());

        let leaf = store.combat_record(ids[2]).unwrap().unwrap();
        assert_eq!(leaf.state, PowerState::Stale);
        assert_eq!(leaf.personal_power, 0);
        assert_eq!(store.combat_record(ids[1]).unwrap().unwrap().team_power, 0);

        let change = aggregator.refresh(ids[2]).await.unwrap();
        assert_eq!(change.delta, 70);
        assert_eq!(change.propagation.updated, 2);
        assert_eq!(store.combat_record(ids[1]).unwrap().unwrap().team_power, 70);
        assert_eq!(store.combat_record(ids[0]).unwrap().unwrap().team_power, 70);
        assert_eq!(aggregator.recalculate_team_stats(ids[0]).await.unwrap().team_power, 70);
    }

    #[tokio::test]
    async fn test_join_retry_counts_once() {
        let (registry, forest, store, aggregator, ids) = flaky_chain();
        aggregator.on_participant_joined(ids[0]).await.unwrap();
        aggregator.on_participant_joined(ids[1]).await.unwrap();

        registry.set_holdings(ids[2], 5);
        forest.armed.store(true, Ordering::SeqCst);
        assert!(aggregator.on_participant_joined(ids[2]).await.is_err());
        aggregator.on_participant_joined(ids[2]).await.unwrap();
        // a duplicate join event settles power only
        aggregator.on_participant_joined(ids[2]).await.unwrap();

        let mid = store.combat_record(ids[1]).unwrap().unwrap();
        assert_eq!(
            (mid.team_members, mid.direct_referrals, mid.team_power),
            (1, 1, 5)
        );
        let root = store.combat_record(ids[0]).unwrap().unwrap();
        assert_eq!(
            (root.team_members, root.direct_referrals, root.team_power),
            (2, 1, 5)
        );
        assert!(store.combat_record(ids[2]).unwrap().unwrap().joined_at.is_some());

        let stats = aggregator.recalculate_team_stats(ids[0]).await.unwrap();
        assert_eq!(stats.team_members, root.team_members);
        assert_eq!(stats.team_power, root.team_power);
    }
}
