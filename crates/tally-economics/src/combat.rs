//! # Combat Power Aggregation
//!
//! Personal power is `(holdings + lp + burn) x multiplier`. Team power is the
//! sum of personal power over a participant's whole downline and is kept
//! current incrementally: every personal change is propagated as a signed
//! delta to each ancestor. Deltas are additive, so concurrent propagations
//! converge regardless of interleaving.
//!
//! `recalculate_team_stats` recomputes the team fields from scratch and is
//! what periodic reconciliation uses to correct drift.
//!
//! ## State machine
//!
//! ```text
//!   Current ──weights changed──► Stale ──► Recalculating ──► Current
//! ```

use crate::forest::{collect_downline, walk_ancestors, Ancestry, WalkStop};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tally_core::math::{apply_multiplier, multiplier_to_ppm, power_delta, MULTIPLIER_SCALE};
use tally_core::{
    Amount, Clock, CombatPowerRecord, MultiplierSource, ParticipantId, PowerHistoryPoint,
    PowerState, ReferralForest, Result, TeamDelta, TeamStats, WeightSource,
    DEFAULT_MAX_ANCESTOR_DEPTH,
};
use tally_storage::RewardStore;
use tokio_util::sync::CancellationToken;

/// Outcome of walking the ancestors of one participant
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Ancestors updated
    pub updated: usize,
    /// Ancestors whose write failed
    pub skipped: usize,
    pub stop: WalkStop,
}

/// A personal power recalculation and its propagation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowerChange {
    pub participant: ParticipantId,
    pub previous: Amount,
    pub current: Amount,
    pub delta: i128,
    pub propagation: PropagationReport,
}

/// Progress of a reconciliation pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Participants recomputed
    pub processed: usize,
    /// Participants whose stored team fields differed
    pub corrected: usize,
    pub failed: usize,
    /// Absolute team power drift corrected
    pub drift: Amount,
    /// Index of the first participant not processed when cancelled
    pub resume_at: Option<usize>,
}

impl ReconcileReport {
    pub fn cancelled(&self) -> bool {
        self.resume_at.is_some()
    }
}

pub struct CombatPowerAggregator {
    store: Arc<dyn RewardStore>,
    weights: Arc<dyn WeightSource>,
    multipliers: Arc<dyn MultiplierSource>,
    forest: Arc<dyn ReferralForest>,
    clock: Arc<dyn Clock>,
    max_depth: usize,
}

impl CombatPowerAggregator {
    pub fn new(
        store: Arc<dyn RewardStore>,
        weights: Arc<dyn WeightSource>,
        multipliers: Arc<dyn MultiplierSource>,
        forest: Arc<dyn ReferralForest>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            weights,
            multipliers,
            forest,
            clock,
            max_depth: DEFAULT_MAX_ANCESTOR_DEPTH,
        }
    }

    /// Hop limit for ancestor walks
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn record(&self, participant: ParticipantId) -> Result<Option<CombatPowerRecord>> {
        self.store.combat_record(participant)
    }

    /// Recompute and store personal power, returning it
    pub async fn recalculate_personal(&self, participant: ParticipantId) -> Result<Amount> {
        let (_, current) = self.recalculate(participant).await?;
        Ok(current)
    }

    /// Recompute personal power; storing it is the last fallible step
    async fn recalculate(&self, participant: ParticipantId) -> Result<(Amount, Amount)> {
        let now = self.clock.now();
        self.store
            .set_power_state(participant, PowerState::Recalculating, now)?;

        let inputs = self.read_inputs(participant).await;
        let (holdings, lp, burn, ppm) = match inputs {
            Ok(inputs) => inputs,
            Err(e) => {
                self.store.set_power_state(participant, PowerState::Stale, now)?;
                return Err(e);
            }
        };

        let base = holdings.saturating_add(lp).saturating_add(burn);
        let power = apply_multiplier(base, ppm);
        let now = self.clock.now();
        let previous = self.store.store_personal(participant, power, lp, burn, now)?;
        self.record_history(participant, power, now);

        tracing::debug!(%participant, previous = %previous, current = %power, "Recalculated personal power");
        Ok((previous, power))
    }

    fn record_history(&self, participant: ParticipantId, personal_power: Amount, now: DateTime<Utc>) {
        let team_power = match self.store.combat_record(participant) {
            Ok(record) => record.map(|r| r.team_power).unwrap_or(0),
            Err(e) => {
                tracing::warn!(%participant, error = %e, "Skipping power history point");
                return;
            }
        };
        let point = PowerHistoryPoint {
            participant,
            personal_power,
            team_power,
            recorded_at: now,
        };
        if let Err(e) = self.store.append_history(point) {
            tracing::warn!(%participant, error = %e, "Failed to append power history");
        }
    }

    async fn read_inputs(&self, participant: ParticipantId) -> Result<(Amount, Amount, Amount, u128)> {
        let holdings = self.weights.holdings_weight(participant).await?;
        let lp = self.weights.lp_weight(participant).await?;
        let burn = self.weights.burn_weight(participant).await?;

        let ppm = match self.multipliers.active_multiplier(participant).await? {
            None => MULTIPLIER_SCALE,
            Some(factor) => multiplier_to_ppm(factor).unwrap_or_else(|| {
                tracing::warn!(%participant, factor, "Ignoring invalid combat power multiplier");
                MULTIPLIER_SCALE
            }),
        };
        Ok((holdings, lp, burn, ppm))
    }

    /// Add `delta` to the team power of every ancestor of `participant`
    pub async fn propagate_to_ancestors(
        &self,
        participant: ParticipantId,
        delta: i128,
    ) -> Result<PropagationReport> {
        let ancestry = walk_ancestors(self.forest.as_ref(), participant, self.max_depth).await?;
        Ok(self.apply_to_ancestors(
            participant,
            &ancestry,
            TeamDelta::power(delta),
            TeamDelta::power(delta),
        ))
    }

    /// Apply `first` to the inviter and `rest` above it
    ///
    /// The ancestry is resolved up front, so nothing here can fail halfway
    /// through the chain. A failed write is skipped and left to reconciliation.
    fn apply_to_ancestors(
        &self,
        participant: ParticipantId,
        ancestry: &Ancestry,
        first: TeamDelta,
        rest: TeamDelta,
    ) -> PropagationReport {
        let mut report = PropagationReport {
            stop: ancestry.stop,
            ..Default::default()
        };
        if first.is_empty() && rest.is_empty() {
            return report;
        }

        for (hop, &ancestor) in ancestry.ancestors.iter().enumerate() {
            let delta = if hop == 0 { first } else { rest };
            if delta.is_empty() {
                continue;
            }
            match self.store.apply_team_delta(ancestor, delta, self.clock.now()) {
                Ok(_) => report.updated += 1,
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(%participant, %ancestor, error = %e, "Skipping ancestor in team power propagation");
                }
            }
        }

        match report.stop {
            WalkStop::Root => {}
            WalkStop::DepthLimit => tracing::warn!(
                %participant,
                max_depth = self.max_depth,
                "Team power propagation hit depth limit"
            ),
            WalkStop::Cycle => {
                tracing::warn!(%participant, "Cycle in referral forest, propagation stopped")
            }
        }
        report
    }

    /// Recalculate personal power and push the change to all ancestors
    ///
    /// A failed ancestor lookup leaves the participant `Stale` with nothing
    /// written, so a retry recomputes the same delta.
    pub async fn refresh(&self, participant: ParticipantId) -> Result<PowerChange> {
        self.store
            .set_power_state(participant, PowerState::Stale, self.clock.now())?;
        let ancestry = walk_ancestors(self.forest.as_ref(), participant, self.max_depth).await?;
        let (previous, current) = self.recalculate(participant).await?;
        let delta = power_delta(previous, current);
        let propagation = self.apply_to_ancestors(
            participant,
            &ancestry,
            TeamDelta::power(delta),
            TeamDelta::power(delta),
        );
        Ok(PowerChange {
            participant,
            previous,
            current,
            delta,
            propagation,
        })
    }

    /// Onboard a participant: zeroed record, personal power, ancestor counts
    ///
    /// The inviter gains a direct referral; every ancestor gains a team
    /// member and the newcomer's personal power. Counts are applied once per
    /// participant, so a repeated or retried join only settles power.
    pub async fn on_participant_joined(&self, participant: ParticipantId) -> Result<PowerChange> {
        let ancestry = walk_ancestors(self.forest.as_ref(), participant, self.max_depth).await?;
        self.store
            .ensure_combat_record(participant, self.clock.now())?;

        if self.store.mark_joined(participant, self.clock.now())? {
            let rest = TeamDelta {
                power: 0,
                members: 1,
                direct_referrals: 0,
            };
            let first = TeamDelta {
                direct_referrals: 1,
                ..rest
            };
            self.apply_to_ancestors(participant, &ancestry, first, rest);
        } else {
            tracing::debug!(%participant, "Join already counted");
        }

        let (previous, current) = self.recalculate(participant).await?;
        let delta = power_delta(previous, current);
        let propagation = self.apply_to_ancestors(
            participant,
            &ancestry,
            TeamDelta::power(delta),
            TeamDelta::power(delta),
        );

        tracing::info!(%participant, power = %current, ancestors = ancestry.ancestors.len(), "Participant joined");
        Ok(PowerChange {
            participant,
            previous,
            current,
            delta,
            propagation,
        })
    }

    /// Recompute team power and counts from the full downline and store them
    pub async fn recalculate_team_stats(&self, participant: ParticipantId) -> Result<TeamStats> {
        let downline = collect_downline(self.forest.as_ref(), participant).await?;

        let mut team_power: Amount = 0;
        for member in downline.participants() {
            let personal = self
                .store
                .combat_record(member)?
                .map(|r| r.personal_power)
                .unwrap_or(0);
            team_power = team_power.saturating_add(personal);
        }

        let stats = TeamStats {
            team_power,
            team_members: downline.members.len() as u64,
            direct_referrals: downline.direct as u64,
        };
        self.store
            .store_team_stats(participant, stats, self.clock.now())?;
        Ok(stats)
    }

    /// Recompute team stats for `participants`, stopping between participants on cancel
    pub async fn reconcile(
        &self,
        participants: &[ParticipantId],
        cancel: &CancellationToken,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for (index, &participant) in participants.iter().enumerate() {
            if cancel.is_cancelled() {
                report.resume_at = Some(index);
                break;
            }

            let stored = match self.store.combat_record(participant) {
                Ok(record) => record,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(%participant, error = %e, "Reconciliation read failed");
                    continue;
                }
            };

            match self.recalculate_team_stats(participant).await {
                Ok(stats) => {
                    report.processed += 1;
                    let Some(stored) = stored else { continue };
                    let drift = stored.team_power.abs_diff(stats.team_power);
                    if drift > 0
                        || stored.team_members != stats.team_members
                        || stored.direct_referrals != stats.direct_referrals
                    {
                        report.corrected += 1;
                        report.drift = report.drift.saturating_add(drift);
                        tracing::debug!(%participant, drift = %drift, "Corrected team stats drift");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(%participant, error = %e, "Team stats recalculation failed");
                }
            }
        }

        if report.corrected > 0 || report.failed > 0 {
            tracing::info!(
                processed = report.processed,
                corrected = report.corrected,
                failed = report.failed,
                drift = %report.drift,
                "Reconciled team stats"
            );
        }
        report
    }

    /// Ancestors of `participant`, nearest first
    pub async fn ancestors(&self, participant: ParticipantId) -> Result<Vec<ParticipantId>> {
        Ok(walk_ancestors(self.forest.as_ref(), participant, self.max_depth)
            .await?
            .ancestors)
    }

    /// Number of levels in the downline of `participant`
    pub async fn tree_depth(&self, participant: ParticipantId) -> Result<usize> {
        crate::forest::downline_depth(self.forest.as_ref(), participant).await
    }

    /// Sum of personal power over all participants
    pub fn network_power(&self) -> Result<Amount> {
        Ok(self
            .store
            .combat_records()?
            .iter()
            .fold(0, |acc: Amount, r| acc.saturating_add(r.personal_power)))
    }

    pub fn history(
        &self,
        participant: ParticipantId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PowerHistoryPoint>> {
        self.store.history(participant, since)
    }
}
