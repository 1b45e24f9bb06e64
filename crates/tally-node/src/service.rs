//! Engine service: wires the components to the collaborators and drives them

use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::worker::{DeadLetter, JobHandle, RecalcJob, RecalcPool};
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use tally_core::{
    Amount, BalanceLedger, Clock, EntryId, MintBlock, MultiplierSource, ParticipantId,
    ReferralForest, Result, SystemClock, WeightSource,
};
use tally_economics::{
    ClaimLedger, ClaimReceipt, CombatPowerAggregator, MintBlockScheduler, ReconcileReport,
    RewardDistributor, TickOutcome, WeightSnapshotter,
};
use tally_storage::{MemoryRegistry, MemoryStore, RewardStore};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// External systems the engine reads from and writes to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RewardStore>,
    pub ledger: Arc<dyn BalanceLedger>,
    pub weights: Arc<dyn WeightSource>,
    pub multipliers: Arc<dyn MultiplierSource>,
    pub forest: Arc<dyn ReferralForest>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-memory store around a registry that serves weights, multipliers and the forest
    pub fn in_memory(registry: Arc<MemoryRegistry>, ledger: Arc<dyn BalanceLedger>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            ledger,
            weights: registry.clone(),
            multipliers: registry.clone(),
            forest: registry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// The running reward engine
pub struct EngineService {
    config: EngineConfig,
    forest: Arc<dyn ReferralForest>,
    scheduler: Arc<MintBlockScheduler>,
    claims: Arc<ClaimLedger>,
    aggregator: Arc<CombatPowerAggregator>,
    pool: RecalcPool,
    metrics: Option<Arc<EngineMetrics>>,
    reconcile_cursor: Mutex<usize>,
    shutdown: CancellationToken,
}

impl EngineService {
    /// Build the engine and start the recalculation workers
    pub async fn new(config: EngineConfig, deps: Collaborators) -> anyhow::Result<Self> {
        config.validate()?;

        let metrics = if config.metrics.enabled {
            let metrics = EngineMetrics::new(&config.metrics.namespace)
                .context("Failed to register metrics")?;
            Some(Arc::new(metrics))
        } else {
            None
        };

        let snapshotter = Arc::new(WeightSnapshotter::new(
            deps.forest.clone(),
            deps.weights.clone(),
            deps.store.clone(),
            deps.clock.clone(),
        ));
        let distributor = Arc::new(RewardDistributor::new(deps.store.clone(), deps.clock.clone()));
        let scheduler = Arc::new(MintBlockScheduler::new(
            deps.store.clone(),
            snapshotter,
            distributor,
            deps.clock.clone(),
            config.schedule.settings(),
        ));

        let claims = ClaimLedger::connect(
            deps.store.clone(),
            deps.ledger.clone(),
            deps.clock.clone(),
            &config.schedule.reward_symbol,
        )
        .await
        .with_context(|| format!("Failed to resolve reward asset {}", config.schedule.reward_symbol))?;

        let aggregator = Arc::new(
            CombatPowerAggregator::new(
                deps.store.clone(),
                deps.weights.clone(),
                deps.multipliers.clone(),
                deps.forest.clone(),
                deps.clock.clone(),
            )
            .with_max_depth(config.combat.max_ancestor_depth),
        );
        let pool = RecalcPool::start(aggregator.clone(), &config.worker, metrics.clone());

        tracing::info!(
            interval_secs = config.schedule.interval_secs,
            block_reward = config.schedule.block_reward_tokens,
            symbol = %config.schedule.reward_symbol,
            "Reward engine initialized"
        );

        Ok(Self {
            config,
            forest: deps.forest,
            scheduler,
            claims: Arc::new(claims),
            aggregator,
            pool,
            metrics,
            reconcile_cursor: Mutex::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<MintBlockScheduler> {
        &self.scheduler
    }

    pub fn claims(&self) -> &Arc<ClaimLedger> {
        &self.claims
    }

    pub fn aggregator(&self) -> &Arc<CombatPowerAggregator> {
        &self.aggregator
    }

    /// Prometheus text exposition, `None` when metrics are disabled
    pub fn metrics_text(&self) -> Option<String> {
        self.metrics.as_ref().map(|m| m.gather_text())
    }

    /// Token that stops [`run`](Self::run) and in-flight reconciliation
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queue follow-up recalculation work
    pub fn submit(&self, job: RecalcJob) -> Result<JobHandle> {
        self.pool.submit(job)
    }

    /// Queue onboarding of a participant already linked in the forest
    pub fn participant_joined(&self, participant: ParticipantId) -> Result<JobHandle> {
        self.submit(RecalcJob::Joined(participant))
    }

    /// Queue a refresh after a participant's weights or multiplier changed
    pub fn weights_changed(&self, participant: ParticipantId) -> Result<JobHandle> {
        self.submit(RecalcJob::Refresh(participant))
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.pool.dead_letters()
    }

    /// Advance the block schedule once
    pub async fn tick(&self) -> Result<TickOutcome> {
        let outcome = self.scheduler.tick().await?;
        if let Some(metrics) = &self.metrics {
            match &outcome {
                TickOutcome::Created { block, report } => {
                    metrics.record_block(block.number);
                    metrics.record_stuck(None);
                    if let Some(report) = report {
                        metrics.record_distribution(report);
                    }
                }
                TickOutcome::Resumed { report, .. } => {
                    metrics.record_stuck(None);
                    if let Some(report) = report {
                        metrics.record_distribution(report);
                    }
                }
                TickOutcome::Stuck { block, .. } => metrics.record_stuck(Some(block.number)),
                TickOutcome::Idle { .. } => {}
            }
        }
        Ok(outcome)
    }

    /// Mint a block with an explicit pool outside the schedule
    pub async fn create_block(&self, total_reward: Amount) -> Result<MintBlock> {
        let block = self.scheduler.create_block(total_reward).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_block(block.number);
        }
        Ok(block)
    }

    pub async fn claim(&self, participant: ParticipantId, entry_ids: &[EntryId]) -> ClaimReceipt {
        let receipt = self.claims.claim(participant, entry_ids).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_claims(&receipt);
        }
        receipt
    }

    pub async fn claim_all(&self, participant: ParticipantId) -> Result<ClaimReceipt> {
        let receipt = self.claims.claim_all(participant).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_claims(&receipt);
        }
        Ok(receipt)
    }

    /// Reconcile the next batch of participants, wrapping around at the end
    pub async fn reconcile_batch(&self) -> Result<ReconcileReport> {
        let participants = self.forest.participants().await?;
        if participants.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let start = {
            let cursor = *self.reconcile_cursor.lock();
            if cursor >= participants.len() {
                0
            } else {
                cursor
            }
        };
        let end = (start + self.config.combat.reconcile_batch_size).min(participants.len());

        let report = self
            .aggregator
            .reconcile(&participants[start..end], &self.shutdown)
            .await;

        let next = match report.resume_at {
            Some(offset) => start + offset,
            None if end >= participants.len() => 0,
            None => end,
        };
        *self.reconcile_cursor.lock() = next;

        if let Some(metrics) = &self.metrics {
            metrics.record_reconcile(&report);
        }
        tracing::info!(
            from = start,
            processed = report.processed,
            corrected = report.corrected,
            failed = report.failed,
            "Reconciled team stats"
        );
        Ok(report)
    }

    /// Tick the scheduler and reconcile on their intervals until shut down
    pub async fn run(&self) {
        let mut ticks = interval(self.config.schedule.tick_interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let every = self.config.combat.reconcile_interval();
        let mut reconciles = interval_at(Instant::now() + every, every);
        reconciles.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            tick_secs = self.config.schedule.tick_interval_secs,
            reconcile_secs = self.config.combat.reconcile_interval_secs,
            "Reward engine running"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Reward engine shutting down");
                    break;
                }
                _ = ticks.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Created { block, .. }) => {
                            tracing::info!(block = block.number, distributed = block.distributed, "Mint block created");
                        }
                        Ok(TickOutcome::Resumed { block, .. }) => {
                            tracing::info!(block = block.number, distributed = block.distributed, "Mint block resumed");
                        }
                        Ok(TickOutcome::Idle { remaining }) => {
                            tracing::trace!(remaining_secs = remaining.as_secs(), "Next mint block not due");
                        }
                        Ok(TickOutcome::Stuck { block, error }) => {
                            tracing::error!(block = block.number, error = %error, code = error.code(), "Mint schedule halted on open block");
                        }
                        Err(e) => tracing::error!(error = %e, "Scheduler tick failed"),
                    }
                }
                _ = reconciles.tick() => {
                    if let Err(e) = self.reconcile_batch().await {
                        tracing::error!(error = %e, "Reconciliation failed");
                    }
                }
            }
        }
    }

    /// Cancel the run loop and drain the worker pool
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
    }
}
