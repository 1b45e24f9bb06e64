//! Recalculation worker pool
//!
//! Follow-up combat power work (after a purchase, an LP change, a burn or a
//! new referral) is queued as a [`RecalcJob`] on a bounded channel and
//! served by a fixed set of tokio tasks. Every submission returns a
//! [`JobHandle`] that resolves with the final outcome. Retryable failures are
//! retried with linear backoff; jobs that still fail are kept in a
//! dead-letter list.

use crate::config::WorkerConfig;
use crate::metrics::EngineMetrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{ParticipantId, Result, TallyError, TeamStats};
use tally_economics::{CombatPowerAggregator, PowerChange};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Unit of follow-up work
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecalcJob {
    /// Weights changed: recalculate personal power and propagate
    Refresh(ParticipantId),
    /// New participant onboarded
    Joined(ParticipantId),
    /// Full team stats recomputation
    TeamStats(ParticipantId),
}

impl RecalcJob {
    pub fn participant(&self) -> ParticipantId {
        match self {
            Self::Refresh(p) | Self::Joined(p) | Self::TeamStats(p) => *p,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Refresh(_) => "refresh",
            Self::Joined(_) => "joined",
            Self::TeamStats(_) => "team_stats",
        }
    }
}

/// Successful result of a job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecalcOutcome {
    Power(PowerChange),
    Team(TeamStats),
}

/// A job that exhausted its attempts
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub job_id: u64,
    pub job: RecalcJob,
    pub attempts: u32,
    pub error: TallyError,
    pub failed_at: DateTime<Utc>,
}

/// Completion handle of a submitted job
pub struct JobHandle {
    id: u64,
    job: RecalcJob,
    rx: oneshot::Receiver<Result<RecalcOutcome>>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job(&self) -> RecalcJob {
        self.job
    }

    /// Wait for the final outcome; `Cancelled` if the pool shut down first
    pub async fn wait(self) -> Result<RecalcOutcome> {
        self.rx.await.map_err(|_| TallyError::Cancelled)?
    }
}

struct Envelope {
    id: u64,
    job: RecalcJob,
    reply: oneshot::Sender<Result<RecalcOutcome>>,
}

#[derive(Clone)]
struct Worker {
    aggregator: Arc<CombatPowerAggregator>,
    dead_letters: Arc<RwLock<Vec<DeadLetter>>>,
    metrics: Option<Arc<EngineMetrics>>,
    max_attempts: u32,
    backoff: Duration,
}

impl Worker {
    async fn run(self, index: usize, rx: Arc<Mutex<mpsc::Receiver<Envelope>>>) {
        tracing::debug!(worker = index, "Recalculation worker started");
        loop {
            let next = rx.lock().await.recv().await;
            let Some(envelope) = next else { break };
            if let Some(metrics) = &self.metrics {
                metrics.recalc_queue_depth.dec();
            }
            let result = self.process(envelope.id, envelope.job).await;
            // submitter may have dropped the handle
            let _ = envelope.reply.send(result);
        }
        tracing::debug!(worker = index, "Recalculation worker stopped");
    }

    async fn process(&self, id: u64, job: RecalcJob) -> Result<RecalcOutcome> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.execute(job).await {
                Ok(outcome) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.recalc_succeeded.inc();
                    }
                    return Ok(outcome);
                }
                Err(e) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.recalc_failed.inc();
                    }
                    if e.is_retryable() && attempt < self.max_attempts {
                        tracing::warn!(
                            job = id,
                            kind = job.kind(),
                            participant = %job.participant(),
                            attempt,
                            error = %e,
                            "Recalculation failed, retrying"
                        );
                        tokio::time::sleep(self.backoff * attempt).await;
                        continue;
                    }

                    tracing::error!(
                        job = id,
                        kind = job.kind(),
                        participant = %job.participant(),
                        attempts = attempt,
                        error = %e,
                        "Recalculation job dead-lettered"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.recalc_dead_lettered.inc();
                    }
                    self.dead_letters.write().push(DeadLetter {
                        job_id: id,
                        job,
                        attempts: attempt,
                        error: e.clone(),
                        failed_at: Utc::now(),
                    });
                    return Err(e);
                }
            }
        }
    }

    async fn execute(&self, job: RecalcJob) -> Result<RecalcOutcome> {
        match job {
            RecalcJob::Refresh(p) => self.aggregator.refresh(p).await.map(RecalcOutcome::Power),
            RecalcJob::Joined(p) => self
                .aggregator
                .on_participant_joined(p)
                .await
                .map(RecalcOutcome::Power),
            RecalcJob::TeamStats(p) => self
                .aggregator
                .recalculate_team_stats(p)
                .await
                .map(RecalcOutcome::Team),
        }
    }
}

/// Bounded queue of recalculation jobs served by N workers
pub struct RecalcPool {
    tx: mpsc::Sender<Envelope>,
    /// Shared with the workers; pending jobs are dropped with it on shutdown
    _queue: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    capacity: usize,
    next_id: AtomicU64,
    dead_letters: Arc<RwLock<Vec<DeadLetter>>>,
    metrics: Option<Arc<EngineMetrics>>,
    workers: Vec<JoinHandle<()>>,
}

impl RecalcPool {
    /// Spawn the workers; must be called inside a tokio runtime
    pub fn start(
        aggregator: Arc<CombatPowerAggregator>,
        config: &WorkerConfig,
        metrics: Option<Arc<EngineMetrics>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let dead_letters = Arc::new(RwLock::new(Vec::new()));

        let worker = Worker {
            aggregator,
            dead_letters: dead_letters.clone(),
            metrics: metrics.clone(),
            max_attempts: config.max_attempts,
            backoff: config.retry_backoff(),
        };
        let workers = (0..config.workers)
            .map(|index| tokio::spawn(worker.clone().run(index, rx.clone())))
            .collect();

        tracing::info!(
            workers = config.workers,
            capacity = config.queue_capacity,
            max_attempts = config.max_attempts,
            "Started recalculation pool"
        );

        Self {
            tx,
            _queue: rx,
            capacity: config.queue_capacity,
            next_id: AtomicU64::new(1),
            dead_letters,
            metrics,
            workers,
        }
    }

    /// Queue a job without waiting; `QueueFull` when saturated
    pub fn submit(&self, job: RecalcJob) -> Result<JobHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();

        match self.tx.try_send(Envelope { id, job, reply }) {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.recalc_queue_depth.inc();
                }
                Ok(JobHandle { id, job, rx })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(kind = job.kind(), participant = %job.participant(), "Recalculation queue full");
                Err(TallyError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TallyError::Cancelled),
        }
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.read().clone()
    }

    /// Stop accepting jobs, let workers drain the queue, and wait for them
    pub async fn shutdown(self) {
        let pending = self.queued();
        drop(self.tx);
        if self.workers.is_empty() && pending > 0 {
            tracing::warn!(pending, "Recalculation pool stopped with jobs pending");
        }
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Recalculation worker panicked");
            }
        }
        tracing::info!("Recalculation pool stopped");
    }
}
