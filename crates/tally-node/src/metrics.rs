//! Prometheus metrics for the engine

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tally_core::ONE_TOKEN;
use tally_economics::{ClaimReceipt, DistributionReport, ReconcileReport};

/// Engine counters and gauges on a private registry
pub struct EngineMetrics {
    registry: Registry,

    pub blocks_created: IntCounter,
    pub entries_distributed: IntCounter,
    /// Whole tokens distributed, rounded down
    pub tokens_distributed: IntCounter,
    pub current_block: IntGauge,
    /// Open block the schedule is halted on, 0 when none
    pub stuck_block: IntGauge,

    pub claims_succeeded: IntCounter,
    pub claims_skipped: IntCounter,
    pub claims_failed: IntCounter,

    pub recalc_succeeded: IntCounter,
    pub recalc_failed: IntCounter,
    pub recalc_dead_lettered: IntCounter,
    pub recalc_queue_depth: IntGauge,

    pub reconcile_corrected: IntCounter,
}

fn counter(registry: &Registry, namespace: &str, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(namespace))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, namespace: &str, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(namespace))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl EngineMetrics {
    pub fn new(namespace: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let r = &registry;
        let ns = namespace;

        Ok(Self {
            blocks_created: counter(r, ns, "blocks_created_total", "Mint blocks created")?,
            entries_distributed: counter(r, ns, "entries_distributed_total", "Reward entries recorded")?,
            tokens_distributed: counter(r, ns, "tokens_distributed_total", "Whole reward tokens distributed")?,
            current_block: gauge(r, ns, "current_block", "Number of the latest mint block")?,
            stuck_block: gauge(r, ns, "stuck_block", "Open mint block that cannot be settled, 0 when none")?,
            claims_succeeded: counter(r, ns, "claims_succeeded_total", "Reward entries claimed")?,
            claims_skipped: counter(r, ns, "claims_skipped_total", "Claim requests skipped")?,
            claims_failed: counter(r, ns, "claims_failed_total", "Claims failed or left inconsistent")?,
            recalc_succeeded: counter(r, ns, "recalc_jobs_succeeded_total", "Recalculation jobs completed")?,
            recalc_failed: counter(r, ns, "recalc_attempts_failed_total", "Recalculation attempts failed")?,
            recalc_dead_lettered: counter(r, ns, "recalc_jobs_dead_lettered_total", "Recalculation jobs given up")?,
            recalc_queue_depth: gauge(r, ns, "recalc_queue_depth", "Jobs waiting in the recalculation queue")?,
            reconcile_corrected: counter(r, ns, "reconcile_corrected_total", "Team stats corrected by reconciliation")?,
            registry,
        })
    }

    pub fn record_distribution(&self, report: &DistributionReport) {
        self.entries_distributed.inc_by(report.entries as u64);
        self.tokens_distributed
            .inc_by(u64::try_from(report.distributed / ONE_TOKEN).unwrap_or(u64::MAX));
    }

    pub fn record_block(&self, number: u64) {
        self.blocks_created.inc();
        self.current_block.set(i64::try_from(number).unwrap_or(i64::MAX));
    }

    pub fn record_stuck(&self, number: Option<u64>) {
        let number = number.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        self.stuck_block.set(number.unwrap_or(0));
    }

    pub fn record_claims(&self, receipt: &ClaimReceipt) {
        self.claims_succeeded.inc_by(receipt.claimed.len() as u64);
        self.claims_skipped.inc_by(receipt.skipped.len() as u64);
        self.claims_failed.inc_by(receipt.failed.len() as u64);
    }

    pub fn record_reconcile(&self, report: &ReconcileReport) {
        self.reconcile_corrected.inc_by(report.corrected as u64);
    }

    /// Prometheus text exposition of every metric
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
