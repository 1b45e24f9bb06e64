//! Tally CLI
//!
//! Runs the reward engine, simulates reward blocks over a participant
//! fixture, and prints the default configuration.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tally_core::{Amount, Clock, CombatPowerRecord, ManualClock, ParticipantId, SystemClock, ONE_TOKEN};
use tally_economics::TickOutcome;
use tally_node::config::LoggingConfig;
use tally_node::{Collaborators, EngineConfig, EngineService};
use tally_storage::{MemoryLedger, MemoryRegistry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tally")]
#[command(version)]
#[command(about = "Tally - reward distribution and combat power aggregation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "tally.toml")]
        config: PathBuf,

        /// Participant fixture (JSON) to seed the in-memory registry
        #[arg(short, long)]
        fixture: Option<PathBuf>,
    },

    /// Mint and distribute blocks over a fixture, claim everything, print JSON
    Simulate {
        /// Participant fixture (JSON)
        #[arg(short, long)]
        fixture: PathBuf,

        /// Number of blocks to mint
        #[arg(short, long, default_value = "3")]
        blocks: u32,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the default configuration as TOML
    Config,
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false),
            )
            .init();
    }
}

/// Human-readable token amount, e.g. `12.5`
fn format_tokens(amount: Amount) -> String {
    let whole = amount / ONE_TOKEN;
    let frac = amount % ONE_TOKEN;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{frac:018}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

fn load_registry(fixture: Option<&Path>) -> anyhow::Result<(Arc<MemoryRegistry>, Vec<(String, ParticipantId)>)> {
    let Some(path) = fixture else {
        return Ok((Arc::new(MemoryRegistry::new()), Vec::new()));
    };
    let (registry, names) = MemoryRegistry::load_fixture(path)
        .with_context(|| format!("Failed to load fixture {}", path.display()))?;
    Ok((Arc::new(registry), names.into_iter().collect()))
}

async fn build_service(
    config: EngineConfig,
    registry: Arc<MemoryRegistry>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<(EngineService, Arc<MemoryLedger>)> {
    let ledger = Arc::new(MemoryLedger::with_assets(&[config.schedule.reward_symbol.as_str()]));
    let deps = Collaborators::in_memory(registry, ledger.clone()).with_clock(clock);
    let service = EngineService::new(config, deps).await?;
    Ok((service, ledger))
}

/// Onboard every fixture participant, in fixture order
async fn onboard(service: &EngineService, participants: &[(String, ParticipantId)]) -> anyhow::Result<()> {
    for (name, id) in participants {
        service
            .participant_joined(*id)?
            .wait()
            .await
            .with_context(|| format!("Failed to onboard {name}"))?;
    }
    Ok(())
}

async fn run(config_path: &Path, fixture: Option<&Path>, verbose: bool) -> anyhow::Result<()> {
    let config = EngineConfig::load(Some(config_path))?;
    init_logging(verbose, &config.logging);
    tracing::info!(config = %config_path.display(), "Starting Tally reward engine");

    let (registry, participants) = load_registry(fixture)?;
    let (service, _ledger) = build_service(config, registry, Arc::new(SystemClock)).await?;
    onboard(&service, &participants).await?;
    tracing::info!(participants = participants.len(), "Participants onboarded");

    let token = service.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Interrupt received");
        token.cancel();
    });

    service.run().await;
    service.shutdown().await;
    Ok(())
}

async fn simulate(
    fixture: &Path,
    blocks: u32,
    config_path: Option<&Path>,
    verbose: bool,
) -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path)?;
    init_logging(verbose, &config.logging);
    let interval = chrono::Duration::seconds(i64::try_from(config.schedule.interval_secs)?);

    let (registry, participants) = load_registry(Some(fixture))?;
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let (service, ledger) = build_service(config, registry, clock.clone()).await?;
    onboard(&service, &participants).await?;

    let mut minted = Vec::new();
    for _ in 0..blocks {
        match service.tick().await? {
            TickOutcome::Created { block, report } | TickOutcome::Resumed { block, report } => {
                minted.push(json!({
                    "number": block.number,
                    "total_reward": format_tokens(block.total_reward),
                    "distributed": block.distributed,
                    "entries": report.as_ref().map(|r| r.entries),
                    "residue": report.as_ref().map(|r| format_tokens(r.residue)),
                }));
            }
            TickOutcome::Idle { remaining } => {
                tracing::warn!(remaining_secs = remaining.as_secs(), "Block not due");
            }
            TickOutcome::Stuck { block, error } => {
                anyhow::bail!("mint block {} cannot be settled: {error}", block.number);
            }
        }
        clock.advance(interval);
    }

    let asset = service.claims().asset();
    let mut rows = Vec::with_capacity(participants.len());
    for (name, id) in &participants {
        let receipt = service.claim_all(*id).await?;
        let record = service
            .aggregator()
            .record(*id)?
            .unwrap_or_else(|| CombatPowerRecord::new(*id, clock.now()));
        rows.push(json!({
            "name": name,
            "claimed": format_tokens(receipt.claimed_amount),
            "entries_claimed": receipt.claimed.len(),
            "balance": format_tokens(ledger.balance_of(*id, asset)),
            "personal_power": format_tokens(record.personal_power),
            "team_power": format_tokens(record.team_power),
            "team_members": record.team_members,
            "direct_referrals": record.direct_referrals,
        }));
    }

    let output = json!({
        "symbol": service.claims().symbol(),
        "blocks": minted,
        "participants": rows,
        "network_power": format_tokens(service.aggregator().network_power()?),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    service.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, fixture } => run(&config, fixture.as_deref(), cli.verbose).await?,

        Commands::Simulate {
            fixture,
            blocks,
            config,
        } => simulate(&fixture, blocks, config.as_deref(), cli.verbose).await?,

        Commands::Config => print!("{}", EngineConfig::default().to_toml()?),
    }

    Ok(())
}
