//! # Tally Economics
//!
//! The reward and combat-power engine.
//!
//! ## Block pipeline
//!
//! ```text
//!   MintBlockScheduler ──► WeightSnapshotter ──► RewardDistributor ──► ClaimLedger
//!          (create)            (snapshot)          (distribute)          (claim)
//! ```
//!
//! Snapshot and distribution run strictly in sequence for one block. A block
//! left open by a failure or a restart is finished by the next scheduler tick.
//!
//! ## Combat power
//!
//! `CombatPowerAggregator` keeps personal power current and propagates
//! changes up the referral forest. `forest` holds the iterative, cycle-safe
//! traversals it is built on.

pub mod claims;
pub mod combat;
pub mod distributor;
pub mod forest;
pub mod scheduler;
pub mod snapshot;

pub use claims::{ClaimLedger, ClaimReceipt, Page, RewardSummary};
pub use combat::{CombatPowerAggregator, PowerChange, PropagationReport, ReconcileReport};
pub use distributor::{allocate, Allocation, DistributionReport, RewardDistributor};
pub use forest::{AncestorWalk, Ancestry, Downline, DownlineMember, WalkStop};
pub use scheduler::{MintBlockScheduler, ScheduleSettings, TickOutcome};
pub use snapshot::WeightSnapshotter;
