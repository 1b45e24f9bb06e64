//! Error types for Tally engine operations

use crate::types::{BlockId, EntryId, ParticipantId};
use thiserror::Error;

/// Result type alias for Tally operations
pub type Result<T> = std::result::Result<T, TallyError>;

/// Errors that can occur in Tally engine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TallyError {
    // === Block Lifecycle ===
    /// Block row could not be persisted
    #[error("Failed to create mint block #{number}: {reason}")]
    BlockCreation { number: u64, reason: String },

    /// Block number already taken
    #[error("Mint block number {0} already exists")]
    DuplicateBlockNumber(u64),

    /// Block not found
    #[error("Mint block not found: {0}")]
    BlockNotFound(BlockId),

    /// Block already distributed
    #[error("Mint block already distributed: {0}")]
    AlreadyDistributed(BlockId),

    // === Snapshots ===
    /// Snapshot already captured for this participant and block
    #[error("Weight snapshot already exists for {participant} in block {block}")]
    DuplicateSnapshot {
        participant: ParticipantId,
        block: BlockId,
    },

    // === Claims ===
    /// Reward entry not found
    #[error("Reward entry not found: {0}")]
    EntryNotFound(EntryId),

    /// Entry belongs to another participant
    #[error("Reward entry {entry} does not belong to {participant}")]
    NotEntryOwner {
        entry: EntryId,
        participant: ParticipantId,
    },

    /// Entry already claimed
    #[error("Reward entry already claimed: {0}")]
    AlreadyClaimed(EntryId),

    /// Claim credited but neither committed nor refunded
    #[error("Fatal inconsistency on reward entry {entry}: {reason}")]
    FatalInconsistency { entry: EntryId, reason: String },

    // === Participants & Assets ===
    /// Participant unknown to the identity subsystem
    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    /// Asset symbol unknown to the balance ledger
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    // === Collaborators ===
    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Balance ledger failure
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Weight, multiplier or referral source failure
    #[error("Source error: {0}")]
    Source(String),

    // === Workers ===
    /// Recalculation queue saturated
    #[error("Recalculation queue full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    /// Operation cancelled or worker gone
    #[error("Operation cancelled")]
    Cancelled,

    // === General ===
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl TallyError {
    /// Stable numeric code for callers that map errors onto their own surface
    pub fn code(&self) -> u32 {
        match self {
            Self::BlockCreation { .. } | Self::DuplicateBlockNumber(_) => 2001,
            Self::BlockNotFound(_) => 2002,
            Self::AlreadyDistributed(_) => 2003,
            Self::DuplicateSnapshot { .. } => 2101,
            Self::EntryNotFound(_) => 2201,
            Self::NotEntryOwner { .. } => 2202,
            Self::AlreadyClaimed(_) => 2203,
            Self::FatalInconsistency { .. } => 2299,
            Self::ParticipantNotFound(_) => 2301,
            Self::AssetNotFound(_) => 2302,
            Self::QueueFull { .. } => 2401,
            Self::Cancelled => 2402,
            _ => 9999,
        }
    }

    /// Transient failure that may succeed on retry
    ///
    /// Never true for kinds meaning the operation already happened.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Ledger(_) | Self::Source(_) | Self::QueueFull { .. }
        )
    }

    /// Precondition rejections that a batch claim skips silently
    pub fn is_claim_skip(&self) -> bool {
        matches!(
            self,
            Self::EntryNotFound(_) | Self::NotEntryOwner { .. } | Self::AlreadyClaimed(_)
        )
    }
}
