//! # Tally Storage
//!
//! Persistence and in-process collaborator backends.
//!
//! ## Layout
//!
//! - `store` - the `RewardStore` interface with row-scoped conditional updates
//! - `memory` - `MemoryStore`, the in-memory `RewardStore`
//! - `ledger` - `MemoryLedger`, an in-memory `BalanceLedger`
//! - `registry` - `MemoryRegistry`, participants, referral links and weights

pub mod ledger;
pub mod memory;
pub mod registry;
pub mod store;

pub use ledger::MemoryLedger;
pub use memory::MemoryStore;
pub use registry::{MemoryRegistry, ParticipantFixture, RegistryFixture};
pub use store::{ClaimTransition, EntryLock, RewardStore};
