//! In-memory participant registry
//!
//! Holds the referral forest together with each participant's weight inputs
//! and active multiplier. Implements all three read-side collaborator traits
//! and can be seeded from a JSON fixture.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tally_core::{
    Amount, MultiplierSource, ParticipantId, ReferralForest, Result, TallyError, WeightSource,
    ONE_TOKEN,
};

#[derive(Default)]
struct Forest {
    order: Vec<ParticipantId>,
    inviter: HashMap<ParticipantId, Option<ParticipantId>>,
    children: HashMap<ParticipantId, Vec<ParticipantId>>,
}

impl Forest {
    fn link(&mut self, participant: ParticipantId, inviter: Option<ParticipantId>) {
        if let Some(Some(old)) = self.inviter.get(&participant) {
            if let Some(siblings) = self.children.get_mut(old) {
                siblings.retain(|c| *c != participant);
            }
        }
        if !self.inviter.contains_key(&participant) {
            self.order.push(participant);
        }
        self.inviter.insert(participant, inviter);
        if let Some(parent) = inviter {
            self.children.entry(parent).or_default().push(participant);
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Inputs {
    holdings: Amount,
    lp: Amount,
    burn: Amount,
}

/// Participants, referral links and weight inputs held in memory
#[derive(Default)]
pub struct MemoryRegistry {
    forest: RwLock<Forest>,
    inputs: DashMap<ParticipantId, Inputs>,
    multipliers: DashMap<ParticipantId, f64>,
    unavailable: DashSet<ParticipantId>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant, or re-link an existing one to a new inviter
    pub fn register(&self, participant: ParticipantId, inviter: Option<ParticipantId>) {
        self.forest.write().link(participant, inviter);
        self.inputs.entry(participant).or_default();
    }

    pub fn contains(&self, participant: ParticipantId) -> bool {
        self.forest.read().inviter.contains_key(&participant)
    }

    pub fn len(&self) -> usize {
        self.forest.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_holdings(&self, participant: ParticipantId, amount: Amount) {
        self.inputs.entry(participant).or_default().holdings = amount;
    }

    pub fn set_lp(&self, participant: ParticipantId, amount: Amount) {
        self.inputs.entry(participant).or_default().lp = amount;
    }

    pub fn set_burn(&self, participant: ParticipantId, amount: Amount) {
        self.inputs.entry(participant).or_default().burn = amount;
    }

    /// Set or clear the active multiplier
    pub fn set_multiplier(&self, participant: ParticipantId, factor: Option<f64>) {
        match factor {
            Some(f) => {
                self.multipliers.insert(participant, f);
            }
            None => {
                self.multipliers.remove(&participant);
            }
        }
    }

    /// Make weight reads for `participant` fail with a source error
    pub fn set_unavailable(&self, participant: ParticipantId, unavailable: bool) {
        if unavailable {
            self.unavailable.insert(participant);
        } else {
            self.unavailable.remove(&participant);
        }
    }

    fn read_inputs(&self, participant: ParticipantId) -> Result<Inputs> {
        if self.unavailable.contains(&participant) {
            return Err(TallyError::Source(format!(
                "weights unavailable for {participant}"
            )));
        }
        Ok(self
            .inputs
            .get(&participant)
            .map(|i| *i)
            .unwrap_or_default())
    }

    /// Build a registry from a fixture, returning it with the name-to-id map
    pub fn from_fixture(
        fixture: &RegistryFixture,
    ) -> Result<(Self, IndexMap<String, ParticipantId>)> {
        let mut names = IndexMap::with_capacity(fixture.participants.len());
        for p in &fixture.participants {
            if names.insert(p.name.clone(), ParticipantId::generate()).is_some() {
                return Err(TallyError::InvalidInput(format!(
                    "duplicate participant name: {}",
                    p.name
                )));
            }
        }

        let registry = Self::new();
        for p in &fixture.participants {
            let id = names[&p.name];
            let inviter = match &p.inviter {
                Some(name) => Some(*names.get(name).ok_or_else(|| {
                    TallyError::InvalidInput(format!("unknown inviter {name} for {}", p.name))
                })?),
                None => None,
            };
            registry.register(id, inviter);
            registry.set_holdings(id, tokens(p.holdings));
            registry.set_lp(id, tokens(p.lp));
            registry.set_burn(id, tokens(p.burn));
            registry.set_multiplier(id, p.multiplier);
        }

        tracing::debug!(participants = names.len(), "Loaded registry fixture");
        Ok((registry, names))
    }

    /// Read a JSON fixture from disk
    pub fn load_fixture(path: &Path) -> Result<(Self, IndexMap<String, ParticipantId>)> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            TallyError::InvalidInput(format!("cannot read {}: {e}", path.display()))
        })?;
        let fixture: RegistryFixture = serde_json::from_str(&data)
            .map_err(|e| TallyError::InvalidInput(format!("invalid fixture: {e}")))?;
        Self::from_fixture(&fixture)
    }
}

fn tokens(whole: u64) -> Amount {
    whole as Amount * ONE_TOKEN
}

/// Seed data for a registry; amounts are whole tokens
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistryFixture {
    pub participants: Vec<ParticipantFixture>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantFixture {
    pub name: String,
    #[serde(default)]
    pub inviter: Option<String>,
    #[serde(default)]
    pub holdings: u64,
    #[serde(default)]
    pub lp: u64,
    #[serde(default)]
    pub burn: u64,
    #[serde(default)]
    pub multiplier: Option<f64>,
}

#[async_trait]
impl WeightSource for MemoryRegistry {
    async fn holdings_weight(&self, participant: ParticipantId) -> Result<Amount> {
        Ok(self.read_inputs(participant)?.holdings)
    }

    async fn lp_weight(&self, participant: ParticipantId) -> Result<Amount> {
        Ok(self.read_inputs(participant)?.lp)
    }

    async fn burn_weight(&self, participant: ParticipantId) -> Result<Amount> {
        Ok(self.read_inputs(participant)?.burn)
    }
}

#[async_trait]
impl MultiplierSource for MemoryRegistry {
    async fn active_multiplier(&self, participant: ParticipantId) -> Result<Option<f64>> {
        Ok(self.multipliers.get(&participant).map(|m| *m))
    }
}

#[async_trait]
impl ReferralForest for MemoryRegistry {
    async fn inviter(&self, participant: ParticipantId) -> Result<Option<ParticipantId>> {
        self.forest
            .read()
            .inviter
            .get(&participant)
            .copied()
            .ok_or(TallyError::ParticipantNotFound(participant))
    }

    async fn direct_referrals(&self, participant: ParticipantId) -> Result<Vec<ParticipantId>> {
        Ok(self
            .forest
            .read()
            .children
            .get(&participant)
            .cloned()
            .unwrap_or_default())
    }

    async fn participants(&self) -> Result<Vec<ParticipantId>> {
        Ok(self.forest.read().order.clone())
    }
}
