//! In-memory balance ledger
//!
//! Stands in for the shared balance subsystem in tests, simulations and
//! single-process deployments. Accounts can be frozen to make credits fail.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use tally_core::{Amount, AssetId, BalanceLedger, ParticipantId, Result, TallyError};

/// Balances keyed by participant and asset
#[derive(Default)]
pub struct MemoryLedger {
    assets: HashMap<String, AssetId>,
    balances: DashMap<(ParticipantId, AssetId), Amount>,
    frozen: DashSet<ParticipantId>,
}

impl MemoryLedger {
    /// Ledger that knows the given asset symbols
    pub fn with_assets(symbols: &[&str]) -> Self {
        Self {
            assets: symbols
                .iter()
                .map(|s| (s.to_string(), AssetId::generate()))
                .collect(),
            ..Self::default()
        }
    }

    /// Reject every credit and debit for `participant`
    pub fn freeze(&self, participant: ParticipantId) {
        self.frozen.insert(participant);
    }

    pub fn unfreeze(&self, participant: ParticipantId) {
        self.frozen.remove(&participant);
    }

    /// Synchronous balance lookup by asset id
    pub fn balance_of(&self, participant: ParticipantId, asset: AssetId) -> Amount {
        self.balances
            .get(&(participant, asset))
            .map(|b| *b)
            .unwrap_or(0)
    }

    fn check_frozen(&self, participant: ParticipantId) -> Result<()> {
        if self.frozen.contains(&participant) {
            return Err(TallyError::Ledger(format!("account {participant} is frozen")));
        }
        Ok(())
    }

    fn check_asset(&self, asset: AssetId) -> Result<()> {
        if self.assets.values().any(|a| *a == asset) {
            Ok(())
        } else {
            Err(TallyError::AssetNotFound(asset.to_string()))
        }
    }
}

#[async_trait]
impl BalanceLedger for MemoryLedger {
    async fn resolve_asset(&self, symbol: &str) -> Result<AssetId> {
        self.assets
            .get(symbol)
            .copied()
            .ok_or_else(|| TallyError::AssetNotFound(symbol.to_string()))
    }

    async fn credit(&self, participant: ParticipantId, asset: AssetId, amount: Amount) -> Result<()> {
        self.check_asset(asset)?;
        self.check_frozen(participant)?;

        let mut balance = self.balances.entry((participant, asset)).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| TallyError::Ledger("balance overflow".into()))?;
        Ok(())
    }

    async fn debit(&self, participant: ParticipantId, asset: AssetId, amount: Amount) -> Result<()> {
        self.check_asset(asset)?;
        self.check_frozen(participant)?;

        let mut balance = self.balances.entry((participant, asset)).or_insert(0);
        if *balance < amount {
            return Err(TallyError::Ledger(format!(
                "insufficient balance: have {}, need {}",
                *balance, amount
            )));
        }
        *balance -= amount;
        Ok(())
    }

    async fn balance(&self, participant: ParticipantId, symbol: &str) -> Result<Amount> {
        let asset = self.resolve_asset(symbol).await?;
        Ok(self.balance_of(participant, asset))
    }
}
