//! Stake-weighted validator registry
//!
//! Entries below the minimum stake stay in the registry for audit but are
//! never selected into a committee.

use dashmap::DashMap;
use serde::Serialize;

use crate::error::{Result, SdupiError};
use crate::types::{Timestamp, ValidatorId, now_millis};

/// Validator stake entry
#[derive(Debug, Clone, Serialize)]
pub struct ValidatorEntry {
    pub id: ValidatorId,
    pub stake: u64,
    pub active: bool,
    pub updated_at: Timestamp,
}

/// Registry of validator stakes, read-shared by the ledger and the engine
pub struct ValidatorRegistry {
    min_stake: u64,
    validators: DashMap<ValidatorId, ValidatorEntry>,
}

impl ValidatorRegistry {
    pub fn new(min_stake: u64) -> Self {
        Self {
            min_stake,
            validators: DashMap::new(),
        }
    }

    pub fn min_stake(&self) -> u64 {
        self.min_stake
    }

    /// Insert or replace a validator's stake
    pub fn upsert(&self, id: ValidatorId, stake: u64) -> ValidatorEntry {
        let active = stake >= self.min_stake;
        let entry = ValidatorEntry {
            id,
            stake,
            active,
            updated_at: now_millis(),
        };
        self.validators.insert(id, entry.clone());
        tracing::debug!("Validator {} stake set to {} (active: {})", id.short(), stake, active);
        entry
    }

    /// Apply a signed stake-change event.
    ///
    /// The entry lock is held across the read-modify-write, so updates to a
    /// single validator serialize.
    pub fn adjust_stake(&self, id: ValidatorId, delta: i64) -> Result<ValidatorEntry> {
        if delta < 0 && !self.validators.contains_key(&id) {
            return Err(SdupiError::InvalidStake {
                validator: id,
                reason: format!("negative delta {} for unregistered validator", delta),
            });
        }

        let min_stake = self.min_stake;
        let mut entry = self.validators.entry(id).or_insert_with(|| ValidatorEntry {
            id,
            stake: 0,
            active: false,
            updated_at: now_millis(),
        });

        let new_stake = i128::from(entry.stake) + i128::from(delta);
        if new_stake < 0 {
            return Err(SdupiError::InvalidStake {
                validator: id,
                reason: format!("stake {} with delta {} would go negative", entry.stake, delta),
            });
        }
        let new_stake = u64::try_from(new_stake).map_err(|_| SdupiError::InvalidStake {
            validator: id,
            reason: "stake overflows u64".to_string(),
        })?;

        entry.stake = new_stake;
        entry.active = new_stake >= min_stake;
        entry.updated_at = now_millis();
        Ok(entry.clone())
    }

    pub fn get(&self, id: &ValidatorId) -> Option<ValidatorEntry> {
        self.validators.get(id).map(|v| v.clone())
    }

    /// Current stake of a validator, active or not
    pub fn stake_of(&self, id: &ValidatorId) -> Option<u64> {
        self.validators.get(id).map(|v| v.stake)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.validators.iter().filter(|v| v.active).count()
    }

    /// Up to `max_size` active validators, stake descending, ties by id ascending
    pub fn select_committee(&self, max_size: usize) -> Vec<ValidatorEntry> {
        let mut validators: Vec<ValidatorEntry> = self
            .validators
            .iter()
            .filter(|v| v.active)
            .map(|v| v.value().clone())
            .collect();

        validators.sort_by(|a, b| b.stake.cmp(&a.stake).then_with(|| a.id.cmp(&b.id)));
        validators.truncate(max_size);

        validators
    }

    /// Sum of active stakes
    pub fn total_active_weight(&self) -> u128 {
        self.validators
            .iter()
            .filter(|v| v.active)
            .map(|v| u128::from(v.stake))
            .sum()
    }
}
