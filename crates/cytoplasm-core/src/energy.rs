//! Per-entity energy accounting for one tick.
//!
//! Processes, osmoregulation and movement report into an [`EnergyBalance`];
//! every mutator recomputes the derived totals immediately so that readers
//! never see a stale balance. Balances are rebuilt from scratch every tick.

use crate::fixed::Fixed64;
use crate::id::CompoundId;
use crate::sim::{Record, StateHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Itemized label for osmoregulation cost.
pub const OSMOREGULATION_LABEL: &str = "osmoregulation";
/// Itemized label for the hex-count movement cost.
pub const BASE_MOVEMENT_LABEL: &str = "base_movement";
/// Itemized label for flagella movement cost.
pub const FLAGELLA_LABEL: &str = "flagella";
/// Itemized label for cilia movement cost.
pub const CILIA_LABEL: &str = "cilia";

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

/// Scalar energy figures. Fields after `process_consumption` are derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyTotals {
    pub base_movement: Fixed64,
    pub flagella_movement: Fixed64,
    pub cilia_movement: Fixed64,
    pub osmoregulation: Fixed64,
    /// Sum of all process consumption entries.
    pub process_consumption: Fixed64,
    pub total_production: Fixed64,

    pub total_movement: Fixed64,
    pub total_consumption_stationary: Fixed64,
    pub total_consumption: Fixed64,
    pub final_balance: Fixed64,
    pub final_balance_stationary: Fixed64,
}

impl EnergyTotals {
    fn recompute(&mut self) {
        self.total_movement = self.base_movement + self.flagella_movement + self.cilia_movement;
        self.total_consumption_stationary = self.process_consumption + self.osmoregulation;
        self.total_consumption = self.total_consumption_stationary + self.total_movement;
        self.final_balance = self.total_production - self.total_consumption;
        self.final_balance_stationary = self.total_production - self.total_consumption_stationary;
    }
}

/// Per-label breakdown kept by the itemized variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyItemization {
    pub consumption: BTreeMap<String, Fixed64>,
    pub production: BTreeMap<String, Fixed64>,
    /// Stored compounds each production label consumed, when tracked.
    pub production_requirements: Option<BTreeMap<String, BTreeMap<CompoundId, Fixed64>>>,
}

// ---------------------------------------------------------------------------
// EnergyBalance
// ---------------------------------------------------------------------------

/// Energy balance of one entity for the current tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyBalance {
    /// Totals only.
    Summary(EnergyTotals),
    /// Totals plus a per-label breakdown, for inspection tooling.
    Itemized {
        totals: EnergyTotals,
        items: EnergyItemization,
    },
}

impl Default for EnergyBalance {
    fn default() -> Self {
        Self::summary()
    }
}

impl EnergyBalance {
    pub fn summary() -> Self {
        Self::Summary(EnergyTotals::default())
    }

    /// An itemized balance. `track_requirements` enables the per-production
    /// record of consumed input compounds.
    pub fn itemized(track_requirements: bool) -> Self {
        Self::Itemized {
            totals: EnergyTotals::default(),
            items: EnergyItemization {
                production_requirements: track_requirements.then(BTreeMap::new),
                ..Default::default()
            },
        }
    }

    pub fn is_itemized(&self) -> bool {
        matches!(self, Self::Itemized { .. })
    }

    pub fn totals(&self) -> &EnergyTotals {
        match self {
            Self::Summary(totals) | Self::Itemized { totals, .. } => totals,
        }
    }

    pub fn itemization(&self) -> Option<&EnergyItemization> {
        match self {
            Self::Summary(_) => None,
            Self::Itemized { items, .. } => Some(items),
        }
    }

    fn parts_mut(&mut self) -> (&mut EnergyTotals, Option<&mut EnergyItemization>) {
        match self {
            Self::Summary(totals) => (totals, None),
            Self::Itemized { totals, items } => (totals, Some(items)),
        }
    }

    /// Record energy consumed by a process.
    pub fn add_consumption(&mut self, label: &str, amount: Fixed64) {
        let (totals, items) = self.parts_mut();
        totals.process_consumption += amount;
        if let Some(items) = items {
            *items.consumption.entry(label.to_string()).or_default() += amount;
        }
        totals.recompute();
    }

    /// Record energy produced by a process, with the stored inputs it used.
    pub fn add_production(
        &mut self,
        label: &str,
        amount: Fixed64,
        required: &[(CompoundId, Fixed64)],
    ) {
        let (totals, items) = self.parts_mut();
        totals.total_production += amount;
        if let Some(items) = items {
            *items.production.entry(label.to_string()).or_default() += amount;
            if let Some(requirements) = items.production_requirements.as_mut() {
                let entry = requirements.entry(label.to_string()).or_default();
                for &(compound, used) in required {
                    *entry.entry(compound).or_default() += used;
                }
            }
        }
        totals.recompute();
    }

    /// Replace this tick's movement costs.
    pub fn set_movement(&mut self, base: Fixed64, flagella: Fixed64, cilia: Fixed64) {
        let (totals, items) = self.parts_mut();
        totals.base_movement = base;
        totals.flagella_movement = flagella;
        totals.cilia_movement = cilia;
        if let Some(items) = items {
            items.consumption.insert(BASE_MOVEMENT_LABEL.to_string(), base);
            items.consumption.insert(FLAGELLA_LABEL.to_string(), flagella);
            items.consumption.insert(CILIA_LABEL.to_string(), cilia);
        }
        totals.recompute();
    }

    /// Replace this tick's osmoregulation cost.
    pub fn set_osmoregulation(&mut self, cost: Fixed64) {
        let (totals, items) = self.parts_mut();
        totals.osmoregulation = cost;
        if let Some(items) = items {
            items
                .consumption
                .insert(OSMOREGULATION_LABEL.to_string(), cost);
        }
        totals.recompute();
    }

    /// Zero everything, keeping the variant and requirement tracking.
    pub fn reset(&mut self) {
        let (totals, items) = self.parts_mut();
        *totals = EnergyTotals::default();
        if let Some(items) = items {
            items.consumption.clear();
            items.production.clear();
            if let Some(requirements) = items.production_requirements.as_mut() {
                requirements.clear();
            }
        }
    }

    pub fn final_balance(&self) -> Fixed64 {
        self.totals().final_balance
    }

    pub fn total_production(&self) -> Fixed64 {
        self.totals().total_production
    }

    pub fn total_consumption(&self) -> Fixed64 {
        self.totals().total_consumption
    }

    pub(crate) fn write_hash(&self, hasher: &mut StateHash) {
        hasher.record(Record::Balance);
        let t = self.totals();
        for v in [
            t.base_movement,
            t.flagella_movement,
            t.cilia_movement,
            t.osmoregulation,
            t.process_consumption,
            t.total_production,
        ] {
            hasher.amount(v);
        }
    }
}
