//! Collaborators outside the compound economy: the biome an entity lives in
//! and the world-side sink that receives vented compounds.

use crate::fixed::Fixed64;
use crate::id::{CompoundId, EntityId};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Biome conditions
// ---------------------------------------------------------------------------

/// Ambient compound levels around the simulated entities.
///
/// Environmental compounds (temperature, light, dissolved gases) are read
/// from here instead of a ledger. Cloud compounds are absorbed from here.
pub trait BiomeConditions: Send + Sync + std::fmt::Debug {
    /// Ambient level of `compound`. Zero when the biome has none.
    fn ambient(&self, compound: CompoundId) -> Fixed64;
}

/// A biome with the same ambient levels everywhere.
#[derive(Debug, Clone, Default)]
pub struct UniformBiome {
    levels: BTreeMap<CompoundId, Fixed64>,
}

impl UniformBiome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, compound: CompoundId, level: Fixed64) -> Self {
        self.set(compound, level);
        self
    }

    pub fn set(&mut self, compound: CompoundId, level: Fixed64) {
        self.levels.insert(compound, level);
    }
}

impl BiomeConditions for UniformBiome {
    fn ambient(&self, compound: CompoundId) -> Fixed64 {
        self.levels.get(&compound).copied().unwrap_or(Fixed64::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Venting
// ---------------------------------------------------------------------------

/// One vented (or overflowed) quantity of a compound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VentRecord {
    pub entity: EntityId,
    pub compound: CompoundId,
    pub amount: Fixed64,
}

/// Vent records collected during a tick, discharged in the last stage.
#[derive(Debug, Clone, Default)]
pub struct VentQueue {
    pending: Vec<VentRecord>,
}

impl VentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a record. Non-positive amounts are dropped.
    pub fn push(&mut self, entity: EntityId, compound: CompoundId, amount: Fixed64) {
        if amount > Fixed64::ZERO {
            self.pending.push(VentRecord {
                entity,
                compound,
                amount,
            });
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = VentRecord> + '_ {
        self.pending.drain(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VentRecord> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Receiver for compounds leaving entities (spawned clouds in a full game).
pub trait VentSink: Send + Sync + std::fmt::Debug {
    fn vent(&mut self, entity: EntityId, compound: CompoundId, amount: Fixed64);

    /// Downcast to `&dyn Any` for type-safe access to concrete sink types.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A sink that only keeps running totals per compound.
#[derive(Debug, Clone, Default)]
pub struct VentTally {
    totals: BTreeMap<CompoundId, Fixed64>,
    records: u64,
}

impl VentTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, compound: CompoundId) -> Fixed64 {
        self.totals.get(&compound).copied().unwrap_or(Fixed64::ZERO)
    }

    /// Number of vent calls received.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn totals(&self) -> impl Iterator<Item = (CompoundId, Fixed64)> + '_ {
        self.totals.iter().map(|(&c, &a)| (c, a))
    }
}

impl VentSink for VentTally {
    fn vent(&mut self, _entity: EntityId, compound: CompoundId, amount: Fixed64) {
        *self.totals.entry(compound).or_default() += amount;
        self.records += 1;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
