//! Capacity-bounded compound storage.
//!
//! A [`CompoundLedger`] holds amounts of any number of compounds under one
//! shared per-compound capacity. Which compounds count as *useful* this tick
//! is not ledger state: it lives in a separate [`UsefulMarks`] set produced
//! by the process engine and cleared at the start of every tick.
//!
//! Both a single ledger and a colony's composite view implement
//! [`CompoundStore`], the seam the process engine runs against.

use crate::fixed::Fixed64;
use crate::id::CompoundId;
use crate::registry::Registry;
use crate::sim::{Record, StateHash};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// CompoundStore
// ---------------------------------------------------------------------------

/// Storage the process engine and upkeep systems can draw from and deposit
/// into.
pub trait CompoundStore {
    /// Stored amount of `compound`, zero if absent.
    fn amount(&self, compound: CompoundId) -> Fixed64;

    /// Deposit up to `amount`, returning how much was absorbed.
    fn add(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64;

    /// Withdraw up to `amount`, returning how much was removed.
    fn take(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64;

    /// Capacity that counts towards `compound` given this tick's marks.
    fn capacity_for(&self, compound: CompoundId, marks: &UsefulMarks) -> Fixed64;

    /// Reset any negative amount to zero.
    fn clamp_negative(&mut self);
}

// ---------------------------------------------------------------------------
// CompoundLedger
// ---------------------------------------------------------------------------

/// Per-entity compound storage with a uniform per-compound capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundLedger {
    capacity: Fixed64,
    amounts: BTreeMap<CompoundId, Fixed64>,
}

impl CompoundLedger {
    /// Create an empty ledger. Negative capacities are treated as zero.
    pub fn new(capacity: Fixed64) -> Self {
        Self {
            capacity: capacity.max(Fixed64::ZERO),
            amounts: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> Fixed64 {
        self.capacity
    }

    /// Change the capacity. Amounts are left untouched, so a shrink can leave
    /// compounds above capacity until the venting stage removes the excess.
    pub fn set_capacity(&mut self, capacity: Fixed64) {
        self.capacity = capacity.max(Fixed64::ZERO);
    }

    pub fn amount(&self, compound: CompoundId) -> Fixed64 {
        self.amounts.get(&compound).copied().unwrap_or(Fixed64::ZERO)
    }

    /// Add up to `amount`, bounded by the free space under capacity.
    /// Returns the amount actually absorbed.
    #[must_use = "the unabsorbed remainder must be vented or discarded explicitly"]
    pub fn add(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64 {
        if amount <= Fixed64::ZERO {
            return Fixed64::ZERO;
        }
        let current = self.amount(compound);
        let space = (self.capacity - current).max(Fixed64::ZERO);
        let absorbed = amount.min(space);
        if absorbed > Fixed64::ZERO {
            self.amounts.insert(compound, current + absorbed);
        }
        absorbed
    }

    /// Remove up to `amount`. Returns the amount actually removed.
    #[must_use = "returns the amount actually removed, which may be less than requested"]
    pub fn take(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64 {
        if amount <= Fixed64::ZERO {
            return Fixed64::ZERO;
        }
        let Some(current) = self.amounts.get_mut(&compound) else {
            return Fixed64::ZERO;
        };
        let removed = amount.min((*current).max(Fixed64::ZERO));
        *current -= removed;
        removed
    }

    /// Full capacity for useful compounds, zero for everything else.
    pub fn capacity_for(&self, compound: CompoundId, marks: &UsefulMarks) -> Fixed64 {
        if marks.is_useful(compound) {
            self.capacity
        } else {
            Fixed64::ZERO
        }
    }

    /// Overwrite a stored amount without any capacity check.
    pub fn set_amount(&mut self, compound: CompoundId, amount: Fixed64) {
        self.amounts.insert(compound, amount);
    }

    pub fn clamp_negative(&mut self) {
        for amount in self.amounts.values_mut() {
            if *amount < Fixed64::ZERO {
                *amount = Fixed64::ZERO;
            }
        }
    }

    /// How far `compound` sits above the plain capacity.
    pub fn excess_over_capacity(&self, compound: CompoundId) -> Fixed64 {
        (self.amount(compound) - self.capacity).max(Fixed64::ZERO)
    }

    /// Stored compounds in id order, including zero entries.
    pub fn iter(&self) -> impl Iterator<Item = (CompoundId, Fixed64)> + '_ {
        self.amounts.iter().map(|(&c, &a)| (c, a))
    }

    /// Sum of all stored amounts.
    pub fn total(&self) -> Fixed64 {
        self.amounts.values().fold(Fixed64::ZERO, |acc, &a| acc + a)
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.values().all(|a| *a == Fixed64::ZERO)
    }

    pub(crate) fn write_hash(&self, hasher: &mut StateHash) {
        hasher.record(Record::Ledger);
        hasher.amount(self.capacity);
        for (&compound, &amount) in &self.amounts {
            hasher.held(compound, amount);
        }
    }
}

impl CompoundStore for CompoundLedger {
    fn amount(&self, compound: CompoundId) -> Fixed64 {
        CompoundLedger::amount(self, compound)
    }

    fn add(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64 {
        CompoundLedger::add(self, compound, amount)
    }

    fn take(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64 {
        CompoundLedger::take(self, compound, amount)
    }

    fn capacity_for(&self, compound: CompoundId, marks: &UsefulMarks) -> Fixed64 {
        CompoundLedger::capacity_for(self, compound, marks)
    }

    fn clamp_negative(&mut self) {
        CompoundLedger::clamp_negative(self)
    }
}

// ---------------------------------------------------------------------------
// UsefulMarks
// ---------------------------------------------------------------------------

/// Compounds that counted as useful during the current tick.
///
/// Always-useful compounds from the registry are part of the seed and survive
/// [`clear`](Self::clear).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsefulMarks {
    seed: BTreeSet<CompoundId>,
    marked: BTreeSet<CompoundId>,
}

impl UsefulMarks {
    /// Marks pre-populated with the registry's always-useful compounds.
    pub fn seeded(registry: &Registry) -> Self {
        let seed: BTreeSet<_> = registry.compounds_where(|f| f.always_useful).collect();
        Self {
            marked: seed.clone(),
            seed,
        }
    }

    pub fn mark(&mut self, compound: CompoundId) {
        self.marked.insert(compound);
    }

    /// Drop every mark except the seed.
    pub fn clear(&mut self) {
        self.marked.clone_from(&self.seed);
    }

    pub fn is_useful(&self, compound: CompoundId) -> bool {
        self.marked.contains(&compound)
    }

    pub fn iter(&self) -> impl Iterator<Item = CompoundId> + '_ {
        self.marked.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.marked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
