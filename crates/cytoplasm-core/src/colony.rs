//! Colonies: groups of entities that pool their compounds.
//!
//! Colony membership is kept in an arena ([`Colonies`]) keyed by
//! [`ColonyId`], with a reverse index from member to colony. Entities hold
//! no pointer to their colony. The first member is the master.
//!
//! A [`ColonyLedger`] is a borrowed view that makes the members' ledgers act
//! as one store for the process engine and for upkeep.

use crate::compound::{CompoundLedger, CompoundStore, UsefulMarks};
use crate::fixed::{Fixed64, checked_div_64};
use crate::id::{ColonyId, CompoundId, EntityId};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::{BTreeMap, HashSet};

// ---------------------------------------------------------------------------
// Colony arena
// ---------------------------------------------------------------------------

/// A colony of two or more entities. `members[0]` is the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Colony {
    members: Vec<EntityId>,
}

impl Colony {
    pub fn master(&self) -> EntityId {
        self.members[0]
    }

    pub fn members(&self) -> &[EntityId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.members.contains(&entity)
    }
}

/// What happened to a colony when a member left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRemoval {
    /// The member left and the colony continues.
    Left(ColonyId),
    /// The colony fell apart; every former member is now free.
    Disbanded {
        colony: ColonyId,
        members: Vec<EntityId>,
    },
}

/// Arena of colonies plus the member → colony index.
#[derive(Debug, Clone, Default)]
pub struct Colonies {
    colonies: SlotMap<ColonyId, Colony>,
    membership: SecondaryMap<EntityId, ColonyId>,
}

impl Colonies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Form a colony with `master` first, followed by `others` in order.
    pub fn form(&mut self, master: EntityId, others: &[EntityId]) -> Result<ColonyId, ColonyError> {
        if others.is_empty() {
            return Err(ColonyError::TooFewMembers);
        }
        let mut seen = HashSet::new();
        for &entity in std::iter::once(&master).chain(others) {
            if !seen.insert(entity) {
                return Err(ColonyError::DuplicateMember(entity));
            }
            if self.membership.contains_key(entity) {
                return Err(ColonyError::AlreadyInColony(entity));
            }
        }

        let mut members = Vec::with_capacity(others.len() + 1);
        members.push(master);
        members.extend_from_slice(others);
        let id = self.colonies.insert(Colony { members });
        for &entity in std::iter::once(&master).chain(others) {
            self.membership.insert(entity, id);
        }
        Ok(id)
    }

    pub fn add_member(&mut self, colony: ColonyId, entity: EntityId) -> Result<(), ColonyError> {
        if self.membership.contains_key(entity) {
            return Err(ColonyError::AlreadyInColony(entity));
        }
        let c = self
            .colonies
            .get_mut(colony)
            .ok_or(ColonyError::UnknownColony(colony))?;
        c.members.push(entity);
        self.membership.insert(entity, colony);
        Ok(())
    }

    /// Remove `entity` from its colony. Removing the master, or leaving a
    /// single member behind, disbands the colony.
    pub fn remove_member(&mut self, entity: EntityId) -> Result<MemberRemoval, ColonyError> {
        let colony = self
            .membership
            .get(entity)
            .copied()
            .ok_or(ColonyError::NotInColony(entity))?;
        let c = self
            .colonies
            .get_mut(colony)
            .ok_or(ColonyError::UnknownColony(colony))?;

        if c.master() == entity || c.len() <= 2 {
            let members = self.disband(colony)?;
            tracing::warn!(?colony, ?entity, "colony disbanded after member removal");
            return Ok(MemberRemoval::Disbanded { colony, members });
        }

        c.members.retain(|&m| m != entity);
        self.membership.remove(entity);
        Ok(MemberRemoval::Left(colony))
    }

    /// Dissolve a colony, returning its former members.
    pub fn disband(&mut self, colony: ColonyId) -> Result<Vec<EntityId>, ColonyError> {
        let c = self
            .colonies
            .remove(colony)
            .ok_or(ColonyError::UnknownColony(colony))?;
        for &member in &c.members {
            self.membership.remove(member);
        }
        Ok(c.members)
    }

    pub fn colony_of(&self, entity: EntityId) -> Option<ColonyId> {
        self.membership.get(entity).copied()
    }

    pub fn get(&self, colony: ColonyId) -> Option<&Colony> {
        self.colonies.get(colony)
    }

    pub fn members(&self, colony: ColonyId) -> Option<&[EntityId]> {
        self.colonies.get(colony).map(Colony::members)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ColonyId, &Colony)> {
        self.colonies.iter()
    }

    pub fn len(&self) -> usize {
        self.colonies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colonies.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ColonyLedger
// ---------------------------------------------------------------------------

/// The members' ledgers viewed as one store, in member order.
///
/// Members without a ledger are skipped.
#[derive(Debug)]
pub struct ColonyLedger<'a> {
    members: &'a [EntityId],
    ledgers: &'a mut SecondaryMap<EntityId, CompoundLedger>,
}

impl<'a> ColonyLedger<'a> {
    pub fn new(members: &'a [EntityId], ledgers: &'a mut SecondaryMap<EntityId, CompoundLedger>) -> Self {
        Self { members, ledgers }
    }

    fn each(&self) -> impl Iterator<Item = &CompoundLedger> + '_ {
        self.members.iter().filter_map(|&m| self.ledgers.get(m))
    }

    pub fn amount(&self, compound: CompoundId) -> Fixed64 {
        self.each()
            .fold(Fixed64::ZERO, |acc, l| acc + l.amount(compound))
    }

    pub fn capacity_for(&self, compound: CompoundId, marks: &UsefulMarks) -> Fixed64 {
        self.each()
            .fold(Fixed64::ZERO, |acc, l| acc + l.capacity_for(compound, marks))
    }

    /// Sum of the members' plain capacities.
    pub fn capacity(&self) -> Fixed64 {
        self.each().fold(Fixed64::ZERO, |acc, l| acc + l.capacity())
    }

    /// Fill members in order until `amount` is absorbed or all are full.
    pub fn add(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64 {
        let mut remaining = amount;
        for &member in self.members {
            if remaining <= Fixed64::ZERO {
                break;
            }
            if let Some(ledger) = self.ledgers.get_mut(member) {
                remaining -= ledger.add(compound, remaining);
            }
        }
        (amount - remaining).max(Fixed64::ZERO)
    }

    /// Drain members in order until `amount` is removed or all are empty.
    pub fn take(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64 {
        let mut remaining = amount;
        for &member in self.members {
            if remaining <= Fixed64::ZERO {
                break;
            }
            if let Some(ledger) = self.ledgers.get_mut(member) {
                remaining -= ledger.take(compound, remaining);
            }
        }
        (amount - remaining).max(Fixed64::ZERO)
    }

    pub fn clamp_negative(&mut self) {
        for &member in self.members {
            if let Some(ledger) = self.ledgers.get_mut(member) {
                ledger.clamp_negative();
            }
        }
    }

    /// Every compound held by any member, summed, in compound id order.
    pub fn iter(&self) -> impl Iterator<Item = (CompoundId, Fixed64)> {
        let mut totals: BTreeMap<CompoundId, Fixed64> = BTreeMap::new();
        for ledger in self.each() {
            for (compound, amount) in ledger.iter() {
                *totals.entry(compound).or_default() += amount;
            }
        }
        totals.into_iter()
    }

    /// Even out every distributable compound so that each member holds the
    /// same fraction of its own useful capacity.
    ///
    /// Runs one pass per compound: surpluses are taken into a pool first,
    /// then deficits are filled from it in member order. Whatever the pool
    /// cannot place goes back to the members it was taken from, even above
    /// their capacity, so the colony total never changes. Any over-capacity
    /// amount is left for the venting stage.
    pub fn distribute_surplus(&mut self, registry: &Registry, marks: &UsefulMarks) {
        for compound in registry.compounds_where(|f| f.distributable) {
            let total_capacity = self.capacity_for(compound, marks);
            if total_capacity <= Fixed64::ZERO {
                continue;
            }
            let total = self.amount(compound);
            let Some(ratio) = checked_div_64(total, total_capacity) else {
                continue;
            };
            let target_for = |capacity: Fixed64| {
                total
                    .checked_mul(capacity)
                    .and_then(|scaled| checked_div_64(scaled, total_capacity))
                    .unwrap_or_else(|| ratio.saturating_mul(capacity))
            };

            let mut pool = Fixed64::ZERO;
            let mut donors = Vec::new();
            let mut deficits = Vec::new();
            for &member in self.members {
                let Some(ledger) = self.ledgers.get_mut(member) else {
                    continue;
                };
                let target = target_for(ledger.capacity_for(compound, marks));
                let current = ledger.amount(compound);
                if current > target {
                    let taken = ledger.take(compound, current - target);
                    pool += taken;
                    donors.push((member, taken));
                } else if current < target {
                    deficits.push((member, target - current));
                }
            }

            for (member, deficit) in deficits {
                if pool <= Fixed64::ZERO {
                    break;
                }
                if let Some(ledger) = self.ledgers.get_mut(member) {
                    pool -= ledger.add(compound, deficit.min(pool));
                }
            }

            // Pool never exceeds the sum taken, so donors can absorb it all.
            for (member, taken) in donors {
                if pool <= Fixed64::ZERO {
                    break;
                }
                if let Some(ledger) = self.ledgers.get_mut(member) {
                    let back = taken.min(pool);
                    ledger.set_amount(compound, ledger.amount(compound) + back);
                    pool -= back;
                }
            }
        }
    }
}

impl CompoundStore for ColonyLedger<'_> {
    fn amount(&self, compound: CompoundId) -> Fixed64 {
        ColonyLedger::amount(self, compound)
    }

    fn add(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64 {
        ColonyLedger::add(self, compound, amount)
    }

    fn take(&mut self, compound: CompoundId, amount: Fixed64) -> Fixed64 {
        ColonyLedger::take(self, compound, amount)
    }

    fn capacity_for(&self, compound: CompoundId, marks: &UsefulMarks) -> Fixed64 {
        ColonyLedger::capacity_for(self, compound, marks)
    }

    fn clamp_negative(&mut self) {
        ColonyLedger::clamp_negative(self)
    }
}

// ---------------------------------------------------------------------------
// ColonyError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ColonyError {
    #[error("a colony needs at least two members")]
    TooFewMembers,
    #[error("entity {0:?} listed twice")]
    DuplicateMember(EntityId),
    #[error("entity {0:?} is already in a colony")]
    AlreadyInColony(EntityId),
    #[error("entity {0:?} is not in a colony")]
    NotInColony(EntityId),
    #[error("unknown colony {0:?}")]
    UnknownColony(ColonyId),
    #[error("unknown entity {0:?}")]
    UnknownEntity(EntityId),
}

// ===========================================================================
// Tests
// ===========================================================================
