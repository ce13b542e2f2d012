//! Shared simulation state and the access-checked view systems receive.
//!
//! Data that never changes during a tick (registry, entity set, process
//! lists, anatomy, colonies, biome) is plain data: a running tick only holds
//! `&World`, so it can only be changed between ticks.
//!
//! Data systems write during a tick lives behind one `RwLock` per
//! [`Resource`]. Locks are only ever taken with `try_read`/`try_write`: the
//! stage plan guarantees no two lanes touch the same resource in the same
//! stage, so a lock that would block means the plan is wrong and the access
//! fails with [`AccessError::Contended`] instead of waiting.

use crate::anatomy::{Anatomy, EnergyCosts, Motion};
use crate::colony::Colonies;
use crate::compound::{CompoundLedger, UsefulMarks};
use crate::energy::EnergyBalance;
use crate::environment::{BiomeConditions, VentQueue, VentSink};
use crate::fixed::{Fixed64, Ticks};
use crate::id::EntityId;
use crate::process::ProcessInstance;
use crate::registry::Registry;
use crate::sim::StateHash;
use slotmap::{SecondaryMap, SlotMap};
use std::collections::BTreeSet;
use std::sync::{
    Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};

// ---------------------------------------------------------------------------
// Resources and access declarations
// ---------------------------------------------------------------------------

/// A lock-guarded piece of per-tick world state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    Ledgers,
    Motion,
    EnergyCosts,
    EnergyBalances,
    UsefulMarks,
    VentQueue,
    VentSink,
}

/// The resources a system reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemAccess {
    reads: BTreeSet<Resource>,
    writes: BTreeSet<Resource>,
}

impl SystemAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(mut self, resource: Resource) -> Self {
        self.reads.insert(resource);
        self
    }

    pub fn writes(mut self, resource: Resource) -> Self {
        self.writes.insert(resource);
        self
    }

    pub fn may_read(&self, resource: Resource) -> bool {
        self.reads.contains(&resource) || self.writes.contains(&resource)
    }

    pub fn may_write(&self, resource: Resource) -> bool {
        self.writes.contains(&resource)
    }

    /// First resource written by one side and touched by the other.
    pub fn conflict_with(&self, other: &SystemAccess) -> Option<Resource> {
        self.writes
            .iter()
            .find(|r| other.may_read(**r))
            .or_else(|| other.writes.iter().find(|r| self.may_read(**r)))
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("system '{system}' did not declare {mode} access to {resource:?}")]
    Undeclared {
        system: String,
        resource: Resource,
        mode: &'static str,
    },
    #[error("{0:?} is held by the other lane")]
    Contended(Resource),
    #[error("{0:?} was poisoned by a panicking system")]
    Poisoned(Resource),
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// All simulation state.
#[derive(Debug)]
pub struct World {
    registry: Arc<Registry>,
    entities: SlotMap<EntityId, ()>,
    anatomy: SecondaryMap<EntityId, Anatomy>,
    processes: SecondaryMap<EntityId, Vec<ProcessInstance>>,
    pub(crate) colonies: Colonies,
    biome: Box<dyn BiomeConditions>,

    ledgers: RwLock<SecondaryMap<EntityId, CompoundLedger>>,
    motion: RwLock<SecondaryMap<EntityId, Motion>>,
    energy_costs: RwLock<SecondaryMap<EntityId, EnergyCosts>>,
    balances: RwLock<SecondaryMap<EntityId, EnergyBalance>>,
    useful: RwLock<SecondaryMap<EntityId, UsefulMarks>>,
    vent_queue: RwLock<VentQueue>,
    vent_sink: RwLock<Box<dyn VentSink>>,
}

fn at_rest<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn at_rest_mut<T>(lock: &mut RwLock<T>) -> &mut T {
    lock.get_mut().unwrap_or_else(PoisonError::into_inner)
}

impl World {
    pub fn new(
        registry: Arc<Registry>,
        biome: Box<dyn BiomeConditions>,
        vent_sink: Box<dyn VentSink>,
    ) -> Self {
        Self {
            registry,
            entities: SlotMap::with_key(),
            anatomy: SecondaryMap::new(),
            processes: SecondaryMap::new(),
            colonies: Colonies::new(),
            biome,
            ledgers: RwLock::new(SecondaryMap::new()),
            motion: RwLock::new(SecondaryMap::new()),
            energy_costs: RwLock::new(SecondaryMap::new()),
            balances: RwLock::new(SecondaryMap::new()),
            useful: RwLock::new(SecondaryMap::new()),
            vent_queue: RwLock::new(VentQueue::new()),
            vent_sink: RwLock::new(vent_sink),
        }
    }

    // -----------------------------------------------------------------------
    // Tick-static data
    // -----------------------------------------------------------------------

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_arc(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn biome(&self) -> &dyn BiomeConditions {
        self.biome.as_ref()
    }

    pub fn colonies(&self) -> &Colonies {
        &self.colonies
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.entities.contains_key(entity)
    }

    /// Entities in slot order.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn anatomy(&self, entity: EntityId) -> Option<&Anatomy> {
        self.anatomy.get(entity)
    }

    pub fn processes(&self, entity: EntityId) -> &[ProcessInstance] {
        self.processes
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Between-tick mutation
    // -----------------------------------------------------------------------

    /// Add an entity with an empty ledger sized from its anatomy.
    pub fn spawn(&mut self, anatomy: Anatomy) -> EntityId {
        let entity = self.entities.insert(());
        let seed = UsefulMarks::seeded(&self.registry);
        at_rest_mut(&mut self.ledgers).insert(entity, CompoundLedger::new(anatomy.capacity()));
        at_rest_mut(&mut self.motion).insert(entity, Motion::default());
        at_rest_mut(&mut self.energy_costs).insert(entity, EnergyCosts::default());
        at_rest_mut(&mut self.balances).insert(entity, EnergyBalance::summary());
        at_rest_mut(&mut self.useful).insert(entity, seed);
        self.anatomy.insert(entity, anatomy);
        self.processes.insert(entity, Vec::new());
        entity
    }

    /// Remove an entity and all its state. Colony membership must already
    /// have been dropped.
    pub fn despawn(&mut self, entity: EntityId) -> bool {
        if self.entities.remove(entity).is_none() {
            return false;
        }
        self.anatomy.remove(entity);
        self.processes.remove(entity);
        at_rest_mut(&mut self.ledgers).remove(entity);
        at_rest_mut(&mut self.motion).remove(entity);
        at_rest_mut(&mut self.energy_costs).remove(entity);
        at_rest_mut(&mut self.balances).remove(entity);
        at_rest_mut(&mut self.useful).remove(entity);
        true
    }

    /// Replace an entity's anatomy and resize its ledger.
    pub fn set_anatomy(&mut self, entity: EntityId, anatomy: Anatomy) -> bool {
        if !self.contains(entity) {
            return false;
        }
        if let Some(ledger) = at_rest_mut(&mut self.ledgers).get_mut(entity) {
            ledger.set_capacity(anatomy.capacity());
        }
        self.anatomy.insert(entity, anatomy);
        true
    }

    /// Replace an entity's process instances wholesale.
    pub fn set_processes(&mut self, entity: EntityId, processes: Vec<ProcessInstance>) -> bool {
        if !self.contains(entity) {
            return false;
        }
        self.processes.insert(entity, processes);
        true
    }

    pub fn ledgers_mut(&mut self) -> &mut SecondaryMap<EntityId, CompoundLedger> {
        at_rest_mut(&mut self.ledgers)
    }

    pub fn motion_mut(&mut self) -> &mut SecondaryMap<EntityId, Motion> {
        at_rest_mut(&mut self.motion)
    }

    pub fn balances_mut(&mut self) -> &mut SecondaryMap<EntityId, EnergyBalance> {
        at_rest_mut(&mut self.balances)
    }

    // -----------------------------------------------------------------------
    // Between-tick reads (copies)
    // -----------------------------------------------------------------------

    pub fn ledger(&self, entity: EntityId) -> Option<CompoundLedger> {
        at_rest(&self.ledgers).get(entity).cloned()
    }

    pub fn balance(&self, entity: EntityId) -> Option<EnergyBalance> {
        at_rest(&self.balances).get(entity).cloned()
    }

    pub fn useful(&self, entity: EntityId) -> Option<UsefulMarks> {
        at_rest(&self.useful).get(entity).cloned()
    }

    pub fn motion(&self, entity: EntityId) -> Option<Motion> {
        at_rest(&self.motion).get(entity).cloned()
    }

    /// Run `f` against the vent sink, e.g. to downcast it.
    pub fn with_vent_sink<R>(&self, f: impl FnOnce(&dyn VentSink) -> R) -> R {
        let sink = at_rest(&self.vent_sink);
        f(sink.as_ref())
    }

    /// Hash of the tick counter, every ledger and every energy balance.
    pub fn state_hash(&self, tick: Ticks) -> u64 {
        let mut hasher = StateHash::at_tick(tick);
        let ledgers = at_rest(&self.ledgers);
        let balances = at_rest(&self.balances);
        for entity in self.entities.keys() {
            if let Some(ledger) = ledgers.get(entity) {
                ledger.write_hash(&mut hasher);
            }
            if let Some(balance) = balances.get(entity) {
                balance.write_hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    // -----------------------------------------------------------------------
    // Tick access
    // -----------------------------------------------------------------------

    /// The view a system receives while it runs.
    pub fn context<'w>(
        &'w self,
        system: &'w str,
        access: &'w SystemAccess,
        delta: Fixed64,
        tick: Ticks,
    ) -> SystemContext<'w> {
        SystemContext {
            world: self,
            system,
            access,
            delta,
            tick,
        }
    }
}

// ---------------------------------------------------------------------------
// SystemContext
// ---------------------------------------------------------------------------

/// A system's window onto the world for one `update` call.
///
/// Tick-static data is always readable. Locked resources are reachable only
/// through the typed accessors, which enforce the system's declared
/// [`SystemAccess`].
pub struct SystemContext<'w> {
    world: &'w World,
    system: &'w str,
    access: &'w SystemAccess,
    /// Length of this step in seconds.
    pub delta: Fixed64,
    /// Index of the tick being run.
    pub tick: Ticks,
}

impl<'w> SystemContext<'w> {
    pub fn world(&self) -> &'w World {
        self.world
    }

    pub fn registry(&self) -> &'w Registry {
        &self.world.registry
    }

    pub fn system(&self) -> &str {
        self.system
    }

    fn read<T>(
        &self,
        resource: Resource,
        lock: &'w RwLock<T>,
    ) -> Result<RwLockReadGuard<'w, T>, AccessError> {
        if !self.access.may_read(resource) {
            return Err(self.undeclared(resource, "read"));
        }
        match lock.try_read() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(AccessError::Contended(resource)),
            Err(TryLockError::Poisoned(_)) => Err(AccessError::Poisoned(resource)),
        }
    }

    fn write<T>(
        &self,
        resource: Resource,
        lock: &'w RwLock<T>,
    ) -> Result<RwLockWriteGuard<'w, T>, AccessError> {
        if !self.access.may_write(resource) {
            return Err(self.undeclared(resource, "write"));
        }
        match lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(AccessError::Contended(resource)),
            Err(TryLockError::Poisoned(_)) => Err(AccessError::Poisoned(resource)),
        }
    }

    fn undeclared(&self, resource: Resource, mode: &'static str) -> AccessError {
        AccessError::Undeclared {
            system: self.system.to_string(),
            resource,
            mode,
        }
    }

    pub fn ledgers(&self) -> Result<RwLockReadGuard<'w, SecondaryMap<EntityId, CompoundLedger>>, AccessError> {
        self.read(Resource::Ledgers, &self.world.ledgers)
    }

    pub fn ledgers_mut(&self) -> Result<RwLockWriteGuard<'w, SecondaryMap<EntityId, CompoundLedger>>, AccessError> {
        self.write(Resource::Ledgers, &self.world.ledgers)
    }

    pub fn motion(&self) -> Result<RwLockReadGuard<'w, SecondaryMap<EntityId, Motion>>, AccessError> {
        self.read(Resource::Motion, &self.world.motion)
    }

    pub fn motion_mut(&self) -> Result<RwLockWriteGuard<'w, SecondaryMap<EntityId, Motion>>, AccessError> {
        self.write(Resource::Motion, &self.world.motion)
    }

    pub fn energy_costs(&self) -> Result<RwLockReadGuard<'w, SecondaryMap<EntityId, EnergyCosts>>, AccessError> {
        self.read(Resource::EnergyCosts, &self.world.energy_costs)
    }

    pub fn energy_costs_mut(&self) -> Result<RwLockWriteGuard<'w, SecondaryMap<EntityId, EnergyCosts>>, AccessError> {
        self.write(Resource::EnergyCosts, &self.world.energy_costs)
    }

    pub fn balances(&self) -> Result<RwLockReadGuard<'w, SecondaryMap<EntityId, EnergyBalance>>, AccessError> {
        self.read(Resource::EnergyBalances, &self.world.balances)
    }

    pub fn balances_mut(&self) -> Result<RwLockWriteGuard<'w, SecondaryMap<EntityId, EnergyBalance>>, AccessError> {
        self.write(Resource::EnergyBalances, &self.world.balances)
    }

    pub fn useful(&self) -> Result<RwLockReadGuard<'w, SecondaryMap<EntityId, UsefulMarks>>, AccessError> {
        self.read(Resource::UsefulMarks, &self.world.useful)
    }

    pub fn useful_mut(&self) -> Result<RwLockWriteGuard<'w, SecondaryMap<EntityId, UsefulMarks>>, AccessError> {
        self.write(Resource::UsefulMarks, &self.world.useful)
    }

    pub fn vent_queue(&self) -> Result<RwLockReadGuard<'w, VentQueue>, AccessError> {
        self.read(Resource::VentQueue, &self.world.vent_queue)
    }

    pub fn vent_queue_mut(&self) -> Result<RwLockWriteGuard<'w, VentQueue>, AccessError> {
        self.write(Resource::VentQueue, &self.world.vent_queue)
    }

    pub fn vent_sink(&self) -> Result<RwLockReadGuard<'w, Box<dyn VentSink>>, AccessError> {
        self.read(Resource::VentSink, &self.world.vent_sink)
    }

    pub fn vent_sink_mut(&self) -> Result<RwLockWriteGuard<'w, Box<dyn VentSink>>, AccessError> {
        self.write(Resource::VentSink, &self.world.vent_sink)
    }
}
