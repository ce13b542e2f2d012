//! The simulation: world, scheduler and stepping state in one place.
//!
//! Everything that changes structure (spawning, colonies, process lists,
//! anatomy) takes `&mut self` and therefore happens between ticks. A tick
//! only ever sees `&World`.

use crate::anatomy::{Anatomy, Motion};
use crate::colony::{ColonyError, Colonies, MemberRemoval};
use crate::compound::{CompoundLedger, UsefulMarks};
use crate::config::{ConfigError, ExecutionMode, SimulationConfig};
use crate::energy::EnergyBalance;
use crate::environment::{BiomeConditions, VentSink};
use crate::fixed::{Fixed64, Ticks};
use crate::id::{ColonyId, CompoundId, EntityId};
use crate::process::ProcessInstance;
use crate::registry::Registry;
use crate::scheduler::{ExecutionPath, PlanError, Scheduler, SchedulerError, StagePlan};
use crate::sim::{AdvanceResult, SimState};
use crate::systems::default_plan;
use crate::world::World;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Colony(#[from] ColonyError),
    #[error("unknown entity {0:?}")]
    UnknownEntity(EntityId),
    #[error("simulation halted after a failed tick")]
    Halted,
}

/// A running cell simulation.
#[derive(Debug)]
pub struct Simulation {
    world: World,
    scheduler: Scheduler,
    config: SimulationConfig,
    timestep: Fixed64,
    sim_state: SimState,
    halted: bool,
}

impl Simulation {
    /// Create a simulation running the default plan.
    pub fn new(
        registry: Arc<Registry>,
        biome: Box<dyn BiomeConditions>,
        vent_sink: Box<dyn VentSink>,
        config: SimulationConfig,
    ) -> Result<Self, SimError> {
        config.validate()?;
        let plan = default_plan(&config)?;
        Self::with_plan(registry, biome, vent_sink, config, plan)
    }

    /// Create a simulation running a custom plan.
    pub fn with_plan(
        registry: Arc<Registry>,
        biome: Box<dyn BiomeConditions>,
        vent_sink: Box<dyn VentSink>,
        config: SimulationConfig,
        plan: StagePlan,
    ) -> Result<Self, SimError> {
        config.validate()?;
        debug!(
            stages = plan.stage_count(),
            mode = ?config.scheduler.mode,
            "simulation created"
        );
        Ok(Self {
            world: World::new(registry, biome, vent_sink),
            scheduler: Scheduler::new(plan, config.scheduler.clone()),
            timestep: config.timestep(),
            config,
            sim_state: SimState::new(),
            halted: false,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn registry(&self) -> &Registry {
        self.world.registry()
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn colonies(&self) -> &Colonies {
        self.world.colonies()
    }

    pub fn tick(&self) -> Ticks {
        self.sim_state.tick
    }

    pub fn sim_state(&self) -> &SimState {
        &self.sim_state
    }

    /// Length of one fixed step in seconds.
    pub fn timestep(&self) -> Fixed64 {
        self.timestep
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn state_hash(&self) -> u64 {
        self.world.state_hash(self.sim_state.tick)
    }

    pub fn ledger(&self, entity: EntityId) -> Option<CompoundLedger> {
        self.world.ledger(entity)
    }

    pub fn balance(&self, entity: EntityId) -> Option<EnergyBalance> {
        self.world.balance(entity)
    }

    pub fn useful(&self, entity: EntityId) -> Option<UsefulMarks> {
        self.world.useful(entity)
    }

    pub fn motion(&self, entity: EntityId) -> Option<Motion> {
        self.world.motion(entity)
    }

    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        self.config.scheduler.mode = mode;
        self.scheduler.set_mode(mode);
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    pub fn spawn_entity(&mut self, anatomy: Anatomy) -> EntityId {
        self.world.spawn(anatomy)
    }

    /// Remove an entity, taking it out of its colony first.
    pub fn despawn(&mut self, entity: EntityId) -> Result<(), SimError> {
        self.require(entity)?;
        if self.world.colonies.colony_of(entity).is_some() {
            let removal = self.world.colonies.remove_member(entity)?;
            debug!(?entity, ?removal, "despawned entity left its colony");
        }
        self.world.despawn(entity);
        Ok(())
    }

    pub fn set_processes(
        &mut self,
        entity: EntityId,
        processes: Vec<ProcessInstance>,
    ) -> Result<(), SimError> {
        self.require(entity)?;
        self.world.set_processes(entity, processes);
        Ok(())
    }

    pub fn set_anatomy(&mut self, entity: EntityId, anatomy: Anatomy) -> Result<(), SimError> {
        self.require(entity)?;
        self.world.set_anatomy(entity, anatomy);
        Ok(())
    }

    /// Switch an entity to the itemized energy balance.
    pub fn set_itemized_balance(
        &mut self,
        entity: EntityId,
        track_requirements: bool,
    ) -> Result<(), SimError> {
        self.require(entity)?;
        self.world
            .balances_mut()
            .insert(entity, EnergyBalance::itemized(track_requirements));
        Ok(())
    }

    /// Overwrite a stored amount. No capacity check: anything above capacity
    /// is vented during the next tick.
    pub fn set_ledger_amount(
        &mut self,
        entity: EntityId,
        compound: CompoundId,
        amount: Fixed64,
    ) -> Result<(), SimError> {
        let ledger = self
            .world
            .ledgers_mut()
            .get_mut(entity)
            .ok_or(SimError::UnknownEntity(entity))?;
        ledger.set_amount(compound, amount);
        Ok(())
    }

    pub fn set_motion(&mut self, entity: EntityId, motion: Motion) -> Result<(), SimError> {
        self.require(entity)?;
        self.world.motion_mut().insert(entity, motion);
        Ok(())
    }

    fn require(&self, entity: EntityId) -> Result<(), SimError> {
        if self.world.contains(entity) {
            Ok(())
        } else {
            Err(SimError::UnknownEntity(entity))
        }
    }

    // -----------------------------------------------------------------------
    // Colonies
    // -----------------------------------------------------------------------

    pub fn form_colony(&mut self, master: EntityId, others: &[EntityId]) -> Result<ColonyId, SimError> {
        self.require(master)?;
        for &entity in others {
            self.require(entity)?;
        }
        Ok(self.world.colonies.form(master, others)?)
    }

    pub fn add_to_colony(&mut self, colony: ColonyId, entity: EntityId) -> Result<(), SimError> {
        self.require(entity)?;
        Ok(self.world.colonies.add_member(colony, entity)?)
    }

    pub fn remove_from_colony(&mut self, entity: EntityId) -> Result<MemberRemoval, SimError> {
        Ok(self.world.colonies.remove_member(entity)?)
    }

    pub fn disband_colony(&mut self, colony: ColonyId) -> Result<Vec<EntityId>, SimError> {
        Ok(self.world.colonies.disband(colony)?)
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Run exactly one tick. A failed tick halts the simulation.
    pub fn advance_one_fixed_step(&mut self) -> Result<ExecutionPath, SimError> {
        if self.halted {
            return Err(SimError::Halted);
        }
        let tick = self.sim_state.tick;
        match self.scheduler.run_tick(&self.world, self.timestep, tick) {
            Ok(path) => {
                self.sim_state.tick += 1;
                Ok(path)
            }
            Err(e) => {
                error!(tick, error = %e, "tick failed, halting simulation");
                self.halted = true;
                Err(e.into())
            }
        }
    }

    /// Accumulate `elapsed` seconds and run as many fixed steps as fit, up to
    /// `max_steps_per_advance`. Whole steps beyond the limit are dropped and
    /// reported; the sub-step remainder carries over.
    pub fn advance(&mut self, elapsed: Fixed64) -> Result<AdvanceResult, SimError> {
        if self.halted {
            return Err(SimError::Halted);
        }
        let mut result = AdvanceResult::default();
        if elapsed > Fixed64::ZERO {
            self.sim_state.accumulator = self.sim_state.accumulator.saturating_add(elapsed);
        }

        let limit = u64::from(self.config.max_steps_per_advance);
        while self.sim_state.accumulator >= self.timestep {
            if result.steps_run == limit {
                let acc = self.sim_state.accumulator;
                result.steps_dropped = acc.saturating_div(self.timestep).to_num::<u64>();
                self.sim_state.accumulator = acc % self.timestep;
                warn!(
                    dropped = result.steps_dropped,
                    limit, "advance fell behind, dropping steps"
                );
                break;
            }
            self.advance_one_fixed_step()?;
            self.sim_state.accumulator -= self.timestep;
            result.steps_run += 1;
        }
        Ok(result)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::VentTally;
    use crate::scheduler::{PlanBuilder, System, SystemError};
    use crate::test_utils::*;
    use crate::world::{SystemAccess, SystemContext};

    fn sim(mode: ExecutionMode) -> (Fixture, Simulation) {
        let f = fixture();
        let sim = simulation(&f, config(mode));
        (f, sim)
    }

    #[test]
    fn one_step_increments_tick() {
        let (_, mut sim) = sim(ExecutionMode::Sequential);
        assert_eq!(sim.advance_one_fixed_step().unwrap(), ExecutionPath::Sequential);
        assert_eq!(sim.tick(), 1);
    }

    #[test]
    fn advance_accumulates_remainder() {
        let (_, mut sim) = sim(ExecutionMode::Sequential);
        let step = sim.timestep();
        let result = sim.advance(step * Fixed64::from_num(2) + step / 2).unwrap();
        assert_eq!(result.steps_run, 2);
        assert_eq!(result.steps_dropped, 0);
        assert_eq!(sim.tick(), 2);
        let result = sim.advance(step - step / 2).unwrap();
        assert_eq!(result.steps_run, 1);
        assert_eq!(sim.tick(), 3);
    }

    #[test]
    fn advance_drops_steps_beyond_limit() {
        let f = fixture();
        let mut cfg = config(ExecutionMode::Sequential);
        cfg.max_steps_per_advance = 2;
        let mut sim = simulation(&f, cfg);
        let step = sim.timestep();
        let result = sim.advance(step * Fixed64::from_num(5)).unwrap();
        assert_eq!(result.steps_run, 2);
        assert_eq!(result.steps_dropped, 3);
        assert!(sim.sim_state().accumulator < step);
    }

    #[test]
    fn negative_elapsed_is_ignored() {
        let (_, mut sim) = sim(ExecutionMode::Sequential);
        let result = sim.advance(Fixed64::from_num(-1)).unwrap();
        assert_eq!(result.steps_run, 0);
        assert_eq!(sim.sim_state().accumulator, Fixed64::ZERO);
    }

    #[test]
    fn unknown_entity_is_an_error() {
        let (f, mut sim) = sim(ExecutionMode::Sequential);
        let e = sim.spawn_entity(cell(10.0));
        sim.despawn(e).unwrap();
        assert!(matches!(
            sim.set_ledger_amount(e, f.atp, Fixed64::ONE),
            Err(SimError::UnknownEntity(_))
        ));
        assert!(matches!(sim.despawn(e), Err(SimError::UnknownEntity(_))));
    }

    #[test]
    fn despawning_master_disbands_colony() {
        let (_, mut sim) = sim(ExecutionMode::Sequential);
        let a = sim.spawn_entity(cell(10.0));
        let b = sim.spawn_entity(cell(10.0));
        let c = sim.spawn_entity(cell(10.0));
        sim.form_colony(a, &[b, c]).unwrap();
        sim.despawn(a).unwrap();
        assert!(sim.colonies().is_empty());
        assert_eq!(sim.colonies().colony_of(b), None);
    }

    #[test]
    fn form_colony_checks_entities() {
        let (_, mut sim) = sim(ExecutionMode::Sequential);
        let a = sim.spawn_entity(cell(10.0));
        let b = sim.spawn_entity(cell(10.0));
        sim.despawn(b).unwrap();
        assert!(matches!(
            sim.form_colony(a, &[b]),
            Err(SimError::UnknownEntity(_))
        ));
    }

    #[derive(Debug)]
    struct Failing;

    impl System for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn access(&self) -> SystemAccess {
            SystemAccess::new()
        }
        fn update(&mut self, _ctx: &SystemContext<'_>) -> Result<(), SystemError> {
            Err(SystemError::Failed("boom".into()))
        }
    }

    #[test]
    fn failed_tick_halts() {
        let f = fixture();
        let plan = PlanBuilder::new().stage("only").main(Failing).build().unwrap();
        let mut sim = Simulation::with_plan(
            Arc::clone(&f.registry),
            Box::new(biome(&f)),
            Box::new(VentTally::new()),
            config(ExecutionMode::Sequential),
            plan,
        )
        .unwrap();

        assert!(matches!(
            sim.advance_one_fixed_step(),
            Err(SimError::Scheduler(SchedulerError::SystemFailed { .. }))
        ));
        assert!(sim.is_halted());
        assert_eq!(sim.tick(), 0);
        assert!(matches!(sim.advance_one_fixed_step(), Err(SimError::Halted)));
        assert!(matches!(sim.advance(Fixed64::ONE), Err(SimError::Halted)));
    }

    #[test]
    fn invalid_config_rejected() {
        let f = fixture();
        let mut cfg = SimulationConfig::default();
        cfg.venting.rate = -1.0;
        let result = Simulation::new(
            Arc::clone(&f.registry),
            Box::new(biome(&f)),
            Box::new(VentTally::new()),
            cfg,
        );
        assert!(matches!(result, Err(SimError::Config(_))));
    }

    #[test]
    fn itemized_balance_survives_ticks() {
        let (f, mut sim) = sim(ExecutionMode::Sequential);
        let e = sim.spawn_entity(cell(100.0));
        sim.set_itemized_balance(e, true).unwrap();
        sim.set_ledger_amount(e, f.glucose, fixed(50.0)).unwrap();
        sim.set_processes(e, vec![ProcessInstance::new(f.glycolysis, Fixed64::ONE)])
            .unwrap();
        sim.advance_one_fixed_step().unwrap();
        let balance = sim.balance(e).unwrap();
        assert!(balance.is_itemized());
        let items = balance.itemization().unwrap();
        assert!(items.production.contains_key("glycolysis"));
    }
}
