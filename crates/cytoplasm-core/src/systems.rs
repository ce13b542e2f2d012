//! The systems of the default stage plan.
//!
//! | Stage   | Main lane                  | Worker lane                                  |
//! |---------|----------------------------|----------------------------------------------|
//! | prepare | [`TickResetSystem`]        | [`EnergyCostSystem`], [`CompoundAbsorptionSystem`] |
//! | process | [`ProcessSystem`]          | [`MovementSystem`]                           |
//! | upkeep  | [`EnergyUpkeepSystem`]     |                                              |
//! | share   | [`ColonyDistributionSystem`] |                                            |
//! | vent    | [`CompoundVentingSystem`]  |                                              |
//! | settle  | [`LedgerClampSystem`]      | [`VentDischargeSystem`]                      |
//!
//! Every system walks entities in slot order and colonies in arena order, so
//! the result of a tick depends only on the world, never on which lane or
//! thread ran a system.

use crate::anatomy::EnergyCosts;
use crate::colony::ColonyLedger;
use crate::compound::{CompoundLedger, UsefulMarks};
use crate::config::{AbsorptionConfig, SimulationConfig, UpkeepConfig, VentingConfig};
use crate::fixed::{Fixed64, f64_to_fixed64};
use crate::id::{CompoundId, EntityId};
use crate::process::{ProcessInstance, ProcessRun, account_energy, run_processes};
use crate::scheduler::{PlanBuilder, PlanError, StagePlan, System, SystemError};
use crate::world::{Resource, SystemAccess, SystemContext, World};
use slotmap::SecondaryMap;
use tracing::trace;

/// Build the six-stage plan every [`Simulation`](crate::simulation::Simulation)
/// starts with.
pub fn default_plan(config: &SimulationConfig) -> Result<StagePlan, PlanError> {
    PlanBuilder::new()
        .stage("prepare")
        .main(TickResetSystem)
        .worker(EnergyCostSystem::new(&config.upkeep))
        .worker(CompoundAbsorptionSystem::new(&config.absorption))
        .stage("process")
        .main(ProcessSystem)
        .worker(MovementSystem)
        .stage("upkeep")
        .main(EnergyUpkeepSystem)
        .stage("share")
        .main(ColonyDistributionSystem)
        .stage("vent")
        .main(CompoundVentingSystem::new(&config.venting))
        .stage("settle")
        .main(LedgerClampSystem)
        .worker(VentDischargeSystem)
        .build()
}

// ---------------------------------------------------------------------------
// prepare
// ---------------------------------------------------------------------------

/// Rebuilds energy balances from zero and drops last tick's useful marks.
#[derive(Debug, Default)]
pub struct TickResetSystem;

impl System for TickResetSystem {
    fn name(&self) -> &str {
        "tick_reset"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new()
            .writes(Resource::EnergyBalances)
            .writes(Resource::UsefulMarks)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        let mut balances = ctx.balances_mut()?;
        let mut useful = ctx.useful_mut()?;
        for (_, balance) in balances.iter_mut() {
            balance.reset();
        }
        for (_, marks) in useful.iter_mut() {
            marks.clear();
        }
        Ok(())
    }
}

/// Computes this tick's osmoregulation and movement costs from anatomy and
/// motion.
#[derive(Debug)]
pub struct EnergyCostSystem {
    osmoregulation_cost: Fixed64,
    base_movement_cost: Fixed64,
    flagellum_cost: Fixed64,
    cilium_cost: Fixed64,
}

impl EnergyCostSystem {
    pub fn new(config: &UpkeepConfig) -> Self {
        Self {
            osmoregulation_cost: f64_to_fixed64(config.osmoregulation_cost),
            base_movement_cost: f64_to_fixed64(config.base_movement_cost),
            flagellum_cost: f64_to_fixed64(config.flagellum_cost),
            cilium_cost: f64_to_fixed64(config.cilium_cost),
        }
    }
}

impl System for EnergyCostSystem {
    fn name(&self) -> &str {
        "energy_cost"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new()
            .writes(Resource::EnergyCosts)
            .reads(Resource::Motion)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        let world = ctx.world();
        let motion = ctx.motion()?;
        let mut costs = ctx.energy_costs_mut()?;
        let delta = ctx.delta;

        for (entity, cost) in costs.iter_mut() {
            let Some(anatomy) = world.anatomy(entity) else {
                *cost = EnergyCosts::default();
                continue;
            };
            let hex = Fixed64::saturating_from_num(anatomy.hex_count);
            let moving = motion.get(entity).is_some_and(|m| m.moving);

            cost.osmoregulation = hex
                .saturating_mul(self.osmoregulation_cost)
                .saturating_mul(anatomy.osmoregulation_multiplier)
                .saturating_mul(delta);
            if moving {
                cost.base_movement = hex
                    .saturating_mul(self.base_movement_cost)
                    .saturating_mul(delta);
                cost.flagella = Fixed64::saturating_from_num(anatomy.flagella)
                    .saturating_mul(self.flagellum_cost)
                    .saturating_mul(delta);
                cost.cilia = Fixed64::saturating_from_num(anatomy.cilia)
                    .saturating_mul(self.cilium_cost)
                    .saturating_mul(delta);
            } else {
                cost.base_movement = Fixed64::ZERO;
                cost.flagella = Fixed64::ZERO;
                cost.cilia = Fixed64::ZERO;
            }
        }
        Ok(())
    }
}

/// Pulls cloud compounds from the biome into each ledger.
#[derive(Debug)]
pub struct CompoundAbsorptionSystem {
    enabled: bool,
    scale: Fixed64,
}

impl CompoundAbsorptionSystem {
    pub fn new(config: &AbsorptionConfig) -> Self {
        Self {
            enabled: config.enabled,
            scale: f64_to_fixed64(config.scale),
        }
    }
}

impl System for CompoundAbsorptionSystem {
    fn name(&self) -> &str {
        "compound_absorption"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new().writes(Resource::Ledgers)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        if !self.enabled {
            return Ok(());
        }
        let world = ctx.world();
        let registry = ctx.registry();
        let clouds: Vec<CompoundId> = registry.compounds_where(|f| f.cloud).collect();
        if clouds.is_empty() {
            return Ok(());
        }
        let mut ledgers = ctx.ledgers_mut()?;

        for (entity, ledger) in ledgers.iter_mut() {
            let Some(anatomy) = world.anatomy(entity) else {
                continue;
            };
            let rate = anatomy
                .absorption_rate
                .saturating_mul(self.scale)
                .saturating_mul(ctx.delta);
            if rate <= Fixed64::ZERO {
                continue;
            }
            for &compound in &clouds {
                let offered = world.biome().ambient(compound).saturating_mul(rate);
                // Whatever does not fit stays in the environment.
                let _ = ledger.add(compound, offered);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// process
// ---------------------------------------------------------------------------

/// Runs every entity's processes, and every colony's processes against the
/// pooled colony ledger.
#[derive(Debug, Default)]
pub struct ProcessSystem;

impl System for ProcessSystem {
    fn name(&self) -> &str {
        "process"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new()
            .writes(Resource::Ledgers)
            .writes(Resource::EnergyBalances)
            .writes(Resource::UsefulMarks)
            .writes(Resource::VentQueue)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        let world = ctx.world();
        let registry = ctx.registry();
        let seed = UsefulMarks::seeded(registry);
        let mut ledgers = ctx.ledgers_mut()?;
        let mut balances = ctx.balances_mut()?;
        let mut useful = ctx.useful_mut()?;
        let mut vents = ctx.vent_queue_mut()?;

        for (entity, run) in run_solo(world, &mut ledgers, &seed, ctx.delta) {
            if let Some(balance) = balances.get_mut(entity) {
                for outcome in &run.outcomes {
                    account_energy(registry, outcome, balance);
                }
            }
            for &(compound, amount) in &run.overflow {
                vents.push(entity, compound, amount);
            }
            if let Some(marks) = useful.get_mut(entity) {
                *marks = run.useful;
            }
        }

        for (_, colony) in world.colonies().iter() {
            let members = colony.members();
            let (owners, instances): (Vec<EntityId>, Vec<ProcessInstance>) = members
                .iter()
                .flat_map(|&m| world.processes(m).iter().map(move |p| (m, *p)))
                .unzip();

            let mut store = ColonyLedger::new(members, &mut ledgers);
            let run = run_processes(
                registry,
                &mut store,
                &instances,
                world.biome(),
                seed.clone(),
                ctx.delta,
            );

            for (owner, outcome) in owners.iter().zip(&run.outcomes) {
                if let Some(balance) = balances.get_mut(*owner) {
                    account_energy(registry, outcome, balance);
                }
            }
            for &(compound, amount) in &run.overflow {
                vents.push(colony.master(), compound, amount);
            }
            for &member in members {
                if let Some(marks) = useful.get_mut(member) {
                    marks.clone_from(&run.useful);
                }
            }
        }
        Ok(())
    }
}

/// Run the processes of every entity outside a colony, in slot order.
fn run_solo(
    world: &World,
    ledgers: &mut SecondaryMap<EntityId, CompoundLedger>,
    seed: &UsefulMarks,
    delta: Fixed64,
) -> Vec<(EntityId, ProcessRun)> {
    let work = ledgers
        .iter_mut()
        .filter(|(entity, _)| world.colonies().colony_of(*entity).is_none());
    let run = |(entity, ledger): (EntityId, &mut CompoundLedger)| {
        let result = run_processes(
            world.registry(),
            ledger,
            world.processes(entity),
            world.biome(),
            seed.clone(),
            delta,
        );
        (entity, result)
    };

    #[cfg(feature = "parallel")]
    let runs: Vec<_> = {
        use rayon::prelude::*;
        work.collect::<Vec<_>>().into_par_iter().map(run).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let runs: Vec<_> = work.map(run).collect();

    runs
}

/// Integrates positions from velocities.
#[derive(Debug, Default)]
pub struct MovementSystem;

impl System for MovementSystem {
    fn name(&self) -> &str {
        "movement"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new().writes(Resource::Motion)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        let mut motion = ctx.motion_mut()?;
        for (_, m) in motion.iter_mut() {
            if !m.moving {
                continue;
            }
            for axis in 0..2 {
                let step = m.velocity[axis].saturating_mul(ctx.delta);
                m.position[axis] = m.position[axis].saturating_add(step);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// upkeep
// ---------------------------------------------------------------------------

/// Records this tick's fixed costs in each balance and pays them from the
/// energy compound. Colony members pay from the colony ledger.
#[derive(Debug, Default)]
pub struct EnergyUpkeepSystem;

impl System for EnergyUpkeepSystem {
    fn name(&self) -> &str {
        "energy_upkeep"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new()
            .writes(Resource::Ledgers)
            .writes(Resource::EnergyBalances)
            .reads(Resource::EnergyCosts)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        let world = ctx.world();
        let energy = ctx.registry().energy_compound();
        let costs = ctx.energy_costs()?;
        let mut ledgers = ctx.ledgers_mut()?;
        let mut balances = ctx.balances_mut()?;

        for entity in world.entities() {
            let Some(cost) = costs.get(entity) else {
                continue;
            };
            if let Some(balance) = balances.get_mut(entity) {
                balance.set_osmoregulation(cost.osmoregulation);
                balance.set_movement(cost.base_movement, cost.flagella, cost.cilia);
            }

            let Some(energy) = energy else {
                continue;
            };
            let due = cost.total();
            if due <= Fixed64::ZERO {
                continue;
            }
            let members = world
                .colonies()
                .colony_of(entity)
                .and_then(|c| world.colonies().members(c));
            let paid = match members {
                Some(members) => ColonyLedger::new(members, &mut ledgers).take(energy, due),
                None => ledgers
                    .get_mut(entity)
                    .map_or(Fixed64::ZERO, |l| l.take(energy, due)),
            };
            if paid < due {
                trace!(?entity, shortfall = %(due - paid), "upkeep not fully paid");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// share
// ---------------------------------------------------------------------------

/// Evens out distributable compounds across each colony's members.
#[derive(Debug, Default)]
pub struct ColonyDistributionSystem;

impl System for ColonyDistributionSystem {
    fn name(&self) -> &str {
        "colony_distribution"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new()
            .writes(Resource::Ledgers)
            .reads(Resource::UsefulMarks)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        let world = ctx.world();
        let registry = ctx.registry();
        let useful = ctx.useful()?;
        let mut ledgers = ctx.ledgers_mut()?;

        let seed = UsefulMarks::seeded(registry);
        for (_, colony) in world.colonies().iter() {
            // Members share one set of marks after the process stage.
            let marks = useful.get(colony.master()).unwrap_or(&seed);
            ColonyLedger::new(colony.members(), &mut ledgers).distribute_surplus(registry, marks);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// vent
// ---------------------------------------------------------------------------

/// Vents cloud compounds nothing used this tick, and anything above capacity.
///
/// Amounts above the plain capacity leave immediately. The non-useful part of
/// a cloud compound leaves at up to `rate` per second.
#[derive(Debug)]
pub struct CompoundVentingSystem {
    rate: Fixed64,
}

impl CompoundVentingSystem {
    pub fn new(config: &VentingConfig) -> Self {
        Self {
            rate: f64_to_fixed64(config.rate),
        }
    }
}

impl System for CompoundVentingSystem {
    fn name(&self) -> &str {
        "compound_venting"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new()
            .writes(Resource::Ledgers)
            .writes(Resource::VentQueue)
            .reads(Resource::UsefulMarks)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        let registry = ctx.registry();
        let useful = ctx.useful()?;
        let mut ledgers = ctx.ledgers_mut()?;
        let mut vents = ctx.vent_queue_mut()?;
        let budget = self.rate.saturating_mul(ctx.delta);
        let seed = UsefulMarks::seeded(registry);

        for (entity, ledger) in ledgers.iter_mut() {
            let marks = useful.get(entity).unwrap_or(&seed);
            let held: Vec<CompoundId> = ledger.iter().map(|(c, _)| c).collect();
            for compound in held {
                let over = ledger.excess_over_capacity(compound);
                if over > Fixed64::ZERO {
                    vents.push(entity, compound, ledger.take(compound, over));
                }

                if !registry.is_cloud(compound) || budget <= Fixed64::ZERO {
                    continue;
                }
                let excess = ledger.amount(compound) - ledger.capacity_for(compound, marks);
                if excess > Fixed64::ZERO {
                    vents.push(entity, compound, ledger.take(compound, excess.min(budget)));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// settle
// ---------------------------------------------------------------------------

/// Resets any negative ledger amount to zero.
#[derive(Debug, Default)]
pub struct LedgerClampSystem;

impl System for LedgerClampSystem {
    fn name(&self) -> &str {
        "ledger_clamp"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new().writes(Resource::Ledgers)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        let mut ledgers = ctx.ledgers_mut()?;
        for (_, ledger) in ledgers.iter_mut() {
            ledger.clamp_negative();
        }
        Ok(())
    }
}

/// Hands the tick's vent records to the vent sink.
#[derive(Debug, Default)]
pub struct VentDischargeSystem;

impl System for VentDischargeSystem {
    fn name(&self) -> &str {
        "vent_discharge"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::new()
            .writes(Resource::VentQueue)
            .writes(Resource::VentSink)
    }

    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError> {
        let mut queue = ctx.vent_queue_mut()?;
        let mut sink = ctx.vent_sink_mut()?;
        for record in queue.drain() {
            sink.vent(record.entity, record.compound, record.amount);
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
