//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::anatomy::{Anatomy, Motion};
use crate::config::{ExecutionMode, SimulationConfig};
use crate::environment::{UniformBiome, VentTally};
use crate::fixed::Fixed64;
use crate::id::{CompoundId, EntityId, ProcessId};
use crate::process::ProcessInstance;
use crate::registry::{CompoundFlags, ProcessEntry, Registry, RegistryBuilder};
use crate::simulation::Simulation;
use std::sync::Arc;

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

pub fn approx(a: Fixed64, b: f64) -> bool {
    (a.to_num::<f64>() - b).abs() < 1e-6
}

// ===========================================================================
// Registry fixture
// ===========================================================================

/// A small cell chemistry:
///
/// - `glucose`: cloud, distributable
/// - `atp`: always useful, distributable, the energy compound
/// - `oxygen`: environmental
/// - `co2`: cloud
/// - `ammonia`: cloud, distributable
///
/// Processes: `glycolysis` (glucose → 2 atp, metabolic), `respiration`
/// (glucose + oxygen → 6 atp + co2, metabolic), `ammonia_synthesis`
/// (atp → ammonia).
#[derive(Debug, Clone)]
pub struct Fixture {
    pub registry: Arc<Registry>,
    pub glucose: CompoundId,
    pub atp: CompoundId,
    pub oxygen: CompoundId,
    pub co2: CompoundId,
    pub ammonia: CompoundId,
    pub glycolysis: ProcessId,
    pub respiration: ProcessId,
    pub ammonia_synthesis: ProcessId,
}

pub fn fixture() -> Fixture {
    let mut b = RegistryBuilder::new();
    let glucose = b.register_compound(
        "glucose",
        CompoundFlags {
            cloud: true,
            distributable: true,
            ..Default::default()
        },
    );
    let atp = b.register_compound(
        "atp",
        CompoundFlags {
            always_useful: true,
            distributable: true,
            ..Default::default()
        },
    );
    let oxygen = b.register_compound(
        "oxygen",
        CompoundFlags {
            environmental: true,
            ..Default::default()
        },
    );
    let co2 = b.register_compound(
        "co2",
        CompoundFlags {
            cloud: true,
            ..Default::default()
        },
    );
    let ammonia = b.register_compound(
        "ammonia",
        CompoundFlags {
            cloud: true,
            distributable: true,
            ..Default::default()
        },
    );
    b.set_energy_compound(atp);

    let glycolysis = b.register_process(
        "glycolysis",
        vec![ProcessEntry::new(glucose, fixed(1.0))],
        vec![ProcessEntry::new(atp, fixed(2.0))],
        true,
    );
    let respiration = b.register_process(
        "respiration",
        vec![
            ProcessEntry::new(glucose, fixed(1.0)),
            ProcessEntry::new(oxygen, fixed(1.0)),
        ],
        vec![
            ProcessEntry::new(atp, fixed(6.0)),
            ProcessEntry::new(co2, fixed(1.0)),
        ],
        true,
    );
    let ammonia_synthesis = b.register_process(
        "ammonia_synthesis",
        vec![ProcessEntry::new(atp, fixed(1.0))],
        vec![ProcessEntry::new(ammonia, fixed(1.0))],
        false,
    );

    Fixture {
        registry: Arc::new(b.build().expect("fixture registry is valid")),
        glucose,
        atp,
        oxygen,
        co2,
        ammonia,
        glycolysis,
        respiration,
        ammonia_synthesis,
    }
}

// ===========================================================================
// Simulation builders
// ===========================================================================

/// Full oxygen and a little glucose in the water.
pub fn biome(f: &Fixture) -> UniformBiome {
    UniformBiome::new()
        .with(f.oxygen, fixed(1.0))
        .with(f.glucose, fixed(2.0))
}

/// Default config in `mode`, with two threads assumed so `Auto` can thread.
pub fn config(mode: ExecutionMode) -> SimulationConfig {
    let mut config = SimulationConfig::default();
    config.scheduler.mode = mode;
    config.scheduler.worker_threads = Some(2);
    config
}

pub fn simulation(f: &Fixture, config: SimulationConfig) -> Simulation {
    Simulation::new(
        Arc::clone(&f.registry),
        Box::new(biome(f)),
        Box::new(VentTally::new()),
        config,
    )
    .expect("test simulation is valid")
}

pub fn cell(storage: f64) -> Anatomy {
    Anatomy {
        storage: fixed(storage),
        ..Default::default()
    }
}

/// Spawn `count` varied cells. Every fourth cell onwards is grouped into
/// colonies of three.
pub fn populate(sim: &mut Simulation, f: &Fixture, count: usize) -> Vec<EntityId> {
    let mut entities = Vec::with_capacity(count);
    for i in 0..count {
        let anatomy = Anatomy {
            hex_count: 1 + (i % 5) as u32,
            flagella: (i % 3) as u32,
            cilia: (i % 2) as u32,
            storage: fixed(20.0 + (i % 7) as f64 * 5.0),
            osmoregulation_multiplier: fixed(1.0),
            absorption_rate: fixed(0.1 * (i % 4) as f64),
        };
        let e = sim.spawn_entity(anatomy);
        sim.set_ledger_amount(e, f.glucose, fixed(5.0 + i as f64))
            .expect("entity was just spawned");
        sim.set_ledger_amount(e, f.atp, fixed(3.0 + (i % 4) as f64))
            .expect("entity was just spawned");

        let mut processes = vec![ProcessInstance::new(f.glycolysis, fixed(1.0 + (i % 3) as f64))];
        if i % 2 == 0 {
            processes.push(ProcessInstance::new(f.respiration, fixed(0.5)));
        }
        if i % 3 == 0 {
            processes.push(ProcessInstance::new(f.ammonia_synthesis, fixed(0.25)));
        }
        sim.set_processes(e, processes).expect("entity was just spawned");

        if i % 2 == 1 {
            sim.set_motion(e, Motion::with_velocity(fixed(1.0), fixed(0.5)))
                .expect("entity was just spawned");
        }
        if i % 5 == 0 {
            sim.set_itemized_balance(e, true).expect("entity was just spawned");
        }
        entities.push(e);
    }

    for group in entities.get(3..).unwrap_or_default().chunks_exact(3).step_by(2) {
        sim.form_colony(group[0], &group[1..])
            .expect("fresh entities can form a colony");
    }
    entities
}

/// Build the same populated simulation twice and run one threaded and one
/// sequentially for `ticks` steps.
pub fn run_both_modes(f: &Fixture, cells: usize, ticks: u64) -> (Simulation, Simulation) {
    let mut threaded = simulation(f, config(ExecutionMode::Threaded));
    let mut sequential = simulation(f, config(ExecutionMode::Sequential));
    populate(&mut threaded, f, cells);
    populate(&mut sequential, f, cells);
    for _ in 0..ticks {
        threaded.advance_one_fixed_step().expect("threaded tick");
        sequential.advance_one_fixed_step().expect("sequential tick");
    }
    (threaded, sequential)
}
