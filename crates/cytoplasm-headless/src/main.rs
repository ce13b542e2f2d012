//! Headless runner: loads content, grows a small population of cells, runs
//! it threaded and sequentially, and checks the two runs stay identical.
//!
//! Run with: `cargo run --package cytoplasm-headless [content_dir]`
//!
//! `RUST_LOG` controls log output. `CYTOPLASM_EXECUTION` and
//! `CYTOPLASM_WORKERS` override the scheduler settings from the content.

use anyhow::{Context, Result, bail};
use cytoplasm_core::anatomy::{Anatomy, Motion};
use cytoplasm_core::config::SimulationConfig;
use cytoplasm_core::environment::{UniformBiome, VentTally};
use cytoplasm_core::fixed::{Fixed64, f64_to_fixed64, fixed64_to_f64};
use cytoplasm_core::id::{EntityId, ProcessId};
use cytoplasm_core::process::ProcessInstance;
use cytoplasm_core::registry::Registry;
use cytoplasm_core::simulation::{SimError, Simulation};
use cytoplasm_core::validation::validate_execution_paths;
use cytoplasm_data::load_content;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CELLS: usize = 48;
const TICKS: u64 = 600;
const COLONY_SIZE: usize = 4;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/content")));

    let content = load_content(&dir)
        .with_context(|| format!("failed to load content from {}", dir.display()))?;
    let mut config = content.config;
    config
        .scheduler
        .apply_env_overrides()
        .context("invalid scheduler override")?;
    let registry = Arc::new(content.registry);
    info!(
        compounds = registry.compound_count(),
        processes = registry.process_count(),
        mode = ?config.scheduler.mode,
        "content loaded"
    );

    let build = || build_population(&registry, &config);
    let result = validate_execution_paths(build, TICKS).context("simulation failed")?;

    for &(tick, threaded, sequential) in result.hash_log.iter().filter(|(t, ..)| t % 100 == 0) {
        info!(
            tick,
            threaded = format_args!("{threaded:#018x}"),
            sequential = format_args!("{sequential:#018x}"),
            "state hash"
        );
    }
    if let Some(tick) = result.divergence_tick {
        bail!("threaded and sequential runs diverged at tick {tick}");
    }
    info!(ticks = TICKS, cells = CELLS, "determinism: PASS");

    let mut sim = build_population(&registry, &config)?;
    // Feed wall time in frames no longer than one advance can absorb.
    let frame = sim.timestep() * Fixed64::from_num(config.max_steps_per_advance);
    let mut remaining = sim.timestep() * Fixed64::from_num(TICKS);
    while remaining > Fixed64::ZERO {
        let slice = remaining.min(frame);
        let advanced = sim.advance(slice)?;
        if advanced.steps_dropped > 0 {
            warn!(dropped = advanced.steps_dropped, "advance dropped steps");
        }
        remaining -= slice;
    }
    report(&sim, &registry);
    Ok(())
}

/// Spawn `CELLS` cells with every loaded process. Cells are grouped into
/// colonies of `COLONY_SIZE`, leaving every other group free-living.
fn build_population(registry: &Arc<Registry>, config: &SimulationConfig) -> Result<Simulation, SimError> {
    let mut biome = UniformBiome::new();
    for (id, def) in registry.compounds() {
        if def.flags.environmental {
            biome.set(id, Fixed64::ONE);
        } else if def.flags.cloud {
            biome.set(id, f64_to_fixed64(0.5));
        }
    }

    let mut sim = Simulation::new(
        Arc::clone(registry),
        Box::new(biome),
        Box::new(VentTally::new()),
        config.clone(),
    )?;

    let process_count = registry.process_count() as u32;
    let mut cells: Vec<EntityId> = Vec::with_capacity(CELLS);
    for i in 0..CELLS {
        let anatomy = Anatomy {
            hex_count: 1 + (i % 4) as u32,
            flagella: (i % 3) as u32,
            cilia: (i % 2) as u32,
            storage: f64_to_fixed64(40.0 + (i % 5) as f64 * 10.0),
            osmoregulation_multiplier: Fixed64::ONE,
            absorption_rate: f64_to_fixed64(0.05 * (i % 4) as f64),
        };
        let cell = sim.spawn_entity(anatomy);

        for (id, def) in registry.compounds() {
            if def.flags.environmental {
                continue;
            }
            let amount = if registry.energy_compound() == Some(id) {
                15.0
            } else {
                5.0 + (i % 7) as f64
            };
            sim.set_ledger_amount(cell, id, f64_to_fixed64(amount))?;
        }

        let processes = (0..process_count)
            .map(|p| {
                let rate = 0.5 + ((i as u32 + p) % 3) as f64 * 0.5;
                ProcessInstance::new(ProcessId(p), f64_to_fixed64(rate))
            })
            .collect();
        sim.set_processes(cell, processes)?;

        if i % 3 == 0 {
            sim.set_motion(cell, Motion::with_velocity(Fixed64::ONE, f64_to_fixed64(-0.5)))?;
        }
        cells.push(cell);
    }

    for group in cells.chunks_exact(COLONY_SIZE).step_by(2) {
        sim.form_colony(group[0], &group[1..])?;
    }
    Ok(sim)
}

fn report(sim: &Simulation, registry: &Registry) {
    info!(
        tick = sim.tick(),
        colonies = sim.colonies().len(),
        hash = format_args!("{:#018x}", sim.state_hash()),
        "final state"
    );

    let (mut production, mut consumption) = (Fixed64::ZERO, Fixed64::ZERO);
    for entity in sim.world().entities() {
        if let Some(balance) = sim.balance(entity) {
            production += balance.totals().total_production;
            consumption += balance.totals().total_consumption;
        }
    }
    info!(
        production = fixed64_to_f64(production),
        consumption = fixed64_to_f64(consumption),
        "energy over the last tick"
    );

    sim.world().with_vent_sink(|sink| {
        let Some(tally) = sink.as_any().downcast_ref::<VentTally>() else {
            return;
        };
        for (compound, amount) in tally.totals() {
            let name = registry.compound(compound).map_or("?", |c| c.name.as_str());
            info!(compound = name, amount = fixed64_to_f64(amount), "vented");
        }
    });
}
