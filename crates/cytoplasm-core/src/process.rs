//! The process engine: runs an entity's (or colony's) processes against a
//! [`CompoundStore`] for one fixed step.
//!
//! # Throttling
//!
//! Processes never fail. Each one runs at a *speed* in `[0, 1]`:
//!
//! 1. Environmental inputs are read from the biome. The process' environment
//!    factor is the minimum over them of `ambient / weight`, clamped to
//!    `[0, 1]`.
//! 2. Every process states a demand for each stored input: `weight × rate ×
//!    speed_multiplier × delta`, scaled by its environment factor. Demands
//!    for the same compound are summed across all processes of the store.
//! 3. A compound whose stored amount falls short of total demand is split
//!    between its consumers in proportion to what each asked for. The last
//!    consumer in instance order takes the remainder, so the shares sum to
//!    exactly what is stored.
//! 4. A process' speed is its environment factor times the smallest fraction
//!    of demand granted among its stored inputs. A process held back by a
//!    scarce input consumes exactly its share of it and scales every other
//!    input and output from that amount.

use crate::compound::{CompoundStore, UsefulMarks};
use crate::energy::EnergyBalance;
use crate::environment::BiomeConditions;
use crate::fixed::{Fixed64, checked_div_64, unit_ratio};
use crate::id::{CompoundId, ProcessId};
use crate::registry::{ProcessDef, ProcessEntry, Registry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// ProcessInstance
// ---------------------------------------------------------------------------

/// A process running inside one entity at a given rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub process: ProcessId,
    pub rate: Fixed64,
    pub speed_multiplier: Fixed64,
}

impl ProcessInstance {
    /// Instance with speed multiplier 1. Negative rates are clamped to zero.
    pub fn new(process: ProcessId, rate: Fixed64) -> Self {
        Self {
            process,
            rate: rate.max(Fixed64::ZERO),
            speed_multiplier: Fixed64::ONE,
        }
    }

    pub fn with_speed_multiplier(mut self, multiplier: Fixed64) -> Self {
        self.speed_multiplier = multiplier.max(Fixed64::ZERO);
        self
    }

    /// Rate after the speed multiplier.
    pub fn effective_rate(&self) -> Fixed64 {
        self.rate.saturating_mul(self.speed_multiplier)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What one process instance did during a step.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub process: ProcessId,
    /// Fraction of full speed achieved, in `[0, 1]`.
    pub speed: Fixed64,
    /// The input that held the speed below 1, if any.
    pub limiting: Option<CompoundId>,
    pub consumed: Vec<(CompoundId, Fixed64)>,
    /// Full produced amounts, including any part the store could not absorb.
    pub produced: Vec<(CompoundId, Fixed64)>,
}

impl ProcessOutcome {
    pub fn consumed_of(&self, compound: CompoundId) -> Fixed64 {
        sum_for(&self.consumed, compound)
    }

    pub fn produced_of(&self, compound: CompoundId) -> Fixed64 {
        sum_for(&self.produced, compound)
    }
}

fn sum_for(entries: &[(CompoundId, Fixed64)], compound: CompoundId) -> Fixed64 {
    entries
        .iter()
        .filter(|(c, _)| *c == compound)
        .fold(Fixed64::ZERO, |acc, (_, a)| acc + *a)
}

/// Result of running every instance of one store for a step.
#[derive(Debug, Clone, Default)]
pub struct ProcessRun {
    /// One outcome per instance, in instance order. Unknown processes report
    /// zero speed.
    pub outcomes: Vec<ProcessOutcome>,
    /// Input and output compounds of every process that ran, plus the seed.
    pub useful: UsefulMarks,
    /// Produced amounts the store could not absorb.
    pub overflow: Vec<(CompoundId, Fixed64)>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Planned<'r> {
    instance: ProcessInstance,
    def: &'r ProcessDef,
    /// `rate × speed_multiplier × delta`.
    scale: Fixed64,
    env: Fixed64,
    env_limit: Option<CompoundId>,
    inputs: Vec<PlannedInput>,
}

/// One stored input of a planned process.
struct PlannedInput {
    compound: CompoundId,
    weight: Fixed64,
    wanted: Fixed64,
    /// This process' share of a scarce compound. `None` when supply covers
    /// every demand.
    allotted: Option<Fixed64>,
}

/// Environment factor of a process and the environmental input setting it.
fn environment_factor(
    registry: &Registry,
    def: &ProcessDef,
    biome: &dyn BiomeConditions,
) -> (Fixed64, Option<CompoundId>) {
    let mut factor = Fixed64::ONE;
    let mut limit = None;
    for input in def
        .inputs
        .iter()
        .filter(|i| registry.is_environmental(i.compound))
    {
        let ratio = unit_ratio(biome.ambient(input.compound), input.weight);
        if ratio < factor {
            factor = ratio;
            limit = Some(input.compound);
        }
    }
    (factor, limit)
}

/// `amount × num / den`, multiplying first so exact quotients stay exact.
fn scaled(amount: Fixed64, num: Fixed64, den: Fixed64) -> Fixed64 {
    amount
        .checked_mul(num)
        .and_then(|product| checked_div_64(product, den))
        .or_else(|| checked_div_64(amount, den).map(|q| q.saturating_mul(num)))
        .unwrap_or(Fixed64::ZERO)
}

/// Run `instances` against `store` for one step of `delta` seconds.
///
/// `useful` is the starting set of marks (normally
/// [`UsefulMarks::seeded`]); every compound touched by a process is added.
pub fn run_processes(
    registry: &Registry,
    store: &mut dyn CompoundStore,
    instances: &[ProcessInstance],
    biome: &dyn BiomeConditions,
    mut useful: UsefulMarks,
    delta: Fixed64,
) -> ProcessRun {
    let mut planned = Vec::with_capacity(instances.len());
    let mut demand: BTreeMap<CompoundId, Fixed64> = BTreeMap::new();

    for instance in instances {
        let Some(def) = registry.process(instance.process) else {
            tracing::debug!(process = instance.process.0, "unknown process runs at zero speed");
            planned.push(None);
            continue;
        };
        let scale = instance.effective_rate().saturating_mul(delta);
        let (env, env_limit) = environment_factor(registry, def, biome);
        let inputs: Vec<PlannedInput> = stored_inputs(registry, def)
            .map(|input| PlannedInput {
                compound: input.compound,
                weight: input.weight,
                wanted: input.weight.saturating_mul(scale).saturating_mul(env),
                allotted: None,
            })
            .collect();
        for input in &inputs {
            let total = demand.entry(input.compound).or_default();
            *total = total.saturating_add(input.wanted);
        }
        planned.push(Some(Planned {
            instance: *instance,
            def,
            scale,
            env,
            env_limit,
            inputs,
        }));
    }

    allot_scarce(store, &demand, &mut planned);

    let mut run = ProcessRun::default();
    for (instance, plan) in instances.iter().zip(planned) {
        let Some(plan) = plan else {
            run.outcomes.push(ProcessOutcome {
                process: instance.process,
                speed: Fixed64::ZERO,
                limiting: None,
                consumed: Vec::new(),
                produced: Vec::new(),
            });
            continue;
        };

        // The scarce input granting the smallest fraction of its demand
        // sets the speed, unless the environment is tighter still.
        let mut speed = plan.env;
        let mut limiting = plan.env_limit;
        let mut bound: Option<&PlannedInput> = None;
        for input in &plan.inputs {
            let Some(allotted) = input.allotted else {
                continue;
            };
            let candidate = plan.env * unit_ratio(allotted, input.wanted);
            if candidate < speed {
                speed = candidate;
                limiting = Some(input.compound);
                bound = Some(input);
            }
        }
        let speed = speed.clamp(Fixed64::ZERO, Fixed64::ONE);

        for entry in plan.def.inputs.iter().chain(plan.def.outputs.iter()) {
            useful.mark(entry.compound);
        }

        let mut outcome = ProcessOutcome {
            process: plan.instance.process,
            speed,
            limiting,
            consumed: Vec::new(),
            produced: Vec::new(),
        };

        // Amount moved for an entry of `weight`. A bound process moves
        // exactly its allotment of the binding input and scales the rest
        // from that, so a scarce input is emptied without rounding residue.
        let factor = plan.scale.saturating_mul(speed);
        let amount_for = |weight: Fixed64| match bound {
            Some(b) => scaled(weight, b.allotted.unwrap_or(Fixed64::ZERO), b.weight),
            None => weight.saturating_mul(factor),
        };

        if speed > Fixed64::ZERO && plan.scale > Fixed64::ZERO {
            for input in &plan.inputs {
                let wanted = match bound {
                    Some(b) if b.compound == input.compound => {
                        b.allotted.unwrap_or(Fixed64::ZERO)
                    }
                    _ => amount_for(input.weight),
                };
                let taken = store.take(input.compound, wanted);
                outcome.consumed.push((input.compound, taken));
            }
            for output in &plan.def.outputs {
                let made = amount_for(output.weight);
                let absorbed = store.add(output.compound, made);
                if absorbed < made {
                    run.overflow.push((output.compound, made - absorbed));
                }
                outcome.produced.push((output.compound, made));
            }
        }

        run.outcomes.push(outcome);
    }

    run.useful = useful;
    run
}

/// Split every scarce compound between its consumers in proportion to
/// demand. The last consumer in instance order takes whatever is left, so
/// the shares add up to exactly what is stored.
fn allot_scarce(
    store: &dyn CompoundStore,
    demand: &BTreeMap<CompoundId, Fixed64>,
    planned: &mut [Option<Planned<'_>>],
) {
    for (&compound, &total) in demand {
        let stored = store.amount(compound).max(Fixed64::ZERO);
        if stored >= total {
            continue;
        }
        let consumers: Vec<(usize, usize)> = planned
            .iter()
            .enumerate()
            .filter_map(|(p, plan)| {
                let plan = plan.as_ref()?;
                let i = plan
                    .inputs
                    .iter()
                    .position(|i| i.compound == compound && i.wanted > Fixed64::ZERO)?;
                Some((p, i))
            })
            .collect();
        let mut left = stored;
        let count = consumers.len();
        for (n, (p, i)) in consumers.into_iter().enumerate() {
            let Some(input) = planned[p].as_mut().map(|plan| &mut plan.inputs[i]) else {
                continue;
            };
            let share = if n + 1 == count {
                left
            } else {
                scaled(stored, input.wanted, total).min(left)
            };
            left -= share;
            input.allotted = Some(share);
        }
    }
}

fn stored_inputs<'d>(
    registry: &'d Registry,
    def: &'d ProcessDef,
) -> impl Iterator<Item = &'d ProcessEntry> + 'd {
    def.inputs
        .iter()
        .filter(move |i| !registry.is_environmental(i.compound))
}

/// Fold a process' energy-compound flows into `balance` under the process
/// name. Registries without an energy compound leave the balance untouched.
pub fn account_energy(registry: &Registry, outcome: &ProcessOutcome, balance: &mut EnergyBalance) {
    let Some(energy) = registry.energy_compound() else {
        return;
    };
    let Some(def) = registry.process(outcome.process) else {
        return;
    };

    let produced = outcome.produced_of(energy);
    if produced > Fixed64::ZERO {
        let required: Vec<_> = outcome
            .consumed
            .iter()
            .filter(|(c, _)| *c != energy)
            .copied()
            .collect();
        balance.add_production(&def.name, produced, &required);
    }
    let consumed = outcome.consumed_of(energy);
    if consumed > Fixed64::ZERO {
        balance.add_consumption(&def.name, consumed);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compound::CompoundLedger;
    use crate::environment::UniformBiome;
    use crate::registry::{CompoundFlags, ProcessEntry, RegistryBuilder};

    fn fixed(v: f64) -> Fixed64 {
        Fixed64::from_num(v)
    }

    fn approx(a: Fixed64, b: f64) -> bool {
        (a.to_num::<f64>() - b).abs() < 1e-6
    }

    struct Fixture {
        registry: Registry,
        glucose: CompoundId,
        atp: CompoundId,
        oxygen: CompoundId,
        toxin: CompoundId,
        glycolysis: ProcessId,
        respiration: ProcessId,
        toxin_synthesis: ProcessId,
    }

    fn fixture() -> Fixture {
        let mut b = RegistryBuilder::new();
        let glucose = b.register_compound("glucose", CompoundFlags::default());
        let atp = b.register_compound(
            "atp",
            CompoundFlags {
                always_useful: true,
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
        let toxin = b.register_compound("toxin", CompoundFlags::default());
        b.set_energy_compound(atp);
        let glycolysis = b.register_process(
            "glycolysis",
            vec![ProcessEntry::new(glucose, fixed(10.0))],
            vec![ProcessEntry::new(atp, fixed(5.0))],
            true,
        );
        let respiration = b.register_process(
            "respiration",
            vec![
                ProcessEntry::new(glucose, fixed(2.0)),
                ProcessEntry::new(oxygen, fixed(0.5)),
            ],
            vec![ProcessEntry::new(atp, fixed(8.0))],
            true,
        );
        let toxin_synthesis = b.register_process(
            "toxin_synthesis",
            vec![ProcessEntry::new(atp, fixed(1.0))],
            vec![ProcessEntry::new(toxin, fixed(1.0))],
            false,
        );
        Fixture {
            registry: b.build().unwrap(),
            glucose,
            atp,
            oxygen,
            toxin,
            glycolysis,
            respiration,
            toxin_synthesis,
        }
    }

    fn run(
        f: &Fixture,
        ledger: &mut CompoundLedger,
        instances: &[ProcessInstance],
        biome: &UniformBiome,
    ) -> ProcessRun {
        run_processes(
            &f.registry,
            ledger,
            instances,
            biome,
            UsefulMarks::seeded(&f.registry),
            Fixed64::ONE,
        )
    }

    #[test]
    fn full_speed_when_supplied() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        ledger.set_amount(f.glucose, fixed(50.0));
        let out = run(
            &f,
            &mut ledger,
            &[ProcessInstance::new(f.glycolysis, Fixed64::ONE)],
            &UniformBiome::new(),
        );
        let outcome = &out.outcomes[0];
        assert_eq!(outcome.speed, Fixed64::ONE);
        assert_eq!(outcome.limiting, None);
        assert_eq!(ledger.amount(f.glucose), fixed(40.0));
        assert_eq!(ledger.amount(f.atp), fixed(5.0));
    }

    #[test]
    fn throttles_to_available_fraction() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        ledger.set_amount(f.glucose, fixed(4.0));
        let out = run(
            &f,
            &mut ledger,
            &[ProcessInstance::new(f.glycolysis, Fixed64::ONE)],
            &UniformBiome::new(),
        );
        let outcome = &out.outcomes[0];
        assert!(approx(outcome.speed, 0.4));
        assert_eq!(outcome.limiting, Some(f.glucose));
        assert_eq!(outcome.consumed_of(f.glucose), fixed(4.0));
        assert_eq!(ledger.amount(f.atp), fixed(2.0));
        assert_eq!(ledger.amount(f.glucose), Fixed64::ZERO);
    }

    #[test]
    fn scarce_input_is_fully_consumed_across_uneven_shares() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        ledger.set_amount(f.glucose, fixed(10.0));
        let instances = [
            ProcessInstance::new(f.glycolysis, Fixed64::ONE),
            ProcessInstance::new(f.glycolysis, Fixed64::ONE),
            ProcessInstance::new(f.glycolysis, Fixed64::ONE),
        ];
        let out = run(&f, &mut ledger, &instances, &UniformBiome::new());
        // 30 wanted, 10 stored: thirds that do not divide evenly.
        assert_eq!(ledger.amount(f.glucose), Fixed64::ZERO);
        let consumed: Fixed64 = out.outcomes.iter().map(|o| o.consumed_of(f.glucose)).sum();
        assert_eq!(consumed, fixed(10.0));
        for outcome in &out.outcomes {
            assert!(approx(outcome.consumed_of(f.glucose), 10.0 / 3.0));
            assert!(approx(outcome.speed, 1.0 / 3.0));
        }
    }

    #[test]
    fn starved_process_runs_at_zero() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        let out = run(
            &f,
            &mut ledger,
            &[ProcessInstance::new(f.glycolysis, Fixed64::ONE)],
            &UniformBiome::new(),
        );
        assert_eq!(out.outcomes[0].speed, Fixed64::ZERO);
        assert!(out.outcomes[0].produced.is_empty());
        assert_eq!(ledger.amount(f.atp), Fixed64::ZERO);
    }

    #[test]
    fn environment_limits_speed() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        ledger.set_amount(f.glucose, fixed(50.0));
        let biome = UniformBiome::new().with(f.oxygen, fixed(0.25));
        let out = run(
            &f,
            &mut ledger,
            &[ProcessInstance::new(f.respiration, Fixed64::ONE)],
            &biome,
        );
        let outcome = &out.outcomes[0];
        assert_eq!(outcome.speed, fixed(0.5));
        assert_eq!(outcome.limiting, Some(f.oxygen));
        assert_eq!(ledger.amount(f.glucose), fixed(49.0));
        assert_eq!(ledger.amount(f.atp), fixed(4.0));
        assert_eq!(ledger.amount(f.oxygen), Fixed64::ZERO);
    }

    #[test]
    fn scarce_input_split_by_demand() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        ledger.set_amount(f.glucose, fixed(6.0));
        let biome = UniformBiome::new().with(f.oxygen, fixed(1.0));
        let out = run(
            &f,
            &mut ledger,
            &[
                ProcessInstance::new(f.glycolysis, Fixed64::ONE),
                ProcessInstance::new(f.respiration, Fixed64::ONE),
            ],
            &biome,
        );
        // Demand is 10 + 2 = 12 against 6 stored: both run at half speed.
        assert_eq!(out.outcomes[0].speed, fixed(0.5));
        assert_eq!(out.outcomes[1].speed, fixed(0.5));
        assert_eq!(out.outcomes[0].consumed_of(f.glucose), fixed(5.0));
        assert_eq!(out.outcomes[1].consumed_of(f.glucose), fixed(1.0));
        assert_eq!(ledger.amount(f.glucose), Fixed64::ZERO);
        assert_eq!(ledger.amount(f.atp), fixed(6.5));
    }

    #[test]
    fn overflow_reported_when_full() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(20.0));
        ledger.set_amount(f.glucose, fixed(20.0));
        ledger.set_amount(f.atp, fixed(18.0));
        let out = run(
            &f,
            &mut ledger,
            &[ProcessInstance::new(f.glycolysis, Fixed64::ONE)],
            &UniformBiome::new(),
        );
        assert_eq!(out.overflow, vec![(f.atp, fixed(3.0))]);
        assert_eq!(ledger.amount(f.atp), fixed(20.0));
        assert_eq!(out.outcomes[0].produced_of(f.atp), fixed(5.0));
    }

    #[test]
    fn marks_every_touched_compound() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        let out = run(
            &f,
            &mut ledger,
            &[ProcessInstance::new(f.respiration, Fixed64::ONE)],
            &UniformBiome::new(),
        );
        assert!(out.useful.is_useful(f.glucose));
        assert!(out.useful.is_useful(f.oxygen));
        assert!(out.useful.is_useful(f.atp));
        assert!(!out.useful.is_useful(f.toxin));
    }

    #[test]
    fn zero_rate_consumes_nothing() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        ledger.set_amount(f.glucose, fixed(10.0));
        let inst = ProcessInstance::new(f.glycolysis, fixed(-3.0));
        assert_eq!(inst.rate, Fixed64::ZERO);
        run(&f, &mut ledger, &[inst], &UniformBiome::new());
        assert_eq!(ledger.amount(f.glucose), fixed(10.0));
    }

    #[test]
    fn speed_multiplier_scales_throughput() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        ledger.set_amount(f.glucose, fixed(50.0));
        let inst = ProcessInstance::new(f.glycolysis, Fixed64::ONE).with_speed_multiplier(fixed(2.0));
        run(&f, &mut ledger, &[inst], &UniformBiome::new());
        assert_eq!(ledger.amount(f.glucose), fixed(30.0));
        assert_eq!(ledger.amount(f.atp), fixed(10.0));
    }

    #[test]
    fn unknown_process_keeps_outcomes_aligned() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        ledger.set_amount(f.glucose, fixed(50.0));
        let out = run(
            &f,
            &mut ledger,
            &[
                ProcessInstance::new(ProcessId(42), Fixed64::ONE),
                ProcessInstance::new(f.glycolysis, Fixed64::ONE),
            ],
            &UniformBiome::new(),
        );
        assert_eq!(out.outcomes.len(), 2);
        assert_eq!(out.outcomes[0].speed, Fixed64::ZERO);
        assert_eq!(out.outcomes[1].process, f.glycolysis);
        assert_eq!(out.outcomes[1].speed, Fixed64::ONE);
    }

    #[test]
    fn energy_accounting_covers_every_process() {
        let f = fixture();
        let mut ledger = CompoundLedger::new(fixed(100.0));
        ledger.set_amount(f.glucose, fixed(50.0));
        ledger.set_amount(f.atp, fixed(10.0));
        let out = run(
            &f,
            &mut ledger,
            &[
                ProcessInstance::new(f.glycolysis, Fixed64::ONE),
                ProcessInstance::new(f.toxin_synthesis, Fixed64::ONE),
            ],
            &UniformBiome::new(),
        );
        let mut balance = EnergyBalance::itemized(true);
        for outcome in &out.outcomes {
            account_energy(&f.registry, outcome, &mut balance);
        }
        // Toxin synthesis is not metabolic but still spends atp.
        assert_eq!(balance.total_production(), fixed(5.0));
        assert_eq!(balance.total_consumption(), fixed(1.0));
        assert_eq!(balance.final_balance(), fixed(4.0));
        let items = balance.itemization().unwrap();
        let reqs = items.production_requirements.as_ref().unwrap();
        assert_eq!(reqs["glycolysis"][&f.glucose], fixed(10.0));
    }
}
