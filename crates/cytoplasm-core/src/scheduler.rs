//! Fixed-step scheduler: a stage plan executed on two lanes.
//!
//! # Plan
//!
//! A [`StagePlan`] is an ordered list of named stages. Each stage holds a
//! contiguous run of systems on the *main* lane and another on the *worker*
//! lane. Within a lane, systems run in insertion order.
//!
//! The plan is validated once when built: systems in different lanes of the
//! same stage may not write a resource the other lane reads or writes.
//!
//! # Execution
//!
//! - **Threaded**: the main lane runs on the calling thread, the worker lane
//!   on a scoped thread. At the end of every stage both lanes meet at a
//!   rendezvous (a pair of one-slot channels). A lane that stops early drops
//!   its channel ends, so the peer fails at its next rendezvous instead of
//!   waiting forever.
//! - **Sequential**: stage by stage, main-lane systems then worker-lane
//!   systems, all on the calling thread.
//!
//! Both paths produce identical results for a valid plan.
//!
//! ```rust,ignore
//! let plan = PlanBuilder::new()
//!     .stage("prepare").main(TickResetSystem).worker(EnergyCostSystem::new(&upkeep))
//!     .stage("process").main(ProcessSystem).worker(MovementSystem)
//!     .build()?;
//! ```

use crate::config::{ExecutionMode, SchedulerConfig};
use crate::fixed::{Fixed64, Ticks};
use crate::world::{AccessError, Resource, SystemAccess, SystemContext, World};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use tracing::{debug, error, trace, warn};

// ---------------------------------------------------------------------------
// System trait
// ---------------------------------------------------------------------------

/// One unit of per-tick work.
pub trait System: Send + fmt::Debug {
    /// Unique name, used in logs and errors.
    fn name(&self) -> &str;

    /// The world resources this system touches.
    fn access(&self) -> SystemAccess;

    /// Run once per tick.
    fn update(&mut self, ctx: &SystemContext<'_>) -> Result<(), SystemError>;

    /// Called after every tick, including ticks that failed.
    fn after_tick(&mut self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Lanes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Main,
    Worker,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Main => f.write_str("main"),
            Lane::Worker => f.write_str("worker"),
        }
    }
}

/// How a tick was actually executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    Threaded,
    Sequential,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Slot {
    name: String,
    access: SystemAccess,
    system: Box<dyn System>,
}

#[derive(Debug, Clone)]
struct Stage {
    name: String,
    main: Range<usize>,
    worker: Range<usize>,
}

impl Stage {
    fn range(&self, lane: Lane) -> Range<usize> {
        match lane {
            Lane::Main => self.main.clone(),
            Lane::Worker => self.worker.clone(),
        }
    }
}

/// A validated stage plan.
#[derive(Debug)]
pub struct StagePlan {
    stages: Vec<Stage>,
    main: Vec<Slot>,
    worker: Vec<Slot>,
}

impl StagePlan {
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// System names of one lane of a stage, in run order.
    pub fn systems_in(&self, stage: &str, lane: Lane) -> Vec<&str> {
        let Some(s) = self.stages.iter().find(|s| s.name == stage) else {
            return Vec::new();
        };
        self.lane(lane)[s.range(lane)]
            .iter()
            .map(|slot| slot.name.as_str())
            .collect()
    }

    pub fn has_worker_systems(&self) -> bool {
        !self.worker.is_empty()
    }

    /// Look up a system by name.
    pub fn system(&self, name: &str) -> Option<&dyn System> {
        self.main
            .iter()
            .chain(&self.worker)
            .find(|slot| slot.name == name)
            .map(|slot| slot.system.as_ref())
    }

    fn lane(&self, lane: Lane) -> &[Slot] {
        match lane {
            Lane::Main => &self.main,
            Lane::Worker => &self.worker,
        }
    }
}

/// Builds a [`StagePlan`]. Systems attach to the most recently opened stage.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    stages: Vec<Stage>,
    main: Vec<Slot>,
    worker: Vec<Slot>,
    orphan: Option<String>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new stage.
    pub fn stage(mut self, name: &str) -> Self {
        self.stages.push(Stage {
            name: name.to_string(),
            main: self.main.len()..self.main.len(),
            worker: self.worker.len()..self.worker.len(),
        });
        self
    }

    /// Append a system to the current stage's main lane.
    pub fn main(self, system: impl System + 'static) -> Self {
        self.push(Lane::Main, Box::new(system))
    }

    /// Append a system to the current stage's worker lane.
    pub fn worker(self, system: impl System + 'static) -> Self {
        self.push(Lane::Worker, Box::new(system))
    }

    /// Append an already boxed system.
    pub fn push(mut self, lane: Lane, system: Box<dyn System>) -> Self {
        let slot = Slot {
            name: system.name().to_string(),
            access: system.access(),
            system,
        };
        let Some(stage) = self.stages.last_mut() else {
            self.orphan.get_or_insert(slot.name);
            return self;
        };
        match lane {
            Lane::Main => {
                self.main.push(slot);
                stage.main.end = self.main.len();
            }
            Lane::Worker => {
                self.worker.push(slot);
                stage.worker.end = self.worker.len();
            }
        }
        self
    }

    /// Validate and freeze the plan.
    pub fn build(self) -> Result<StagePlan, PlanError> {
        if let Some(name) = self.orphan {
            return Err(PlanError::NoStage(name));
        }
        if self.main.is_empty() && self.worker.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut stage_names = HashSet::new();
        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(PlanError::DuplicateStage(stage.name.clone()));
            }
        }

        let mut system_names = HashSet::new();
        for slot in self.main.iter().chain(&self.worker) {
            if !system_names.insert(slot.name.as_str()) {
                return Err(PlanError::DuplicateSystem(slot.name.clone()));
            }
        }

        for stage in &self.stages {
            for a in &self.main[stage.main.clone()] {
                for b in &self.worker[stage.worker.clone()] {
                    if let Some(resource) = a.access.conflict_with(&b.access) {
                        return Err(PlanError::Conflict {
                            stage: stage.name.clone(),
                            main: a.name.clone(),
                            worker: b.name.clone(),
                            resource,
                        });
                    }
                }
            }
        }

        debug!(
            stages = self.stages.len(),
            main = self.main.len(),
            worker = self.worker.len(),
            "stage plan built"
        );
        Ok(StagePlan {
            stages: self.stages,
            main: self.main,
            worker: self.worker,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("plan contains no systems")]
    Empty,
    #[error("system '{0}' was added before any stage")]
    NoStage(String),
    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),
    #[error("duplicate system name '{0}'")]
    DuplicateSystem(String),
    #[error("stage '{stage}': '{main}' and '{worker}' conflict on {resource:?}")]
    Conflict {
        stage: String,
        main: String,
        worker: String,
        resource: Resource,
    },
}

// ---------------------------------------------------------------------------
// Scheduler errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("system '{system}' failed in stage '{stage}' on the {lane} lane: {source}")]
    SystemFailed {
        stage: String,
        lane: Lane,
        system: String,
        source: SystemError,
    },
    #[error("{lane} lane stopped at stage '{stage}' because its peer lane stopped")]
    PeerAborted { stage: String, lane: Lane },
    #[error("worker lane panicked")]
    WorkerPanicked,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl SchedulerError {
    fn is_root_cause(&self) -> bool {
        !matches!(self, SchedulerError::PeerAborted { .. })
    }
}

// ---------------------------------------------------------------------------
// Rendezvous
// ---------------------------------------------------------------------------

/// One side of the two-party stage barrier.
struct Rendezvous {
    tx: SyncSender<()>,
    rx: Receiver<()>,
}

impl Rendezvous {
    fn pair() -> (Self, Self) {
        let (to_worker, from_main) = sync_channel(1);
        let (to_main, from_worker) = sync_channel(1);
        (
            Rendezvous {
                tx: to_worker,
                rx: from_worker,
            },
            Rendezvous {
                tx: to_main,
                rx: from_main,
            },
        )
    }

    /// Signal arrival, then wait for the peer. Fails if the peer is gone.
    fn arrive(&self) -> bool {
        self.tx.send(()).is_ok() && self.rx.recv().is_ok()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runs a [`StagePlan`] once per tick.
#[derive(Debug)]
pub struct Scheduler {
    plan: StagePlan,
    config: SchedulerConfig,
    fallback_logged: bool,
}

impl Scheduler {
    pub fn new(plan: StagePlan, config: SchedulerConfig) -> Self {
        Self {
            plan,
            config,
            fallback_logged: false,
        }
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.config.mode = mode;
        self.fallback_logged = false;
    }

    /// Decide how the next tick runs.
    pub fn resolve_path(&mut self) -> ExecutionPath {
        match self.config.mode {
            ExecutionMode::Sequential => ExecutionPath::Sequential,
            ExecutionMode::Threaded => ExecutionPath::Threaded,
            ExecutionMode::Auto => {
                let threads = self.config.worker_threads.unwrap_or_else(|| {
                    std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1)
                });
                if threads >= 2 && self.plan.has_worker_systems() {
                    ExecutionPath::Threaded
                } else {
                    if !self.fallback_logged {
                        warn!(
                            threads,
                            worker_systems = self.plan.worker.len(),
                            "falling back to sequential execution"
                        );
                        self.fallback_logged = true;
                    }
                    ExecutionPath::Sequential
                }
            }
        }
    }

    /// Run every stage once against `world`.
    ///
    /// `after_tick` runs for every system whether or not the tick failed.
    pub fn run_tick(
        &mut self,
        world: &World,
        delta: Fixed64,
        tick: Ticks,
    ) -> Result<ExecutionPath, SchedulerError> {
        let path = self.resolve_path();
        trace!(tick, ?path, "tick start");
        let result = match path {
            ExecutionPath::Threaded => self.run_threaded(world, delta, tick),
            ExecutionPath::Sequential => self.run_sequential(world, delta, tick),
        };
        for slot in self.plan.main.iter_mut().chain(self.plan.worker.iter_mut()) {
            slot.system.after_tick();
        }
        result.map(|()| path)
    }

    fn run_sequential(&mut self, world: &World, delta: Fixed64, tick: Ticks) -> Result<(), SchedulerError> {
        let StagePlan {
            stages,
            main,
            worker,
        } = &mut self.plan;
        for stage in stages.iter() {
            trace!(stage = %stage.name, "stage");
            run_stage(Lane::Main, stage, main, world, delta, tick)?;
            run_stage(Lane::Worker, stage, worker, world, delta, tick)?;
        }
        Ok(())
    }

    fn run_threaded(&mut self, world: &World, delta: Fixed64, tick: Ticks) -> Result<(), SchedulerError> {
        let StagePlan {
            stages,
            main,
            worker,
        } = &mut self.plan;
        let stages: &[Stage] = stages;
        let (main_side, worker_side) = Rendezvous::pair();

        std::thread::scope(|scope| {
            let handle = std::thread::Builder::new()
                .name("cytoplasm-worker".to_string())
                .spawn_scoped(scope, move || {
                    run_lane(Lane::Worker, stages, worker, world, delta, tick, worker_side)
                })
                .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

            let main_result = run_lane(Lane::Main, stages, main, world, delta, tick, main_side);
            let worker_result = handle.join().unwrap_or(Err(SchedulerError::WorkerPanicked));

            match (main_result, worker_result) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
                (Err(a), Err(b)) => Err(if a.is_root_cause() || !b.is_root_cause() { a } else { b }),
            }
        })
    }
}

/// Run one lane's systems of one stage.
fn run_stage(
    lane: Lane,
    stage: &Stage,
    slots: &mut [Slot],
    world: &World,
    delta: Fixed64,
    tick: Ticks,
) -> Result<(), SchedulerError> {
    for slot in &mut slots[stage.range(lane)] {
        let ctx = world.context(&slot.name, &slot.access, delta, tick);
        if let Err(source) = slot.system.update(&ctx) {
            error!(
                stage = %stage.name,
                %lane,
                system = %slot.name,
                error = %source,
                "system failed"
            );
            return Err(SchedulerError::SystemFailed {
                stage: stage.name.clone(),
                lane,
                system: slot.name.clone(),
                source,
            });
        }
    }
    Ok(())
}

/// Run a whole lane with a rendezvous after every stage.
fn run_lane(
    lane: Lane,
    stages: &[Stage],
    slots: &mut [Slot],
    world: &World,
    delta: Fixed64,
    tick: Ticks,
    rendezvous: Rendezvous,
) -> Result<(), SchedulerError> {
    for stage in stages {
        if lane == Lane::Main {
            trace!(stage = %stage.name, "stage");
        }
        run_stage(lane, stage, slots, world, delta, tick)?;
        if !rendezvous.arrive() {
            return Err(SchedulerError::PeerAborted {
                stage: stage.name.clone(),
                lane,
            });
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
