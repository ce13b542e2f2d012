//! Cytoplasm Core -- the fixed-step simulation core of a cell simulator.
//!
//! This crate provides capacity-bounded compound storage, weighted
//! production/consumption processes, per-entity energy accounting, colony
//! resource sharing and the two-lane scheduler that drives them, all in
//! deterministic fixed-point arithmetic.
//!
//! # Tick Pipeline
//!
//! Each call to [`simulation::Simulation::advance_one_fixed_step`] runs the
//! default stage plan once:
//!
//! 1. **prepare** -- Reset energy balances and useful marks; compute upkeep
//!    costs and absorb cloud compounds (worker lane).
//! 2. **process** -- Run every process against its entity or colony store;
//!    integrate movement (worker lane).
//! 3. **upkeep** -- Pay osmoregulation and movement costs in the energy
//!    compound.
//! 4. **share** -- Even out distributable compounds across colony members.
//! 5. **vent** -- Release unused cloud compounds and anything over capacity.
//! 6. **settle** -- Clamp negative amounts; hand vented compounds to the
//!    vent sink (worker lane).
//!
//! Both lanes meet at the end of every stage. Running them on one thread
//! gives the same result bit for bit.
//!
//! # Key Types
//!
//! - [`simulation::Simulation`] -- Entry point: world, scheduler, stepping.
//! - [`compound::CompoundLedger`] -- Per-entity storage with a uniform cap.
//! - [`process::run_processes`] -- The throttling process engine.
//! - [`energy::EnergyBalance`] -- Summary or itemized energy accounting.
//! - [`colony::ColonyLedger`] -- Member ledgers viewed as one store.
//! - [`scheduler::StagePlan`] -- Validated stages on two lanes.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point type for deterministic math.
//! - [`registry::Registry`] -- Immutable compound and process definitions.

pub mod anatomy;
pub mod colony;
pub mod compound;
pub mod config;
pub mod energy;
pub mod environment;
pub mod fixed;
pub mod id;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod sim;
pub mod simulation;
pub mod systems;
pub mod validation;
pub mod world;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
