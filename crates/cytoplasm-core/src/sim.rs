//! Simulation state, stepping strategy and state hashing.
//!
//! The simulation advances in fixed steps of `fixed_timestep` seconds. Hosts
//! either call [`Simulation::advance_one_fixed_step`] at their own fixed rate,
//! or feed elapsed wall time to [`Simulation::advance`] which accumulates it
//! and runs as many fixed steps as fit, carrying the remainder forward.
//!
//! [`Simulation::advance_one_fixed_step`]: crate::simulation::Simulation::advance_one_fixed_step
//! [`Simulation::advance`]: crate::simulation::Simulation::advance

use crate::fixed::{Fixed64, Ticks};
use crate::id::CompoundId;

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Mutable stepping state tracked by the simulation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SimState {
    /// Current tick counter. Incremented by 1 for each fixed step.
    pub tick: Ticks,

    /// Elapsed time not yet consumed by a fixed step, in seconds.
    pub accumulator: Fixed64,
}

impl SimState {
    /// Create a new simulation state starting at tick 0.
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Advance result
// ---------------------------------------------------------------------------

/// Result of a `Simulation::advance()` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdvanceResult {
    /// Number of fixed steps actually executed.
    pub steps_run: u64,

    /// Whole steps that were due but dropped because the per-call step limit
    /// was reached.
    pub steps_dropped: u64,
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// Desync fingerprint of one tick: every ledger and energy balance, in
/// entity order.
///
/// FNV-1a (64-bit) over the raw bits of fixed-point amounts, so two runs
/// agree exactly when their state does. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(u64);

/// Tag opening each per-entity record. An entity with no balance then
/// cannot alias the next entity's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Record {
    Ledger = 1,
    Balance = 2,
}

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn at_tick(tick: Ticks) -> Self {
        let mut hash = Self(Self::FNV_OFFSET);
        hash.feed(&tick.to_le_bytes());
        hash
    }

    fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn record(&mut self, record: Record) {
        self.feed(&[record as u8]);
    }

    pub fn amount(&mut self, v: Fixed64) {
        self.feed(&v.to_bits().to_le_bytes());
    }

    /// A ledger entry: which compound and how much of it.
    pub fn held(&mut self, compound: CompoundId, amount: Fixed64) {
        self.feed(&compound.0.to_le_bytes());
        self.amount(amount);
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}
