//! State comparison and determinism checking.
//!
//! The economy must come out bit-identical whichever execution path ran it.
//! These helpers compare two simulations entity by entity, produce a
//! `bitcode` snapshot of the economy for byte-level comparison, and run the
//! same setup threaded and sequentially side by side.

use crate::compound::CompoundLedger;
use crate::config::ExecutionMode;
use crate::energy::EnergyBalance;
use crate::fixed::Ticks;
use crate::id::EntityId;
use crate::simulation::{SimError, Simulation};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// The economy state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity: EntityId,
    pub ledger: CompoundLedger,
    pub balance: EnergyBalance,
}

/// The economy state of a whole simulation, in entity slot order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EconomySnapshot {
    pub tick: Ticks,
    pub entities: Vec<EntitySnapshot>,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
}

impl EconomySnapshot {
    pub fn capture(sim: &Simulation) -> Self {
        let entities = sim
            .world()
            .entities()
            .filter_map(|entity| {
                Some(EntitySnapshot {
                    entity,
                    ledger: sim.ledger(entity)?,
                    balance: sim.balance(entity)?,
                })
            })
            .collect();
        Self {
            tick: sim.tick(),
            entities,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        bitcode::serialize(self).map_err(|e| SnapshotError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, SnapshotError> {
        bitcode::deserialize(data).map_err(|e| SnapshotError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// State diff
// ---------------------------------------------------------------------------

/// Difference between two simulations at the entity level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityDiff {
    OnlyInA(EntityId),
    OnlyInB(EntityId),
    /// Entity exists in both but its economy differs.
    StateMismatch { entity: EntityId, description: String },
}

#[derive(Debug, Clone)]
pub struct StateDiff {
    pub is_identical: bool,
    pub tick_matches: bool,
    pub entity_diffs: Vec<EntityDiff>,
}

/// Compare the economy of two simulations.
pub fn diff_simulations(a: &Simulation, b: &Simulation) -> StateDiff {
    let tick_matches = a.tick() == b.tick();
    let mut entity_diffs = Vec::new();

    for entity in a.world().entities() {
        if !b.world().contains(entity) {
            entity_diffs.push(EntityDiff::OnlyInA(entity));
            continue;
        }
        let mut mismatches = Vec::new();
        if a.ledger(entity) != b.ledger(entity) {
            mismatches.push("ledger");
        }
        if a.balance(entity) != b.balance(entity) {
            mismatches.push("energy_balance");
        }
        if a.useful(entity) != b.useful(entity) {
            mismatches.push("useful_marks");
        }
        if !mismatches.is_empty() {
            entity_diffs.push(EntityDiff::StateMismatch {
                entity,
                description: mismatches.join(", "),
            });
        }
    }
    for entity in b.world().entities() {
        if !a.world().contains(entity) {
            entity_diffs.push(EntityDiff::OnlyInB(entity));
        }
    }

    StateDiff {
        is_identical: tick_matches && entity_diffs.is_empty(),
        tick_matches,
        entity_diffs,
    }
}

// ---------------------------------------------------------------------------
// Determinism validation
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DeterminismResult {
    pub is_deterministic: bool,
    /// First tick whose hashes differed.
    pub divergence_tick: Option<Ticks>,
    /// (tick, threaded hash, sequential hash) after every step.
    pub hash_log: Vec<(Ticks, u64, u64)>,
}

/// Build the same simulation twice, run one threaded and one sequentially
/// for `ticks` steps, and compare state hashes after every step.
pub fn validate_execution_paths(
    build: impl Fn() -> Result<Simulation, SimError>,
    ticks: u64,
) -> Result<DeterminismResult, SimError> {
    let mut threaded = build()?;
    let mut sequential = build()?;
    threaded.set_execution_mode(ExecutionMode::Threaded);
    sequential.set_execution_mode(ExecutionMode::Sequential);

    let mut hash_log = Vec::with_capacity(ticks as usize);
    let mut divergence_tick = None;
    for _ in 0..ticks {
        threaded.advance_one_fixed_step()?;
        sequential.advance_one_fixed_step()?;

        let (ha, hb) = (threaded.state_hash(), sequential.state_hash());
        let tick = threaded.tick();
        hash_log.push((tick, ha, hb));
        if ha != hb && divergence_tick.is_none() {
            divergence_tick = Some(tick);
        }
    }

    Ok(DeterminismResult {
        is_deterministic: divergence_tick.is_none(),
        divergence_tick,
        hash_log,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn identical_setups_have_no_diff() {
        let f = fixture();
        let mut a = simulation(&f, config(ExecutionMode::Sequential));
        let mut b = simulation(&f, config(ExecutionMode::Sequential));
        populate(&mut a, &f, 4);
        populate(&mut b, &f, 4);
        let diff = diff_simulations(&a, &b);
        assert!(diff.is_identical);
    }

    #[test]
    fn diff_detects_tick_and_ledger_changes() {
        let f = fixture();
        let mut a = simulation(&f, config(ExecutionMode::Sequential));
        let mut b = simulation(&f, config(ExecutionMode::Sequential));
        populate(&mut a, &f, 2);
        populate(&mut b, &f, 2);
        a.advance_one_fixed_step().unwrap();

        let diff = diff_simulations(&a, &b);
        assert!(!diff.is_identical);
        assert!(!diff.tick_matches);
        assert!(diff
            .entity_diffs
            .iter()
            .any(|d| matches!(d, EntityDiff::StateMismatch { description, .. } if description.contains("ledger"))));
    }

    #[test]
    fn diff_detects_extra_entities() {
        let f = fixture();
        let a = simulation(&f, config(ExecutionMode::Sequential));
        let mut b = simulation(&f, config(ExecutionMode::Sequential));
        b.spawn_entity(cell(10.0));
        let diff = diff_simulations(&a, &b);
        assert!(matches!(diff.entity_diffs.as_slice(), [EntityDiff::OnlyInB(_)]));
    }

    #[test]
    fn snapshot_bytes_survive_decode() {
        let f = fixture();
        let mut sim = simulation(&f, config(ExecutionMode::Sequential));
        populate(&mut sim, &f, 3);
        sim.advance_one_fixed_step().unwrap();
        let snapshot = EconomySnapshot::capture(&sim);
        let bytes = snapshot.encode().unwrap();
        assert_eq!(EconomySnapshot::decode(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        assert!(matches!(
            EconomySnapshot::decode(&[0xff, 0x01]),
            Err(SnapshotError::Decode(_))
        ));
    }

    #[test]
    fn execution_paths_agree() {
        let f = fixture();
        let result = validate_execution_paths(
            || {
                let mut sim = simulation(&f, config(ExecutionMode::Auto));
                populate(&mut sim, &f, 12);
                Ok(sim)
            },
            30,
        )
        .unwrap();
        assert!(result.is_deterministic, "diverged at {:?}", result.divergence_tick);
        assert_eq!(result.hash_log.len(), 30);
    }
}
