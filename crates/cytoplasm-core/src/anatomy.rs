use crate::fixed::Fixed64;
use serde::{Deserialize, Serialize};

/// The numeric body plan of an entity, as far as the economy cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anatomy {
    pub hex_count: u32,
    pub flagella: u32,
    pub cilia: u32,
    /// Per-compound ledger capacity.
    pub storage: Fixed64,
    pub osmoregulation_multiplier: Fixed64,
    /// Fraction of ambient cloud concentration absorbed per second.
    pub absorption_rate: Fixed64,
}

impl Default for Anatomy {
    fn default() -> Self {
        Self {
            hex_count: 1,
            flagella: 0,
            cilia: 0,
            storage: Fixed64::from_num(10),
            osmoregulation_multiplier: Fixed64::ONE,
            absorption_rate: Fixed64::ZERO,
        }
    }
}

impl Anatomy {
    /// Ledger capacity this anatomy provides.
    pub fn capacity(&self) -> Fixed64 {
        self.storage.max(Fixed64::ZERO)
    }
}

/// Position and velocity in the plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Motion {
    pub position: [Fixed64; 2],
    pub velocity: [Fixed64; 2],
    pub moving: bool,
}

impl Motion {
    pub fn with_velocity(vx: Fixed64, vy: Fixed64) -> Self {
        Self {
            position: [Fixed64::ZERO; 2],
            velocity: [vx, vy],
            moving: vx != Fixed64::ZERO || vy != Fixed64::ZERO,
        }
    }
}

/// Energy costs computed for the current tick, before they are paid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnergyCosts {
    pub osmoregulation: Fixed64,
    pub base_movement: Fixed64,
    pub flagella: Fixed64,
    pub cilia: Fixed64,
}

impl EnergyCosts {
    pub fn movement(&self) -> Fixed64 {
        self.base_movement + self.flagella + self.cilia
    }

    pub fn total(&self) -> Fixed64 {
        self.osmoregulation + self.movement()
    }
}
