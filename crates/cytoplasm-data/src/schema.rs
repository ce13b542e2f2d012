//! Serde data file structs for cell chemistry definitions.
//!
//! These structs define the on-disk format for compounds and processes.
//! They are deserialized from RON, JSON, or TOML data files and then
//! resolved into registry types by the loader.

use serde::Deserialize;

// ===========================================================================
// Compounds
// ===========================================================================

/// A compound definition in a data file. Every flag defaults to `false`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompoundData {
    pub name: String,
    #[serde(default)]
    pub always_useful: bool,
    #[serde(default)]
    pub distributable: bool,
    #[serde(default)]
    pub environmental: bool,
    #[serde(default)]
    pub cloud: bool,
    /// Marks the compound energy balances are measured in. At most one.
    #[serde(default)]
    pub energy: bool,
}

// ===========================================================================
// Processes
// ===========================================================================

/// A process input or output, in short tuple form or full form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProcessEntryData {
    /// Short form: `("compound_name", weight)`.
    Short(String, f64),
    /// Full form with explicit fields.
    Full { compound: String, weight: f64 },
}

impl ProcessEntryData {
    pub fn compound(&self) -> &str {
        match self {
            Self::Short(name, _) => name,
            Self::Full { compound, .. } => compound,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Self::Short(_, weight) | Self::Full { weight, .. } => *weight,
        }
    }
}

/// A process definition in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessData {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<ProcessEntryData>,
    #[serde(default)]
    pub outputs: Vec<ProcessEntryData>,
    /// Whether the process counts toward energy accounting.
    #[serde(default)]
    pub metabolic: bool,
}

// ===========================================================================
// TOML wrappers
// ===========================================================================

/// TOML has no top-level arrays, so lists live under a key.
#[derive(Debug, Clone, Deserialize)]
pub struct TomlCompounds {
    pub compounds: Vec<CompoundData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlProcesses {
    pub processes: Vec<ProcessData>,
}

// ===========================================================================
// Tests
// ===========================================================================
