//! Simulation configuration.
//!
//! Numeric settings are `f64` on disk and converted to [`Fixed64`] once when
//! the simulation is built. Every section has working defaults, so a config
//! file only needs the fields it changes.

use crate::fixed::{Fixed64, f64_to_fixed64};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Environment variable selecting the execution mode.
pub const EXECUTION_ENV: &str = "CYTOPLASM_EXECUTION";
/// Environment variable overriding the available thread count.
pub const WORKERS_ENV: &str = "CYTOPLASM_WORKERS";

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// How the scheduler runs its two lanes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Threaded when at least two threads are available and the plan has a
    /// worker lane, sequential otherwise.
    #[default]
    Auto,
    /// Always run the worker lane on its own thread.
    Threaded,
    /// Run both lanes on the calling thread.
    Sequential,
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "threaded" => Ok(Self::Threaded),
            "sequential" => Ok(Self::Sequential),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub mode: ExecutionMode,
    /// Threads assumed available. `None` asks the OS.
    pub worker_threads: Option<usize>,
}

impl SchedulerConfig {
    /// Apply `CYTOPLASM_EXECUTION` and `CYTOPLASM_WORKERS` if set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(mode) = lookup(EXECUTION_ENV) {
            self.mode = mode.parse()?;
        }
        if let Some(workers) = lookup(WORKERS_ENV) {
            let n = workers
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidWorkers(workers.clone()))?;
            self.worker_threads = Some(n);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Economy tuning
// ---------------------------------------------------------------------------

/// Energy costs, per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpkeepConfig {
    /// Osmoregulation cost per hex.
    pub osmoregulation_cost: f64,
    /// Movement cost per hex while moving.
    pub base_movement_cost: f64,
    pub flagellum_cost: f64,
    pub cilium_cost: f64,
}

impl Default for UpkeepConfig {
    fn default() -> Self {
        Self {
            osmoregulation_cost: 1.0,
            base_movement_cost: 1.0,
            flagellum_cost: 7.1,
            cilium_cost: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VentingConfig {
    /// Non-useful cloud compound vented per second.
    pub rate: f64,
}

impl Default for VentingConfig {
    fn default() -> Self {
        Self { rate: 5.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsorptionConfig {
    pub enabled: bool,
    /// Global multiplier on every anatomy's absorption rate.
    pub scale: f64,
}

impl Default for AbsorptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// SimulationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Length of one fixed step, in seconds.
    pub fixed_timestep: f64,
    /// Upper bound on steps run by one `advance` call.
    pub max_steps_per_advance: u32,
    pub scheduler: SchedulerConfig,
    pub upkeep: UpkeepConfig,
    pub venting: VentingConfig,
    pub absorption: AbsorptionConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fixed_timestep: 1.0 / 60.0,
            max_steps_per_advance: 8,
            scheduler: SchedulerConfig::default(),
            upkeep: UpkeepConfig::default(),
            venting: VentingConfig::default(),
            absorption: AbsorptionConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fixed_timestep.is_finite() && self.timestep() > Fixed64::ZERO) {
            return Err(ConfigError::OutOfRange {
                field: "fixed_timestep",
                requirement: "positive",
                value: self.fixed_timestep,
            });
        }
        if self.max_steps_per_advance == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_steps_per_advance",
                requirement: "at least 1",
                value: 0.0,
            });
        }
        for (field, value) in [
            ("upkeep.osmoregulation_cost", self.upkeep.osmoregulation_cost),
            ("upkeep.base_movement_cost", self.upkeep.base_movement_cost),
            ("upkeep.flagellum_cost", self.upkeep.flagellum_cost),
            ("upkeep.cilium_cost", self.upkeep.cilium_cost),
            ("venting.rate", self.venting.rate),
            ("absorption.scale", self.absorption.scale),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::OutOfRange {
                    field,
                    requirement: "finite and non-negative",
                    value,
                });
            }
        }
        Ok(())
    }

    /// The fixed step length as a fixed-point number.
    pub fn timestep(&self) -> Fixed64 {
        f64_to_fixed64(self.fixed_timestep)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid execution mode '{0}' (expected auto, threaded or sequential)")]
    InvalidMode(String),
    #[error("invalid worker thread count '{0}'")]
    InvalidWorkers(String),
    #[error("{field} must be {requirement}, got {value}")]
    OutOfRange {
        field: &'static str,
        requirement: &'static str,
        value: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.mode, ExecutionMode::Auto);
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Threaded".parse::<ExecutionMode>(), Ok(ExecutionMode::Threaded));
        assert_eq!(" sequential ".parse::<ExecutionMode>(), Ok(ExecutionMode::Sequential));
        assert!("fast".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn overrides_apply() {
        let vars: HashMap<&str, &str> =
            [(EXECUTION_ENV, "sequential"), (WORKERS_ENV, "4")].into_iter().collect();
        let mut config = SchedulerConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.mode, ExecutionMode::Sequential);
        assert_eq!(config.worker_threads, Some(4));
    }

    #[test]
    fn bad_worker_override_is_an_error() {
        let mut config = SchedulerConfig::default();
        let result = config.apply_overrides(|k| (k == WORKERS_ENV).then(|| "many".to_string()));
        assert_eq!(result, Err(ConfigError::InvalidWorkers("many".to_string())));
    }

    #[test]
    fn rejects_non_positive_timestep() {
        let config = SimulationConfig {
            fixed_timestep: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "fixed_timestep", .. })
        ));
    }

    #[test]
    fn rejects_timestep_below_fixed_resolution() {
        let config = SimulationConfig {
            fixed_timestep: 1e-12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_costs() {
        let mut config = SimulationConfig::default();
        config.upkeep.flagellum_cost = -1.0;
        assert!(config.validate().is_err());
    }
}
