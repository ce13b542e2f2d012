use crate::fixed::Fixed64;
use crate::id::*;
use std::collections::{HashMap, HashSet};

/// Behavioural flags attached to a compound type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompoundFlags {
    /// Useful regardless of which processes ran this tick.
    pub always_useful: bool,
    /// Shared between colony members by surplus distribution.
    pub distributable: bool,
    /// Read from the surrounding biome instead of stored in a ledger.
    pub environmental: bool,
    /// Exists as a cloud in the world: absorbed from and vented into it.
    pub cloud: bool,
}

/// A compound type definition in the registry.
#[derive(Debug, Clone)]
pub struct CompoundDef {
    pub name: String,
    pub flags: CompoundFlags,
}

/// A process input/output entry: a compound and its per-unit-rate weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessEntry {
    pub compound: CompoundId,
    pub weight: Fixed64,
}

impl ProcessEntry {
    pub fn new(compound: CompoundId, weight: Fixed64) -> Self {
        Self { compound, weight }
    }
}

/// A process definition: a weighted conversion of inputs into outputs.
#[derive(Debug, Clone)]
pub struct ProcessDef {
    pub name: String,
    pub inputs: Vec<ProcessEntry>,
    pub outputs: Vec<ProcessEntry>,
    /// Marks the cell's core metabolism for display. Energy accounting
    /// covers every process regardless.
    pub metabolic: bool,
}

/// Builder for constructing an immutable Registry.
/// Three-phase lifecycle: registration -> mutation -> finalization.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    compounds: Vec<CompoundDef>,
    compound_name_to_id: HashMap<String, CompoundId>,
    processes: Vec<ProcessDef>,
    process_name_to_id: HashMap<String, ProcessId>,
    energy_compounds: Vec<CompoundId>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1: Register a compound type. Returns its ID.
    pub fn register_compound(&mut self, name: &str, flags: CompoundFlags) -> CompoundId {
        let id = CompoundId(self.compounds.len() as u32);
        self.compounds.push(CompoundDef {
            name: name.to_string(),
            flags,
        });
        self.compound_name_to_id.entry(name.to_string()).or_insert(id);
        id
    }

    /// Phase 1: Register a process. Returns its ID.
    pub fn register_process(
        &mut self,
        name: &str,
        inputs: Vec<ProcessEntry>,
        outputs: Vec<ProcessEntry>,
        metabolic: bool,
    ) -> ProcessId {
        let id = ProcessId(self.processes.len() as u32);
        self.processes.push(ProcessDef {
            name: name.to_string(),
            inputs,
            outputs,
            metabolic,
        });
        self.process_name_to_id.entry(name.to_string()).or_insert(id);
        id
    }

    /// Phase 1: Declare the compound that energy balances are measured in.
    pub fn set_energy_compound(&mut self, compound: CompoundId) {
        self.energy_compounds.push(compound);
    }

    /// Phase 2: Mutate an existing process by name.
    pub fn mutate_process<F>(&mut self, name: &str, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut ProcessDef),
    {
        let id = self
            .process_name_to_id
            .get(name)
            .ok_or(RegistryError::NotFound(name.to_string()))?;
        f(&mut self.processes[id.0 as usize]);
        Ok(())
    }

    /// Lookup compound ID by name.
    pub fn compound_id(&self, name: &str) -> Option<CompoundId> {
        self.compound_name_to_id.get(name).copied()
    }

    /// Lookup process ID by name.
    pub fn process_id(&self, name: &str) -> Option<ProcessId> {
        self.process_name_to_id.get(name).copied()
    }

    /// Phase 3: Validate and build the immutable registry.
    pub fn build(self) -> Result<Registry, RegistryError> {
        check_unique_names(self.compounds.iter().map(|c| c.name.as_str()))?;
        check_unique_names(self.processes.iter().map(|p| p.name.as_str()))?;

        let energy_compound = match self.energy_compounds.as_slice() {
            [] => None,
            [single] => Some(*single),
            [_, ..] => return Err(RegistryError::MultipleEnergyCompounds),
        };
        if let Some(energy) = energy_compound {
            let def = self
                .compounds
                .get(energy.0 as usize)
                .ok_or(RegistryError::InvalidEnergyCompound(energy))?;
            if def.flags.environmental {
                return Err(RegistryError::InvalidEnergyCompound(energy));
            }
        }

        for process in &self.processes {
            validate_process(process, &self.compounds)?;
        }

        Ok(Registry {
            compounds: self.compounds,
            compound_name_to_id: self.compound_name_to_id,
            processes: self.processes,
            process_name_to_id: self.process_name_to_id,
            energy_compound,
        })
    }
}

fn check_unique_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<(), RegistryError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}

fn validate_process(process: &ProcessDef, compounds: &[CompoundDef]) -> Result<(), RegistryError> {
    if process.inputs.is_empty() && process.outputs.is_empty() {
        return Err(RegistryError::EmptyProcess(process.name.clone()));
    }

    for (list, is_output) in [(&process.inputs, false), (&process.outputs, true)] {
        let mut seen = HashSet::new();
        for entry in list {
            let def = compounds.get(entry.compound.0 as usize).ok_or_else(|| {
                RegistryError::InvalidCompoundRef {
                    process: process.name.clone(),
                    compound: entry.compound,
                }
            })?;
            if entry.weight <= Fixed64::ZERO {
                return Err(RegistryError::NonPositiveWeight {
                    process: process.name.clone(),
                    compound: def.name.clone(),
                });
            }
            if !seen.insert(entry.compound) {
                return Err(RegistryError::DuplicateEntry {
                    process: process.name.clone(),
                    compound: def.name.clone(),
                });
            }
            if is_output && def.flags.environmental {
                return Err(RegistryError::EnvironmentalOutput {
                    process: process.name.clone(),
                    compound: def.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Immutable registry. Frozen after build(). Thread-safe to share.
#[derive(Debug)]
pub struct Registry {
    compounds: Vec<CompoundDef>,
    compound_name_to_id: HashMap<String, CompoundId>,
    processes: Vec<ProcessDef>,
    process_name_to_id: HashMap<String, ProcessId>,
    energy_compound: Option<CompoundId>,
}

impl Registry {
    pub fn compound(&self, id: CompoundId) -> Option<&CompoundDef> {
        self.compounds.get(id.0 as usize)
    }

    pub fn process(&self, id: ProcessId) -> Option<&ProcessDef> {
        self.processes.get(id.0 as usize)
    }

    pub fn compound_id(&self, name: &str) -> Option<CompoundId> {
        self.compound_name_to_id.get(name).copied()
    }

    pub fn process_id(&self, name: &str) -> Option<ProcessId> {
        self.process_name_to_id.get(name).copied()
    }

    pub fn compound_count(&self) -> usize {
        self.compounds.len()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// The compound energy balances are measured in, if any.
    pub fn energy_compound(&self) -> Option<CompoundId> {
        self.energy_compound
    }

    /// Iterate every compound in id order.
    pub fn compounds(&self) -> impl Iterator<Item = (CompoundId, &CompoundDef)> + '_ {
        self.compounds
            .iter()
            .enumerate()
            .map(|(i, def)| (CompoundId(i as u32), def))
    }

    /// Flags of a compound; unknown ids report no flags.
    pub fn flags(&self, id: CompoundId) -> CompoundFlags {
        self.compound(id).map(|c| c.flags).unwrap_or_default()
    }

    pub fn is_always_useful(&self, id: CompoundId) -> bool {
        self.flags(id).always_useful
    }

    pub fn is_distributable(&self, id: CompoundId) -> bool {
        self.flags(id).distributable
    }

    pub fn is_environmental(&self, id: CompoundId) -> bool {
        self.flags(id).environmental
    }

    pub fn is_cloud(&self, id: CompoundId) -> bool {
        self.flags(id).cloud
    }

    /// Compounds matching a flag predicate, in id order.
    pub fn compounds_where<'a>(
        &'a self,
        predicate: impl Fn(CompoundFlags) -> bool + 'a,
    ) -> impl Iterator<Item = CompoundId> + 'a {
        self.compounds()
            .filter(move |(_, def)| predicate(def.flags))
            .map(|(id, _)| id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate name: {0}")]
    DuplicateName(String),
    #[error("process '{process}' references unknown compound {compound:?}")]
    InvalidCompoundRef { process: String, compound: CompoundId },
    #[error("process '{0}' has neither inputs nor outputs")]
    EmptyProcess(String),
    #[error("process '{process}' has a non-positive weight for '{compound}'")]
    NonPositiveWeight { process: String, compound: String },
    #[error("process '{process}' lists '{compound}' twice")]
    DuplicateEntry { process: String, compound: String },
    #[error("process '{process}' outputs environmental compound '{compound}'")]
    EnvironmentalOutput { process: String, compound: String },
    #[error("more than one energy compound declared")]
    MultipleEnergyCompounds,
    #[error("invalid energy compound: {0:?}")]
    InvalidEnergyCompound(CompoundId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(v: f64) -> Fixed64 {
        Fixed64::from_num(v)
    }

    fn setup_builder() -> RegistryBuilder {
        let mut b = RegistryBuilder::new();
        let glucose = b.register_compound(
            "glucose",
            CompoundFlags {
                distributable: true,
                cloud: true,
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
        b.register_compound(
            "oxygen",
            CompoundFlags {
                environmental: true,
                ..Default::default()
            },
        );
        b.set_energy_compound(atp);
        b.register_process(
            "glycolysis",
            vec![ProcessEntry::new(glucose, fixed(1.0))],
            vec![ProcessEntry::new(atp, fixed(2.0))],
            true,
        );
        b
    }

    #[test]
    fn register_and_build() {
        let reg = setup_builder().build().unwrap();
        assert_eq!(reg.compound_count(), 3);
        assert_eq!(reg.process_count(), 1);
        assert_eq!(reg.energy_compound(), reg.compound_id("atp"));
    }

    #[test]
    fn lookup_by_name() {
        let reg = setup_builder().build().unwrap();
        assert!(reg.compound_id("glucose").is_some());
        assert!(reg.compound_id("nonexistent").is_none());
        let id = reg.process_id("glycolysis").unwrap();
        assert_eq!(reg.process(id).unwrap().name, "glycolysis");
    }

    #[test]
    fn flag_queries() {
        let reg = setup_builder().build().unwrap();
        let atp = reg.compound_id("atp").unwrap();
        let oxygen = reg.compound_id("oxygen").unwrap();
        assert!(reg.is_always_useful(atp));
        assert!(reg.is_environmental(oxygen));
        assert!(!reg.is_cloud(oxygen));
        let distributable: Vec<_> = reg.compounds_where(|f| f.distributable).collect();
        assert_eq!(distributable.len(), 2);
    }

    #[test]
    fn compounds_where_accepts_borrowing_predicate() {
        let reg = setup_builder().build().unwrap();
        let wanted = CompoundFlags {
            environmental: true,
            ..Default::default()
        };
        let matching: Vec<_> = reg.compounds_where(|f| f == wanted).collect();
        assert_eq!(matching, vec![reg.compound_id("oxygen").unwrap()]);
    }

    #[test]
    fn mutate_process() {
        let mut b = setup_builder();
        let oxygen = b.compound_id("oxygen").unwrap();
        b.mutate_process("glycolysis", |p| {
            p.inputs.push(ProcessEntry::new(oxygen, fixed(0.5)));
        })
        .unwrap();
        let reg = b.build().unwrap();
        let p = reg.process(reg.process_id("glycolysis").unwrap()).unwrap();
        assert_eq!(p.inputs.len(), 2);
    }

    #[test]
    fn mutate_nonexistent_fails() {
        let mut b = setup_builder();
        assert!(b.mutate_process("nonexistent", |_| {}).is_err());
    }

    #[test]
    fn empty_process_rejected() {
        let mut b = setup_builder();
        b.register_process("nothing", vec![], vec![], false);
        assert!(matches!(b.build(), Err(RegistryError::EmptyProcess(_))));
    }

    #[test]
    fn non_positive_weight_rejected() {
        let mut b = setup_builder();
        let glucose = b.compound_id("glucose").unwrap();
        b.register_process("bad", vec![ProcessEntry::new(glucose, fixed(0.0))], vec![], false);
        assert!(matches!(
            b.build(),
            Err(RegistryError::NonPositiveWeight { .. })
        ));
    }

    #[test]
    fn unknown_compound_rejected() {
        let mut b = setup_builder();
        b.register_process(
            "bad",
            vec![ProcessEntry::new(CompoundId(99), fixed(1.0))],
            vec![],
            false,
        );
        assert!(matches!(
            b.build(),
            Err(RegistryError::InvalidCompoundRef { .. })
        ));
    }

    #[test]
    fn duplicate_entry_rejected() {
        let mut b = setup_builder();
        let glucose = b.compound_id("glucose").unwrap();
        b.register_process(
            "bad",
            vec![
                ProcessEntry::new(glucose, fixed(1.0)),
                ProcessEntry::new(glucose, fixed(2.0)),
            ],
            vec![],
            false,
        );
        assert!(matches!(b.build(), Err(RegistryError::DuplicateEntry { .. })));
    }

    #[test]
    fn environmental_output_rejected() {
        let mut b = setup_builder();
        let glucose = b.compound_id("glucose").unwrap();
        let oxygen = b.compound_id("oxygen").unwrap();
        b.register_process(
            "bad",
            vec![ProcessEntry::new(glucose, fixed(1.0))],
            vec![ProcessEntry::new(oxygen, fixed(1.0))],
            false,
        );
        assert!(matches!(
            b.build(),
            Err(RegistryError::EnvironmentalOutput { .. })
        ));
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut b = setup_builder();
        b.register_compound("glucose", CompoundFlags::default());
        assert!(matches!(b.build(), Err(RegistryError::DuplicateName(_))));
    }

    #[test]
    fn multiple_energy_compounds_rejected() {
        let mut b = setup_builder();
        let glucose = b.compound_id("glucose").unwrap();
        b.set_energy_compound(glucose);
        assert!(matches!(
            b.build(),
            Err(RegistryError::MultipleEnergyCompounds)
        ));
    }
}
