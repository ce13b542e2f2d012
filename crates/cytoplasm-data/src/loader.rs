//! Reads a content directory into a [`Registry`] and a [`SimulationConfig`].
//!
//! A directory holds up to three [`ContentFile`]s, each in exactly one of the
//! supported [`Format`]s. Compound names in process entries are resolved to
//! ids before the registry validates the result.

use cytoplasm_core::config::{ConfigError, SimulationConfig};
use cytoplasm_core::fixed::f64_to_fixed64;
use cytoplasm_core::id::CompoundId;
use cytoplasm_core::registry::{
    CompoundFlags, ProcessEntry, Registry, RegistryBuilder, RegistryError,
};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::schema::{CompoundData, ProcessData, ProcessEntryData};

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    #[error("no {file}.ron, {file}.toml or {file}.json in {dir}")]
    MissingRequired { file: ContentFile, dir: PathBuf },

    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// The same content file exists in more than one format.
    #[error("{file} is defined twice in {dir}: .{a} and .{b}")]
    ConflictingFormats {
        file: ContentFile,
        dir: PathBuf,
        a: &'static str,
        b: &'static str,
    },

    #[error("failed to read {file}: {source}")]
    Read {
        file: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    #[error("process '{process}' in {file} uses unknown compound '{compound}'")]
    UnknownCompound {
        file: PathBuf,
        process: String,
        compound: String,
    },

    #[error("duplicate name '{name}' in {file}")]
    DuplicateName { file: PathBuf, name: String },

    /// A process weight is NaN or infinite.
    #[error("process '{process}' has a non-finite weight for '{compound}' in {file}")]
    InvalidWeight {
        file: PathBuf,
        process: String,
        compound: String,
    },

    /// The simulation config parsed but holds out-of-range values.
    #[error("invalid simulation config in {file}: {source}")]
    Config {
        file: PathBuf,
        source: ConfigError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ===========================================================================
// Content files and formats
// ===========================================================================

/// The files a content directory may hold, by stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFile {
    Compounds,
    Processes,
    /// Optional. Defaults apply when absent.
    Simulation,
}

impl ContentFile {
    pub fn stem(self) -> &'static str {
        match self {
            Self::Compounds => "compounds",
            Self::Processes => "processes",
            Self::Simulation => "simulation",
        }
    }
}

impl fmt::Display for ContentFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

impl Format {
    /// Lookup order when locating a content file.
    const ALL: [Format; 3] = [Format::Ron, Format::Toml, Format::Json];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Ron => "ron",
            Self::Toml => "toml",
            Self::Json => "json",
        }
    }

    pub fn of(path: &Path) -> Result<Self, DataLoadError> {
        let ext = path.extension().and_then(|e| e.to_str());
        Self::ALL
            .into_iter()
            .find(|f| Some(f.extension()) == ext)
            .ok_or_else(|| DataLoadError::UnsupportedFormat {
                file: path.to_path_buf(),
            })
    }

    fn parse<T: DeserializeOwned>(self, text: &str) -> Result<T, String> {
        match self {
            Self::Ron => ron::from_str(text).map_err(|e| e.to_string()),
            Self::Toml => toml::from_str(text).map_err(|e| e.to_string()),
            Self::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
        }
    }
}

// ===========================================================================
// Source
// ===========================================================================

/// A content file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub file: ContentFile,
    pub path: PathBuf,
    pub format: Format,
}

impl Source {
    /// Find `file` in `dir`. Two formats of the same file are an error.
    pub fn locate(dir: &Path, file: ContentFile) -> Result<Option<Self>, DataLoadError> {
        let mut found: Option<Self> = None;
        for format in Format::ALL {
            let path = dir.join(format!("{}.{}", file.stem(), format.extension()));
            if !path.is_file() {
                continue;
            }
            if let Some(first) = &found {
                return Err(DataLoadError::ConflictingFormats {
                    file,
                    dir: dir.to_path_buf(),
                    a: first.format.extension(),
                    b: format.extension(),
                });
            }
            found = Some(Self { file, path, format });
        }
        Ok(found)
    }

    pub fn require(dir: &Path, file: ContentFile) -> Result<Self, DataLoadError> {
        Self::locate(dir, file)?.ok_or_else(|| DataLoadError::MissingRequired {
            file,
            dir: dir.to_path_buf(),
        })
    }

    /// Open an explicit path, inferring the format from its extension.
    pub fn at(path: impl Into<PathBuf>, file: ContentFile) -> Result<Self, DataLoadError> {
        let path = path.into();
        let format = Format::of(&path)?;
        Ok(Self { file, path, format })
    }

    /// Deserialize the whole file as one value.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T, DataLoadError> {
        let text = self.text()?;
        self.format.parse(&text).map_err(|detail| self.parse_error(detail))
    }

    /// Deserialize a list of definitions. TOML has no top-level arrays, so
    /// there the list sits under a key named after the file.
    pub fn read_list<T: DeserializeOwned>(&self) -> Result<Vec<T>, DataLoadError> {
        if self.format != Format::Toml {
            return self.read();
        }
        let mut table: toml::Table = self.read()?;
        let key = self.file.stem();
        let list = table
            .remove(key)
            .ok_or_else(|| self.parse_error(format!("missing [[{key}]] entries")))?;
        list.try_into()
            .map_err(|e: toml::de::Error| self.parse_error(e.to_string()))
    }

    fn text(&self) -> Result<String, DataLoadError> {
        std::fs::read_to_string(&self.path).map_err(|source| DataLoadError::Read {
            file: self.path.clone(),
            source,
        })
    }

    fn parse_error(&self, detail: String) -> DataLoadError {
        DataLoadError::Parse {
            file: self.path.clone(),
            detail,
        }
    }
}

// ===========================================================================
// Content loading
// ===========================================================================

/// Everything a data directory defines.
#[derive(Debug)]
pub struct Content {
    pub registry: Registry,
    /// Defaults when the directory has no `simulation.*` file.
    pub config: SimulationConfig,
}

/// Load `compounds.*` and `processes.*` (required) and `simulation.*`
/// (optional) from `dir`.
pub fn load_content(dir: &Path) -> Result<Content, DataLoadError> {
    let mut builder = RegistryBuilder::new();

    let compounds = Source::require(dir, ContentFile::Compounds)?;
    let names = register_compounds(&mut builder, &compounds, &compounds.read_list()?)?;

    let processes = Source::require(dir, ContentFile::Processes)?;
    register_processes(&mut builder, &processes, &processes.read_list()?, &names)?;

    let config = match Source::locate(dir, ContentFile::Simulation)? {
        Some(source) => load_config(&source)?,
        None => SimulationConfig::default(),
    };

    let registry = builder.build()?;
    debug!(
        dir = %dir.display(),
        compounds = registry.compound_count(),
        processes = registry.process_count(),
        "content loaded"
    );
    Ok(Content { registry, config })
}

fn load_config(source: &Source) -> Result<SimulationConfig, DataLoadError> {
    let config: SimulationConfig = source.read()?;
    config.validate().map_err(|e| DataLoadError::Config {
        file: source.path.clone(),
        source: e,
    })?;
    Ok(config)
}

fn duplicate(source: &Source, name: &str) -> DataLoadError {
    DataLoadError::DuplicateName {
        file: source.path.clone(),
        name: name.to_string(),
    }
}

fn register_compounds(
    builder: &mut RegistryBuilder,
    source: &Source,
    compounds: &[CompoundData],
) -> Result<HashMap<String, CompoundId>, DataLoadError> {
    let mut ids = HashMap::with_capacity(compounds.len());
    for c in compounds {
        if ids.contains_key(&c.name) {
            return Err(duplicate(source, &c.name));
        }
        let id = builder.register_compound(
            &c.name,
            CompoundFlags {
                always_useful: c.always_useful,
                distributable: c.distributable,
                environmental: c.environmental,
                cloud: c.cloud,
            },
        );
        if c.energy {
            builder.set_energy_compound(id);
        }
        ids.insert(c.name.clone(), id);
    }
    Ok(ids)
}

fn register_processes(
    builder: &mut RegistryBuilder,
    source: &Source,
    processes: &[ProcessData],
    names: &HashMap<String, CompoundId>,
) -> Result<(), DataLoadError> {
    let mut seen = HashSet::with_capacity(processes.len());
    for p in processes {
        if !seen.insert(p.name.as_str()) {
            return Err(duplicate(source, &p.name));
        }
        let entry = |data: &ProcessEntryData| {
            let compound = data.compound();
            let Some(&id) = names.get(compound) else {
                return Err(DataLoadError::UnknownCompound {
                    file: source.path.clone(),
                    process: p.name.clone(),
                    compound: compound.to_string(),
                });
            };
            if !data.weight().is_finite() {
                return Err(DataLoadError::InvalidWeight {
                    file: source.path.clone(),
                    process: p.name.clone(),
                    compound: compound.to_string(),
                });
            }
            Ok(ProcessEntry::new(id, f64_to_fixed64(data.weight())))
        };
        let inputs = p.inputs.iter().map(entry).collect::<Result<Vec<_>, _>>()?;
        let outputs = p.outputs.iter().map(entry).collect::<Result<Vec<_>, _>>()?;
        builder.register_process(&p.name, inputs, outputs, p.metabolic);
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cytoplasm_core::config::ExecutionMode;
    use cytoplasm_core::fixed::Fixed64;
    use std::fs;

    /// Create a temporary directory with a unique name for test isolation.
    fn make_test_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "cytoplasm_data_test_{suffix}_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Clean up a test directory.
    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    const COMPOUNDS_RON: &str = r#"[
        (name: "glucose", cloud: true, distributable: true),
        (name: "atp", always_useful: true, distributable: true, energy: true),
        (name: "oxygen", environmental: true),
        (name: "co2", cloud: true),
    ]"#;

    const PROCESSES_RON: &str = r#"[
        (
            name: "glycolysis",
            inputs: [("glucose", 1.0)],
            outputs: [("atp", 2.0)],
            metabolic: true,
        ),
        (
            name: "respiration",
            inputs: [("glucose", 1.0), ("oxygen", 1.0)],
            outputs: [("atp", 6.0), ("co2", 1.0)],
            metabolic: true,
        ),
    ]"#;

    fn write_chemistry(dir: &Path) {
        fs::write(dir.join("compounds.ron"), COMPOUNDS_RON).unwrap();
        fs::write(dir.join("processes.ron"), PROCESSES_RON).unwrap();
    }

    // -----------------------------------------------------------------------
    // Format / Source
    // -----------------------------------------------------------------------

    #[test]
    fn format_from_extension() {
        assert_eq!(Format::of(Path::new("a.ron")).unwrap(), Format::Ron);
        assert_eq!(Format::of(Path::new("a.toml")).unwrap(), Format::Toml);
        assert_eq!(Format::of(Path::new("a.json")).unwrap(), Format::Json);
        for name in ["compounds.yaml", "compounds"] {
            assert!(matches!(
                Format::of(Path::new(name)),
                Err(DataLoadError::UnsupportedFormat { .. })
            ));
        }
    }

    #[test]
    fn locate_found_and_missing() {
        let dir = make_test_dir("locate");
        assert_eq!(Source::locate(&dir, ContentFile::Compounds).unwrap(), None);

        fs::write(dir.join("compounds.json"), "[]").unwrap();
        let source = Source::locate(&dir, ContentFile::Compounds).unwrap().unwrap();
        assert_eq!(source.path, dir.join("compounds.json"));
        assert_eq!(source.format, Format::Json);

        cleanup(&dir);
    }

    #[test]
    fn locate_rejects_two_formats() {
        let dir = make_test_dir("locate_conflict");
        fs::write(dir.join("compounds.ron"), "[]").unwrap();
        fs::write(dir.join("compounds.toml"), "").unwrap();

        let result = Source::locate(&dir, ContentFile::Compounds);
        assert!(matches!(
            result,
            Err(DataLoadError::ConflictingFormats { file: ContentFile::Compounds, a: "ron", b: "toml", .. })
        ));

        cleanup(&dir);
    }

    #[test]
    fn require_reports_missing_file() {
        let dir = make_test_dir("require_missing");

        let result = Source::require(&dir, ContentFile::Processes);
        assert!(matches!(
            result,
            Err(DataLoadError::MissingRequired { file: ContentFile::Processes, .. })
        ));

        cleanup(&dir);
    }

    #[test]
    fn toml_list_without_key_is_a_parse_error() {
        let dir = make_test_dir("list_toml_missing");
        let path = dir.join("compounds.toml");
        fs::write(&path, r#"foo = "bar""#).unwrap();

        let source = Source::at(&path, ContentFile::Compounds).unwrap();
        let result: Result<Vec<CompoundData>, _> = source.read_list();
        assert!(matches!(result, Err(DataLoadError::Parse { .. })));

        cleanup(&dir);
    }

    #[test]
    fn malformed_ron_is_a_parse_error() {
        let dir = make_test_dir("deser_parse_err");
        let path = dir.join("compounds.ron");
        fs::write(&path, "this is not valid RON {{{").unwrap();

        let source = Source::at(&path, ContentFile::Compounds).unwrap();
        let result: Result<Vec<CompoundData>, _> = source.read_list();
        assert!(matches!(result, Err(DataLoadError::Parse { ref file, .. }) if *file == path));

        cleanup(&dir);
    }

    #[test]
    fn unreadable_source_is_a_read_error() {
        let dir = make_test_dir("read_err");
        let source = Source::at(dir.join("compounds.ron"), ContentFile::Compounds).unwrap();
        let result: Result<Vec<CompoundData>, _> = source.read_list();
        assert!(matches!(result, Err(DataLoadError::Read { .. })));

        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // load_content
    // -----------------------------------------------------------------------

    #[test]
    fn load_content_from_ron() {
        let dir = make_test_dir("load_ron");
        write_chemistry(&dir);

        let content = load_content(&dir).unwrap();
        let r = &content.registry;
        assert_eq!(r.compound_count(), 4);
        assert_eq!(r.process_count(), 2);
        let atp = r.compound_id("atp").unwrap();
        assert_eq!(r.energy_compound(), Some(atp));
        assert!(r.is_cloud(r.compound_id("glucose").unwrap()));

        let respiration = r.process(r.process_id("respiration").unwrap()).unwrap();
        assert!(respiration.metabolic);
        assert_eq!(respiration.inputs.len(), 2);
        assert_eq!(respiration.outputs[0].compound, atp);
        assert_eq!(respiration.outputs[0].weight, Fixed64::from_num(6));
        assert_eq!(content.config, SimulationConfig::default());

        cleanup(&dir);
    }

    #[test]
    fn load_content_from_toml_and_json() {
        let dir = make_test_dir("load_mixed");
        fs::write(
            dir.join("compounds.toml"),
            r#"
[[compounds]]
name = "glucose"
cloud = true

[[compounds]]
name = "atp"
energy = true
"#,
        )
        .unwrap();
        fs::write(
            dir.join("processes.json"),
            r#"[{"name": "glycolysis", "inputs": [["glucose", 1]], "outputs": [{"compound": "atp", "weight": 2}], "metabolic": true}]"#,
        )
        .unwrap();

        let content = load_content(&dir).unwrap();
        let glycolysis = content
            .registry
            .process(content.registry.process_id("glycolysis").unwrap())
            .unwrap();
        assert_eq!(glycolysis.outputs[0].weight, Fixed64::from_num(2));

        cleanup(&dir);
    }

    #[test]
    fn partial_toml_config_keeps_defaults() {
        let dir = make_test_dir("partial_config");
        write_chemistry(&dir);
        fs::write(
            dir.join("simulation.toml"),
            r#"
fixed_timestep = 0.5

[scheduler]
mode = "sequential"

[venting]
rate = 2.0
"#,
        )
        .unwrap();

        let config = load_content(&dir).unwrap().config;
        let defaults = SimulationConfig::default();
        assert!((config.fixed_timestep - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.scheduler.mode, ExecutionMode::Sequential);
        assert_eq!(config.scheduler.worker_threads, None);
        assert!((config.venting.rate - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.upkeep, defaults.upkeep);
        assert_eq!(config.absorption, defaults.absorption);
        assert_eq!(config.max_steps_per_advance, defaults.max_steps_per_advance);

        cleanup(&dir);
    }

    #[test]
    fn out_of_range_config_is_rejected() {
        let dir = make_test_dir("bad_config");
        write_chemistry(&dir);
        fs::write(dir.join("simulation.ron"), "(fixed_timestep: -1.0)").unwrap();

        let result = load_content(&dir);
        assert!(matches!(result, Err(DataLoadError::Config { .. })));

        cleanup(&dir);
    }

    #[test]
    fn unknown_compound_in_process() {
        let dir = make_test_dir("unresolved");
        fs::write(dir.join("compounds.ron"), COMPOUNDS_RON).unwrap();
        fs::write(
            dir.join("processes.ron"),
            r#"[(name: "photosynthesis", inputs: [("sunlight", 1.0)], outputs: [("glucose", 1.0)])]"#,
        )
        .unwrap();

        let result = load_content(&dir);
        assert!(matches!(
            result,
            Err(DataLoadError::UnknownCompound { ref process, ref compound, .. })
                if process == "photosynthesis" && compound == "sunlight"
        ));

        cleanup(&dir);
    }

    #[test]
    fn duplicate_compound_name() {
        let dir = make_test_dir("duplicate");
        fs::write(
            dir.join("compounds.ron"),
            r#"[(name: "glucose"), (name: "glucose")]"#,
        )
        .unwrap();
        fs::write(dir.join("processes.ron"), "[]").unwrap();

        let result = load_content(&dir);
        assert!(matches!(
            result,
            Err(DataLoadError::DuplicateName { ref name, .. }) if name == "glucose"
        ));

        cleanup(&dir);
    }

    #[test]
    fn duplicate_process_name() {
        let dir = make_test_dir("duplicate_process");
        fs::write(dir.join("compounds.ron"), COMPOUNDS_RON).unwrap();
        fs::write(
            dir.join("processes.ron"),
            r#"[
                (name: "glycolysis", inputs: [("glucose", 1.0)], outputs: [("atp", 2.0)]),
                (name: "glycolysis", inputs: [("glucose", 2.0)], outputs: [("atp", 3.0)]),
            ]"#,
        )
        .unwrap();

        let result = load_content(&dir);
        assert!(matches!(
            result,
            Err(DataLoadError::DuplicateName { ref file, ref name })
                if name == "glycolysis" && file.ends_with("processes.ron")
        ));

        cleanup(&dir);
    }

    #[test]
    fn registry_validation_errors_surface() {
        let dir = make_test_dir("registry_err");
        fs::write(dir.join("compounds.ron"), COMPOUNDS_RON).unwrap();
        fs::write(
            dir.join("processes.ron"),
            r#"[(name: "broken", inputs: [("glucose", 0.0)], outputs: [("atp", 1.0)])]"#,
        )
        .unwrap();

        let result = load_content(&dir);
        assert!(matches!(
            result,
            Err(DataLoadError::Registry(RegistryError::NonPositiveWeight { .. }))
        ));

        cleanup(&dir);
    }

    #[test]
    fn missing_processes_file() {
        let dir = make_test_dir("no_processes");
        fs::write(dir.join("compounds.ron"), COMPOUNDS_RON).unwrap();

        let result = load_content(&dir);
        assert!(matches!(result, Err(DataLoadError::MissingRequired { .. })));

        cleanup(&dir);
    }

    #[test]
    fn error_display_messages() {
        let e = DataLoadError::MissingRequired {
            file: ContentFile::Compounds,
            dir: PathBuf::from("/data"),
        };
        assert_eq!(
            e.to_string(),
            "no compounds.ron, compounds.toml or compounds.json in /data"
        );

        let e = DataLoadError::InvalidWeight {
            file: PathBuf::from("processes.ron"),
            process: "glycolysis".to_string(),
            compound: "glucose".to_string(),
        };
        let msg = format!("{e}");
        assert!(msg.contains("glycolysis"));
        assert!(msg.contains("glucose"));
    }
}
