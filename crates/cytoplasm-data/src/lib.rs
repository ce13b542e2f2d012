//! Data-driven content for Cytoplasm: compounds, processes and simulation
//! settings from RON, TOML or JSON files.

pub mod loader;
pub mod schema;

pub use loader::{Content, ContentFile, DataLoadError, Format, Source, load_content};
