//! Helm chart values and rendering

pub mod renderer;
pub mod values;

pub use renderer::{
    manifest_file_name, split_documents, ChartEngine, HelmTemplate, ManifestDocument,
    ManifestRenderer, RenderedManifests,
};
pub use values::HelmValues;
