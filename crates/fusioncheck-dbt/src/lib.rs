//! dbt project graph loading and DAG construction
//!
//! This crate handles:
//! - The normalized project graph (models, macros, YAML configs, scripts)
//! - Loading project graph JSON documents
//! - Converting dbt manifest.json into a project graph
//! - Building dependency graphs and impact analysis (downstream dependencies)

pub mod project;
pub mod manifest;
pub mod dag;

pub use project::{ProjectUnit, ProjectGraph, LoadedGraph, UnitKind, UnitId, Language, InputError};
pub use manifest::{Manifest, ManifestNode, ManifestMacro, ManifestResource, DependsOn, ManifestMetadata, ManifestError};
pub use dag::DependencyGraph;
