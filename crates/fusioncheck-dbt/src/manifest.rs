//! dbt manifest.json parsing
//!
//! Parses dbt-generated manifest.json and converts models, macros and
//! YAML-defined resources into a [`ProjectGraph`].

use crate::project::{Language, LoadedGraph, ProjectGraph, ProjectUnit, UnitKind};
use fusioncheck_core::Note;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// dbt manifest.json structure (subset of fields we care about)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Metadata about the manifest
    pub metadata: ManifestMetadata,

    /// Model, test, seed and snapshot nodes
    #[serde(default)]
    pub nodes: HashMap<String, ManifestNode>,

    /// Source definitions
    #[serde(default)]
    pub sources: HashMap<String, serde_json::Value>,

    /// Macro definitions
    #[serde(default)]
    pub macros: HashMap<String, ManifestMacro>,

    /// Semantic model definitions
    #[serde(default)]
    pub semantic_models: HashMap<String, ManifestResource>,

    /// Metric definitions
    #[serde(default)]
    pub metrics: HashMap<String, ManifestResource>,

    /// Saved query definitions
    #[serde(default)]
    pub saved_queries: HashMap<String, ManifestResource>,

    /// Exposure definitions
    #[serde(default)]
    pub exposures: HashMap<String, ManifestResource>,
}

impl Manifest {
    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_str(&contents)
    }

    /// Parse manifest from JSON string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json)
            .map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Get all model nodes (filters out tests, seeds, etc.)
    pub fn models(&self) -> BTreeMap<&String, &ManifestNode> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.resource_type == "model")
            .collect()
    }

    /// Convert the manifest into a project graph
    ///
    /// Models become `model` units, project macros become `macro` units, and
    /// semantic models, metrics, saved queries and exposures become
    /// `yaml-config` units whose config carries the block under its section
    /// name. Sources, seeds and snapshots are registered as external ids so
    /// references to them resolve.
    pub fn to_project_graph(&self) -> LoadedGraph {
        let mut units = Vec::new();
        let mut external = Vec::new();
        let project = self.metadata.project_name.as_deref();

        for (id, node) in &self.nodes {
            match node.resource_type.as_str() {
                "model" => units.push(node.to_unit()),
                "seed" | "snapshot" => external.push(id.clone()),
                _ => {}
            }
        }

        let mut external_macros = Vec::new();
        for (id, macro_def) in &self.macros {
            if !is_project_package(project, &macro_def.package_name) {
                external_macros.push(id.clone());
                continue;
            }
            units.push(macro_def.to_unit(id));
        }

        let sections = [
            ("semantic_models", &self.semantic_models),
            ("metrics", &self.metrics),
            ("saved_queries", &self.saved_queries),
            ("exposures", &self.exposures),
        ];
        for (section, resources) in sections {
            for (id, resource) in resources {
                units.push(resource.to_unit(id, section));
            }
        }

        let mut loaded = ProjectGraph::build(units);
        for id in self.sources.keys().chain(&external).chain(&external_macros) {
            loaded.graph.add_external(id.clone());
        }

        let skipped = self.nodes.len() - self.models().len() - external.len();
        if skipped > 0 {
            loaded.notes.push(Note::info(
                None,
                format!("{} test/analysis nodes are not classified", skipped),
            ));
        }

        loaded
    }
}

/// Whether a macro package belongs to the project being classified
///
/// Without a project name, dbt core (`dbt`) and adapter or hub packages
/// (`dbt_*`) are still treated as external.
fn is_project_package(project: Option<&str>, package: &str) -> bool {
    match project {
        Some(project) => project == package,
        None => package != "dbt" && !package.starts_with("dbt_"),
    }
}

/// Manifest metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub dbt_schema_version: String,
    pub dbt_version: String,
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub invocation_id: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
}

/// A node in the manifest (model, test, snapshot, etc.)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// Unique identifier (e.g., "model.my_project.users")
    pub unique_id: String,

    /// Node name (e.g., "users")
    pub name: String,

    /// Resource type (model, test, snapshot, etc.)
    pub resource_type: String,

    /// Package name
    pub package_name: String,

    /// Original file path
    #[serde(default)]
    pub original_file_path: String,

    /// Model language ("sql" or "python")
    #[serde(default)]
    pub language: Option<String>,

    /// Unrendered model code
    #[serde(default)]
    pub raw_code: String,

    /// Node configuration, kept as declared
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,

    /// Access level (private, protected, public)
    #[serde(default)]
    pub access: Option<String>,

    /// Deprecation date from the model's YAML properties
    #[serde(default)]
    pub deprecation_date: Option<String>,

    /// Dependencies
    #[serde(default)]
    pub depends_on: DependsOn,
}

impl ManifestNode {
    fn to_unit(&self) -> ProjectUnit {
        let mut unit = ProjectUnit::new(self.unique_id.clone(), UnitKind::Model)
            .with_name(self.name.clone())
            .with_source(self.raw_code.clone());
        unit.original_file_path = non_empty(&self.original_file_path);
        unit.config = self.config.clone();
        unit.language = self.language.as_deref().and_then(Language::parse);

        // Node-level properties that the rules read as config
        if let Some(date) = &self.deprecation_date {
            unit.config.insert("deprecation_date".to_string(), date.clone().into());
        }
        if let Some(access) = &self.access {
            unit.config.entry("access".to_string()).or_insert_with(|| access.clone().into());
        }

        unit.depends_on = self.depends_on.nodes.iter().cloned().collect();
        unit
    }
}

/// A macro in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMacro {
    pub name: String,
    pub package_name: String,
    #[serde(default)]
    pub original_file_path: String,
    #[serde(default)]
    pub macro_sql: String,
    #[serde(default)]
    pub depends_on: MacroDependsOn,
}

impl ManifestMacro {
    fn to_unit(&self, unique_id: &str) -> ProjectUnit {
        let mut unit = ProjectUnit::new(unique_id, UnitKind::Macro)
            .with_name(self.name.clone())
            .with_source(self.macro_sql.clone());
        unit.original_file_path = non_empty(&self.original_file_path);
        unit.depends_on = self.depends_on.macros.iter().cloned().collect();
        unit
    }
}

/// A YAML-defined resource (semantic model, metric, saved query, exposure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestResource {
    pub name: String,
    #[serde(default)]
    pub original_file_path: String,
    #[serde(default)]
    pub depends_on: DependsOn,

    /// Everything else in the block, kept verbatim
    #[serde(flatten)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ManifestResource {
    fn to_unit(&self, unique_id: &str, section: &str) -> ProjectUnit {
        let block = serde_json::Value::Object(self.properties.clone());
        let mut unit = ProjectUnit::new(unique_id, UnitKind::YamlConfig)
            .with_name(self.name.clone())
            .with_config(section, block);
        unit.original_file_path = non_empty(&self.original_file_path);
        unit.depends_on = self.depends_on.nodes.iter().cloned().collect();
        unit
    }
}

fn non_empty(path: &str) -> Option<String> {
    (!path.is_empty()).then(|| path.to_string())
}

/// Dependencies structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    /// List of node unique_ids this node depends on
    #[serde(default)]
    pub nodes: Vec<String>,

    /// List of macro unique_ids this node calls
    #[serde(default)]
    pub macros: Vec<String>,
}

/// Macro dependencies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroDependsOn {
    #[serde(default)]
    pub macros: Vec<String>,
}

/// Manifest parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse manifest JSON: {0}")]
    ParseError(String),
}
