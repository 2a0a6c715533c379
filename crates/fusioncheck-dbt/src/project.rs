//! Parsed project graph
//!
//! A [`ProjectGraph`] is the normalized input to classification: every model,
//! macro, YAML config block and script of a dbt project, keyed by unique id,
//! with resolved upstream edges.

use fusioncheck_core::Note;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Unit identifier (unique_id, e.g. "model.jaffle_shop.customers")
pub type UnitId = String;

/// Kind of project unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitKind {
    /// SQL or Python model
    Model,

    /// Jinja macro
    Macro,

    /// YAML config block (semantic models, exposures, saved queries, ...)
    YamlConfig,

    /// Python helper or test script living next to the project
    Script,
}

impl UnitKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "model" => Some(Self::Model),
            "macro" => Some(Self::Macro),
            "yaml-config" | "yaml_config" | "yaml" | "config" => Some(Self::YamlConfig),
            "script" => Some(Self::Script),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Macro => "macro",
            Self::YamlConfig => "yaml-config",
            Self::Script => "script",
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Language a unit is written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Sql,
    Python,
}

impl Language {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" => Some(Self::Sql),
            "python" | "py" => Some(Self::Python),
            _ => None,
        }
    }
}

/// One parsed model, macro, YAML config entry or script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectUnit {
    /// Unique identifier
    pub unique_id: UnitId,

    /// Unit kind
    pub kind: UnitKind,

    /// Short name (e.g. "customers")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Declared language, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,

    /// Path of the defining file, relative to the project root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file_path: Option<String>,

    /// Raw declared config (option name -> value)
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,

    /// Raw source text (unrendered)
    #[serde(default)]
    pub source: String,

    /// Identifiers this unit depends on
    #[serde(default)]
    pub depends_on: BTreeSet<UnitId>,
}

impl ProjectUnit {
    /// Create a unit with empty config, source and dependencies
    pub fn new(unique_id: impl Into<UnitId>, kind: UnitKind) -> Self {
        Self {
            unique_id: unique_id.into(),
            kind,
            name: None,
            language: None,
            original_file_path: None,
            config: BTreeMap::new(),
            source: String::new(),
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.original_file_path = Some(path.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn depends_on(mut self, upstream: impl Into<UnitId>) -> Self {
        self.depends_on.insert(upstream.into());
        self
    }

    /// Short name, falling back to the last segment of the unique id
    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => self.unique_id.rsplit('.').next().unwrap_or(&self.unique_id),
        }
    }

    /// Whether a config key is declared (a JSON `null` counts as not declared)
    pub fn has_config(&self, key: &str) -> bool {
        self.config.get(key).is_some_and(|v| !v.is_null())
    }

    /// String value of a config key
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// Boolean value of a config key (accepts `true` and `"true"`)
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        match self.config.get(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Unit as it appears in an input document, before validation
#[derive(Debug, Clone, Default, Deserialize)]
struct RawUnit {
    #[serde(default)]
    unique_id: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default, alias = "path")]
    original_file_path: Option<String>,
    #[serde(default)]
    config: BTreeMap<String, serde_json::Value>,
    #[serde(default, alias = "raw_code", alias = "raw_sql")]
    source: Option<String>,
    #[serde(default)]
    depends_on: RawDependsOn,
}

/// `depends_on` as either a list of ids or a manifest-style `{nodes: [..]}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawDependsOn {
    List(Vec<String>),
    Nodes {
        #[serde(default)]
        nodes: Vec<String>,
    },
}

impl Default for RawDependsOn {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl RawDependsOn {
    fn into_ids(self) -> Vec<String> {
        match self {
            Self::List(ids) => ids,
            Self::Nodes { nodes } => nodes,
        }
    }
}

impl RawUnit {
    fn validate(self, fallback_id: Option<&str>) -> Result<ProjectUnit, InputError> {
        let unique_id = self.unique_id
            .as_deref()
            .or(fallback_id)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| InputError::InvalidInput("unit is missing its unique_id".to_string()))?
            .to_string();

        let kind = match self.kind.as_deref() {
            Some(k) => UnitKind::parse(k).ok_or_else(|| {
                InputError::InvalidInput(format!("unit '{}' has unknown kind '{}'", unique_id, k))
            })?,
            None => kind_from_id(&unique_id).ok_or_else(|| {
                InputError::InvalidInput(format!("unit '{}' has no kind", unique_id))
            })?,
        };

        let language = self.language.as_deref().and_then(Language::parse);

        Ok(ProjectUnit {
            unique_id,
            kind,
            name: self.name,
            language,
            original_file_path: self.original_file_path,
            config: self.config,
            source: self.source.unwrap_or_default(),
            depends_on: self.depends_on.into_ids().into_iter().collect(),
        })
    }
}

/// Infer the kind from a dbt unique_id prefix ("model.", "macro.", ...)
fn kind_from_id(unique_id: &str) -> Option<UnitKind> {
    match unique_id.split('.').next()? {
        "model" => Some(UnitKind::Model),
        "macro" => Some(UnitKind::Macro),
        "semantic_model" | "metric" | "saved_query" | "exposure" => Some(UnitKind::YamlConfig),
        "script" => Some(UnitKind::Script),
        _ => None,
    }
}

/// Project graph input document
///
/// Units stay as raw JSON values so that one malformed unit cannot reject
/// the whole document.
enum GraphDocument {
    /// `{"units": [...], "external": [...]}`
    Units {
        units: Vec<serde_json::Value>,
        external: Vec<String>,
    },

    /// `[...]`
    List(Vec<serde_json::Value>),

    /// `{"<unique_id>": {...}}`
    Map(serde_json::Map<String, serde_json::Value>),
}

impl GraphDocument {
    fn from_value(value: serde_json::Value) -> Result<Self, InputError> {
        use serde_json::Value;

        match value {
            Value::Array(units) => Ok(Self::List(units)),
            Value::Object(mut map) if map.get("units").map_or(false, Value::is_array) => {
                let units = match map.remove("units") {
                    Some(Value::Array(units)) => units,
                    _ => Vec::new(),
                };
                let external = match map.remove("external").or_else(|| map.remove("sources")) {
                    Some(value) => serde_json::from_value(value).map_err(|e| {
                        InputError::ParseError(format!("'external' must be a list of ids: {}", e))
                    })?,
                    None => Vec::new(),
                };
                Ok(Self::Units { units, external })
            }
            Value::Object(map) => Ok(Self::Map(map)),
            other => Err(InputError::ParseError(format!(
                "expected a list or an object of units, found {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "a list",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Project graph: units keyed by unique id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectGraph {
    units: BTreeMap<UnitId, ProjectUnit>,

    /// Ids that are valid upstream targets but not classified (sources, seeds)
    external: BTreeSet<UnitId>,
}

/// A project graph together with the notes produced while building it
#[derive(Debug, Clone, Default)]
pub struct LoadedGraph {
    pub graph: ProjectGraph,
    pub notes: Vec<Note>,
}

impl LoadedGraph {
    /// Number of units that were rejected while loading
    pub fn excluded(&self) -> usize {
        self.notes.iter().filter(|n| n.level == fusioncheck_core::NoteLevel::Warning).count()
    }
}

impl ProjectGraph {
    /// Build a graph from already-constructed units
    ///
    /// Units with a blank id or a duplicate id are excluded with a warning note.
    pub fn build(units: impl IntoIterator<Item = ProjectUnit>) -> LoadedGraph {
        let mut loaded = LoadedGraph::default();
        for unit in units {
            loaded.graph.insert(unit, &mut loaded.notes);
        }
        loaded
    }

    /// Parse a project graph JSON document
    ///
    /// Fails with [`InputError::InvalidInput`] when no graph is supplied
    /// (blank document or `null`). Malformed units are excluded with a note.
    pub fn from_json(json: &str) -> Result<LoadedGraph, InputError> {
        if json.trim().is_empty() {
            return Err(InputError::no_graph());
        }

        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| InputError::ParseError(e.to_string()))?;
        if value.is_null() {
            return Err(InputError::no_graph());
        }

        let document = GraphDocument::from_value(value)?;

        let mut loaded = LoadedGraph::default();
        match document {
            GraphDocument::Units { units, external } => {
                loaded.graph.external.extend(external);
                loaded.graph.extend_raw(units.into_iter().map(|u| (None, u)), &mut loaded.notes);
            }
            GraphDocument::List(units) => {
                loaded.graph.extend_raw(units.into_iter().map(|u| (None, u)), &mut loaded.notes);
            }
            GraphDocument::Map(units) => {
                loaded.graph.extend_raw(units.into_iter().map(|(k, u)| (Some(k), u)), &mut loaded.notes);
            }
        }

        Ok(loaded)
    }

    /// Load a project graph JSON file
    pub fn from_file(path: &Path) -> Result<LoadedGraph, InputError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| InputError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_json(&contents)
    }

    fn extend_raw(
        &mut self,
        raw: impl IntoIterator<Item = (Option<String>, serde_json::Value)>,
        notes: &mut Vec<Note>,
    ) {
        for (index, (key, value)) in raw.into_iter().enumerate() {
            let subject = value
                .get("unique_id")
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .or_else(|| key.clone());

            let unit = serde_json::from_value::<RawUnit>(value)
                .map_err(|e| InputError::InvalidInput(format!("unit is malformed: {}", e)))
                .and_then(|unit| unit.validate(key.as_deref()));

            match unit {
                Ok(unit) => self.insert(unit, notes),
                Err(e) => {
                    tracing::warn!(index, error = %e, "excluding malformed unit");
                    notes.push(Note::warning(subject, format!("unit #{} excluded: {}", index, e)));
                }
            }
        }
    }

    fn insert(&mut self, mut unit: ProjectUnit, notes: &mut Vec<Note>) {
        let id = unit.unique_id.trim().to_string();
        if id.is_empty() {
            tracing::warn!(kind = %unit.kind, "excluding unit without unique_id");
            notes.push(Note::warning(
                None,
                format!("{} unit excluded: missing unique_id", unit.kind),
            ));
            return;
        }

        if self.units.contains_key(&id) {
            tracing::warn!(unit = %id, "excluding duplicate unit");
            notes.push(Note::warning(
                Some(id),
                "duplicate unique_id; only the first definition is classified",
            ));
            return;
        }

        unit.unique_id = id.clone();
        self.units.insert(id, unit);
    }

    /// Register an id that units may depend on without being classified
    pub fn add_external(&mut self, id: impl Into<UnitId>) {
        self.external.insert(id.into());
    }

    /// All units, in unique-id order
    pub fn units(&self) -> impl Iterator<Item = &ProjectUnit> {
        self.units.values()
    }

    pub fn get(&self, unique_id: &str) -> Option<&ProjectUnit> {
        self.units.get(unique_id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Whether an id is a unit or a registered external id
    ///
    /// Sources, seeds and snapshots are never classified, so their ids are
    /// always treated as known.
    pub fn is_known(&self, unique_id: &str) -> bool {
        const NEVER_CLASSIFIED: [&str; 3] = ["source.", "seed.", "snapshot."];

        self.units.contains_key(unique_id)
            || self.external.contains(unique_id)
            || NEVER_CLASSIFIED.iter().any(|prefix| unique_id.starts_with(prefix))
    }

    /// Resolve a `ref('name')` target to a model id
    pub fn resolve_ref(&self, name: &str) -> Option<&UnitId> {
        self.units
            .values()
            .filter(|u| u.kind == UnitKind::Model)
            .find(|u| u.display_name() == name)
            .map(|u| &u.unique_id)
            .or_else(|| {
                self.external
                    .iter()
                    .find(|id| id.rsplit('.').next() == Some(name))
            })
    }

    /// Find a unit by unique id or short name
    pub fn find(&self, name_or_id: &str) -> Option<&ProjectUnit> {
        self.units
            .get(name_or_id)
            .or_else(|| self.units.values().find(|u| u.display_name() == name_or_id))
    }

    /// sha256 (hex) of the canonical JSON form of the graph
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for unit in self.units.values() {
            // BTreeMap/BTreeSet fields serialize in a stable order
            if let Ok(bytes) = serde_json::to_vec(unit) {
                hasher.update(&bytes);
            }
            hasher.update(b"\n");
        }
        for id in &self.external {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Input errors
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to read project graph {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse project graph JSON: {0}")]
    ParseError(String),
}

impl InputError {
    fn no_graph() -> Self {
        Self::InvalidInput("no input project graph supplied".to_string())
    }
}
