//! Rule identifiers, severities and findings
//!
//! IMPORTANT: Rule ids are versioned and stable.
//! NEVER rename or remove ids - they are part of the public API.
//! Add new rules with new ids only.

use serde::{Deserialize, Serialize};

/// Rule id registry (v1)
///
/// These ids are STABLE and VERSIONED.
/// Do NOT rename or remove ids - only add new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleId {
    // Hard blockers
    /// Python (procedural-language) model
    PythonModel,

    /// Materialization that is not built into the engine
    CustomMaterialization,

    /// Source text that cannot be reliably parsed
    UnparseableSource,

    // Soft blockers
    /// Incremental model using the microbatch strategy
    MicrobatchIncremental,

    /// Model declaring a deprecation date
    DeprecatedModel,

    /// Model written in the Iceberg table format
    IcebergTableFormat,

    /// Semantic models, metrics or saved queries
    SemanticLayerDefinition,

    /// Script driving the dbt CLI or Python API
    ProgrammaticInvocation,

    // Flags
    /// Model with restricted cross-project access
    RestrictedAccess,

    /// Exposure (downstream consumer) definition
    ExposureDefinition,

    /// Call to a query-comment injector macro
    QueryCommentMacro,

    /// pre_hook / post_hook configuration
    ModelHooks,

    // Derived
    /// Unit that transitively depends on a hard blocker
    DownstreamOfHardBlocker,

    /// A rule failed while evaluating a unit
    EvaluationError,
}

impl RuleId {
    /// Every rule id, in declaration order
    pub const ALL: [RuleId; 14] = [
        Self::PythonModel,
        Self::CustomMaterialization,
        Self::UnparseableSource,
        Self::MicrobatchIncremental,
        Self::DeprecatedModel,
        Self::IcebergTableFormat,
        Self::SemanticLayerDefinition,
        Self::ProgrammaticInvocation,
        Self::RestrictedAccess,
        Self::ExposureDefinition,
        Self::QueryCommentMacro,
        Self::ModelHooks,
        Self::DownstreamOfHardBlocker,
        Self::EvaluationError,
    ];

    /// Get the rule id as a stable string identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PythonModel => "python-model",
            Self::CustomMaterialization => "custom-materialization",
            Self::UnparseableSource => "unparseable-source",
            Self::MicrobatchIncremental => "microbatch-incremental",
            Self::DeprecatedModel => "deprecated-model",
            Self::IcebergTableFormat => "iceberg-table-format",
            Self::SemanticLayerDefinition => "semantic-layer-definition",
            Self::ProgrammaticInvocation => "programmatic-invocation",
            Self::RestrictedAccess => "restricted-access",
            Self::ExposureDefinition => "exposure-definition",
            Self::QueryCommentMacro => "query-comment-macro",
            Self::ModelHooks => "model-hooks",
            Self::DownstreamOfHardBlocker => "downstream-of-hard-blocker",
            Self::EvaluationError => "evaluation-error",
        }
    }

    /// Look up a rule id by its stable string form
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.as_str() == s)
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Blocker severity
///
/// Ordered by impact: `Flag < Soft < Hard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Worth a look during migration planning
    Flag,

    /// May need a workaround or feature-parity work
    Soft,

    /// Unconditionally prevents migration
    Hard,
}

impl Severity {
    /// Evaluation tier: hard rules run first, then soft, then flags
    pub fn tier(&self) -> u8 {
        match self {
            Self::Hard => 0,
            Self::Soft => 1,
            Self::Flag => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hard" => Some(Self::Hard),
            "soft" => Some(Self::Soft),
            "flag" => Some(Self::Flag),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hard => write!(f, "hard"),
            Self::Soft => write!(f, "soft"),
            Self::Flag => write!(f, "flag"),
        }
    }
}

/// Source location in a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// File path relative to project root
    pub file: String,

    /// Optional line number (1-indexed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl Location {
    /// Create a new location with just a file path
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
        }
    }

    /// Create a location with file and line number
    pub fn with_line(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file, line),
            None => write!(f, "{}", self.file),
        }
    }
}

/// A rule match against a project unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable rule id
    pub rule_id: RuleId,

    /// Severity (after config overrides)
    pub severity: Severity,

    /// Identifier of the matched unit
    pub unit_id: String,

    /// Human-readable message
    pub message: String,

    /// Units that transitively depend on the matched unit
    #[serde(default)]
    pub downstream_impact: Vec<String>,

    /// Source location (best-effort)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// Why this pattern matters for a migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_context: Option<String>,

    /// Hard-blocker units this finding was derived from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream_blockers: Vec<String>,
}

impl Finding {
    /// Create a new finding with minimal fields
    pub fn new(
        rule_id: RuleId,
        severity: Severity,
        unit_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule_id,
            severity,
            unit_id: unit_id.into(),
            message: message.into(),
            downstream_impact: Vec::new(),
            location: None,
            business_context: None,
            upstream_blockers: Vec::new(),
        }
    }

    /// Set the location
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set downstream impact
    pub fn with_impact(mut self, impact: Vec<String>) -> Self {
        self.downstream_impact = impact;
        self
    }

    /// Set the business context
    pub fn with_business_context(mut self, context: impl Into<String>) -> Self {
        self.business_context = Some(context.into());
        self
    }

    /// Set the hard blockers this finding derives from
    pub fn with_upstream_blockers(mut self, blockers: Vec<String>) -> Self {
        self.upstream_blockers = blockers;
        self
    }

    /// Whether this finding was derived from another unit's hard blocker
    pub fn is_derived(&self) -> bool {
        self.rule_id == RuleId::DownstreamOfHardBlocker
    }
}
