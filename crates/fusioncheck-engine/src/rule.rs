//! Rule trait, evaluation context and registry

use fusioncheck_core::{RuleId, RuleSettings, Severity};
use fusioncheck_dbt::{DependencyGraph, ProjectGraph, ProjectUnit, UnitId};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// A successful rule match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Human-readable message
    pub message: String,

    /// Line in the unit's source (1-indexed), when the match has one
    pub line: Option<usize>,
}

impl RuleMatch {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

/// A fault inside a rule's evaluation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("config key '{key}' has an unexpected value: {reason}")]
    InvalidConfigValue { key: String, reason: String },

    #[error("pattern error: {0}")]
    Pattern(String),

    #[error("rule panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Internal(String),
}

/// Read-only state shared by every rule evaluation in one run
pub struct RuleContext<'a> {
    /// The whole project graph
    pub graph: &'a ProjectGraph,

    /// Dependency index built once for the run
    pub dag: &'a DependencyGraph,

    /// Units that sit on a dependency cycle
    pub cycles: &'a BTreeSet<UnitId>,

    /// Rule settings from fusioncheck.toml
    pub settings: &'a RuleSettings,

    /// Call pattern for the configured query-comment macros
    /// (`None` when no macro is configured)
    pub query_comment_calls: Result<Option<Regex>, RuleError>,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        graph: &'a ProjectGraph,
        dag: &'a DependencyGraph,
        cycles: &'a BTreeSet<UnitId>,
        settings: &'a RuleSettings,
    ) -> Self {
        let query_comment_calls = macro_call_pattern(&settings.query_comment_macros);
        Self {
            graph,
            dag,
            cycles,
            settings,
            query_comment_calls,
        }
    }
}

/// Build a regex matching calls to any of `names`, capturing the name
///
/// A `macro ` prefix is part of the match so definitions can be told apart
/// from calls.
fn macro_call_pattern(names: &[String]) -> Result<Option<Regex>, RuleError> {
    let alternatives: Vec<String> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(regex::escape)
        .collect();

    if alternatives.is_empty() {
        return Ok(None);
    }

    Regex::new(&format!(r"(?:\bmacro\s+)?\b({})\s*\(", alternatives.join("|")))
        .map(Some)
        .map_err(|e| RuleError::Pattern(e.to_string()))
}

/// A named predicate over a project unit
pub trait Rule: Send + Sync {
    /// Stable rule id
    fn id(&self) -> RuleId;

    /// Default severity (config may override it)
    fn severity(&self) -> Severity;

    /// Why this pattern matters for a migration
    fn business_context(&self) -> &str;

    /// Evaluate the rule against one (normalized) unit
    fn evaluate(&self, unit: &ProjectUnit, ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError>;
}

/// Ordered collection of rules
#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in rule
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for rule in crate::rules::builtin_rules() {
            registry.register(rule);
        }
        registry
    }

    /// Add a rule; rules of the same tier keep registration order
    pub fn register(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn Rule + 'static)> {
        self.rules.iter().map(|r| r.as_ref())
    }
}

/// Compile a static pattern once; a bad pattern surfaces as a rule fault
pub(crate) fn cached_regex(
    cell: &'static OnceLock<Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex, RuleError> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| RuleError::Pattern(e.to_string()))
}

/// 1-indexed line number of a byte offset
pub(crate) fn line_of(source: &str, offset: usize) -> usize {
    let end = offset.min(source.len());
    source.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_call_pattern_matches_calls() {
        let re = macro_call_pattern(&["query_comment".to_string(), "set_query_comment".to_string()])
            .unwrap()
            .unwrap();
        let caps = re.captures("select 1 {{ set_query_comment(this) }}").unwrap();
        assert_eq!(&caps[1], "set_query_comment");
        assert!(re.is_match("{{ query_comment (node) }}"));
        assert!(!re.is_match("{{ my_query_comment_helper() }}"));
    }

    #[test]
    fn empty_macro_list_matches_nothing() {
        assert!(macro_call_pattern(&[]).unwrap().is_none());
        assert!(macro_call_pattern(&["  ".to_string()]).unwrap().is_none());
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry = RuleRegistry::builtin();
        let ids: Vec<RuleId> = registry.iter().map(|r| r.id()).collect();
        assert_eq!(ids.first(), Some(&RuleId::PythonModel));
        assert!(!registry.is_empty());
    }

    #[test]
    fn line_numbers() {
        let src = "a\nb\nc";
        assert_eq!(line_of(src, 0), 1);
        assert_eq!(line_of(src, 2), 2);
        assert_eq!(line_of(src, 100), 3);
    }
}
