//! Built-in rule catalogue
//!
//! Rules are grouped by default severity. Each rule is a unit struct
//! implementing [`Rule`]; [`builtin_rules`] returns them in registration
//! order.

mod flag;
mod hard;
mod soft;

pub use flag::{ExposureDefinition, ModelHooks, QueryCommentMacro, RestrictedAccess};
pub use hard::{CustomMaterialization, PythonModel, UnparseableSource};
pub use soft::{
    DeprecatedModel, IcebergTableFormat, MicrobatchIncremental, ProgrammaticInvocation,
    SemanticLayerDefinition,
};

use crate::rule::{Rule, RuleError};
use fusioncheck_dbt::{Language, ProjectUnit};

/// Every built-in rule, in registration order
pub fn builtin_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(PythonModel),
        Box::new(CustomMaterialization),
        Box::new(UnparseableSource),
        Box::new(MicrobatchIncremental),
        Box::new(DeprecatedModel),
        Box::new(IcebergTableFormat),
        Box::new(SemanticLayerDefinition),
        Box::new(ProgrammaticInvocation),
        Box::new(RestrictedAccess),
        Box::new(ExposureDefinition),
        Box::new(QueryCommentMacro),
        Box::new(ModelHooks),
    ]
}

/// String value of a config key
///
/// `Ok(None)` when the key is absent or `null`; an error when it holds
/// anything other than a string.
pub(crate) fn config_string<'u>(unit: &'u ProjectUnit, key: &str) -> Result<Option<&'u str>, RuleError> {
    match unit.config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(RuleError::InvalidConfigValue {
            key: key.to_string(),
            reason: format!("expected a string, found {}", json_type(other)),
        }),
    }
}

/// Whether a unit is written in Python (declared language, config or file extension)
pub(crate) fn is_python(unit: &ProjectUnit) -> bool {
    unit.language == Some(Language::Python)
        || unit
            .config_str("language")
            .is_some_and(|l| l.eq_ignore_ascii_case("python"))
        || unit
            .original_file_path
            .as_deref()
            .is_some_and(|p| p.ends_with(".py"))
}

pub(crate) fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "a list",
        serde_json::Value::Object(_) => "a mapping",
    }
}

/// Evaluate one rule against `unit_id` inside a graph built from `units`
#[cfg(test)]
pub(crate) fn evaluate_in(
    rule: &dyn Rule,
    unit_id: &str,
    units: Vec<ProjectUnit>,
    settings: &fusioncheck_core::RuleSettings,
) -> Result<Option<crate::rule::RuleMatch>, RuleError> {
    use fusioncheck_dbt::{DependencyGraph, ProjectGraph};

    let graph = ProjectGraph::build(units).graph;
    let dag = DependencyGraph::from_project(&graph);
    let cycles = dag.cycle_members();
    let ctx = crate::rule::RuleContext::new(&graph, &dag, &cycles, settings);
    let unit = graph
        .get(unit_id)
        .ok_or_else(|| RuleError::Internal(format!("no unit '{}'", unit_id)))?;
    rule.evaluate(unit, &ctx)
}

/// Evaluate one rule against a single-unit graph with default settings
#[cfg(test)]
pub(crate) fn evaluate_one(
    rule: &dyn Rule,
    unit: ProjectUnit,
) -> Result<Option<crate::rule::RuleMatch>, RuleError> {
    let id = unit.unique_id.clone();
    evaluate_in(rule, &id, vec![unit], &fusioncheck_core::RuleSettings::default())
}
