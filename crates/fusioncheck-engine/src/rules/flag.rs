//! Flags: patterns worth reviewing during migration planning

use super::json_type;
use crate::rule::{cached_regex, line_of, Rule, RuleContext, RuleError, RuleMatch};
use fusioncheck_core::{RuleId, Severity};
use fusioncheck_dbt::{ProjectUnit, UnitKind};
use regex::Regex;
use std::sync::OnceLock;

static EXPOSURE_SECTION: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Models with restricted cross-project access
pub struct RestrictedAccess;

impl Rule for RestrictedAccess {
    fn id(&self) -> RuleId {
        RuleId::RestrictedAccess
    }

    fn severity(&self) -> Severity {
        Severity::Flag
    }

    fn business_context(&self) -> &str {
        "Access-restricted models are enforced differently across project boundaries; \
         confirm consumers still resolve after migration."
    }

    fn evaluate(&self, unit: &ProjectUnit, _ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        if !unit.has_config("restrict_access") {
            return Ok(None);
        }

        match unit.config_bool("restrict_access") {
            Some(true) => Ok(Some(RuleMatch::new(format!(
                "'{}' has restrict_access enabled",
                unit.display_name()
            )))),
            Some(false) => Ok(None),
            None => Err(RuleError::InvalidConfigValue {
                key: "restrict_access".to_string(),
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}

/// Exposure definitions
pub struct ExposureDefinition;

impl Rule for ExposureDefinition {
    fn id(&self) -> RuleId {
        RuleId::ExposureDefinition
    }

    fn severity(&self) -> Severity {
        Severity::Flag
    }

    fn business_context(&self) -> &str {
        "Exposures document downstream dashboards and applications. They are the consumers \
         to notify when upstream models change engine."
    }

    fn evaluate(&self, unit: &ProjectUnit, _ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        if unit.kind != UnitKind::YamlConfig {
            return Ok(None);
        }

        if unit.has_config("exposures") {
            return Ok(Some(RuleMatch::new(format!(
                "'{}' declares an exposure",
                unit.display_name()
            ))));
        }

        let re = cached_regex(&EXPOSURE_SECTION, r"(?m)^exposures\s*:")?;
        Ok(re.find(&unit.source).map(|m| {
            RuleMatch::new(format!("'{}' declares an exposure", unit.display_name()))
                .at_line(line_of(&unit.source, m.start()))
        }))
    }
}

/// Calls to query-comment injector macros
pub struct QueryCommentMacro;

impl Rule for QueryCommentMacro {
    fn id(&self) -> RuleId {
        RuleId::QueryCommentMacro
    }

    fn severity(&self) -> Severity {
        Severity::Flag
    }

    fn business_context(&self) -> &str {
        "Query comments feed cost attribution and audit tooling. The new engine renders \
         comments itself, so injected comments may change shape or disappear."
    }

    fn evaluate(&self, unit: &ProjectUnit, ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        if unit.kind == UnitKind::YamlConfig {
            for key in ["query-comment", "query_comment"] {
                if unit.has_config(key) {
                    return Ok(Some(RuleMatch::new(format!(
                        "'{}' configures a query comment ({})",
                        unit.display_name(),
                        key
                    ))));
                }
            }
        }

        let re = match &ctx.query_comment_calls {
            Ok(Some(re)) => re,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e.clone()),
        };

        for caps in re.captures_iter(&unit.source) {
            let Some(whole) = caps.get(0) else { continue };
            // `{% macro query_comment(...) %}` is the definition, not a call
            if whole.as_str().starts_with("macro") {
                continue;
            }
            return Ok(Some(
                RuleMatch::new(format!(
                    "'{}' calls query-comment macro '{}'",
                    unit.display_name(),
                    &caps[1]
                ))
                .at_line(line_of(&unit.source, whole.start())),
            ));
        }

        Ok(None)
    }
}

/// pre_hook / post_hook configuration
pub struct ModelHooks;

const HOOK_KEYS: [&str; 4] = ["pre_hook", "post_hook", "pre-hook", "post-hook"];

impl Rule for ModelHooks {
    fn id(&self) -> RuleId {
        RuleId::ModelHooks
    }

    fn severity(&self) -> Severity {
        Severity::Flag
    }

    fn business_context(&self) -> &str {
        "Hooks run arbitrary SQL around a model, often for auditing or grants. \
         Review that they still run in the same order and context."
    }

    fn evaluate(&self, unit: &ProjectUnit, _ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        let mut declared = Vec::new();

        for key in HOOK_KEYS {
            let present = match unit.config.get(key) {
                None | Some(serde_json::Value::Null) => false,
                Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
                Some(serde_json::Value::Array(items)) => !items.is_empty(),
                // `{sql: ..., transaction: ...}` form
                Some(serde_json::Value::Object(_)) => true,
                Some(other) => {
                    return Err(RuleError::InvalidConfigValue {
                        key: key.to_string(),
                        reason: format!("expected SQL or a list of SQL, found {}", json_type(other)),
                    })
                }
            };
            if present {
                declared.push(key);
            }
        }

        if declared.is_empty() {
            return Ok(None);
        }

        Ok(Some(RuleMatch::new(format!(
            "'{}' declares {}",
            unit.display_name(),
            declared.join(", ")
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{evaluate_in, evaluate_one};
    use fusioncheck_core::RuleSettings;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn restricted_access() {
        let unit = ProjectUnit::new("model.shop.finance", UnitKind::Model)
            .with_config("restrict_access", json!(true));
        assert!(evaluate_one(&RestrictedAccess, unit).unwrap().is_some());

        let off = ProjectUnit::new("model.shop.open", UnitKind::Model)
            .with_config("restrict_access", json!("false"));
        assert!(evaluate_one(&RestrictedAccess, off).unwrap().is_none());

        let odd = ProjectUnit::new("model.shop.odd", UnitKind::Model)
            .with_config("restrict_access", json!("sometimes"));
        assert!(evaluate_one(&RestrictedAccess, odd).is_err());
    }

    #[test]
    fn exposures() {
        let unit = ProjectUnit::new("exposure.shop.dashboard", UnitKind::YamlConfig)
            .with_config("exposures", json!({"type": "dashboard"}));
        let found = evaluate_one(&ExposureDefinition, unit).unwrap().unwrap();
        assert_eq!(found.message, "'dashboard' declares an exposure");
    }

    #[test]
    fn query_comment_calls_not_definitions() {
        let definition = ProjectUnit::new("macro.shop.query_comment", UnitKind::Macro)
            .with_source("{% macro query_comment(node) %}/* {{ node.unique_id }} */{% endmacro %}");
        assert!(evaluate_one(&QueryCommentMacro, definition).unwrap().is_none());

        let call = ProjectUnit::new("model.shop.orders", UnitKind::Model)
            .with_source("select 1\n{{ set_query_comment(this) }}");
        let found = evaluate_one(&QueryCommentMacro, call).unwrap().unwrap();
        assert_eq!(found.message, "'orders' calls query-comment macro 'set_query_comment'");
        assert_eq!(found.line, Some(2));
    }

    #[test]
    fn query_comment_macros_are_configurable() {
        let unit = ProjectUnit::new("model.shop.orders", UnitKind::Model)
            .with_source("{{ audit_tag() }} select 1");
        let settings = RuleSettings {
            query_comment_macros: vec!["audit_tag".to_string()],
            ..RuleSettings::default()
        };
        assert!(evaluate_in(&QueryCommentMacro, "model.shop.orders", vec![unit.clone()], &settings)
            .unwrap()
            .is_some());

        let none = RuleSettings {
            query_comment_macros: Vec::new(),
            ..RuleSettings::default()
        };
        assert!(evaluate_in(&QueryCommentMacro, "model.shop.orders", vec![unit], &none)
            .unwrap()
            .is_none());
    }

    #[test]
    fn hooks() {
        let unit = ProjectUnit::new("model.shop.orders", UnitKind::Model)
            .with_config("post_hook", json!(["grant select on {{ this }} to role reporter"]))
            .with_config("pre_hook", json!([]));
        let found = evaluate_one(&ModelHooks, unit).unwrap().unwrap();
        assert_eq!(found.message, "'orders' declares post_hook");

        let bad = ProjectUnit::new("model.shop.bad", UnitKind::Model).with_config("pre-hook", json!(42));
        assert!(evaluate_one(&ModelHooks, bad).is_err());
    }
}
