//! Soft blockers: features that need a workaround or are not at parity yet

use super::config_string;
use crate::rule::{cached_regex, line_of, Rule, RuleContext, RuleError, RuleMatch};
use fusioncheck_core::{RuleId, Severity};
use fusioncheck_dbt::{ProjectUnit, UnitKind};
use regex::Regex;
use std::sync::OnceLock;

static SEMANTIC_SECTION: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static DBT_INVOCATION: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Incremental models using the microbatch strategy
pub struct MicrobatchIncremental;

impl Rule for MicrobatchIncremental {
    fn id(&self) -> RuleId {
        RuleId::MicrobatchIncremental
    }

    fn severity(&self) -> Severity {
        Severity::Soft
    }

    fn business_context(&self) -> &str {
        "Microbatch incremental models depend on batch-level retries and backfills \
         that behave differently on the new engine."
    }

    fn evaluate(&self, unit: &ProjectUnit, _ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        let strategy = config_string(unit, "incremental_strategy")?;
        Ok(strategy
            .filter(|s| s.trim().eq_ignore_ascii_case("microbatch"))
            .map(|_| {
                RuleMatch::new(format!(
                    "'{}' uses the microbatch incremental strategy",
                    unit.display_name()
                ))
            }))
    }
}

/// Models with a declared deprecation date
pub struct DeprecatedModel;

impl Rule for DeprecatedModel {
    fn id(&self) -> RuleId {
        RuleId::DeprecatedModel
    }

    fn severity(&self) -> Severity {
        Severity::Soft
    }

    fn business_context(&self) -> &str {
        "Deprecated models are scheduled for removal. Migrating them is usually wasted effort; \
         retire them or move their consumers first."
    }

    fn evaluate(&self, unit: &ProjectUnit, _ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        let Some(date) = unit.config.get("deprecation_date").filter(|v| !v.is_null()) else {
            return Ok(None);
        };

        let date = match date {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        Ok(Some(RuleMatch::new(format!(
            "'{}' is deprecated (deprecation_date: {})",
            unit.display_name(),
            date
        ))))
    }
}

/// Tables written in the Iceberg table format
pub struct IcebergTableFormat;

impl Rule for IcebergTableFormat {
    fn id(&self) -> RuleId {
        RuleId::IcebergTableFormat
    }

    fn severity(&self) -> Severity {
        Severity::Soft
    }

    fn business_context(&self) -> &str {
        "Iceberg tables rely on external catalog integrations whose support on the new engine \
         is still limited."
    }

    fn evaluate(&self, unit: &ProjectUnit, _ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        for key in ["table_format", "file_format"] {
            if let Some(format) = config_string(unit, key)? {
                if format.trim().eq_ignore_ascii_case("iceberg") {
                    return Ok(Some(RuleMatch::new(format!(
                        "'{}' is written as an Iceberg table ({} = '{}')",
                        unit.display_name(),
                        key,
                        format
                    ))));
                }
            }
        }

        for key in ["catalog", "catalog_name"] {
            if let Some(catalog) = config_string(unit, key)? {
                if catalog.to_ascii_lowercase().contains("iceberg") {
                    return Ok(Some(RuleMatch::new(format!(
                        "'{}' is written to Iceberg catalog '{}'",
                        unit.display_name(),
                        catalog
                    ))));
                }
            }
        }

        Ok(None)
    }
}

/// Semantic models, metrics and saved queries
pub struct SemanticLayerDefinition;

const SEMANTIC_SECTIONS: [&str; 3] = ["semantic_models", "metrics", "saved_queries"];

impl Rule for SemanticLayerDefinition {
    fn id(&self) -> RuleId {
        RuleId::SemanticLayerDefinition
    }

    fn severity(&self) -> Severity {
        Severity::Soft
    }

    fn business_context(&self) -> &str {
        "Semantic layer definitions are served by a separate service and are not validated \
         or compiled by the new engine yet."
    }

    fn evaluate(&self, unit: &ProjectUnit, _ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        if unit.kind != UnitKind::YamlConfig {
            return Ok(None);
        }

        if let Some(section) = SEMANTIC_SECTIONS.iter().find(|s| unit.has_config(s)) {
            return Ok(Some(RuleMatch::new(format!(
                "'{}' declares {}",
                unit.display_name(),
                section
            ))));
        }

        let re = cached_regex(
            &SEMANTIC_SECTION,
            r"(?m)^(semantic_models|metrics|saved_queries)\s*:",
        )?;
        Ok(re.captures(&unit.source).and_then(|caps| {
            let at = caps.get(0)?.start();
            Some(
                RuleMatch::new(format!("'{}' declares {}", unit.display_name(), &caps[1]))
                    .at_line(line_of(&unit.source, at)),
            )
        }))
    }
}

/// Scripts that drive the dbt CLI or Python API
pub struct ProgrammaticInvocation;

impl Rule for ProgrammaticInvocation {
    fn id(&self) -> RuleId {
        RuleId::ProgrammaticInvocation
    }

    fn severity(&self) -> Severity {
        Severity::Soft
    }

    fn business_context(&self) -> &str {
        "Scripts that shell out to dbt or use its Python API are tied to the legacy CLI \
         and its flags and must be ported to the new executable."
    }

    fn evaluate(&self, unit: &ProjectUnit, _ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        if unit.kind != UnitKind::Script {
            return Ok(None);
        }

        let re = cached_regex(
            &DBT_INVOCATION,
            r#"subprocess\.(?:run|call|check_call|check_output|Popen)\(\s*\[\s*['"]dbt['"]|os\.system\(\s*['"]dbt\s|\bdbtRunner\b|from\s+dbt\.cli\.main\s+import"#,
        )?;

        Ok(re.find(&unit.source).map(|m| {
            RuleMatch::new(format!(
                "'{}' invokes dbt programmatically ({})",
                unit.display_name(),
                m.as_str().trim()
            ))
            .at_line(line_of(&unit.source, m.start()))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::evaluate_one;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn microbatch_strategy() {
        let unit = ProjectUnit::new("model.shop.events", UnitKind::Model)
            .with_config("materialized", json!("incremental"))
            .with_config("incremental_strategy", json!("microbatch"));
        let found = evaluate_one(&MicrobatchIncremental, unit).unwrap().unwrap();
        assert_eq!(found.message, "'events' uses the microbatch incremental strategy");

        let merge = ProjectUnit::new("model.shop.orders", UnitKind::Model)
            .with_config("incremental_strategy", json!("merge"));
        assert!(evaluate_one(&MicrobatchIncremental, merge).unwrap().is_none());
    }

    #[test]
    fn microbatch_strategy_must_be_a_string() {
        let unit = ProjectUnit::new("model.shop.events", UnitKind::Model)
            .with_config("incremental_strategy", json!({"name": "microbatch"}));
        assert!(evaluate_one(&MicrobatchIncremental, unit).is_err());
    }

    #[test]
    fn deprecation_date() {
        let unit = ProjectUnit::new("model.shop.legacy", UnitKind::Model)
            .with_config("deprecation_date", json!("2025-01-01"));
        let found = evaluate_one(&DeprecatedModel, unit).unwrap().unwrap();
        assert_eq!(found.message, "'legacy' is deprecated (deprecation_date: 2025-01-01)");

        let null = ProjectUnit::new("model.shop.fresh", UnitKind::Model)
            .with_config("deprecation_date", json!(null));
        assert!(evaluate_one(&DeprecatedModel, null).unwrap().is_none());
    }

    #[test]
    fn iceberg_format_and_catalog() {
        let by_format = ProjectUnit::new("model.shop.a", UnitKind::Model)
            .with_config("table_format", json!("Iceberg"));
        assert!(evaluate_one(&IcebergTableFormat, by_format).unwrap().is_some());

        let by_catalog = ProjectUnit::new("model.shop.b", UnitKind::Model)
            .with_config("catalog", json!("iceberg_rest"));
        let found = evaluate_one(&IcebergTableFormat, by_catalog).unwrap().unwrap();
        assert_eq!(found.message, "'b' is written to Iceberg catalog 'iceberg_rest'");

        let delta = ProjectUnit::new("model.shop.c", UnitKind::Model)
            .with_config("file_format", json!("delta"));
        assert!(evaluate_one(&IcebergTableFormat, delta).unwrap().is_none());
    }

    #[test]
    fn semantic_layer_from_config_or_source() {
        let by_config = ProjectUnit::new("semantic_model.shop.orders", UnitKind::YamlConfig)
            .with_config("semantic_models", json!({"name": "orders"}));
        let found = evaluate_one(&SemanticLayerDefinition, by_config).unwrap().unwrap();
        assert_eq!(found.message, "'orders' declares semantic_models");

        let by_source = ProjectUnit::new("yaml.shop.metrics_yml", UnitKind::YamlConfig)
            .with_source("version: 2\n\nmetrics:\n  - name: revenue\n");
        let found = evaluate_one(&SemanticLayerDefinition, by_source).unwrap().unwrap();
        assert_eq!(found.line, Some(3));

        let model = ProjectUnit::new("model.shop.metrics", UnitKind::Model)
            .with_source("metrics:\n");
        assert!(evaluate_one(&SemanticLayerDefinition, model).unwrap().is_none());
    }

    #[test]
    fn scripts_invoking_dbt() {
        let runner = ProjectUnit::new("script.shop.run_all", UnitKind::Script)
            .with_source("from dbt.cli.main import dbtRunner\n\ndbtRunner().invoke(['run'])\n");
        let found = evaluate_one(&ProgrammaticInvocation, runner).unwrap().unwrap();
        assert_eq!(found.line, Some(1));

        let shell = ProjectUnit::new("script.shop.nightly", UnitKind::Script)
            .with_source("import subprocess\nsubprocess.run([\"dbt\", \"build\"], check=True)\n");
        let found = evaluate_one(&ProgrammaticInvocation, shell).unwrap().unwrap();
        assert_eq!(found.line, Some(2));

        let unrelated = ProjectUnit::new("script.shop.helper", UnitKind::Script)
            .with_source("subprocess.run(['ls'])");
        assert!(evaluate_one(&ProgrammaticInvocation, unrelated).unwrap().is_none());
    }
}
