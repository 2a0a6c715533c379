//! Hard blockers: patterns that unconditionally prevent migration

use super::{config_string, is_python};
use crate::heuristics::{self, SourceIssue};
use crate::rule::{cached_regex, line_of, Rule, RuleContext, RuleError, RuleMatch};
use fusioncheck_core::{RuleId, Severity};
use fusioncheck_dbt::{Language, ProjectUnit, UnitKind};
use regex::Regex;
use std::sync::OnceLock;

static PYTHON_ENTRYPOINT: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static MATERIALIZATION_BLOCK: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Materializations the engine ships with
const BUILTIN_MATERIALIZATIONS: [&str; 9] = [
    "table",
    "view",
    "incremental",
    "ephemeral",
    "materialized_view",
    "snapshot",
    "seed",
    "test",
    "dynamic_table",
];

/// Models written in Python
pub struct PythonModel;

impl Rule for PythonModel {
    fn id(&self) -> RuleId {
        RuleId::PythonModel
    }

    fn severity(&self) -> Severity {
        Severity::Hard
    }

    fn business_context(&self) -> &str {
        "Python models run on the warehouse's Python runtime, which the engine does not execute. \
         They must be rewritten in SQL or kept on the legacy engine."
    }

    fn evaluate(&self, unit: &ProjectUnit, _ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        if unit.kind != UnitKind::Model {
            return Ok(None);
        }

        let declared = match config_string(unit, "language")? {
            Some(lang) => Language::parse(lang) == Some(Language::Python),
            None => false,
        };

        let entrypoint = cached_regex(
            &PYTHON_ENTRYPOINT,
            r"(?m)^\s*def\s+model\s*\(\s*dbt\s*,\s*session\s*\)",
        )?
        .find(&unit.source);

        if let Some(m) = entrypoint {
            return Ok(Some(
                RuleMatch::new(format!("'{}' is a Python model", unit.display_name()))
                    .at_line(line_of(&unit.source, m.start())),
            ));
        }

        if declared || is_python(unit) {
            return Ok(Some(RuleMatch::new(format!(
                "'{}' is a Python model",
                unit.display_name()
            ))));
        }

        Ok(None)
    }
}

/// Materializations that are not built into the engine
pub struct CustomMaterialization;

impl Rule for CustomMaterialization {
    fn id(&self) -> RuleId {
        RuleId::CustomMaterialization
    }

    fn severity(&self) -> Severity {
        Severity::Hard
    }

    fn business_context(&self) -> &str {
        "Custom materializations are Jinja programs that drive the warehouse directly. \
         The engine only supports its built-in materializations."
    }

    fn evaluate(&self, unit: &ProjectUnit, ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        match unit.kind {
            UnitKind::Model => {
                let Some(materialized) = config_string(unit, "materialized")? else {
                    return Ok(None);
                };

                let is_builtin = BUILTIN_MATERIALIZATIONS
                    .iter()
                    .copied()
                    .chain(ctx.settings.extra_materializations.iter().map(String::as_str))
                    .any(|m| m.eq_ignore_ascii_case(materialized.trim()));

                if is_builtin {
                    Ok(None)
                } else {
                    Ok(Some(RuleMatch::new(format!(
                        "'{}' uses custom materialization '{}'",
                        unit.display_name(),
                        materialized
                    ))))
                }
            }
            UnitKind::Macro => {
                let re = cached_regex(
                    &MATERIALIZATION_BLOCK,
                    r"\{%-?\s*materialization\s+(\w+)",
                )?;
                Ok(re.captures(&unit.source).and_then(|caps| {
                    let at = caps.get(0)?.start();
                    Some(
                        RuleMatch::new(format!("macro defines custom materialization '{}'", &caps[1]))
                            .at_line(line_of(&unit.source, at)),
                    )
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Sources the engine cannot reliably parse
pub struct UnparseableSource;

impl UnparseableSource {
    fn template_issues(unit: &ProjectUnit) -> Result<Vec<SourceIssue>, RuleError> {
        let templated = match unit.kind {
            UnitKind::Model => !is_python(unit),
            UnitKind::Macro => true,
            _ => false,
        };
        if !templated {
            return Ok(Vec::new());
        }

        let mut issues = heuristics::template_delimiter_issues(&unit.source)?;
        // Block tags are only meaningful once the delimiters are balanced
        if issues.is_empty() {
            issues.extend(heuristics::block_tag_issues(&unit.source)?);
        }
        issues.extend(heuristics::sql_lexical_issues(&unit.source));
        Ok(issues)
    }
}

impl Rule for UnparseableSource {
    fn id(&self) -> RuleId {
        RuleId::UnparseableSource
    }

    fn severity(&self) -> Severity {
        Severity::Hard
    }

    fn business_context(&self) -> &str {
        "The engine parses every model ahead of execution. Sources it cannot parse, or whose \
         references cannot be resolved, fail the whole project."
    }

    fn evaluate(&self, unit: &ProjectUnit, ctx: &RuleContext<'_>) -> Result<Option<RuleMatch>, RuleError> {
        let mut reasons: Vec<(String, Option<usize>)> = Self::template_issues(unit)?
            .into_iter()
            .map(|issue| (issue.reason, Some(issue.line)))
            .collect();

        if matches!(unit.kind, UnitKind::Model | UnitKind::Macro) {
            for (name, line) in heuristics::ref_targets(&unit.source)? {
                if ctx.graph.resolve_ref(&name).is_none() {
                    reasons.push((format!("ref('{}') does not match any model", name), Some(line)));
                }
            }
        }

        for missing in ctx.dag.unresolved_parents(ctx.graph, &unit.unique_id) {
            reasons.push((format!("depends on unknown unit '{}'", missing), None));
        }

        if unit.depends_on.contains(&unit.unique_id) {
            reasons.push(("references itself".to_string(), None));
        } else if ctx.cycles.contains(&unit.unique_id) {
            reasons.push(("is part of a dependency cycle".to_string(), None));
        }

        if reasons.is_empty() {
            return Ok(None);
        }

        let line = reasons.iter().filter_map(|(_, line)| *line).min();
        let joined: Vec<&str> = reasons.iter().map(|(reason, _)| reason.as_str()).collect();
        let mut found = RuleMatch::new(format!(
            "'{}' cannot be reliably parsed: {}",
            unit.display_name(),
            joined.join("; ")
        ));
        found.line = line;
        Ok(Some(found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{evaluate_in, evaluate_one};
    use fusioncheck_core::RuleSettings;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn model(id: &str) -> ProjectUnit {
        ProjectUnit::new(id, UnitKind::Model)
    }

    #[test]
    fn python_model_by_entrypoint() {
        let unit = model("model.shop.segments")
            .with_source("import pandas\n\ndef model(dbt, session):\n    return dbt.ref('customers')");
        let found = evaluate_one(&PythonModel, unit).unwrap().unwrap();
        assert_eq!(found.message, "'segments' is a Python model");
        assert_eq!(found.line, Some(3));
    }

    #[test]
    fn python_model_by_declared_language() {
        let unit = model("model.shop.segments").with_language(Language::Python);
        assert!(evaluate_one(&PythonModel, unit).unwrap().is_some());

        let sql = model("model.shop.orders").with_source("select 1");
        assert!(evaluate_one(&PythonModel, sql).unwrap().is_none());
    }

    #[test]
    fn python_model_rejects_non_string_language() {
        let unit = model("model.shop.a").with_config("language", json!(3));
        assert!(matches!(
            evaluate_one(&PythonModel, unit),
            Err(RuleError::InvalidConfigValue { .. })
        ));
    }

    #[test]
    fn builtin_materializations_are_fine() {
        for m in ["table", "VIEW", "incremental", "ephemeral"] {
            let unit = model("model.shop.a").with_config("materialized", json!(m));
            assert!(evaluate_one(&CustomMaterialization, unit).unwrap().is_none(), "{m}");
        }
    }

    #[test]
    fn custom_materialization_on_model() {
        let unit = model("model.shop.a").with_config("materialized", json!("insert_by_period"));
        let found = evaluate_one(&CustomMaterialization, unit).unwrap().unwrap();
        assert_eq!(found.message, "'a' uses custom materialization 'insert_by_period'");
    }

    #[test]
    fn extra_materializations_are_treated_as_builtin() {
        let unit = model("model.shop.a").with_config("materialized", json!("insert_by_period"));
        let settings = RuleSettings {
            extra_materializations: vec!["insert_by_period".to_string()],
            ..RuleSettings::default()
        };
        assert!(evaluate_in(&CustomMaterialization, "model.shop.a", vec![unit], &settings)
            .unwrap()
            .is_none());
    }

    #[test]
    fn custom_materialization_defined_in_macro() {
        let unit = ProjectUnit::new("macro.shop.materialization_upsert", UnitKind::Macro)
            .with_source("-- upsert\n{%- materialization upsert, adapter='snowflake' %}\n{% endmaterialization %}");
        let found = evaluate_one(&CustomMaterialization, unit).unwrap().unwrap();
        assert_eq!(found.message, "macro defines custom materialization 'upsert'");
        assert_eq!(found.line, Some(2));
    }

    #[test]
    fn clean_source_is_parseable() {
        let unit = model("model.shop.orders")
            .with_source("select * from {{ ref('orders_raw') }} where status = 'done'");
        let upstream = model("model.shop.orders_raw").with_source("select 1");
        let result = evaluate_in(
            &UnparseableSource,
            "model.shop.orders",
            vec![unit, upstream],
            &RuleSettings::default(),
        )
        .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn valid_jinja_is_not_unparseable() {
        let sources = [
            "{% macro m() %}{% raw %}select 1{% endraw %}{% endmacro %}",
            "{% with x = 1 %}select {{ x }}{% endwith %}",
            "{# {% if is_incremental() %} old filter #}\nselect 1",
            "select * from files where path = 'C:\\'",
        ];
        for source in sources {
            let unit = ProjectUnit::new("macro.shop.m", UnitKind::Macro).with_source(source);
            assert_eq!(evaluate_one(&UnparseableSource, unit).unwrap(), None, "{source}");
        }
    }

    #[test]
    fn all_reasons_fold_into_one_match() {
        let unit = model("model.shop.broken")
            .with_source("select *\nfrom {{ ref('nowhere') }}\nwhere x = 'oops\n{{ oops")
            .depends_on("model.shop.ghost");
        let found = evaluate_one(&UnparseableSource, unit).unwrap().unwrap();

        assert!(found.message.contains("'{{' is never closed"), "{}", found.message);
        assert!(found.message.contains("ref('nowhere') does not match any model"));
        assert!(found.message.contains("depends on unknown unit 'model.shop.ghost'"));
        assert_eq!(found.line, Some(2));
    }

    #[test]
    fn dependency_cycles_are_unparseable() {
        let a = model("model.shop.a").depends_on("model.shop.b");
        let b = model("model.shop.b").depends_on("model.shop.a");
        let found = evaluate_in(&UnparseableSource, "model.shop.a", vec![a, b], &RuleSettings::default())
            .unwrap()
            .unwrap();
        assert_eq!(found.message, "'a' cannot be reliably parsed: is part of a dependency cycle");

        let selfish = model("model.shop.c").depends_on("model.shop.c");
        let found = evaluate_one(&UnparseableSource, selfish).unwrap().unwrap();
        assert_eq!(found.message, "'c' cannot be reliably parsed: references itself");
    }

    #[test]
    fn python_sources_skip_template_checks() {
        let unit = model("model.shop.py")
            .with_language(Language::Python)
            .with_source("def model(dbt, session):\n    return {'a': {'b': 1}}");
        assert!(evaluate_one(&UnparseableSource, unit).unwrap().is_none());
    }
}
