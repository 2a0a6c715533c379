//! Blocker classification
//!
//! [`BlockerClassifier`] evaluates every rule against every unit of a
//! [`ProjectGraph`] and then propagates hard blockers to their transitive
//! dependents.
//!
//! Output order is stable: units in id order; per unit, findings by
//! severity tier (hard, soft, flag) and then by rule registration order,
//! with derived findings after the direct findings of the same tier.

use crate::normalize::normalize;
use crate::rule::{Rule, RuleContext, RuleError, RuleMatch, RuleRegistry};
use fusioncheck_core::{Config, Finding, Location, Note, Report, RuleId, Severity};
use fusioncheck_dbt::{DependencyGraph, InputError, LoadedGraph, ProjectGraph, ProjectUnit, UnitId};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};

const DOWNSTREAM_CONTEXT: &str = "Units built on top of a hard blocker cannot migrate \
    until every upstream blocker is resolved.";

/// Rule metadata as seen by a configured classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
    pub id: RuleId,

    /// Severity after config overrides
    pub severity: Severity,

    /// Severity the rule declares
    pub default_severity: Severity,

    pub business_context: String,
}

/// Result of classifying a loaded graph
#[derive(Debug, Clone)]
pub struct Classification {
    pub findings: Vec<Finding>,

    /// Notes from loading plus classifier notes
    pub notes: Vec<Note>,

    /// Units that were evaluated
    pub units_checked: usize,

    /// Units rejected while loading
    pub units_excluded: usize,

    /// Fingerprint of the input graph
    pub fingerprint: String,
}

impl Classification {
    /// Turn the classification into a versioned report
    pub fn into_report(self) -> Report {
        Report::from_findings(self.findings)
            .with_unit_counts(self.units_checked, self.units_excluded)
            .with_notes(self.notes)
            .with_fingerprint(self.fingerprint)
    }
}

/// Classifies project units into migration blockers
pub struct BlockerClassifier {
    config: Config,
    registry: RuleRegistry,
}

impl Default for BlockerClassifier {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl BlockerClassifier {
    /// Classifier with every built-in rule
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, RuleRegistry::builtin())
    }

    /// Classifier with a custom rule set
    pub fn with_registry(config: Config, registry: RuleRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn effective_severity(&self, id: RuleId, default: Severity) -> Severity {
        self.config.severity.get_severity(id, default)
    }

    /// Enabled rules with their effective severity, in evaluation order
    fn ordered_rules(&self) -> Vec<(&dyn Rule, Severity)> {
        let mut rules: Vec<(&dyn Rule, Severity)> = self
            .registry
            .iter()
            .filter(|rule| !self.config.rules.is_disabled(rule.id()))
            .map(|rule| (rule, self.effective_severity(rule.id(), rule.severity())))
            .collect();

        // Stable: registration order is kept within a tier
        rules.sort_by_key(|(_, severity)| severity.tier());
        rules
    }

    /// Enabled rules in evaluation order
    pub fn rules(&self) -> Vec<RuleInfo> {
        self.ordered_rules()
            .into_iter()
            .map(|(rule, severity)| RuleInfo {
                id: rule.id(),
                severity,
                default_severity: rule.severity(),
                business_context: rule.business_context().to_string(),
            })
            .collect()
    }

    /// Classify every unit of `graph`
    pub fn classify(&self, graph: &ProjectGraph) -> Vec<Finding> {
        let dag = DependencyGraph::from_project(graph);
        let cycles = dag.cycle_members();
        let ctx = RuleContext::new(graph, &dag, &cycles, &self.config.rules);
        let rules = self.ordered_rules();

        let mut per_unit: BTreeMap<UnitId, Vec<Finding>> = BTreeMap::new();
        for unit in graph.units() {
            if self.config.allowlist.is_unit_skipped(&unit.unique_id) {
                tracing::debug!(unit = %unit.unique_id, "skipping allowlisted unit");
                continue;
            }

            let findings = self.evaluate_unit(unit, &rules, &ctx);
            tracing::debug!(unit = %unit.unique_id, findings = findings.len(), "classified unit");
            per_unit.insert(unit.unique_id.clone(), findings);
        }

        self.propagate(&dag, &mut per_unit);

        per_unit.into_values().flatten().collect()
    }

    fn evaluate_unit(
        &self,
        unit: &ProjectUnit,
        rules: &[(&dyn Rule, Severity)],
        ctx: &RuleContext<'_>,
    ) -> Vec<Finding> {
        let normalized = normalize(unit).unwrap_or_else(|e| {
            tracing::warn!(unit = %unit.unique_id, error = %e, "inline config ignored");
            Cow::Borrowed(unit)
        });

        let mut findings = Vec::new();
        for &(rule, severity) in rules {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(&normalized, ctx)))
                .unwrap_or_else(|payload| Err(RuleError::Panicked(panic_message(payload.as_ref()))));

            match outcome {
                Ok(None) => {}
                Ok(Some(found)) => {
                    findings.push(direct_finding(rule, severity, &normalized, found));
                }
                Err(e) => {
                    tracing::warn!(
                        rule = %rule.id(),
                        unit = %unit.unique_id,
                        error = %e,
                        "rule evaluation failed"
                    );
                    let mut finding = Finding::new(
                        RuleId::EvaluationError,
                        severity,
                        &unit.unique_id,
                        format!("rule '{}' failed on '{}': {}", rule.id(), unit.unique_id, e),
                    );
                    if let Some(path) = &unit.original_file_path {
                        finding = finding.with_location(Location::new(path.clone()));
                    }
                    findings.push(finding);
                }
            }
        }

        findings
    }

    /// Attach downstream impact to hard blockers and add derived findings
    fn propagate(&self, dag: &DependencyGraph, per_unit: &mut BTreeMap<UnitId, Vec<Finding>>) {
        let mut blockers_of: BTreeMap<UnitId, BTreeSet<UnitId>> = BTreeMap::new();

        for (unit_id, findings) in per_unit.iter_mut() {
            let is_blocker = findings.iter().any(is_propagating);
            if !is_blocker {
                continue;
            }

            let impact: Vec<UnitId> = dag
                .downstream(unit_id)
                .into_iter()
                .filter(|id| !self.config.allowlist.is_unit_skipped(id))
                .collect();

            for finding in findings.iter_mut().filter(|f| is_propagating(f)) {
                finding.downstream_impact = impact.clone();
            }

            for dependent in &impact {
                blockers_of
                    .entry(dependent.clone())
                    .or_default()
                    .insert(unit_id.clone());
            }
        }

        if self.config.rules.is_disabled(RuleId::DownstreamOfHardBlocker) {
            return;
        }
        let severity = self.effective_severity(RuleId::DownstreamOfHardBlocker, Severity::Hard);

        for (dependent, blockers) in blockers_of {
            // Only classified units receive derived findings
            let Some(findings) = per_unit.get_mut(&dependent) else { continue };

            let blockers: Vec<UnitId> = blockers.into_iter().collect();
            let impact: Vec<UnitId> = dag
                .downstream(&dependent)
                .into_iter()
                .filter(|id| !self.config.allowlist.is_unit_skipped(id))
                .collect();

            let message = if blockers.len() == 1 {
                format!("'{}' depends on hard blocker '{}'", dependent, blockers[0])
            } else {
                format!(
                    "'{}' depends on {} hard blockers: {}",
                    dependent,
                    blockers.len(),
                    blockers.join(", ")
                )
            };

            findings.push(
                Finding::new(RuleId::DownstreamOfHardBlocker, severity, &dependent, message)
                    .with_impact(impact)
                    .with_business_context(DOWNSTREAM_CONTEXT)
                    .with_upstream_blockers(blockers),
            );
            // Derived findings may have been overridden to a lower tier
            findings.sort_by_key(|f| f.severity.tier());
        }
    }

    /// Classify a loaded graph, carrying its notes and counts
    pub fn classify_loaded(&self, loaded: LoadedGraph) -> Classification {
        let units_excluded = loaded.excluded();
        let LoadedGraph { graph, mut notes } = loaded;

        let skipped: Vec<&UnitId> = graph
            .units()
            .map(|u| &u.unique_id)
            .filter(|id| self.config.allowlist.is_unit_skipped(id))
            .collect();
        for id in &skipped {
            notes.push(Note::info(Some((*id).clone()), "skipped by allowlist"));
        }
        let units_checked = graph.len() - skipped.len();

        let findings = self.classify(&graph);
        tracing::info!(
            units = units_checked,
            excluded = units_excluded,
            findings = findings.len(),
            "classification finished"
        );

        Classification {
            findings,
            notes,
            units_checked,
            units_excluded,
            fingerprint: graph.fingerprint(),
        }
    }

    /// Classify an input graph, failing when none was supplied
    pub fn classify_input(&self, input: Option<LoadedGraph>) -> Result<Classification, InputError> {
        let loaded = input.ok_or_else(|| {
            InputError::InvalidInput("no input project graph supplied".to_string())
        })?;
        Ok(self.classify_loaded(loaded))
    }
}

/// A direct hard finding that is propagated to dependents
fn is_propagating(finding: &Finding) -> bool {
    finding.severity == Severity::Hard
        && finding.rule_id != RuleId::EvaluationError
        && !finding.is_derived()
}

fn direct_finding(rule: &dyn Rule, severity: Severity, unit: &ProjectUnit, found: RuleMatch) -> Finding {
    let mut finding = Finding::new(rule.id(), severity, &unit.unique_id, found.message)
        .with_business_context(rule.business_context());

    if let Some(path) = &unit.original_file_path {
        let location = match found.line {
            Some(line) => Location::with_line(path.clone(), line),
            None => Location::new(path.clone()),
        };
        finding = finding.with_location(location);
    }

    finding
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusioncheck_dbt::UnitKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ids(findings: &[Finding]) -> Vec<(String, RuleId)> {
        findings.iter().map(|f| (f.unit_id.clone(), f.rule_id)).collect()
    }

    #[test]
    fn rules_are_ordered_by_effective_tier() {
        let mut config = Config::default();
        config.severity.set_override(RuleId::ModelHooks, Severity::Hard);
        config.rules.disabled.push("python-model".to_string());

        let rules = BlockerClassifier::new(config).rules();
        let ids: Vec<RuleId> = rules.iter().map(|r| r.id).collect();

        assert_eq!(
            &ids[..3],
            &[RuleId::CustomMaterialization, RuleId::UnparseableSource, RuleId::ModelHooks]
        );
        assert!(!ids.contains(&RuleId::PythonModel));
        assert_eq!(rules[2].default_severity, Severity::Flag);
    }

    #[test]
    fn findings_within_a_unit_follow_tier_order() {
        let graph = ProjectGraph::build(vec![ProjectUnit::new("model.shop.a", UnitKind::Model)
            .with_config("post_hook", json!("grant select on {{ this }} to role r"))
            .with_config("deprecation_date", json!("2025-01-01"))
            .with_config("materialized", json!("insert_by_period"))])
        .graph;

        let findings = BlockerClassifier::default().classify(&graph);
        assert_eq!(
            ids(&findings),
            vec![
                ("model.shop.a".to_string(), RuleId::CustomMaterialization),
                ("model.shop.a".to_string(), RuleId::DeprecatedModel),
                ("model.shop.a".to_string(), RuleId::ModelHooks),
            ]
        );
    }

    #[test]
    fn location_comes_from_file_path_and_match_line() {
        let graph = ProjectGraph::build(vec![ProjectUnit::new("model.shop.py", UnitKind::Model)
            .with_path("models/py.py")
            .with_source("# helper\ndef model(dbt, session):\n    return None\n")])
        .graph;

        let findings = BlockerClassifier::default().classify(&graph);
        assert_eq!(findings[0].location, Some(Location::with_line("models/py.py", 2)));
        assert!(findings[0].business_context.is_some());
    }

    #[test]
    fn derived_findings_list_every_blocker() {
        let graph = ProjectGraph::build(vec![
            ProjectUnit::new("model.shop.a", UnitKind::Model).with_language(fusioncheck_dbt::Language::Python),
            ProjectUnit::new("model.shop.b", UnitKind::Model).with_config("materialized", json!("custom")),
            ProjectUnit::new("model.shop.c", UnitKind::Model)
                .depends_on("model.shop.a")
                .depends_on("model.shop.b"),
        ])
        .graph;

        let findings = BlockerClassifier::default().classify(&graph);
        let derived: Vec<&Finding> = findings.iter().filter(|f| f.is_derived()).collect();

        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].unit_id, "model.shop.c");
        assert_eq!(derived[0].upstream_blockers, vec!["model.shop.a", "model.shop.b"]);
        assert_eq!(derived[0].severity, Severity::Hard);
    }

    #[test]
    fn derived_severity_can_be_overridden() {
        let mut config = Config::default();
        config.severity.set_override(RuleId::DownstreamOfHardBlocker, Severity::Flag);

        let graph = ProjectGraph::build(vec![
            ProjectUnit::new("model.shop.a", UnitKind::Model).with_language(fusioncheck_dbt::Language::Python),
            ProjectUnit::new("model.shop.b", UnitKind::Model)
                .depends_on("model.shop.a")
                .with_config("incremental_strategy", json!("microbatch")),
        ])
        .graph;

        let findings = BlockerClassifier::new(config).classify(&graph);
        assert_eq!(
            ids(&findings),
            vec![
                ("model.shop.a".to_string(), RuleId::PythonModel),
                ("model.shop.b".to_string(), RuleId::MicrobatchIncremental),
                ("model.shop.b".to_string(), RuleId::DownstreamOfHardBlocker),
            ]
        );
        assert_eq!(findings[2].severity, Severity::Flag);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");

        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn classify_input_requires_a_graph() {
        let err = BlockerClassifier::default().classify_input(None).unwrap_err();
        assert_eq!(err.to_string(), "Invalid input: no input project graph supplied");
    }
}
