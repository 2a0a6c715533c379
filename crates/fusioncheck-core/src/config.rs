//! Configuration schema (fusioncheck.toml)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use crate::finding::{RuleId, Severity};

/// Severity overrides for specific rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeverityThreshold {
    /// Map of rule id to severity override
    #[serde(default)]
    pub overrides: HashMap<String, Severity>,
}

impl SeverityThreshold {
    /// Get severity for a rule, or default
    pub fn get_severity(&self, rule: RuleId, default: Severity) -> Severity {
        self.overrides
            .get(rule.as_str())
            .copied()
            .unwrap_or(default)
    }

    /// Set severity override for a rule
    pub fn set_override(&mut self, rule: RuleId, severity: Severity) {
        self.overrides.insert(rule.as_str().to_string(), severity);
    }

    /// Override keys that do not name a known rule
    pub fn unknown_rules(&self) -> Vec<&str> {
        let mut unknown: Vec<&str> = self.overrides
            .keys()
            .map(String::as_str)
            .filter(|key| RuleId::parse(key).is_none())
            .collect();
        unknown.sort_unstable();
        unknown
    }
}

/// Rule-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSettings {
    /// Rules that are not evaluated at all
    #[serde(default)]
    pub disabled: Vec<String>,

    /// Macros treated as query-comment injectors
    #[serde(default = "default_query_comment_macros")]
    pub query_comment_macros: Vec<String>,

    /// Project materializations to treat as built-in
    #[serde(default)]
    pub extra_materializations: Vec<String>,
}

fn default_query_comment_macros() -> Vec<String> {
    vec!["query_comment".to_string(), "set_query_comment".to_string()]
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            disabled: Vec::new(),
            query_comment_macros: default_query_comment_macros(),
            extra_materializations: Vec::new(),
        }
    }
}

impl RuleSettings {
    /// Check if a rule is disabled
    pub fn is_disabled(&self, rule: RuleId) -> bool {
        self.disabled.iter().any(|d| d == rule.as_str())
    }
}

/// Allowlist rules for specific units or patterns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllowlistRules {
    /// Completely skip classification for these units (glob patterns)
    #[serde(default)]
    pub skip_units: Vec<String>,
}

impl AllowlistRules {
    /// Check if a unit id matches any pattern in the list
    fn matches_pattern(unit_id: &str, patterns: &[String]) -> bool {
        patterns.iter().any(|pattern| {
            if pattern.contains('*') {
                glob_match(pattern, unit_id)
            } else {
                pattern == unit_id
            }
        })
    }

    /// Check if a unit should be skipped
    pub fn is_unit_skipped(&self, unit_id: &str) -> bool {
        Self::matches_pattern(unit_id, &self.skip_units)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Severity overrides
    #[serde(default)]
    pub severity: SeverityThreshold,

    /// Rule settings
    #[serde(default)]
    pub rules: RuleSettings,

    /// Allowlist rules
    #[serde(default)]
    pub allowlist: AllowlistRules,
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml(&contents)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let unknown = config.severity.unknown_rules();
        if let Some(first) = unknown.first() {
            return Err(ConfigError::UnknownRule(first.to_string()));
        }
        if let Some(bad) = config.rules.disabled.iter().find(|d| RuleId::parse(d).is_none()) {
            return Err(ConfigError::UnknownRule(bad.clone()));
        }

        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }
}

/// Simple glob matching (`*` matches any run of characters, including dots)
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut pieces = pattern.split('*');
    let Some(first) = pieces.next() else { return pattern == text };
    let Some(mut rest) = text.strip_prefix(first) else { return false };

    let middle: Vec<&str> = pieces.collect();
    let Some((last, inner)) = middle.split_last() else {
        // No `*` at all
        return rest.is_empty();
    };

    for piece in inner {
        match rest.find(piece) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }

    rest.ends_with(last)
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Unknown rule id '{0}'")]
    UnknownRule(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.rules.disabled.is_empty());
        assert_eq!(
            config.rules.query_comment_macros,
            vec!["query_comment".to_string(), "set_query_comment".to_string()]
        );
    }

    #[test]
    fn severity_override() {
        let mut threshold = SeverityThreshold::default();
        threshold.set_override(RuleId::RestrictedAccess, Severity::Soft);

        assert_eq!(
            threshold.get_severity(RuleId::RestrictedAccess, Severity::Flag),
            Severity::Soft
        );
        assert_eq!(
            threshold.get_severity(RuleId::ModelHooks, Severity::Flag),
            Severity::Flag
        );
    }

    #[test]
    fn parse_full_toml() {
        let config = Config::from_toml(
            r#"
            [severity.overrides]
            "deprecated-model" = "flag"

            [rules]
            disabled = ["model-hooks"]
            query_comment_macros = ["inject_comment"]
            extra_materializations = ["audited_table"]

            [allowlist]
            skip_units = ["model.jaffle_shop.legacy_*"]
            "#,
        )
        .unwrap();

        assert_eq!(
            config.severity.get_severity(RuleId::DeprecatedModel, Severity::Soft),
            Severity::Flag
        );
        assert!(config.rules.is_disabled(RuleId::ModelHooks));
        assert!(!config.rules.is_disabled(RuleId::PythonModel));
        assert_eq!(config.rules.query_comment_macros, vec!["inject_comment".to_string()]);
        assert!(config.allowlist.is_unit_skipped("model.jaffle_shop.legacy_orders"));
        assert!(!config.allowlist.is_unit_skipped("model.jaffle_shop.orders"));
    }

    #[test]
    fn unknown_rule_is_rejected() {
        let err = Config::from_toml("[rules]\ndisabled = [\"nope\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRule(ref r) if r == "nope"));

        let err = Config::from_toml("[severity.overrides]\nbogus = \"hard\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRule(_)));
    }

    #[test]
    fn config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusioncheck.toml");

        let mut config = Config::default();
        config.rules.disabled.push("model-hooks".to_string());
        config.severity.set_override(RuleId::DeprecatedModel, Severity::Flag);
        config.save_to_file(&path).unwrap();

        let parsed = Config::from_file(&path).unwrap();
        assert_eq!(config.rules, parsed.rules);
        assert_eq!(config.severity, parsed.severity);
    }

    #[test]
    fn from_file_reads_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusioncheck.toml");
        std::fs::write(&path, "[allowlist]\nskip_units = [\"seed.*\"]\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.allowlist.is_unit_skipped("seed.jaffle_shop.raw_orders"));
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("model.shop.*", "model.shop.orders"));
        assert!(glob_match("*_python", "model.shop.segments_python"));
        assert!(!glob_match("model.shop.*", "macro.shop.orders"));
        assert!(!glob_match("ab*ba", "aba"));
        assert!(glob_match("**", "model.shop.orders"));
    }

    #[test]
    fn every_star_is_a_wildcard() {
        assert!(glob_match("model.*.stg_*", "model.shop.stg_orders"));
        assert!(glob_match("*.stg_*", "model.shop.stg_orders"));
        assert!(glob_match("model.*.*_python", "model.shop.segments_python"));
        assert!(!glob_match("model.*.stg_*", "model.shop.orders"));
        assert!(!glob_match("model.*.stg_*", "macro.shop.stg_orders"));
        assert!(!glob_match("a*b*c", "acb"));

        let allowlist = AllowlistRules {
            skip_units: vec!["model.*.stg_*".to_string()],
        };
        assert!(allowlist.is_unit_skipped("model.jaffle_shop.stg_orders"));
    }
}
