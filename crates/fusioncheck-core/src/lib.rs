//! fusioncheck core
//!
//! Core domain model with stable, versioned types.
//! Never rename rule ids - they are part of the public API.

pub mod finding;
pub mod report;
pub mod config;

pub use finding::{Finding, RuleId, Severity, Location};
pub use report::{Report, ReportVersion, ReportSummary, Note, NoteLevel};
pub use config::{Config, ConfigError, SeverityThreshold, RuleSettings, AllowlistRules};
