//! Report schema (stable v1)
//!
//! This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.

use serde::{Deserialize, Serialize};
use crate::finding::{Finding, Severity};

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Level of a non-finding note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteLevel {
    Info,
    Warning,
}

/// A note about the input that is not itself a finding
/// (e.g. a malformed unit that was excluded from classification)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub level: NoteLevel,

    /// Unit the note refers to, when one can be named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    pub message: String,
}

impl Note {
    pub fn warning(subject: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoteLevel::Warning,
            subject,
            message: message.into(),
        }
    }

    pub fn info(subject: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoteLevel::Info,
            subject,
            message: message.into(),
        }
    }
}

/// Summary statistics for a report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Total number of findings
    pub total: usize,

    /// Number of hard blockers (direct and derived)
    pub hard: usize,

    /// Number of soft blockers
    pub soft: usize,

    /// Number of flags
    pub flag: usize,

    /// Number of units classified
    pub units_checked: usize,

    /// Number of units excluded from classification
    pub units_excluded: usize,
}

/// Migration assessment report (report.json v1)
///
/// This is the stable output format.
/// All fields are versioned and backward-compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Schema version
    pub version: ReportVersion,

    /// Timestamp (ISO 8601)
    pub timestamp: String,

    /// Summary statistics
    pub summary: ReportSummary,

    /// All findings, in classification order
    pub findings: Vec<Finding>,

    /// Notes about the input
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,

    /// sha256 of the canonical input graph
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_fingerprint: Option<String>,
}

impl Report {
    /// Create a new empty report
    pub fn new() -> Self {
        Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            summary: ReportSummary::default(),
            findings: Vec::new(),
            notes: Vec::new(),
            input_fingerprint: None,
        }
    }

    /// Create a report from findings
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let mut report = Self::new();
        for finding in findings {
            report.add_finding(finding);
        }
        report
    }

    /// Add a finding to the report
    pub fn add_finding(&mut self, finding: Finding) {
        match finding.severity {
            Severity::Hard => self.summary.hard += 1,
            Severity::Soft => self.summary.soft += 1,
            Severity::Flag => self.summary.flag += 1,
        }

        self.summary.total += 1;
        self.findings.push(finding);
    }

    /// Record unit counts
    pub fn with_unit_counts(mut self, checked: usize, excluded: usize) -> Self {
        self.summary.units_checked = checked;
        self.summary.units_excluded = excluded;
        self
    }

    /// Attach input notes
    pub fn with_notes(mut self, notes: Vec<Note>) -> Self {
        self.notes = notes;
        self
    }

    /// Attach the input fingerprint
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.input_fingerprint = Some(fingerprint.into());
        self
    }

    /// Check if the report has any finding at or above `threshold`
    pub fn has_findings_at_or_above(&self, threshold: Severity) -> bool {
        self.findings.iter().any(|f| f.severity >= threshold)
    }

    /// Check if the report has any hard blockers
    pub fn has_hard_blockers(&self) -> bool {
        self.summary.hard > 0
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}
