//! fusioncheck engine - blocker classification
//!
//! This crate implements the classification logic:
//! - Rule trait and registry
//! - Built-in rule catalogue (hard blockers, soft blockers, flags)
//! - Inline config normalization
//! - Unparseable-source heuristics
//! - Critical-path propagation of hard blockers

pub mod rule;
pub mod rules;
pub mod heuristics;
pub mod normalize;
pub mod classifier;

pub use rule::{Rule, RuleContext, RuleError, RuleMatch, RuleRegistry};
pub use classifier::{BlockerClassifier, Classification, RuleInfo};
