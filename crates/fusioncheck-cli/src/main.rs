use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use fusioncheck_core::{Config, NoteLevel, Report, Severity};
use fusioncheck_dbt::{DependencyGraph, LoadedGraph, Manifest, ProjectGraph};
use fusioncheck_engine::BlockerClassifier;

const DEFAULT_CONFIG: &str = "fusioncheck.toml";
const DEFAULT_MANIFEST: &str = "target/manifest.json";

/// fusioncheck - Fusion compatibility blockers for dbt projects
#[derive(Parser)]
#[command(name = "fusioncheck")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: fusioncheck.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the project graph comes from
#[derive(clap::Args, Debug, Clone)]
struct InputArgs {
    /// Project graph JSON document
    #[arg(short, long, conflicts_with = "manifest")]
    graph: Option<PathBuf>,

    /// dbt manifest.json (default: target/manifest.json)
    #[arg(short = 'f', long)]
    manifest: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every unit and write a report
    Scan {
        #[command(flatten)]
        input: InputArgs,

        /// Output file for report.json
        #[arg(short, long, default_value = "report.json")]
        output: PathBuf,

        /// Also output markdown report
        #[arg(short, long)]
        markdown: Option<PathBuf>,

        /// Exit with status 1 when a finding at or above this severity exists
        #[arg(long, value_enum, default_value_t = FailOn::Hard)]
        fail_on: FailOn,
    },

    /// Show the units affected by a change to one unit
    Impact {
        /// Unit to analyze (short name or unique_id)
        unit: String,

        #[command(flatten)]
        input: InputArgs,
    },

    /// List the rules in evaluation order
    Rules,

    /// Write a default fusioncheck.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum FailOn {
    Hard,
    Soft,
    Flag,
    Never,
}

impl FailOn {
    fn threshold(self) -> Option<Severity> {
        match self {
            Self::Hard => Some(Severity::Hard),
            Self::Soft => Some(Severity::Soft),
            Self::Flag => Some(Severity::Flag),
            Self::Never => None,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Scan { input, output, markdown, fail_on } => {
            let config = load_config(config_path, cli.verbose)?;
            scan_command(&config, &input, &output, markdown.as_deref(), fail_on, cli.verbose)
        }
        Commands::Impact { unit, input } => {
            let config = load_config(config_path, cli.verbose)?;
            impact_command(&config, &unit, &input, cli.verbose)
        }
        Commands::Rules => {
            let config = load_config(config_path, cli.verbose)?;
            rules_command(&config);
            Ok(())
        }
        // Writes the config, so never loads one
        Commands::Init { force } => {
            let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG));
            init_command(path, force)
        }
    }
}

/// Install the stderr log subscriber (`RUST_LOG` wins over `--verbose`)
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load config from `--config`, `./fusioncheck.toml`, or defaults
fn load_config(path: Option<&Path>, verbose: bool) -> Result<Config> {
    if let Some(path) = path {
        return Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }

    let default_path = Path::new(DEFAULT_CONFIG);
    if default_path.exists() {
        return Config::from_file(default_path)
            .with_context(|| format!("Failed to load config {}", default_path.display()));
    }

    if verbose {
        eprintln!("{}", "No config file found, using defaults".yellow());
    }
    Ok(Config::default())
}

/// Load the project graph named by the input arguments
///
/// `Ok(None)` when no input was given and no manifest exists at the default path.
fn load_input(input: &InputArgs, verbose: bool) -> Result<Option<LoadedGraph>> {
    if let Some(graph_path) = &input.graph {
        if verbose {
            eprintln!("{} {}", "Loading project graph from:".cyan(), graph_path.display());
        }
        let loaded = ProjectGraph::from_file(graph_path)?;
        return Ok(Some(loaded));
    }

    let manifest_path = match &input.manifest {
        Some(path) => path.clone(),
        None => {
            let default_path = PathBuf::from(DEFAULT_MANIFEST);
            if !default_path.exists() {
                return Ok(None);
            }
            default_path
        }
    };

    if verbose {
        eprintln!("{} {}", "Loading manifest from:".cyan(), manifest_path.display());
    }

    let manifest = Manifest::from_file(&manifest_path)
        .map_err(|e| anyhow::anyhow!("Failed to load manifest: {}", e))?;
    let loaded = manifest.to_project_graph();
    tracing::debug!(units = loaded.graph.len(), notes = loaded.notes.len(), "manifest converted");
    Ok(Some(loaded))
}

/// Scan command - classify blockers and write the report
fn scan_command(
    config: &Config,
    input: &InputArgs,
    output: &Path,
    markdown: Option<&Path>,
    fail_on: FailOn,
    verbose: bool,
) -> Result<()> {
    let loaded = load_input(input, verbose)?;

    if verbose {
        eprintln!("{}", "Classifying project units...".cyan());
    }

    let classifier = BlockerClassifier::new(config.clone());
    let classification = classifier.classify_input(loaded).with_context(|| {
        format!(
            "Pass --graph or --manifest, or run 'dbt compile' to produce {}",
            DEFAULT_MANIFEST
        )
    })?;
    let report = classification.into_report();

    report
        .save_to_file(output)
        .with_context(|| format!("Failed to write report {}", output.display()))?;

    if verbose {
        eprintln!("{} {}", "Report saved to:".green(), output.display());
    }

    if let Some(md_path) = markdown {
        std::fs::write(md_path, generate_markdown_report(&report))
            .with_context(|| format!("Failed to write markdown report {}", md_path.display()))?;
        if verbose {
            eprintln!("{} {}", "Markdown report saved to:".green(), md_path.display());
        }
    }

    print_report_summary(&report);

    if should_fail(&report, fail_on) {
        std::process::exit(1);
    }

    Ok(())
}

fn should_fail(report: &Report, fail_on: FailOn) -> bool {
    fail_on
        .threshold()
        .is_some_and(|threshold| report.has_findings_at_or_above(threshold))
}

/// Impact command - show transitive dependents
fn impact_command(_config: &Config, unit: &str, input: &InputArgs, verbose: bool) -> Result<()> {
    let loaded = load_input(input, verbose)?.ok_or_else(|| {
        anyhow::anyhow!(
            "No project graph supplied. Pass --graph or --manifest, or run 'dbt compile' to produce {}",
            DEFAULT_MANIFEST
        )
    })?;
    let graph = loaded.graph;

    if verbose {
        eprintln!("{}", "Building dependency graph...".cyan());
    }

    let dag = DependencyGraph::from_project(&graph);

    let target = graph.find(unit).ok_or_else(|| {
        anyhow::anyhow!(
            "Unit '{}' not found. Try using the full unique_id (e.g., 'model.project.{}')",
            unit,
            unit
        )
    })?;

    // Dependency order when the graph is acyclic, id order otherwise
    let downstream = dag.downstream(&target.unique_id);
    let downstream: Vec<String> = match dag.topological_sort() {
        Some(order) => order.into_iter().filter(|id| downstream.contains(id)).collect(),
        None => downstream,
    };
    let upstream = dag.upstream(&target.unique_id);

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Downstream Impact Analysis".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("{} {}", "Unit:".bold(), target.unique_id.green());
    println!("{} {}", "Upstream units:".bold(), upstream.len());
    println!("{} {}", "Downstream units:".bold(), downstream.len());
    println!();

    if downstream.is_empty() {
        println!("{}", "✓ No downstream dependencies".green());
        println!("A blocker in this unit does not hold back any other unit.");
    } else {
        println!("{}", "Affected units (in dependency order):".bold());
        println!();

        for (i, dep) in downstream.iter().enumerate() {
            let info = graph
                .get(dep)
                .map(|u| format!("{} ({})", dep, u.kind))
                .unwrap_or_else(|| dep.clone());

            println!("  {}. {}", i + 1, info.yellow());
        }

        println!();
        println!("{}", "⚠ A hard blocker here blocks every unit above!".yellow().bold());
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());

    Ok(())
}

/// Rules command - print the configured rule catalogue
fn rules_command(config: &Config) {
    let classifier = BlockerClassifier::new(config.clone());

    println!("{}", "Rules (evaluation order):".bold());
    println!();

    for rule in classifier.rules() {
        let severity = colored_severity(rule.severity);
        if rule.severity == rule.default_severity {
            println!("  [{}] {}", severity, rule.id.to_string().bold());
        } else {
            println!(
                "  [{}] {} (default: {})",
                severity,
                rule.id.to_string().bold(),
                rule.default_severity
            );
        }
        println!("      {}", rule.business_context);
    }
}

/// Init command - write the default configuration
fn init_command(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow::anyhow!(
            "{} already exists. Use --force to overwrite it.",
            path.display()
        ));
    }

    Config::default()
        .save_to_file(path)
        .with_context(|| format!("Failed to write config {}", path.display()))?;

    println!("{} {}", "Wrote".green(), path.display());
    Ok(())
}

fn colored_severity(severity: Severity) -> colored::ColoredString {
    match severity {
        Severity::Hard => "HARD".red().bold(),
        Severity::Soft => "SOFT".yellow().bold(),
        Severity::Flag => "FLAG".cyan(),
    }
}

/// Print report summary to stdout
fn print_report_summary(report: &Report) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Fusion Compatibility Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("Version: {}", report.version);
    println!("Timestamp: {}", report.timestamp);
    println!();

    println!("{}", "Summary:".bold());
    println!(
        "  Units checked: {} ({} excluded)",
        report.summary.units_checked, report.summary.units_excluded
    );
    println!("  Total findings: {}", report.summary.total);

    if report.summary.hard > 0 {
        println!("  Hard: {}", format!("{}", report.summary.hard).red().bold());
    } else {
        println!("  Hard: {}", format!("{}", report.summary.hard).green());
    }

    if report.summary.soft > 0 {
        println!("  Soft: {}", format!("{}", report.summary.soft).yellow());
    } else {
        println!("  Soft: {}", format!("{}", report.summary.soft).green());
    }

    println!("  Flag: {}", report.summary.flag);
    println!();

    for note in report.notes.iter().filter(|n| n.level == NoteLevel::Warning) {
        match &note.subject {
            Some(subject) => println!("  {} {}: {}", "note:".yellow(), subject, note.message),
            None => println!("  {} {}", "note:".yellow(), note.message),
        }
    }

    if report.findings.is_empty() {
        println!("{}", "✓ No blockers found!".green().bold());
    } else {
        println!("{}", "Findings:".bold());
        for finding in &report.findings {
            println!(
                "  [{}] {} {}: {}",
                colored_severity(finding.severity),
                finding.unit_id,
                finding.rule_id,
                finding.message
            );

            if let Some(loc) = &finding.location {
                println!("    at {}", loc);
            }

            if !finding.downstream_impact.is_empty() {
                println!("    Impact: {} downstream units", finding.downstream_impact.len());
                for unit in &finding.downstream_impact {
                    println!("      - {}", unit);
                }
            }
        }
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
}

/// Generate markdown report
fn generate_markdown_report(report: &Report) -> String {
    let mut md = String::new();

    md.push_str("# Fusion Compatibility Report\n\n");
    md.push_str(&format!("**Version:** {}\n\n", report.version));
    md.push_str(&format!("**Timestamp:** {}\n\n", report.timestamp));
    if let Some(fingerprint) = &report.input_fingerprint {
        md.push_str(&format!("**Input:** `{}`\n\n", fingerprint));
    }

    md.push_str("## Summary\n\n");
    md.push_str(&format!(
        "- Units checked: {} ({} excluded)\n",
        report.summary.units_checked, report.summary.units_excluded
    ));
    md.push_str(&format!("- Total findings: {}\n", report.summary.total));
    md.push_str(&format!("- Hard: {}\n", report.summary.hard));
    md.push_str(&format!("- Soft: {}\n", report.summary.soft));
    md.push_str(&format!("- Flag: {}\n", report.summary.flag));
    md.push('\n');

    if report.findings.is_empty() {
        md.push_str("✅ **No blockers found!**\n");
        return md;
    }

    for severity in [Severity::Hard, Severity::Soft, Severity::Flag] {
        let findings: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.severity == severity)
            .collect();
        if findings.is_empty() {
            continue;
        }

        let (emoji, title) = match severity {
            Severity::Hard => ("❌", "Hard blockers"),
            Severity::Soft => ("⚠️", "Soft blockers"),
            Severity::Flag => ("ℹ️", "Flags"),
        };
        md.push_str(&format!("## {} {}\n\n", emoji, title));

        for finding in findings {
            md.push_str(&format!("### `{}` - {}\n\n", finding.unit_id, finding.rule_id));
            md.push_str(&format!("{}\n\n", finding.message));

            if let Some(loc) = &finding.location {
                md.push_str(&format!("**Location:** {}\n\n", loc));
            }

            if let Some(context) = &finding.business_context {
                md.push_str(&format!("> {}\n\n", context));
            }

            if !finding.upstream_blockers.is_empty() {
                md.push_str("**Blocked by:**\n\n");
                for blocker in &finding.upstream_blockers {
                    md.push_str(&format!("- {}\n", blocker));
                }
                md.push('\n');
            }

            if !finding.downstream_impact.is_empty() {
                md.push_str(&format!(
                    "**Impact:** {} downstream units\n\n",
                    finding.downstream_impact.len()
                ));
                for unit in &finding.downstream_impact {
                    md.push_str(&format!("- {}\n", unit));
                }
                md.push('\n');
            }
        }
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusioncheck_core::{Finding, RuleId};

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn graph_and_manifest_conflict() {
        let parsed = Cli::try_parse_from([
            "fusioncheck", "scan", "--graph", "g.json", "--manifest", "m.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn fail_on_threshold() {
        let report = Report::from_findings(vec![Finding::new(
            RuleId::DeprecatedModel,
            Severity::Soft,
            "model.shop.legacy",
            "deprecated",
        )]);

        assert!(!should_fail(&report, FailOn::Hard));
        assert!(should_fail(&report, FailOn::Soft));
        assert!(should_fail(&report, FailOn::Flag));
        assert!(!should_fail(&report, FailOn::Never));
    }

    #[test]
    fn load_graph_input_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{"units": [{"unique_id": "model.shop.a", "kind": "model", "language": "python"}]}"#,
        )
        .unwrap();

        let input = InputArgs { graph: Some(path), manifest: None };
        let loaded = load_input(&input, false).unwrap().unwrap();
        assert_eq!(loaded.graph.len(), 1);
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(load_config(Some(missing.as_path()), false).is_err());

        let path = dir.path().join("fusioncheck.toml");
        std::fs::write(&path, "[rules]\ndisabled = [\"model-hooks\"]\n").unwrap();
        let config = load_config(Some(path.as_path()), false).unwrap();
        assert_eq!(config.rules.disabled, vec!["model-hooks".to_string()]);
    }

    #[test]
    fn markdown_groups_findings_by_severity() {
        let report = Report::from_findings(vec![
            Finding::new(RuleId::PythonModel, Severity::Hard, "model.shop.py", "'py' is a Python model")
                .with_impact(vec!["model.shop.child".to_string()]),
            Finding::new(
                RuleId::DownstreamOfHardBlocker,
                Severity::Hard,
                "model.shop.child",
                "'model.shop.child' depends on hard blocker 'model.shop.py'",
            )
            .with_upstream_blockers(vec!["model.shop.py".to_string()]),
            Finding::new(RuleId::RestrictedAccess, Severity::Flag, "model.shop.fin", "restricted"),
        ])
        .with_fingerprint("abc123");

        let md = generate_markdown_report(&report);
        assert!(md.contains("## ❌ Hard blockers"));
        assert!(md.contains("## ℹ️ Flags"));
        assert!(!md.contains("Soft blockers"));
        assert!(md.contains("**Blocked by:**\n\n- model.shop.py"));
        assert!(md.contains("**Impact:** 1 downstream units"));
        assert!(md.contains("`abc123`"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusioncheck.toml");

        init_command(&path, false).unwrap();
        assert!(Config::from_file(&path).is_ok());
        assert!(init_command(&path, false).is_err());
        assert!(init_command(&path, true).is_ok());
    }

    #[test]
    fn init_writes_to_explicit_config_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let arg = path.to_str().unwrap();

        let cli = Cli::try_parse_from(["fusioncheck", "init", "--config", arg]).unwrap();
        run(cli).unwrap();
        assert!(Config::from_file(&path).is_ok());

        // A broken config can be replaced with --force
        std::fs::write(&path, "[rules\ndisabled = 3").unwrap();
        let cli = Cli::try_parse_from(["fusioncheck", "init", "--force", "--config", arg]).unwrap();
        run(cli).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), Config::default());
    }

    #[test]
    fn markdown_for_clean_report() {
        let md = generate_markdown_report(&Report::new());
        assert!(md.contains("No blockers found"));
    }
}
