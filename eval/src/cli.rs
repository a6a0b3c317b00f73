//! CLI command implementations.
//!
//! Commands write to `out` so they can be tested without capturing stdout.

use std::io::Write;

use anyhow::{Context, Result, bail};
use harness::core::test_tree::TestTreeNode;
use harness::dsl::Registry;
use harness::exit_codes;
use harness::io::config::HarnessConfig;
use harness::io::ledger::{Ledger, LedgerEntry};
use harness::pipeline::{Pipeline, plan};
use tracing::{debug, info};

use crate::console::ConsoleReporter;

/// Print every registered test as `suite / title [tags]`.
pub fn list_tests(registry: &Registry, out: &mut dyn Write) -> Result<()> {
    for test in &registry.tests {
        let mut line = test.suite_path.join(" / ");
        if !line.is_empty() {
            line.push_str(" / ");
        }
        line.push_str(test.test_id());
        if !test.tags.is_empty() {
            line.push_str(&format!(" [{}]", test.tags.join(", ")));
        }
        writeln!(out, "{line}")?;
    }
    Ok(())
}

/// Names of the configured runners, optionally limited to `only`.
fn runner_names(config: &HarnessConfig, only: Option<&str>) -> Result<Vec<String>> {
    let names: Vec<String> = config
        .runners
        .iter()
        .filter(|runner| only.is_none_or(|name| runner.name == name))
        .map(|runner| runner.name.clone())
        .collect();
    if names.is_empty()
        && let Some(name) = only
    {
        bail!("no runner named {name:?} is configured");
    }
    Ok(names)
}

/// Print the execution plan of every matching test as JSON.
pub fn plan_tests(
    config: &HarnessConfig,
    registry: &Registry,
    filter: Option<&str>,
    runner: Option<&str>,
    out: &mut dyn Write,
) -> Result<()> {
    let settings = config.run_settings();
    let runners = runner_names(config, runner)?;
    let plans = registry
        .filtered(filter)
        .into_iter()
        .map(|test| {
            plan(test, &settings, runners.clone()).with_context(|| format!("plan {}", test.test_id()))
        })
        .collect::<Result<Vec<_>>>()?;
    let payload = serde_json::to_string_pretty(&plans).context("serialize plans")?;
    writeln!(out, "{payload}")?;
    Ok(())
}

/// Run every matching test against every selected runner. Returns the exit
/// code: [`exit_codes::OK`] when every iteration succeeded.
pub fn run_tests(
    config: &HarnessConfig,
    registry: Registry,
    filter: Option<&str>,
    runner: Option<&str>,
    out: &mut dyn Write,
) -> Result<i32> {
    if registry.filtered(filter).is_empty() {
        bail!(
            "no tests matched{} in {}",
            filter.map(|f| format!(" {f:?}")).unwrap_or_default(),
            config.cases_dir.display()
        );
    }
    let pipeline = Pipeline::new(
        config.run_settings(),
        config.build_environment()?,
        config.build_judge()?,
        Box::new(config.open_ledger()?),
        config.build_runners(runner)?,
    );
    info!(runners = ?pipeline.runner_names(), "starting run");
    let mut reporter = ConsoleReporter::new(out);
    let summary = pipeline.run_registry(registry, filter, &mut reporter);
    debug!(failed = summary.failed(), "run complete");
    Ok(if summary.all_passed() {
        exit_codes::OK
    } else {
        exit_codes::FAILURES
    })
}

fn entry_line(entry: &LedgerEntry) -> String {
    let overridden = if entry.score_override.is_some() {
        " (override)"
    } else {
        ""
    };
    format!(
        "{:>5}  {}  {:<4} {:.2}{overridden}  {}  runner={} judge={}",
        entry.id,
        entry.record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.effective_status().as_str(),
        entry.effective_score(),
        entry.record.test_id,
        entry.record.agent_runner,
        entry.record.judge_model,
    )
}

/// Newest runs first, one line each.
pub fn list_runs(ledger: &dyn Ledger, test_id: Option<&str>, out: &mut dyn Write) -> Result<()> {
    for entry in ledger.get_runs(test_id)? {
        writeln!(out, "{}", entry_line(&entry))?;
    }
    Ok(())
}

/// Full entry as JSON, including context and the override in effect.
pub fn show_run(ledger: &dyn Ledger, id: i64, out: &mut dyn Write) -> Result<()> {
    let Some(entry) = ledger.get_run_by_id(id)? else {
        bail!("run {id} not found");
    };
    let payload = serde_json::to_string_pretty(&entry).context("serialize run")?;
    writeln!(out, "{payload}")?;
    Ok(())
}

/// Latest result per (test, runner) under the suite tree.
pub fn print_tree(ledger: &dyn Ledger, out: &mut dyn Write) -> Result<()> {
    let latest = ledger.get_latest_entries()?;
    for node in ledger.get_test_tree()? {
        write_node(&node, 0, &latest, out)?;
    }
    Ok(())
}

fn write_node(
    node: &TestTreeNode,
    depth: usize,
    latest: &[LedgerEntry],
    out: &mut dyn Write,
) -> Result<()> {
    let indent = "  ".repeat(depth);
    match node {
        TestTreeNode::Suite { name, children } => {
            writeln!(out, "{indent}{name}/")?;
            for child in children {
                write_node(child, depth + 1, latest, out)?;
            }
        }
        TestTreeNode::Test { name, test_id } => {
            let results: Vec<String> = latest
                .iter()
                .filter(|entry| &entry.record.test_id == test_id)
                .map(|entry| {
                    format!(
                        "{}={} {:.2}",
                        entry.record.agent_runner,
                        entry.effective_status().as_str(),
                        entry.effective_score()
                    )
                })
                .collect();
            writeln!(out, "{indent}{name}  {}", results.join("  "))?;
        }
    }
    Ok(())
}

pub fn print_stats(ledger: &dyn Ledger, test_id: Option<&str>, out: &mut dyn Write) -> Result<()> {
    let stats = ledger.get_stats(test_id)?;
    writeln!(
        out,
        "stats: runs={} passed={} warnings={} failed={}",
        stats.total_runs, stats.passed, stats.warnings, stats.failed
    )?;
    writeln!(
        out,
        "stats: pass_rate={:.2} average_score={:.2}",
        stats.pass_rate, stats.average_score
    )?;
    Ok(())
}

pub fn override_score(
    ledger: &dyn Ledger,
    id: i64,
    score: f64,
    reason: &str,
    out: &mut dyn Write,
) -> Result<()> {
    let record = ledger.override_run_score(id, score, reason)?;
    writeln!(
        out,
        "override: run={} score={:.2} status={} override_id={}",
        record.run_id,
        record.score,
        record.status.as_str(),
        record.id
    )?;
    Ok(())
}

/// Override history for a run, newest first.
pub fn list_overrides(ledger: &dyn Ledger, id: i64, out: &mut dyn Write) -> Result<()> {
    if ledger.get_run_by_id(id)?.is_none() {
        bail!("run {id} not found");
    }
    for record in ledger.get_run_overrides(id)? {
        writeln!(
            out,
            "{:>5}  {}  {:<4} {:.2}  {}",
            record.id,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.status.as_str(),
            record.score,
            record.reason
        )?;
    }
    Ok(())
}
