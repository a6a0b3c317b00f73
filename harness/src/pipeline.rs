//! Test execution: one iteration per (test, runner) pair.
//!
//! Every iteration runs sequentially against the shared working directory:
//!
//! 1. environment setup
//! 2. configured before-each commands, then suite before-each hooks
//! 3. the test body
//! 4. the mode-specific tail (declarative tasks and judge, or the stashed verdict)
//! 5. persist the verdict to the ledger
//! 6. suite after-each hooks
//! 7. environment teardown (always)
//!
//! Any error in steps 1-5 is recorded as a FAIL run instead of aborting the
//! whole run.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::core::hooks::{HookKind, HookTree};
use crate::core::types::{Status, Thresholds, Verdict};
use crate::dsl::{Hook, HookContext, Registry, TestDefinition};
use crate::handle::{AgentHandle, JudgeAssertionError, Live, Mode, PlanStep, TestContext};
use crate::io::agent::AgentRunner;
use crate::io::environment::{Environment, run_recorded};
use crate::io::judge::Judge;
use crate::io::ledger::{Ledger, RunContext, RunRecord};
use crate::report::Reporter;

/// Settings shared by every iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Working directory agents and commands run in.
    pub cwd: PathBuf,
    /// Shell commands run before every test; a non-zero exit fails the iteration.
    pub before_each: Vec<String>,
    /// Shell commands run after the agent; their output goes to the judge.
    pub after_each: Vec<String>,
    pub thresholds: Option<Thresholds>,
    pub command_timeout: Duration,
    pub agent_timeout: Duration,
}

/// Outcome of one (test, runner) iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub test_id: String,
    pub runner: String,
    /// Ledger id, when the run was persisted.
    pub entry_id: Option<i64>,
    pub score: f64,
    pub status: Status,
    pub pass: bool,
    pub reason: String,
    pub duration_ms: u64,
    /// Failure outside the verdict (ledger write, after-each hook).
    pub error: Option<String>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.pass && self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub results: Vec<RunResult>,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.succeeded()).count()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }
}

/// What a test would do, computed without running anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub test_id: String,
    pub suite_path: Vec<String>,
    pub mode: Mode,
    pub runners: Vec<String>,
    pub before_each: Vec<String>,
    pub after_each: Vec<String>,
    pub steps: Vec<PlanStep>,
}

pub struct Pipeline {
    settings: RunSettings,
    environment: Box<dyn Environment>,
    judge: Box<dyn Judge>,
    ledger: Box<dyn Ledger>,
    runners: Vec<Box<dyn AgentRunner>>,
    hooks: HookTree<Hook>,
}

impl Pipeline {
    pub fn new(
        settings: RunSettings,
        environment: Box<dyn Environment>,
        judge: Box<dyn Judge>,
        ledger: Box<dyn Ledger>,
        runners: Vec<Box<dyn AgentRunner>>,
    ) -> Self {
        Self {
            settings,
            environment,
            judge,
            ledger,
            runners,
            hooks: HookTree::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookTree<Hook>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    pub fn runner_names(&self) -> Vec<String> {
        self.runners.iter().map(|r| r.name().to_string()).collect()
    }

    /// Run every test against every runner, in registration order.
    pub fn run_all<'t>(
        &self,
        tests: impl IntoIterator<Item = &'t TestDefinition>,
        reporter: &mut dyn Reporter,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        for test in tests {
            summary.results.extend(self.run_test(test, reporter));
        }
        reporter.run_finished(&summary);
        summary
    }

    /// Convenience for running a whole [`Registry`] with its hooks.
    pub fn run_registry(
        self,
        mut registry: Registry,
        filter: Option<&str>,
        reporter: &mut dyn Reporter,
    ) -> RunSummary {
        let pipeline = self.with_hooks(std::mem::take(&mut registry.hooks));
        pipeline.run_all(registry.filtered(filter), reporter)
    }

    /// One iteration per configured runner.
    #[instrument(skip_all, fields(test = test.test_id()))]
    pub fn run_test(&self, test: &TestDefinition, reporter: &mut dyn Reporter) -> Vec<RunResult> {
        let names = self.runner_names();
        reporter.test_started(test, &names);
        let results: Vec<RunResult> = self
            .runners
            .iter()
            .map(|runner| {
                reporter.iteration_started(test.test_id(), runner.name());
                let result = self.run_iteration(test, runner.as_ref());
                reporter.iteration_finished(&result);
                result
            })
            .collect();
        reporter.test_finished(test.test_id(), &results);
        results
    }

    /// Record the steps a test body registers without touching the
    /// environment, agents or judge. Mode-policy errors surface here.
    pub fn dry_run(&self, test: &TestDefinition) -> Result<ExecutionPlan> {
        plan(test, &self.settings, self.runner_names())
    }

    #[instrument(skip_all, fields(test = test.test_id(), runner = runner.name()))]
    fn run_iteration(&self, test: &TestDefinition, runner: &dyn AgentRunner) -> RunResult {
        let started = Instant::now();
        let thresholds = Thresholds::resolve(test.judge.thresholds, self.settings.thresholds);
        let live = Live {
            environment: self.environment.as_ref(),
            runner,
            judge: self.judge.as_ref(),
            settings: &self.settings,
        };

        let (outcome, ctx) = self.execute(test, live);
        let body_ok = outcome.is_ok();
        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "iteration failed");
                verdict_from_error(&err, thresholds)
            }
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let record = RunRecord {
            test_id: test.test_id().to_string(),
            suite_path: test.suite_path.clone(),
            timestamp: Utc::now(),
            agent_runner: runner.name().to_string(),
            judge_model: self.judge.label(test.judge.model.as_deref()),
            score: verdict.score,
            pass: verdict.pass,
            status: verdict.status,
            reason: verdict.reason.clone(),
            improvement: verdict.improvement.clone(),
            context: RunContext {
                diff: ctx.diff,
                commands: ctx.commands,
            },
            duration_ms,
            thresholds: verdict.thresholds,
        };
        let mut result = RunResult {
            test_id: record.test_id.clone(),
            runner: record.agent_runner.clone(),
            entry_id: None,
            score: verdict.score,
            status: verdict.status,
            pass: verdict.pass,
            reason: verdict.reason,
            duration_ms,
            error: None,
        };
        let persisted = match self.ledger.record_run(&record) {
            Ok(entry) => {
                result.entry_id = Some(entry.id);
                true
            }
            Err(err) => {
                let message = format!("record run: {err:#}");
                error!(err = %message, "failed to record run");
                result.error = Some(message);
                false
            }
        };

        // After-each hook failures only surface when everything before succeeded.
        if let Err(err) = self.run_hooks(HookKind::AfterEach, test) {
            let message = format!("after_each hook: {err:#}");
            if body_ok && persisted {
                result.error = Some(message);
            } else {
                warn!(err = %message, "hook failed after an earlier error");
            }
        }

        if let Err(err) = self.environment.teardown(&self.settings.cwd) {
            let message = format!("{err:#}");
            warn!(err = %message, "environment teardown failed");
        }

        info!(
            score = result.score,
            status = result.status.as_str(),
            duration_ms,
            "iteration finished"
        );
        result
    }

    /// Steps 1-4. The context is returned even when a step fails so the
    /// ledger keeps whatever was captured.
    fn execute(&self, test: &TestDefinition, live: Live<'_>) -> (Result<Verdict>, TestContext) {
        let mut handle = AgentHandle::live(live, &test.judge);
        let outcome = self
            .prepare(test)
            .and_then(|()| (test.body)(&mut handle))
            .and_then(|()| handle.conclude());
        (outcome, handle.into_context())
    }

    fn prepare(&self, test: &TestDefinition) -> Result<()> {
        let cwd = &self.settings.cwd;
        self.environment.setup(cwd)?;
        for (index, command) in self.settings.before_each.iter().enumerate() {
            let name = format!("before_each[{index}]");
            let result = run_recorded(
                self.environment.as_ref(),
                &name,
                command,
                cwd,
                self.settings.command_timeout,
            )?;
            if !result.succeeded() {
                bail!(
                    "before_each command {command:?} exited with {:?}: {}",
                    result.exit_code,
                    result.stderr.trim()
                );
            }
        }
        self.run_hooks(HookKind::BeforeEach, test)
    }

    fn run_hooks(&self, kind: HookKind, test: &TestDefinition) -> Result<()> {
        let ctx = HookContext {
            test_id: test.test_id(),
            suite_path: &test.suite_path,
            environment: self.environment.as_ref(),
            cwd: &self.settings.cwd,
            timeout: self.settings.command_timeout,
        };
        for hook in self.hooks.matching(kind, &test.suite_path) {
            hook(&ctx)?;
        }
        Ok(())
    }
}

/// Dry-run `test` against `settings`; nothing is built or executed.
pub fn plan(
    test: &TestDefinition,
    settings: &RunSettings,
    runners: Vec<String>,
) -> Result<ExecutionPlan> {
    let mut handle = AgentHandle::inert(&test.judge, settings.thresholds);
    (test.body)(&mut handle)?;
    let (mode, steps) = handle.into_plan();
    if mode == Mode::Declarative && !steps.iter().any(|s| matches!(s, PlanStep::Task { .. })) {
        warn!(
            test = test.test_id(),
            "declarative test registers no tasks; it will fail unless the body judges"
        );
    }
    Ok(ExecutionPlan {
        test_id: test.test_id().to_string(),
        suite_path: test.suite_path.clone(),
        mode,
        runners,
        before_each: settings.before_each.clone(),
        after_each: settings.after_each.clone(),
        steps,
    })
}

/// Verdict for an iteration that ended in an error. A failed judge assertion
/// keeps the judge's own score and reason rather than the `Execution error:`
/// prefix every other error gets.
fn verdict_from_error(err: &anyhow::Error, thresholds: Thresholds) -> Verdict {
    if let Some(assertion) = err.downcast_ref::<JudgeAssertionError>() {
        return Verdict {
            score: assertion.score,
            status: Status::Fail,
            pass: false,
            reason: assertion.reason.clone(),
            improvement: assertion.improvement.clone(),
            thresholds,
        };
    }
    Verdict::failed(format!("Execution error: {err:#}"), thresholds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assertion_errors_keep_the_judge_values() {
        let thresholds = Thresholds::default();
        let err: anyhow::Error = JudgeAssertionError {
            score: 0.2,
            status: Status::Fail,
            reason: "no tests".to_string(),
            improvement: "add tests".to_string(),
        }
        .into();
        let verdict = verdict_from_error(&err, thresholds);
        assert_eq!(verdict.score, 0.2);
        assert_eq!(verdict.reason, "no tests");
        assert_eq!(verdict.improvement, "add tests");
        assert!(!verdict.pass);
    }

    #[test]
    fn other_errors_become_execution_errors() {
        let err = anyhow::anyhow!("disk full").context("write file");
        let verdict = verdict_from_error(&err, Thresholds::default());
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.status, Status::Fail);
        assert_eq!(verdict.reason, "Execution error: write file: disk full");
    }

    #[test]
    fn summary_counts_errors_as_failures() {
        let ok = RunResult {
            test_id: "t".to_string(),
            runner: "r".to_string(),
            entry_id: Some(1),
            score: 1.0,
            status: Status::Pass,
            pass: true,
            reason: String::new(),
            duration_ms: 1,
            error: None,
        };
        let mut hook_failed = ok.clone();
        hook_failed.error = Some("after_each hook: boom".to_string());
        let summary = RunSummary {
            results: vec![ok, hook_failed],
        };
        assert_eq!(summary.failed(), 1);
        assert!(!summary.all_passed());
    }
}
