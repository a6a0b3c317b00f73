//! Progress reporting hooks for the pipeline.

use tracing::info;

use crate::dsl::TestDefinition;
use crate::pipeline::{RunResult, RunSummary};

/// Observer for run progress. Every method defaults to a no-op.
pub trait Reporter {
    fn test_started(&mut self, _test: &TestDefinition, _runners: &[String]) {}

    fn iteration_started(&mut self, _test_id: &str, _runner: &str) {}

    fn iteration_finished(&mut self, _result: &RunResult) {}

    fn test_finished(&mut self, _test_id: &str, _results: &[RunResult]) {}

    fn run_finished(&mut self, _summary: &RunSummary) {}
}

/// Reporter that discards everything.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Reporter that emits progress as tracing events.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn iteration_started(&mut self, test_id: &str, runner: &str) {
        info!(test = test_id, runner, "iteration started");
    }

    fn iteration_finished(&mut self, result: &RunResult) {
        info!(
            test = %result.test_id,
            runner = %result.runner,
            score = result.score,
            status = result.status.as_str(),
            error = ?result.error,
            "iteration finished"
        );
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        info!(
            iterations = summary.results.len(),
            failed = summary.failed(),
            "run finished"
        );
    }
}
