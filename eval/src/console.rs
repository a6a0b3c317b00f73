//! Plain-text progress output for `eval run`.

use std::io::Write;

use harness::core::types::Status;
use harness::dsl::TestDefinition;
use harness::pipeline::{RunResult, RunSummary};
use harness::report::Reporter;

/// Writes one line per iteration plus a closing summary.
pub struct ConsoleReporter<W: Write> {
    out: W,
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

// Console writes are best effort; a closed stdout must not abort a run.
impl<W: Write> Reporter for ConsoleReporter<W> {
    fn test_started(&mut self, test: &TestDefinition, runners: &[String]) {
        let suite = if test.suite_path.is_empty() {
            String::new()
        } else {
            format!("{} / ", test.suite_path.join(" / "))
        };
        let _ = writeln!(
            self.out,
            "test: {suite}{} runners={}",
            test.test_id(),
            runners.join(",")
        );
    }

    fn iteration_finished(&mut self, result: &RunResult) {
        let id = result
            .entry_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        let _ = writeln!(
            self.out,
            "  {} {:<4} score={:.2} runner={} run={} ({}ms)",
            marker(result),
            result.status.as_str(),
            result.score,
            result.runner,
            id,
            result.duration_ms
        );
        if result.status != Status::Pass && !result.reason.is_empty() {
            let _ = writeln!(self.out, "    reason: {}", result.reason);
        }
        if let Some(error) = &result.error {
            let _ = writeln!(self.out, "    error: {error}");
        }
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        let total = summary.results.len();
        let failed = summary.failed();
        let _ = writeln!(
            self.out,
            "summary: iterations={total} ok={} failed={failed}",
            total - failed
        );
    }
}

fn marker(result: &RunResult) -> &'static str {
    if !result.succeeded() {
        "x"
    } else if result.status == Status::Warn {
        "~"
    } else {
        "+"
    }
}
