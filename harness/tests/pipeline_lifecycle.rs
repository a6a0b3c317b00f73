//! Pipeline lifecycle tests: full iterations against scripted agents and
//! judges, persisted to a real SQLite ledger in a temp dir.

use std::cell::RefCell;
use std::rc::Rc;

use harness::core::types::{Status, Thresholds};
use harness::dsl::{Suite, TaskDefinition, TestDefinition};
use harness::handle::JudgeOptions;
use harness::io::ledger::{Ledger, SqliteLedger};
use harness::pipeline::{Pipeline, RunSettings};
use harness::report::NullReporter;
use harness::test_support::{
    EventLog, RecordingEnvironment, ScriptedJudge, ScriptedRunner, event_log, events,
    judge_result, settings,
};
use tempfile::TempDir;

struct Fixture {
    temp: TempDir,
    log: EventLog,
}

impl Fixture {
    fn new() -> Self {
        Self {
            temp: tempfile::tempdir().expect("tempdir"),
            log: event_log(),
        }
    }

    fn settings(&self) -> RunSettings {
        settings(self.temp.path())
    }

    fn ledger(&self) -> SqliteLedger {
        SqliteLedger::open(self.temp.path().join("ledger.db")).expect("ledger")
    }

    fn pipeline(
        &self,
        settings: RunSettings,
        environment: RecordingEnvironment,
        judge: ScriptedJudge,
        runners: &[&str],
    ) -> Pipeline {
        let runners = runners
            .iter()
            .map(|name| {
                Box::new(ScriptedRunner::new(name, Rc::clone(&self.log)))
                    as Box<dyn harness::io::agent::AgentRunner>
            })
            .collect();
        Pipeline::new(
            settings,
            Box::new(environment),
            Box::new(judge),
            Box::new(self.ledger()),
            runners,
        )
    }

    fn env(&self) -> RecordingEnvironment {
        RecordingEnvironment::new(Rc::clone(&self.log))
    }

    fn judge(&self, scores: &[f64]) -> ScriptedJudge {
        ScriptedJudge::new(
            Rc::clone(&self.log),
            scores.iter().map(|s| judge_result(*s, "looks right")),
        )
    }
}

fn declarative() -> TestDefinition {
    TestDefinition::new("adds greeting", |agent| {
        agent.instruct("Add a greeting file")?;
        agent.task(TaskDefinition::command("check", "echo checked", "prints checked").weight(2.0))?;
        Ok(())
    })
}

/// Declarative order: setup, agent, diff, after-each commands, tasks, judge,
/// teardown. The judge sees the weighted task criteria; the ledger keeps the
/// full transcript.
#[test]
fn declarative_iteration_runs_agent_then_tasks_then_judge() {
    let fx = Fixture::new();
    let mut run_settings = fx.settings();
    run_settings.after_each = vec!["echo after".to_string()];
    let judge = fx.judge(&[0.9]);
    let criteria = judge.criteria();
    let transcripts = judge.transcripts();
    let pipeline = fx.pipeline(
        run_settings,
        fx.env().with_diff("diff --git a/hello b/hello\n"),
        judge,
        &["alpha"],
    );

    let results = pipeline.run_test(&declarative(), &mut NullReporter);

    assert_eq!(
        events(&fx.log),
        vec![
            "setup",
            "agent:alpha:Add a greeting file",
            "diff",
            "exec:echo after",
            "exec:echo checked",
            "judge",
            "teardown",
        ]
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, Status::Pass);
    assert!(results[0].succeeded());

    let seen = criteria.borrow();
    assert!(seen[0].contains("Add a greeting file"));
    assert!(seen[0].contains("check"));
    assert!(seen[0].contains("prints checked"));
    // Task output is quoted once, in the weighted criteria.
    assert_eq!(transcripts.borrow()[0], vec!["after_each[0]"]);

    let entry = fx
        .ledger()
        .get_run_by_id(results[0].entry_id.expect("persisted"))
        .expect("query")
        .expect("entry");
    assert_eq!(entry.record.agent_runner, "alpha");
    assert_eq!(entry.record.judge_model, "scripted");
    assert_eq!(entry.record.context.diff, "diff --git a/hello b/hello\n");
    let names: Vec<&str> = entry
        .record
        .context
        .commands
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(names, vec!["after_each[0]", "check"]);
}

/// Each runner gets its own iteration, fully set up and torn down before the
/// next one starts.
#[test]
fn runners_execute_sequentially_with_isolated_lifecycles() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline(fx.settings(), fx.env(), fx.judge(&[0.9, 0.6]), &["a", "b"]);

    let results = pipeline.run_test(&declarative(), &mut NullReporter);

    let lifecycle: Vec<String> = events(&fx.log)
        .into_iter()
        .filter(|e| e == "setup" || e == "teardown" || e.starts_with("agent:"))
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            "setup",
            "agent:a:Add a greeting file",
            "teardown",
            "setup",
            "agent:b:Add a greeting file",
            "teardown",
        ]
    );
    assert_eq!(results[0].status, Status::Pass);
    assert_eq!(results[1].status, Status::Warn);
    assert!(results[1].pass);
    assert_eq!(fx.ledger().get_runs(Some("adds greeting")).expect("runs").len(), 2);
}

#[test]
fn imperative_test_without_judge_records_fail() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline(fx.settings(), fx.env(), fx.judge(&[]), &["a"]);
    let test = TestDefinition::new("forgets to judge", |agent| {
        agent.run("do something")?;
        Ok(())
    });

    let results = pipeline.run_test(&test, &mut NullReporter);

    assert_eq!(results[0].status, Status::Fail);
    assert_eq!(results[0].score, 0.0);
    assert_eq!(results[0].reason, "Test completed without judge evaluation");
}

#[test]
fn declarative_test_without_tasks_or_judge_records_fail() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline(fx.settings(), fx.env(), fx.judge(&[]), &["a"]);
    let test = TestDefinition::new("instruct only", |agent| agent.instruct("do it"));

    let results = pipeline.run_test(&test, &mut NullReporter);

    assert_eq!(results[0].status, Status::Fail);
    assert_eq!(
        results[0].reason,
        "Test completed without tasks or judge evaluation"
    );
    assert!(events(&fx.log).contains(&"agent:a:do it".to_string()));
}

/// A failed judge assertion keeps the judge's score and reason in the ledger.
#[test]
fn failed_judge_assertion_records_judge_values() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline(fx.settings(), fx.env(), fx.judge(&[0.3]), &["a"]);
    let test = TestDefinition::new("asserts", |agent| {
        agent.run("do it")?;
        agent.judge("the file exists")?;
        Ok(())
    });

    let results = pipeline.run_test(&test, &mut NullReporter);

    assert_eq!(results[0].status, Status::Fail);
    assert_eq!(results[0].score, 0.3);
    assert_eq!(results[0].reason, "looks right");
}

#[test]
fn mode_policy_violations_become_execution_errors() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline(fx.settings(), fx.env(), fx.judge(&[]), &["a"]);
    let test = TestDefinition::new("instructs twice", |agent| {
        agent.instruct("one")?;
        agent.instruct("two")?;
        Ok(())
    });

    let results = pipeline.run_test(&test, &mut NullReporter);

    assert_eq!(results[0].status, Status::Fail);
    assert!(results[0].reason.starts_with("Execution error:"));
    assert!(results[0].reason.contains("only be called once"));
    assert!(!events(&fx.log).iter().any(|e| e.starts_with("agent:")));
}

#[test]
fn setup_failure_is_recorded_and_teardown_still_runs() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline(
        fx.settings(),
        fx.env().failing_setup(),
        fx.judge(&[]),
        &["a"],
    );

    let results = pipeline.run_test(&declarative(), &mut NullReporter);

    assert_eq!(results[0].status, Status::Fail);
    assert!(results[0].reason.contains("sandbox unavailable"));
    assert!(results[0].entry_id.is_some());
    assert_eq!(events(&fx.log), vec!["setup", "teardown"]);
}

#[test]
fn failing_before_each_command_skips_the_body() {
    let fx = Fixture::new();
    let mut run_settings = fx.settings();
    run_settings.before_each = vec!["echo no deps >&2; exit 3".to_string()];
    let pipeline = fx.pipeline(run_settings, fx.env(), fx.judge(&[]), &["a"]);

    let results = pipeline.run_test(&declarative(), &mut NullReporter);

    assert_eq!(results[0].status, Status::Fail);
    assert!(results[0].reason.contains("no deps"));
    assert!(!events(&fx.log).iter().any(|e| e.starts_with("agent:")));
}

/// Per-test thresholds beat the global ones: 0.85 passes globally but only
/// warns for a strict test.
#[test]
fn per_test_thresholds_override_global_thresholds() {
    let fx = Fixture::new();
    let mut run_settings = fx.settings();
    run_settings.thresholds = Some(Thresholds {
        warn: 0.7,
        fail: 0.4,
    });
    let pipeline = fx.pipeline(run_settings, fx.env(), fx.judge(&[0.85, 0.85]), &["a"]);
    let strict = declarative().with_judge(JudgeOptions {
        thresholds: Some(Thresholds {
            warn: 0.9,
            fail: 0.5,
        }),
        ..JudgeOptions::default()
    });
    let lenient = TestDefinition::new("lenient", |agent| {
        agent.instruct("x")?;
        agent.task(TaskDefinition::command("t", "true", "ok"))?;
        Ok(())
    });

    let strict_result = pipeline.run_test(&strict, &mut NullReporter);
    let lenient_result = pipeline.run_test(&lenient, &mut NullReporter);

    assert_eq!(strict_result[0].status, Status::Warn);
    assert_eq!(lenient_result[0].status, Status::Pass);
    let entry = fx
        .ledger()
        .get_run_by_id(strict_result[0].entry_id.expect("id"))
        .expect("query")
        .expect("entry");
    assert_eq!(entry.record.thresholds.warn, 0.9);
}

/// Suite hooks run root-first in registration order; an after-each failure on
/// an otherwise successful iteration surfaces on the result.
#[test]
fn suite_hooks_run_in_order_and_after_each_errors_surface() {
    let fx = Fixture::new();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut suite = Suite::new();
    let log = Rc::clone(&calls);
    suite.before_each(move |ctx| {
        log.borrow_mut().push(format!("root-before:{}", ctx.test_id));
        Ok(())
    });
    suite.describe("greetings", |suite| {
        let log = Rc::clone(&calls);
        suite.before_each(move |_| {
            log.borrow_mut().push("suite-before".to_string());
            Ok(())
        });
        let log = Rc::clone(&calls);
        suite.after_each(move |_| {
            log.borrow_mut().push("suite-after".to_string());
            anyhow::bail!("cleanup failed")
        });
        suite.add(declarative());
    });
    let registry = suite.finish().expect("registry");
    let pipeline = fx.pipeline(fx.settings(), fx.env(), fx.judge(&[0.95]), &["a"]);

    let summary = pipeline.run_registry(registry, None, &mut NullReporter);

    assert_eq!(
        *calls.borrow(),
        vec!["root-before:adds greeting", "suite-before", "suite-after"]
    );
    let result = &summary.results[0];
    assert_eq!(result.status, Status::Pass);
    assert!(result.error.as_deref().unwrap_or("").contains("cleanup failed"));
    assert_eq!(summary.failed(), 1);
}

#[test]
fn dry_run_plans_without_executing() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline(fx.settings(), fx.env(), fx.judge(&[]), &["a", "b"]);

    let plan = pipeline.dry_run(&declarative()).expect("plan");

    assert_eq!(plan.runners, vec!["a", "b"]);
    assert_eq!(plan.steps.len(), 2);
    assert!(events(&fx.log).is_empty());

    let bad = TestDefinition::new("mixes modes", |agent| {
        agent.run("x")?;
        agent.instruct("y")
    });
    assert!(pipeline.dry_run(&bad).is_err());
}

/// Overrides change effective stats without touching the recorded run.
#[test]
fn overrides_feed_effective_stats() {
    let fx = Fixture::new();
    let pipeline = fx.pipeline(fx.settings(), fx.env(), fx.judge(&[0.2, 0.9]), &["a"]);
    let failing = pipeline.run_test(&declarative(), &mut NullReporter);
    let passing = pipeline.run_test(&declarative(), &mut NullReporter);
    assert_eq!(failing[0].status, Status::Fail);
    assert_eq!(passing[0].status, Status::Pass);

    let ledger = pipeline.ledger();
    let before = ledger.get_stats(None).expect("stats");
    assert_eq!(before.total_runs, 2);
    assert_eq!(before.passed, 1);

    let run_id = failing[0].entry_id.expect("id");
    let record = ledger
        .override_run_score(run_id, 0.85, "judge missed the new test")
        .expect("override");
    assert_eq!(record.status, Status::Pass);

    let after = ledger.get_stats(Some("adds greeting")).expect("stats");
    assert_eq!(after.passed, 2);
    assert_eq!(after.pass_rate, 1.0);
    let entry = ledger.get_run_by_id(run_id).expect("query").expect("entry");
    assert_eq!(entry.record.score, 0.2);
    assert_eq!(entry.effective_score(), 0.85);
}
