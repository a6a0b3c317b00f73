//! Test registration: suites, tests, tasks and lifecycle hooks.
//!
//! ```no_run
//! use harness::dsl::{Suite, TaskDefinition};
//!
//! let mut suite = Suite::new();
//! suite.describe("cli", |suite| {
//!     suite.test("adds a --verbose flag", |agent| {
//!         agent.instruct("Add a --verbose flag to the CLI")?;
//!         agent.task(TaskDefinition::command("build", "cargo build", "The crate builds"))?;
//!         agent.task(TaskDefinition::command("tests", "cargo test", "Tests pass").weight(2.0))?;
//!         Ok(())
//!     });
//! });
//! let registry = suite.finish().expect("unique titles");
//! assert_eq!(registry.tests.len(), 1);
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::core::hooks::{HookKind, HookTree};
use crate::core::types::CommandResult;
use crate::handle::{AgentHandle, JudgeOptions};
use crate::io::environment::{Environment, run_recorded};

/// What a task action can reach.
pub struct TaskEnv<'a> {
    pub environment: &'a dyn Environment,
    pub cwd: &'a Path,
    pub timeout: Duration,
}

pub type TaskAction = Box<dyn Fn(&TaskEnv<'_>) -> Result<CommandResult>>;

/// A post-agent check contributing to a declarative test's verdict.
pub struct TaskDefinition {
    pub name: String,
    pub action: TaskAction,
    pub criteria: String,
    /// Relative importance in the judge prompt. Defaults to 1.
    pub weight: f64,
}

impl TaskDefinition {
    pub fn new(
        name: impl Into<String>,
        criteria: impl Into<String>,
        action: impl Fn(&TaskEnv<'_>) -> Result<CommandResult> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
            criteria: criteria.into(),
            weight: 1.0,
        }
    }

    /// Task that runs a shell command in the environment.
    pub fn command(
        name: impl Into<String>,
        command: impl Into<String>,
        criteria: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let command = command.into();
        let label = name.clone();
        Self::new(name, criteria, move |env| {
            run_recorded(env.environment, &label, &command, env.cwd, env.timeout)
        })
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("criteria", &self.criteria)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

pub type TestBody = Box<dyn Fn(&mut AgentHandle<'_>) -> Result<()>>;

pub struct TestDefinition {
    /// Title; doubles as the ledger's test id.
    pub title: String,
    pub tags: Vec<String>,
    /// Enclosing `describe` names, outermost first.
    pub suite_path: Vec<String>,
    pub judge: JudgeOptions,
    pub body: TestBody,
}

impl TestDefinition {
    pub fn new(
        title: impl Into<String>,
        body: impl Fn(&mut AgentHandle<'_>) -> Result<()> + 'static,
    ) -> Self {
        Self {
            title: title.into(),
            tags: Vec::new(),
            suite_path: Vec::new(),
            judge: JudgeOptions::default(),
            body: Box::new(body),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.title
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_judge(mut self, judge: JudgeOptions) -> Self {
        self.judge = judge;
        self
    }
}

impl std::fmt::Debug for TestDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDefinition")
            .field("title", &self.title)
            .field("tags", &self.tags)
            .field("suite_path", &self.suite_path)
            .field("judge", &self.judge)
            .finish_non_exhaustive()
    }
}

/// What a lifecycle hook can reach.
pub struct HookContext<'a> {
    pub test_id: &'a str,
    pub suite_path: &'a [String],
    pub environment: &'a dyn Environment,
    pub cwd: &'a Path,
    pub timeout: Duration,
}

pub type Hook = Box<dyn Fn(&HookContext<'_>) -> Result<()>>;

/// Registered tests and hooks, ready for the pipeline.
#[derive(Default)]
pub struct Registry {
    pub tests: Vec<TestDefinition>,
    pub hooks: HookTree<Hook>,
}

impl Registry {
    /// Tests whose id contains `filter` (all tests when `None`).
    pub fn filtered(&self, filter: Option<&str>) -> Vec<&TestDefinition> {
        self.tests
            .iter()
            .filter(|test| filter.is_none_or(|f| test.test_id().contains(f)))
            .collect()
    }
}

/// Builder that tracks the current `describe` nesting.
#[derive(Default)]
pub struct Suite {
    path: Vec<String>,
    tests: Vec<TestDefinition>,
    hooks: HookTree<Hook>,
}

impl Suite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register everything `body` adds under a nested suite named `name`.
    pub fn describe(&mut self, name: impl Into<String>, body: impl FnOnce(&mut Suite)) {
        self.path.push(name.into());
        body(self);
        self.path.pop();
    }

    pub fn test(
        &mut self,
        title: impl Into<String>,
        body: impl Fn(&mut AgentHandle<'_>) -> Result<()> + 'static,
    ) -> &mut TestDefinition {
        self.add(TestDefinition::new(title, body))
    }

    /// Add a prebuilt test at the current nesting; its suite path is
    /// prefixed with the enclosing suites.
    pub fn add(&mut self, mut test: TestDefinition) -> &mut TestDefinition {
        let mut suite_path = self.path.clone();
        suite_path.append(&mut test.suite_path);
        test.suite_path = suite_path;
        self.tests.push(test);
        let last = self.tests.len() - 1;
        &mut self.tests[last]
    }

    pub fn before_each(&mut self, hook: impl Fn(&HookContext<'_>) -> Result<()> + 'static) {
        self.hooks
            .register(HookKind::BeforeEach, &self.path, Box::new(hook));
    }

    pub fn after_each(&mut self, hook: impl Fn(&HookContext<'_>) -> Result<()> + 'static) {
        self.hooks
            .register(HookKind::AfterEach, &self.path, Box::new(hook));
    }

    /// Finish registration. Titles must be unique across the whole suite
    /// and per-test thresholds must be valid; every problem is reported.
    pub fn finish(self) -> Result<Registry> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for test in &self.tests {
            if !seen.insert(test.title.as_str()) {
                errors.push(format!("duplicate test title {:?}", test.title));
            }
            if let Some(thresholds) = &test.judge.thresholds {
                errors.extend(
                    thresholds
                        .validate()
                        .into_iter()
                        .map(|err| format!("test {:?}: {err}", test.title)),
                );
            }
        }
        if !errors.is_empty() {
            bail!("{}", errors.join("; "));
        }
        Ok(Registry {
            tests: self.tests,
            hooks: self.hooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Thresholds;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn noop(_: &mut AgentHandle<'_>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn describe_nests_suite_paths() {
        let mut suite = Suite::new();
        suite.test("top", noop);
        suite.describe("outer", |suite| {
            suite.test("a", noop);
            suite.describe("inner", |suite| {
                suite.test("b", noop).tags = vec!["slow".to_string()];
            });
        });
        let registry = suite.finish().expect("registry");
        let paths: Vec<(&str, Vec<String>)> = registry
            .tests
            .iter()
            .map(|t| (t.test_id(), t.suite_path.clone()))
            .collect();
        assert_eq!(
            paths,
            vec![
                ("top", vec![]),
                ("a", vec!["outer".to_string()]),
                ("b", vec!["outer".to_string(), "inner".to_string()]),
            ]
        );
        assert_eq!(registry.tests[2].tags, vec!["slow"]);
    }

    #[test]
    fn duplicate_titles_are_rejected() {
        let mut suite = Suite::new();
        suite.test("same", noop);
        suite.describe("elsewhere", |suite| {
            suite.test("same", noop);
        });
        let err = suite.finish().err().expect("duplicate");
        assert!(err.to_string().contains("duplicate test title"));
    }

    #[test]
    fn invalid_test_thresholds_are_rejected() {
        let mut suite = Suite::new();
        suite.add(TestDefinition::new("ok", noop).with_judge(JudgeOptions {
            thresholds: Some(Thresholds {
                warn: 0.9,
                fail: 0.6,
            }),
            ..JudgeOptions::default()
        }));
        suite.add(TestDefinition::new("broken", noop).with_judge(JudgeOptions {
            thresholds: Some(Thresholds {
                warn: 0.3,
                fail: 1.7,
            }),
            ..JudgeOptions::default()
        }));
        suite.test("ok", noop);
        let err = suite.finish().err().expect("invalid thresholds");
        let message = err.to_string();
        assert!(message.contains("test \"broken\": thresholds.fail must be within [0, 1]"));
        assert!(message.contains("must not exceed"));
        assert!(message.contains("duplicate test title \"ok\""));
    }

    #[test]
    fn hooks_register_at_current_suite() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut suite = Suite::new();
        let log = Rc::clone(&calls);
        suite.before_each(move |_| {
            log.borrow_mut().push("root");
            Ok(())
        });
        suite.describe("db", |suite| {
            let log = Rc::clone(&calls);
            suite.before_each(move |_| {
                log.borrow_mut().push("db");
                Ok(())
            });
        });
        let registry = suite.finish().expect("registry");
        let db = vec!["db".to_string()];
        assert_eq!(
            registry.hooks.matching(HookKind::BeforeEach, &db).len(),
            2
        );
        assert_eq!(registry.hooks.matching(HookKind::BeforeEach, &[]).len(), 1);
    }

    #[test]
    fn filtered_matches_substrings() {
        let mut suite = Suite::new();
        suite.test("adds flag", noop);
        suite.test("fixes bug", noop);
        let registry = suite.finish().expect("registry");
        let names: Vec<&str> = registry
            .filtered(Some("flag"))
            .iter()
            .map(|t| t.test_id())
            .collect();
        assert_eq!(names, vec!["adds flag"]);
        assert_eq!(registry.filtered(None).len(), 2);
    }

    #[test]
    fn command_tasks_default_to_unit_weight() {
        let task = TaskDefinition::command("build", "make", "it builds");
        assert_eq!(task.weight, 1.0);
        assert_eq!(task.weight(3.0).weight, 3.0);
    }
}
