//! Case file parsing and validation.
//!
//! Cases are TOML files under `cases_dir`. Each file holds one or more
//! `[[tests]]`; a test is declarative (`instruction` plus command `tasks`)
//! or imperative (`prompt` plus judge `criteria`).
//!
//! ```toml
//! suite = ["cli"]
//!
//! [[tests]]
//! title = "adds a verbose flag"
//! instruction = "Add a --verbose flag"
//! expected_files = ["src/main.rs"]
//!
//! [[tests.tasks]]
//! name = "build"
//! command = "cargo build"
//! criteria = "The crate builds"
//! weight = 2.0
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use harness::core::types::Thresholds;
use harness::dsl::{Registry, Suite, TaskDefinition, TestDefinition};
use harness::handle::JudgeOptions;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaseFile {
    /// Suite path for every test in the file; defaults to the file stem.
    pub suite: Option<Vec<String>>,
    pub tests: Vec<CaseTest>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaseTest {
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Declarative instruction.
    pub instruction: Option<String>,
    #[serde(default)]
    pub tasks: Vec<CaseTask>,
    /// Imperative prompt, judged against `criteria`.
    pub prompt: Option<String>,
    pub criteria: Option<String>,
    pub thresholds: Option<Thresholds>,
    pub expected_files: Option<Vec<String>>,
    pub judge_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaseTask {
    pub name: String,
    pub command: String,
    pub criteria: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl CaseFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read case {}", path.display()))?;
        Self::parse_str(&contents).with_context(|| format!("case {}", path.display()))
    }

    pub fn parse_str(contents: &str) -> Result<Self> {
        let case: CaseFile = toml::from_str(contents).context("parse case")?;
        case.validate()?;
        Ok(case)
    }

    fn validate(&self) -> Result<()> {
        if self.tests.is_empty() {
            bail!("tests must be a non-empty array");
        }
        if let Some(suite) = &self.suite
            && suite.iter().any(|name| name.trim().is_empty())
        {
            bail!("suite names must be non-empty");
        }
        for (index, test) in self.tests.iter().enumerate() {
            test.validate()
                .with_context(|| format!("tests[{index}] invalid"))?;
        }
        Ok(())
    }

    /// Compile into test definitions under `default_suite` unless the file
    /// names its own suite.
    pub fn definitions(&self, default_suite: &str) -> Vec<TestDefinition> {
        let suite_path = self
            .suite
            .clone()
            .unwrap_or_else(|| vec![default_suite.to_string()]);
        self.tests
            .iter()
            .map(|test| {
                let mut definition = test.definition();
                definition.suite_path = suite_path.clone();
                definition
            })
            .collect()
    }
}

impl CaseTest {
    fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            bail!("title must be non-empty");
        }
        match (&self.instruction, &self.prompt) {
            (Some(_), Some(_)) => bail!("set either instruction or prompt, not both"),
            (None, None) => bail!("one of instruction or prompt is required"),
            (Some(instruction), None) => {
                if instruction.trim().is_empty() {
                    bail!("instruction must be non-empty");
                }
                if self.tasks.is_empty() {
                    bail!("declarative tests need at least one task");
                }
                if self.criteria.is_some() {
                    bail!("criteria only applies to prompt tests; use task criteria");
                }
            }
            (None, Some(prompt)) => {
                if prompt.trim().is_empty() {
                    bail!("prompt must be non-empty");
                }
                if !self.tasks.is_empty() {
                    bail!("tasks require an instruction");
                }
                if self.criteria.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    bail!("prompt tests need non-empty criteria");
                }
            }
        }
        for (index, task) in self.tasks.iter().enumerate() {
            task.validate()
                .with_context(|| format!("tasks[{index}] invalid"))?;
        }
        if let Some(thresholds) = &self.thresholds {
            let errors = thresholds.validate();
            if !errors.is_empty() {
                bail!("{}", errors.join("; "));
            }
        }
        Ok(())
    }

    fn definition(&self) -> TestDefinition {
        let options = JudgeOptions {
            thresholds: self.thresholds,
            model: self.judge_model.clone(),
            expected_files: self.expected_files.clone(),
        };
        let body = match (&self.instruction, &self.prompt) {
            (Some(instruction), _) => declarative_body(instruction.clone(), self.tasks.clone()),
            (None, prompt) => imperative_body(
                prompt.clone().unwrap_or_default(),
                self.criteria.clone().unwrap_or_default(),
            ),
        };
        TestDefinition::new(self.title.clone(), body)
            .with_tags(self.tags.clone())
            .with_judge(options)
    }
}

impl CaseTask {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("name must be non-empty");
        }
        if self.command.trim().is_empty() {
            bail!("command must be non-empty");
        }
        if self.criteria.trim().is_empty() {
            bail!("criteria must be non-empty");
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            bail!("weight must be >= 0 (got {})", self.weight);
        }
        Ok(())
    }
}

type Body = Box<dyn Fn(&mut harness::handle::AgentHandle<'_>) -> Result<()>>;

fn declarative_body(instruction: String, tasks: Vec<CaseTask>) -> Body {
    Box::new(move |agent| {
        agent.instruct(&instruction)?;
        for task in &tasks {
            agent.task(
                TaskDefinition::command(&task.name, &task.command, &task.criteria)
                    .weight(task.weight),
            )?;
        }
        Ok(())
    })
}

fn imperative_body(prompt: String, criteria: String) -> Body {
    Box::new(move |agent| {
        agent.run(&prompt)?;
        agent.judge(&criteria)?;
        Ok(())
    })
}

/// `.toml` files directly under `dir`, sorted by path.
pub fn discover_case_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read cases dir {}", dir.display()))? {
        let path = entry.context("read case entry")?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Load every case file under `dir` into one registry. Titles must be unique
/// across files.
pub fn load_registry(dir: &Path) -> Result<Registry> {
    let mut suite = Suite::new();
    for path in discover_case_files(dir)? {
        let case = CaseFile::load(&path)?;
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(path = %path.display(), tests = case.tests.len(), "loaded case file");
        for definition in case.definitions(&stem) {
            suite.add(definition);
        }
    }
    suite
        .finish()
        .with_context(|| format!("load cases from {}", dir.display()))
}
