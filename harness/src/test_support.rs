//! Test doubles for pipeline tests: an environment that logs its lifecycle,
//! a scripted agent runner and a scripted judge.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use crate::core::types::JudgeResult;
use crate::io::agent::{AgentOutput, AgentRunner, RunnerContext};
use crate::io::environment::{Environment, ExecOutput};
use crate::io::judge::{Judge, JudgeRequest};
use crate::io::process::{run_command_with_timeout, shell};
use crate::pipeline::RunSettings;

/// Shared, ordered log of events across doubles.
pub type EventLog = Rc<RefCell<Vec<String>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.borrow().clone()
}

/// Settings with short timeouts and no global commands.
pub fn settings(cwd: &Path) -> RunSettings {
    RunSettings {
        cwd: cwd.to_path_buf(),
        before_each: Vec::new(),
        after_each: Vec::new(),
        thresholds: None,
        command_timeout: Duration::from_secs(10),
        agent_timeout: Duration::from_secs(10),
    }
}

pub fn judge_result(score: f64, reason: &str) -> JudgeResult {
    JudgeResult {
        pass: score >= 0.5,
        status: None,
        score,
        reason: reason.to_string(),
        improvement: String::new(),
    }
}

/// Host environment that logs `setup`, `exec:<command>` and `teardown`.
/// The diff is a fixed string.
pub struct RecordingEnvironment {
    log: EventLog,
    diff: String,
    fail_setup: bool,
}

impl RecordingEnvironment {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            diff: String::new(),
            fail_setup: false,
        }
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = diff.into();
        self
    }

    pub fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }
}

impl Environment for RecordingEnvironment {
    fn name(&self) -> &str {
        "recording"
    }

    fn setup(&self, _cwd: &Path) -> Result<()> {
        self.log.borrow_mut().push("setup".to_string());
        if self.fail_setup {
            bail!("sandbox unavailable");
        }
        Ok(())
    }

    fn execute(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutput> {
        self.log.borrow_mut().push(format!("exec:{command}"));
        let output = run_command_with_timeout(shell(command, cwd), None, timeout, 64 * 1024)?;
        Ok(ExecOutput {
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
        })
    }

    fn diff(&self, _cwd: &Path) -> Result<String> {
        self.log.borrow_mut().push("diff".to_string());
        Ok(self.diff.clone())
    }

    fn teardown(&self, _cwd: &Path) -> Result<()> {
        self.log.borrow_mut().push("teardown".to_string());
        Ok(())
    }
}

/// Runner that logs `agent:<name>:<prompt>` and optionally writes a file.
pub struct ScriptedRunner {
    name: String,
    log: EventLog,
    writes: Option<(PathBuf, String)>,
    fail: bool,
}

impl ScriptedRunner {
    pub fn new(name: &str, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            writes: None,
            fail: false,
        }
    }

    /// Write `contents` to `path` (relative to the cwd) when executed.
    pub fn writing(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.writes = Some((path.into(), contents.into()));
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl AgentRunner for ScriptedRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, prompt: &str, ctx: &RunnerContext<'_>) -> Result<AgentOutput> {
        self.log
            .borrow_mut()
            .push(format!("agent:{}:{prompt}", self.name));
        if self.fail {
            bail!("agent {} crashed", self.name);
        }
        let mut files_written = Vec::new();
        if let Some((path, contents)) = &self.writes {
            fs::write(ctx.cwd.join(path), contents)?;
            files_written.push(path.display().to_string());
        }
        Ok(AgentOutput {
            files_written: Some(files_written),
            stdout: Some(String::new()),
            exit_code: Some(0),
        })
    }
}

/// Judge that returns queued results in order and logs every criteria text.
pub struct ScriptedJudge {
    results: RefCell<VecDeque<JudgeResult>>,
    log: EventLog,
    criteria: Rc<RefCell<Vec<String>>>,
    transcripts: Rc<RefCell<Vec<Vec<String>>>>,
}

impl ScriptedJudge {
    pub fn new(log: EventLog, results: impl IntoIterator<Item = JudgeResult>) -> Self {
        Self {
            results: RefCell::new(results.into_iter().collect()),
            log,
            criteria: Rc::new(RefCell::new(Vec::new())),
            transcripts: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Handle to the criteria the judge has seen.
    pub fn criteria(&self) -> Rc<RefCell<Vec<String>>> {
        Rc::clone(&self.criteria)
    }

    /// Handle to the command names of each transcript the judge was shown.
    pub fn transcripts(&self) -> Rc<RefCell<Vec<Vec<String>>>> {
        Rc::clone(&self.transcripts)
    }
}

impl Judge for ScriptedJudge {
    fn label(&self, model_override: Option<&str>) -> String {
        model_override.unwrap_or("scripted").to_string()
    }

    fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeResult> {
        self.log.borrow_mut().push("judge".to_string());
        self.criteria
            .borrow_mut()
            .push(request.criteria.to_string());
        self.transcripts.borrow_mut().push(
            request
                .commands
                .iter()
                .map(|command| command.name.clone())
                .collect(),
        );
        self.results
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted judge has no results left"))
    }
}
