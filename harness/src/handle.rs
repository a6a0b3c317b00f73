//! The agent handle a test body drives, and the context it accumulates.
//!
//! A handle starts `Unstarted`. The first `run()` makes it imperative: the
//! agent runs immediately and the body judges the result itself. The first
//! `instruct()` makes it declarative: the body only registers an instruction
//! and tasks, and the pipeline runs everything after the body returns. Both
//! modes are terminal.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::types::{CommandResult, JudgeResult, Status, Thresholds, Verdict};
use crate::dsl::{TaskDefinition, TaskEnv};
use crate::io::agent::{AgentOutput, AgentRunner, RunnerContext};
use crate::io::environment::{Environment, run_recorded};
use crate::io::judge::{Judge, JudgeRequest};
use crate::io::prompt::{TaskOutcome, build_task_criteria};
use crate::pipeline::RunSettings;

/// Per-test judge settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeOptions {
    pub thresholds: Option<Thresholds>,
    /// Model override passed to the judge.
    pub model: Option<String>,
    /// Files the agent is expected to touch; enables file scope analysis.
    pub expected_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Unstarted,
    Imperative,
    Declarative,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Unstarted => "unstarted",
            Mode::Imperative => "imperative",
            Mode::Declarative => "declarative",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("instruct() may only be called once per test")]
    SecondInstruct,
    #[error("{attempted}() cannot be used once the test is in {mode} mode")]
    MixedModes {
        attempted: &'static str,
        mode: &'static str,
    },
}

/// Raised by [`AgentHandle::judge`] when the verdict is FAIL.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("judge assertion failed with score {score:.2}: {reason}")]
pub struct JudgeAssertionError {
    pub score: f64,
    pub status: Status,
    pub reason: String,
    pub improvement: String,
}

/// Everything captured during one iteration.
#[derive(Debug, Clone, Default)]
pub struct TestContext {
    /// Every command run after the agent, in execution order.
    pub commands: Vec<CommandResult>,
    pub diff: String,
    pub agent_output: Option<AgentOutput>,
    verdict: Option<Verdict>,
}

impl TestContext {
    /// Verdict stashed by the last successful or failed `judge()` call.
    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    pub(crate) fn take_verdict(&mut self) -> Option<Verdict> {
        self.verdict.take()
    }
}

/// A step recorded while dry-running a test body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "camelCase")]
pub enum PlanStep {
    Run { prompt: String },
    Instruct { prompt: String },
    Task { name: String, weight: f64, criteria: String },
    Exec { name: String, command: String },
    Judge { criteria: String },
}

/// Collaborators for a live iteration.
#[derive(Clone, Copy)]
pub(crate) struct Live<'a> {
    pub environment: &'a dyn Environment,
    pub runner: &'a dyn AgentRunner,
    pub judge: &'a dyn Judge,
    pub settings: &'a RunSettings,
}

enum Backend<'a> {
    Live(Live<'a>),
    Inert(Vec<PlanStep>),
}

pub struct AgentHandle<'a> {
    backend: Backend<'a>,
    options: &'a JudgeOptions,
    thresholds: Thresholds,
    mode: Mode,
    instruction: Option<String>,
    tasks: Vec<TaskDefinition>,
    ctx: TestContext,
}

impl<'a> AgentHandle<'a> {
    pub(crate) fn live(live: Live<'a>, options: &'a JudgeOptions) -> Self {
        let thresholds = Thresholds::resolve(options.thresholds, live.settings.thresholds);
        Self::with_backend(Backend::Live(live), options, thresholds)
    }

    /// Handle that records steps instead of executing them.
    pub(crate) fn inert(options: &'a JudgeOptions, global: Option<Thresholds>) -> Self {
        let thresholds = Thresholds::resolve(options.thresholds, global);
        Self::with_backend(Backend::Inert(Vec::new()), options, thresholds)
    }

    fn with_backend(backend: Backend<'a>, options: &'a JudgeOptions, thresholds: Thresholds) -> Self {
        Self {
            backend,
            options,
            thresholds,
            mode: Mode::Unstarted,
            instruction: None,
            tasks: Vec::new(),
            ctx: TestContext::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn context(&self) -> &TestContext {
        &self.ctx
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Run the agent now (imperative mode): agent, diff, then the global
    /// after-each commands.
    #[instrument(skip_all)]
    pub fn run(&mut self, prompt: &str) -> Result<AgentOutput> {
        if self.mode == Mode::Declarative {
            return Err(PolicyError::MixedModes {
                attempted: "run",
                mode: self.mode.as_str(),
            }
            .into());
        }
        self.mode = Mode::Imperative;
        let live = match &mut self.backend {
            Backend::Inert(steps) => {
                steps.push(PlanStep::Run {
                    prompt: prompt.to_string(),
                });
                return Ok(AgentOutput::default());
            }
            Backend::Live(live) => *live,
        };
        let output = run_agent(live, &mut self.ctx, prompt)?;
        Ok(output)
    }

    /// Register the single instruction for a declarative test.
    pub fn instruct(&mut self, prompt: &str) -> Result<()> {
        match self.mode {
            Mode::Imperative => {
                return Err(PolicyError::MixedModes {
                    attempted: "instruct",
                    mode: self.mode.as_str(),
                }
                .into());
            }
            Mode::Declarative => return Err(PolicyError::SecondInstruct.into()),
            Mode::Unstarted => {}
        }
        self.mode = Mode::Declarative;
        self.instruction = Some(prompt.to_string());
        if let Backend::Inert(steps) = &mut self.backend {
            steps.push(PlanStep::Instruct {
                prompt: prompt.to_string(),
            });
        }
        Ok(())
    }

    /// Register a task to run (in registration order) after the agent.
    pub fn task(&mut self, task: TaskDefinition) -> Result<()> {
        if self.mode == Mode::Imperative {
            return Err(PolicyError::MixedModes {
                attempted: "task",
                mode: self.mode.as_str(),
            }
            .into());
        }
        if !task.weight.is_finite() || task.weight < 0.0 {
            bail!(
                "task {:?} has invalid weight {} (must be >= 0)",
                task.name,
                task.weight
            );
        }
        if let Backend::Inert(steps) = &mut self.backend {
            steps.push(PlanStep::Task {
                name: task.name.clone(),
                weight: task.weight,
                criteria: task.criteria.clone(),
            });
        }
        self.tasks.push(task);
        Ok(())
    }

    /// Run a shell command in the environment and add it to the transcript.
    pub fn exec(&mut self, name: &str, command: &str) -> Result<CommandResult> {
        let live = match &mut self.backend {
            Backend::Inert(steps) => {
                steps.push(PlanStep::Exec {
                    name: name.to_string(),
                    command: command.to_string(),
                });
                return Ok(CommandResult {
                    name: name.to_string(),
                    command: command.to_string(),
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: Some(0),
                    duration_ms: 0,
                });
            }
            Backend::Live(live) => *live,
        };
        let result = run_recorded(
            live.environment,
            name,
            command,
            &live.settings.cwd,
            live.settings.command_timeout,
        )?;
        self.ctx.commands.push(result.clone());
        Ok(result)
    }

    /// Judge the captured context against `criteria`.
    ///
    /// The verdict is stashed on the context either way; a FAIL verdict is
    /// returned as a [`JudgeAssertionError`].
    #[instrument(skip_all)]
    pub fn judge(&mut self, criteria: &str) -> Result<Verdict> {
        let live = match &mut self.backend {
            Backend::Inert(steps) => {
                steps.push(PlanStep::Judge {
                    criteria: criteria.to_string(),
                });
                return Ok(Verdict::grade(
                    JudgeResult {
                        pass: true,
                        status: None,
                        score: 1.0,
                        reason: "dry run".to_string(),
                        improvement: String::new(),
                    },
                    self.thresholds,
                ));
            }
            Backend::Live(live) => *live,
        };
        let verdict = judge_context(
            live,
            &self.ctx.diff,
            &self.ctx.commands,
            self.options,
            self.thresholds,
            criteria,
        )?;
        self.ctx.verdict = Some(verdict.clone());
        if verdict.status == Status::Fail {
            return Err(JudgeAssertionError {
                score: verdict.score,
                status: verdict.status,
                reason: verdict.reason.clone(),
                improvement: verdict.improvement.clone(),
            }
            .into());
        }
        Ok(verdict)
    }

    /// Steps recorded by an inert handle.
    pub(crate) fn into_plan(self) -> (Mode, Vec<PlanStep>) {
        match self.backend {
            Backend::Inert(steps) => (self.mode, steps),
            Backend::Live(_) => (self.mode, Vec::new()),
        }
    }

    pub(crate) fn into_context(self) -> TestContext {
        self.ctx
    }

    /// Produce the iteration verdict once the body has returned.
    pub(crate) fn conclude(&mut self) -> Result<Verdict> {
        match self.mode {
            Mode::Declarative => self.finish_declarative(),
            Mode::Imperative | Mode::Unstarted => Ok(self
                .ctx
                .take_verdict()
                .unwrap_or_else(|| Verdict::failed("Test completed without judge evaluation", self.thresholds))),
        }
    }

    /// Declarative tail: agent, diff, after-each commands, tasks, then the
    /// weighted judge (or the stashed verdict, or FAIL).
    #[instrument(skip_all, fields(tasks = self.tasks.len()))]
    fn finish_declarative(&mut self) -> Result<Verdict> {
        let Backend::Live(live) = &self.backend else {
            bail!("declarative tests cannot be concluded during a dry run");
        };
        let live = *live;
        let instruction = self
            .instruction
            .clone()
            .context("declarative test has no instruction")?;
        run_agent(live, &mut self.ctx, &instruction)?;

        let task_env = TaskEnv {
            environment: live.environment,
            cwd: &live.settings.cwd,
            timeout: live.settings.command_timeout,
        };
        // Task output reaches the judge through the weighted criteria only.
        let transcript_len = self.ctx.commands.len();
        let mut results = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            info!(task = %task.name, "running task");
            let result = (task.action)(&task_env).with_context(|| format!("task {}", task.name))?;
            self.ctx.commands.push(result.clone());
            results.push(result);
        }

        if !self.tasks.is_empty() {
            let outcomes: Vec<TaskOutcome<'_>> = self
                .tasks
                .iter()
                .zip(&results)
                .map(|(task, result)| TaskOutcome {
                    name: &task.name,
                    weight: task.weight,
                    criteria: &task.criteria,
                    result,
                })
                .collect();
            let criteria = build_task_criteria(&instruction, &outcomes)?;
            let verdict = judge_context(
                live,
                &self.ctx.diff,
                &self.ctx.commands[..transcript_len],
                self.options,
                self.thresholds,
                &criteria,
            )?;
            self.ctx.verdict = Some(verdict.clone());
            return Ok(verdict);
        }

        Ok(self.ctx.take_verdict().unwrap_or_else(|| {
            Verdict::failed(
                "Test completed without tasks or judge evaluation",
                self.thresholds,
            )
        }))
    }
}

fn run_agent(live: Live<'_>, ctx: &mut TestContext, prompt: &str) -> Result<AgentOutput> {
    let cwd: &Path = &live.settings.cwd;
    let output = live.runner.execute(
        prompt,
        &RunnerContext {
            cwd,
            environment: live.environment,
            timeout: live.settings.agent_timeout,
        },
    )?;
    ctx.diff = live.environment.diff(cwd).context("capture diff")?;
    debug!(diff_bytes = ctx.diff.len(), "agent finished");
    for (index, command) in live.settings.after_each.iter().enumerate() {
        let name = format!("after_each[{index}]");
        let result = run_recorded(
            live.environment,
            &name,
            command,
            cwd,
            live.settings.command_timeout,
        )?;
        ctx.commands.push(result);
    }
    ctx.agent_output = Some(output.clone());
    Ok(output)
}

fn judge_context(
    live: Live<'_>,
    diff: &str,
    commands: &[CommandResult],
    options: &JudgeOptions,
    thresholds: Thresholds,
    criteria: &str,
) -> Result<Verdict> {
    let result = live.judge.judge(&JudgeRequest {
        criteria,
        diff,
        commands,
        model: options.model.as_deref(),
        expected_files: options.expected_files.as_deref(),
        cwd: &live.settings.cwd,
    })?;
    let verdict = Verdict::grade(result, thresholds);
    info!(score = verdict.score, status = verdict.status.as_str(), "judged");
    Ok(verdict)
}
