//! Prompt builders for judges and model runners.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::scope::FileScope;
use crate::core::types::CommandResult;

const JUDGE_TEMPLATE: &str = include_str!("prompts/judge.md");
const TASKS_TEMPLATE: &str = include_str!("prompts/tasks.md");
const AGENT_EDIT_TEMPLATE: &str = include_str!("prompts/agent_edit.md");

/// Per-stream cap for command output quoted in a judge prompt.
const COMMAND_OUTPUT_CHARS: usize = 4_000;
/// Cap for a task's combined output in the weighted task criteria.
const TASK_OUTPUT_CHARS: usize = 2_000;

/// A declarative task after its action ran.
#[derive(Debug, Clone)]
pub struct TaskOutcome<'a> {
    pub name: &'a str,
    pub weight: f64,
    pub criteria: &'a str,
    pub result: &'a CommandResult,
}

#[derive(Debug, Serialize)]
struct CommandView {
    name: String,
    command: String,
    exit: String,
    stdout: String,
    stderr: String,
}

impl CommandView {
    fn from_result(result: &CommandResult) -> Self {
        Self {
            name: result.name.clone(),
            command: result.command.clone(),
            exit: exit_label(result.exit_code),
            stdout: truncate(result.stdout.trim_end(), COMMAND_OUTPUT_CHARS),
            stderr: truncate(result.stderr.trim_end(), COMMAND_OUTPUT_CHARS),
        }
    }
}

#[derive(Debug, Serialize)]
struct TaskView {
    name: String,
    weight: f64,
    criteria: String,
    exit: String,
    output: String,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("judge", JUDGE_TEMPLATE)
            .expect("judge template should be valid");
        env.add_template("tasks", TASKS_TEMPLATE)
            .expect("tasks template should be valid");
        env.add_template("agent_edit", AGENT_EDIT_TEMPLATE)
            .expect("agent edit template should be valid");
        Self { env }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let rendered = self.env.get_template(name)?.render(ctx)?;
        debug!(template = name, chars = rendered.len(), "rendered prompt");
        Ok(rendered)
    }
}

/// Judge prompt: criteria, the diff, the command transcript and, when
/// expected files are given, a file scope analysis.
pub fn build_judge_prompt(
    criteria: &str,
    diff: &str,
    commands: &[CommandResult],
    expected_files: Option<&[String]>,
) -> Result<String> {
    let commands: Vec<CommandView> = commands.iter().map(CommandView::from_result).collect();
    let scope = expected_files.map(|expected| FileScope::analyze(expected, diff));
    PromptEngine::new().render(
        "judge",
        context! {
            criteria => criteria.trim(),
            diff => diff.trim_end(),
            commands => commands,
            scope => scope,
        },
    )
}

/// Weighted criteria for a declarative test, fed to the judge as its criteria.
pub fn build_task_criteria(instruction: &str, tasks: &[TaskOutcome<'_>]) -> Result<String> {
    let tasks: Vec<TaskView> = tasks
        .iter()
        .map(|task| TaskView {
            name: task.name.to_string(),
            weight: task.weight,
            criteria: task.criteria.trim().to_string(),
            exit: exit_label(task.result.exit_code),
            output: truncate(&combined_output(task.result), TASK_OUTPUT_CHARS),
        })
        .collect();
    PromptEngine::new().render(
        "tasks",
        context! {
            instruction => instruction.trim(),
            tasks => tasks,
        },
    )
}

/// Prompt asking a model for structured file edits.
pub fn build_agent_edit_prompt(instruction: &str, cwd: &Path) -> Result<String> {
    PromptEngine::new().render(
        "agent_edit",
        context! {
            instruction => instruction.trim(),
            cwd => cwd.display().to_string(),
        },
    )
}

fn exit_label(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => code.to_string(),
        None => "killed".to_string(),
    }
}

fn combined_output(result: &CommandResult) -> String {
    let stdout = result.stdout.trim_end();
    let stderr = result.stderr.trim_end();
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n[stderr]\n{stderr}"),
    }
}

/// Keep the first `limit` characters, noting how many were dropped.
fn truncate(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit).collect();
    format!("{kept}\n[... truncated {} chars]", total - limit)
}
