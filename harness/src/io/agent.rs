//! Agent runners: drive one coding agent with a natural-language instruction.

use std::fs;
use std::io::Write;
use std::path::{Component, Path};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::template::substitute_prompt;
use crate::io::environment::Environment;
use crate::io::model::{ModelCaller, ModelRequest};
use crate::io::prompt::build_agent_edit_prompt;

const AGENT_EDITS_SCHEMA: &str = include_str!("../../schemas/agent_edits.schema.json");

static AGENT_EDITS_SCHEMA_VALUE: LazyLock<Value> = LazyLock::new(|| {
    serde_json::from_str(AGENT_EDITS_SCHEMA).expect("agent edits schema should be valid JSON")
});

/// What a runner reports back. Every field is optional; runners report what they know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub files_written: Option<Vec<String>>,
    pub stdout: Option<String>,
    pub exit_code: Option<i32>,
}

/// Where and how long a runner may work.
#[derive(Clone, Copy)]
pub struct RunnerContext<'a> {
    pub cwd: &'a Path,
    pub environment: &'a dyn Environment,
    pub timeout: Duration,
}

pub trait AgentRunner {
    fn name(&self) -> &str;

    fn execute(&self, prompt: &str, ctx: &RunnerContext<'_>) -> Result<AgentOutput>;
}

/// Runner that shells out to an agent CLI through the environment.
///
/// The template receives the instruction via `{{prompt}}` (inline, quoted) or
/// `{{prompt_file}}` (path to a temporary file holding the instruction).
#[derive(Debug, Clone)]
pub struct CommandRunner {
    name: String,
    template: String,
}

impl CommandRunner {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
        }
    }
}

impl AgentRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(runner = %self.name, timeout_secs = ctx.timeout.as_secs()))]
    fn execute(&self, prompt: &str, ctx: &RunnerContext<'_>) -> Result<AgentOutput> {
        let mut prompt_file = tempfile::Builder::new()
            .prefix("harness-prompt-")
            .suffix(".md")
            .tempfile()
            .context("create prompt file")?;
        prompt_file
            .write_all(prompt.as_bytes())
            .context("write prompt file")?;
        prompt_file.flush().context("flush prompt file")?;

        let command = substitute_prompt(&self.template, prompt, prompt_file.path());
        info!("starting agent");
        let output = ctx
            .environment
            .execute(&command, ctx.cwd, ctx.timeout)
            .with_context(|| format!("run agent {}", self.name))?;

        if output.timed_out {
            warn!("agent timed out");
            bail!(
                "agent {} timed out after {}s",
                self.name,
                ctx.timeout.as_secs()
            );
        }
        if output.exit_code != Some(0) {
            warn!(exit_code = ?output.exit_code, "agent failed");
            bail!(
                "agent {} exited with {:?}: {}",
                self.name,
                output.exit_code,
                output.stderr.trim()
            );
        }
        debug!("agent finished");
        Ok(AgentOutput {
            files_written: None,
            stdout: Some(output.stdout),
            exit_code: output.exit_code,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AgentEdits {
    edits: Vec<FileEdit>,
    summary: String,
}

#[derive(Debug, Deserialize)]
struct FileEdit {
    path: String,
    contents: String,
}

/// Runner that asks a model for whole-file edits and writes them into the workspace.
pub struct ModelRunner {
    name: String,
    model: Option<String>,
    caller: Box<dyn ModelCaller>,
}

impl ModelRunner {
    pub fn new(name: impl Into<String>, model: Option<String>, caller: Box<dyn ModelCaller>) -> Self {
        Self {
            name: name.into(),
            model,
            caller,
        }
    }
}

impl AgentRunner for ModelRunner {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(runner = %self.name))]
    fn execute(&self, prompt: &str, ctx: &RunnerContext<'_>) -> Result<AgentOutput> {
        let instruction = build_agent_edit_prompt(prompt, ctx.cwd)?;
        let value = self.caller.generate_object(&ModelRequest {
            prompt: &instruction,
            schema: &AGENT_EDITS_SCHEMA_VALUE,
            model: self.model.as_deref(),
            cwd: ctx.cwd,
        })?;
        let edits: AgentEdits =
            serde_json::from_value(value).context("parse agent edits from model")?;

        let mut written = Vec::with_capacity(edits.edits.len());
        for edit in &edits.edits {
            write_edit(ctx.cwd, edit)?;
            written.push(edit.path.clone());
        }
        info!(files = written.len(), "model edits applied");
        Ok(AgentOutput {
            files_written: Some(written),
            stdout: Some(edits.summary),
            exit_code: Some(0),
        })
    }
}

fn write_edit(root: &Path, edit: &FileEdit) -> Result<()> {
    let relative = Path::new(&edit.path);
    let inside = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !inside || relative.as_os_str().is_empty() {
        return Err(anyhow!("edit path {:?} escapes the workspace", edit.path));
    }
    let target = root.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&target, &edit.contents).with_context(|| format!("write {}", target.display()))
}
