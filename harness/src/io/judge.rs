//! Judges: score criteria against captured context.
//!
//! [`ModelJudge`] asks a structured-output model and trusts the object it
//! gets back. [`CliJudge`] runs an external command and extracts the verdict
//! from its stdout, retrying only when the output itself is unusable.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::extract::{extract_judge_result, judge_output_schema};
use crate::core::template::substitute_prompt;
use crate::core::types::{CommandResult, JudgeResult};
use crate::io::model::{ModelCaller, ModelRequest};
use crate::io::process::{run_command_with_timeout, shell};
use crate::io::prompt::build_judge_prompt;

pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Everything a judge sees for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub criteria: &'a str,
    pub diff: &'a str,
    pub commands: &'a [CommandResult],
    pub model: Option<&'a str>,
    pub expected_files: Option<&'a [String]>,
    pub cwd: &'a Path,
}

impl JudgeRequest<'_> {
    fn prompt(&self) -> Result<String> {
        build_judge_prompt(self.criteria, self.diff, self.commands, self.expected_files)
    }
}

pub trait Judge {
    /// Identifier recorded as the ledger's `judge_model`.
    fn label(&self, model_override: Option<&str>) -> String;

    fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeResult>;
}

pub struct ModelJudge {
    caller: Box<dyn ModelCaller>,
}

impl ModelJudge {
    pub fn new(caller: Box<dyn ModelCaller>) -> Self {
        Self { caller }
    }
}

impl Judge for ModelJudge {
    fn label(&self, model_override: Option<&str>) -> String {
        self.caller.label(model_override)
    }

    #[instrument(skip_all, fields(model = ?request.model))]
    fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeResult> {
        let prompt = request.prompt()?;
        let value = self.caller.generate_object(&ModelRequest {
            prompt: &prompt,
            schema: judge_output_schema(),
            model: request.model,
            cwd: request.cwd,
        })?;
        let result: JudgeResult =
            serde_json::from_value(value).context("parse judge verdict from model")?;
        debug!(score = result.score, "model judge verdict");
        Ok(result)
    }
}

/// Judge backed by an external command.
#[derive(Debug, Clone)]
pub struct CliJudge {
    template: String,
    max_retries: u32,
    timeout: Duration,
    output_limit_bytes: usize,
    model: Option<String>,
}

impl CliJudge {
    pub fn new(
        template: impl Into<String>,
        max_retries: u32,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            template: template.into(),
            max_retries,
            timeout,
            output_limit_bytes,
            model: None,
        }
    }

    /// Label recorded in the ledger instead of `cli`.
    pub fn with_model_label(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

impl Judge for CliJudge {
    fn label(&self, model_override: Option<&str>) -> String {
        model_override
            .or(self.model.as_deref())
            .unwrap_or("cli")
            .to_string()
    }

    #[instrument(skip_all, fields(max_retries = self.max_retries, timeout_secs = self.timeout.as_secs()))]
    fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeResult> {
        let prompt = request.prompt()?;
        let mut prompt_file = tempfile::Builder::new()
            .prefix("harness-judge-")
            .suffix(".md")
            .tempfile()
            .context("create judge prompt file")?;
        prompt_file
            .write_all(prompt.as_bytes())
            .context("write judge prompt file")?;
        prompt_file.flush().context("flush judge prompt file")?;
        let command = substitute_prompt(&self.template, &prompt, prompt_file.path());

        let attempts = self.max_retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            info!(attempt, attempts, "running judge command");
            let output = run_command_with_timeout(
                shell(&command, request.cwd),
                None,
                self.timeout,
                self.output_limit_bytes,
            )
            .context("run judge command")?;

            // Execution failures are final; only unusable output is retried.
            if output.timed_out {
                bail!("judge command timed out after {}s", self.timeout.as_secs());
            }
            if !output.status.success() {
                bail!(
                    "judge command exited with {:?}: {}",
                    output.status.code(),
                    output.stderr_text().trim()
                );
            }

            match extract_judge_result(&output.stdout_text()) {
                Ok(result) => {
                    debug!(attempt, score = result.score, "judge verdict extracted");
                    return Ok(result);
                }
                Err(err) => {
                    warn!(attempt, err = %err, "judge output rejected");
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.ok_or_else(|| anyhow!("judge command was never run"))?;
        Err(anyhow::Error::new(err).context(format!(
            "judge output rejected after {attempts} attempt{}",
            if attempts == 1 { "" } else { "s" }
        )))
    }
}
