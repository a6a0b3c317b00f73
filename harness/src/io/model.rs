//! Structured-output model calls.
//!
//! The [`ModelCaller`] trait decouples judges and runners from the model
//! backend (currently `codex exec`). Tests use scripted callers that return
//! predetermined objects without spawning processes.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// One structured-output request.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub prompt: &'a str,
    /// JSON Schema the returned object must satisfy.
    pub schema: &'a Value,
    /// Overrides the caller's default model.
    pub model: Option<&'a str>,
    pub cwd: &'a Path,
}

pub trait ModelCaller {
    /// Model identifier recorded in the ledger for `model_override`.
    fn label(&self, model_override: Option<&str>) -> String;

    fn generate_object(&self, request: &ModelRequest<'_>) -> Result<Value>;
}

/// Model caller that spawns `codex exec` with an output schema.
#[derive(Debug, Clone)]
pub struct CodexModel {
    default_model: Option<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CodexModel {
    pub fn new(default_model: Option<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            default_model,
            timeout,
            output_limit_bytes,
        }
    }
}

impl ModelCaller for CodexModel {
    fn label(&self, model_override: Option<&str>) -> String {
        match model_override.or(self.default_model.as_deref()) {
            Some(model) => model.to_string(),
            None => "codex".to_string(),
        }
    }

    #[instrument(skip_all, fields(model = ?request.model, timeout_secs = self.timeout.as_secs()))]
    fn generate_object(&self, request: &ModelRequest<'_>) -> Result<Value> {
        let scratch = tempfile::tempdir().context("create codex scratch dir")?;
        let schema_path = scratch.path().join("schema.json");
        let output_path = scratch.path().join("output.json");
        let schema = serde_json::to_string_pretty(request.schema).context("serialize schema")?;
        fs::write(&schema_path, schema)
            .with_context(|| format!("write schema {}", schema_path.display()))?;

        let mut cmd = Command::new("codex");
        cmd.arg("exec");
        if let Some(model) = request.model.or(self.default_model.as_deref()) {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("--sandbox")
            .arg("read-only")
            // Workspaces under evaluation are not always git repositories.
            .arg("--skip-git-repo-check")
            .arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&output_path)
            .arg("-")
            .current_dir(request.cwd);

        info!(cwd = %request.cwd.display(), "starting codex exec");
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run codex exec")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "codex exec timed out");
            return Err(anyhow!("codex exec timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
            return Err(anyhow!(
                "codex exec failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }

        let contents = fs::read_to_string(&output_path)
            .with_context(|| format!("read codex output {}", output_path.display()))?;
        let value: Value = serde_json::from_str(&contents).context("parse codex output")?;
        debug!("codex exec returned structured output");
        Ok(value)
    }
}
