//! Execution environments: where agents and commands run.
//!
//! An [`Environment`] prepares an isolated workspace, executes shell commands
//! in it and reports what changed. [`GitEnvironment`] resets a shared git
//! working tree; [`CommandEnvironment`] delegates every step to configured
//! shell commands (containers, remote boxes).

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument};

use crate::core::template::substitute_command;
use crate::core::types::CommandResult;
use crate::io::git::Git;
use crate::io::process::{run_command_with_timeout, shell};

/// Output of one command executed inside an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the command was killed.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

pub trait Environment {
    fn name(&self) -> &str;

    /// Prepare `cwd` for a fresh iteration.
    fn setup(&self, cwd: &Path) -> Result<()>;

    fn execute(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutput>;

    /// Unified diff of everything changed since `setup`.
    fn diff(&self, cwd: &Path) -> Result<String>;

    fn teardown(&self, _cwd: &Path) -> Result<()> {
        Ok(())
    }
}

/// Execute `command` and record it as a [`CommandResult`] named `name`.
#[instrument(skip_all, fields(command = name))]
pub fn run_recorded(
    env: &dyn Environment,
    name: &str,
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandResult> {
    let started = Instant::now();
    let output = env
        .execute(command, cwd, timeout)
        .with_context(|| format!("execute command {name:?}"))?;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    debug!(exit_code = ?output.exit_code, duration_ms, "command recorded");
    let mut stderr = output.stderr;
    if output.timed_out {
        stderr.push_str(&format!("\n[timed out after {}s]\n", timeout.as_secs()));
    }
    Ok(CommandResult {
        name: name.to_string(),
        command: command.to_string(),
        stdout: output.stdout,
        stderr,
        exit_code: output.exit_code,
        duration_ms,
    })
}

/// Run `script` with `sh -c` on the host.
fn run_host(script: &str, cwd: &Path, timeout: Duration, output_limit: usize) -> Result<ExecOutput> {
    let output = run_command_with_timeout(shell(script, cwd), None, timeout, output_limit)?;
    Ok(ExecOutput {
        stdout: output.stdout_text(),
        stderr: output.stderr_text(),
        exit_code: output.exit_code(),
        timed_out: output.timed_out,
    })
}

/// Default environment: a git working tree reset before every iteration.
#[derive(Debug, Clone)]
pub struct GitEnvironment {
    output_limit_bytes: usize,
}

impl GitEnvironment {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }
}

impl Environment for GitEnvironment {
    fn name(&self) -> &str {
        "git"
    }

    #[instrument(skip_all, fields(cwd = %cwd.display()))]
    fn setup(&self, cwd: &Path) -> Result<()> {
        let git = Git::new(cwd);
        if !git.is_repo() {
            bail!("{} is not a git working tree", cwd.display());
        }
        git.reset_clean().context("reset working tree")
    }

    fn execute(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutput> {
        run_host(command, cwd, timeout, self.output_limit_bytes)
    }

    fn diff(&self, cwd: &Path) -> Result<String> {
        Git::new(cwd).diff_head()
    }
}

/// Shell commands backing a [`CommandEnvironment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentCommands {
    pub setup: Option<String>,
    /// Wrapper template; `{{command}}` receives the quoted command.
    pub exec: String,
    /// Prints the unified diff on stdout.
    pub diff: String,
    pub teardown: Option<String>,
}

/// Environment whose lifecycle is driven by configured shell commands.
#[derive(Debug, Clone)]
pub struct CommandEnvironment {
    commands: EnvironmentCommands,
    lifecycle_timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandEnvironment {
    pub fn new(
        commands: EnvironmentCommands,
        lifecycle_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            commands,
            lifecycle_timeout,
            output_limit_bytes,
        }
    }

    fn lifecycle(&self, step: &str, script: &str, cwd: &Path) -> Result<ExecOutput> {
        info!(step, "running environment command");
        let output = run_host(script, cwd, self.lifecycle_timeout, self.output_limit_bytes)
            .with_context(|| format!("environment {step}"))?;
        if output.timed_out {
            bail!(
                "environment {step} timed out after {}s",
                self.lifecycle_timeout.as_secs()
            );
        }
        if output.exit_code != Some(0) {
            bail!(
                "environment {step} exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

impl Environment for CommandEnvironment {
    fn name(&self) -> &str {
        "command"
    }

    fn setup(&self, cwd: &Path) -> Result<()> {
        if let Some(script) = &self.commands.setup {
            self.lifecycle("setup", script, cwd)?;
        }
        Ok(())
    }

    fn execute(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutput> {
        let wrapped = substitute_command(&self.commands.exec, command);
        run_host(&wrapped, cwd, timeout, self.output_limit_bytes)
    }

    fn diff(&self, cwd: &Path) -> Result<String> {
        Ok(self.lifecycle("diff", &self.commands.diff, cwd)?.stdout)
    }

    fn teardown(&self, cwd: &Path) -> Result<()> {
        if let Some(script) = &self.commands.teardown {
            self.lifecycle("teardown", script, cwd)?;
        }
        Ok(())
    }
}
