//! Harness configuration stored in `harness.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::plugin_check::check_plugins;
use crate::core::types::Thresholds;
use crate::io::agent::{AgentRunner, CommandRunner, ModelRunner};
use crate::io::environment::{
    CommandEnvironment, Environment, EnvironmentCommands, GitEnvironment,
};
use crate::io::judge::{CliJudge, DEFAULT_MAX_RETRIES, Judge, ModelJudge};
use crate::io::ledger::{DEFAULT_LEDGER_FILE, SqliteLedger};
use crate::io::model::CodexModel;
use crate::pipeline::RunSettings;

pub const DEFAULT_CONFIG_FILE: &str = "harness.toml";
const SUPPORTED_PROVIDER: &str = "codex";

/// Harness configuration (TOML).
///
/// Missing fields default to values that work for a git repository with one
/// configured runner; relative paths resolve against the config file's directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Working tree the agents edit.
    pub workspace: PathBuf,

    /// Directory holding `ledger.db` and other run artifacts.
    pub output_dir: PathBuf,

    /// Directory scanned for `*.toml` case files.
    pub cases_dir: PathBuf,

    /// Commands run before every test body.
    pub before_each: Vec<String>,

    /// Commands run right after the agent, before tasks and judging.
    pub after_each: Vec<String>,

    /// Global thresholds; per-test thresholds take precedence.
    pub thresholds: Option<Thresholds>,

    pub timeouts: TimeoutConfig,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub judge: JudgeConfig,
    pub environment: EnvironmentConfig,
    pub ledger: LedgerConfig,
    pub runners: Vec<RunnerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub command_secs: u64,
    pub agent_secs: u64,
    pub judge_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: 120,
            agent_secs: 600,
            judge_secs: 300,
        }
    }
}

/// Either a CLI judge (`command`) or a model judge (`provider` + `model`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JudgeConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub command: Option<String>,
    pub max_retries: u32,
    /// Overrides `timeouts.judge_secs` for this judge.
    pub timeout_secs: Option<u64>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: Some(SUPPORTED_PROVIDER.to_string()),
            model: None,
            command: None,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// `git` or `command`.
    pub kind: String,
    pub setup: Option<String>,
    pub exec: Option<String>,
    pub diff: Option<String>,
    pub teardown: Option<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            kind: "git".to_string(),
            setup: None,
            exec: None,
            diff: None,
            teardown: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub kind: String,
    /// File name (or path) inside `output_dir`.
    pub file: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            file: PathBuf::from(DEFAULT_LEDGER_FILE),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerConfig {
    pub name: String,
    /// Agent CLI template with `{{prompt}}` or `{{prompt_file}}`.
    #[serde(default)]
    pub command: Option<String>,
    /// Model for a model-backed runner.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            output_dir: PathBuf::from(".harness"),
            cases_dir: PathBuf::from("harness/cases"),
            before_each: Vec::new(),
            after_each: Vec::new(),
            thresholds: None,
            timeouts: TimeoutConfig::default(),
            output_limit_bytes: 100_000,
            judge: JudgeConfig::default(),
            environment: EnvironmentConfig::default(),
            ledger: LedgerConfig::default(),
            runners: Vec::new(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if let Some(thresholds) = &self.thresholds {
            errors.extend(thresholds.validate());
        }
        for (label, secs) in [
            ("timeouts.command_secs", self.timeouts.command_secs),
            ("timeouts.agent_secs", self.timeouts.agent_secs),
            ("timeouts.judge_secs", self.timeouts.judge_secs),
        ] {
            if secs == 0 {
                errors.push(format!("{label} must be > 0"));
            }
        }
        if self.output_limit_bytes == 0 {
            errors.push("output_limit_bytes must be > 0".to_string());
        }
        for (index, command) in self.before_each.iter().enumerate() {
            if command.trim().is_empty() {
                errors.push(format!("before_each[{index}] must not be blank"));
            }
        }
        for (index, command) in self.after_each.iter().enumerate() {
            if command.trim().is_empty() {
                errors.push(format!("after_each[{index}] must not be blank"));
            }
        }
        let mut names = HashSet::new();
        for runner in &self.runners {
            if !names.insert(runner.name.as_str()) {
                errors.push(format!("duplicate runner name {:?}", runner.name));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(errors.join("; ")))
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.workspace,
            &mut self.output_dir,
            &mut self.cases_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.output_dir.join(&self.ledger.file)
    }

    pub fn open_ledger(&self) -> Result<SqliteLedger> {
        SqliteLedger::open(self.ledger_path())
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            cwd: self.workspace.clone(),
            before_each: self.before_each.clone(),
            after_each: self.after_each.clone(),
            thresholds: self.thresholds,
            command_timeout: Duration::from_secs(self.timeouts.command_secs),
            agent_timeout: Duration::from_secs(self.timeouts.agent_secs),
        }
    }

    pub fn build_environment(&self) -> Result<Box<dyn Environment>> {
        let env = &self.environment;
        match env.kind.as_str() {
            "git" => Ok(Box::new(GitEnvironment::new(self.output_limit_bytes))),
            "command" => {
                let commands = EnvironmentCommands {
                    setup: env.setup.clone(),
                    exec: env
                        .exec
                        .clone()
                        .ok_or_else(|| anyhow!("environment.exec is required"))?,
                    diff: env
                        .diff
                        .clone()
                        .ok_or_else(|| anyhow!("environment.diff is required"))?,
                    teardown: env.teardown.clone(),
                };
                Ok(Box::new(CommandEnvironment::new(
                    commands,
                    Duration::from_secs(self.timeouts.command_secs),
                    self.output_limit_bytes,
                )))
            }
            other => bail!("unknown environment kind {other:?}"),
        }
    }

    pub fn build_judge(&self) -> Result<Box<dyn Judge>> {
        let judge = &self.judge;
        let timeout = Duration::from_secs(judge.timeout_secs.unwrap_or(self.timeouts.judge_secs));
        if let Some(command) = &judge.command {
            return Ok(Box::new(
                CliJudge::new(
                    command.clone(),
                    judge.max_retries,
                    timeout,
                    self.output_limit_bytes,
                )
                .with_model_label(judge.model.clone()),
            ));
        }
        ensure_provider(judge.provider.as_deref(), "judge")?;
        Ok(Box::new(ModelJudge::new(Box::new(CodexModel::new(
            judge.model.clone(),
            timeout,
            self.output_limit_bytes,
        )))))
    }

    /// Runners in configuration order, optionally limited to `only`.
    pub fn build_runners(&self, only: Option<&str>) -> Result<Vec<Box<dyn AgentRunner>>> {
        let selected: Vec<&RunnerConfig> = self
            .runners
            .iter()
            .filter(|runner| only.is_none_or(|name| runner.name == name))
            .collect();
        if selected.is_empty() {
            match only {
                Some(name) => bail!("no runner named {name:?} is configured"),
                None => bail!("no runners configured; add a [[runners]] table"),
            }
        }
        let agent_timeout = Duration::from_secs(self.timeouts.agent_secs);
        selected
            .into_iter()
            .map(|runner| -> Result<Box<dyn AgentRunner>> {
                if let Some(command) = &runner.command {
                    return Ok(Box::new(CommandRunner::new(&runner.name, command)));
                }
                ensure_provider(runner.provider.as_deref(), &runner.name)?;
                // Model edits land on the host workspace, which a command
                // environment may not share.
                if self.environment.kind != "git" {
                    bail!(
                        "runner {:?}: model runners need environment.kind = \"git\"; \
                         configure a command template instead",
                        runner.name
                    );
                }
                Ok(Box::new(ModelRunner::new(
                    &runner.name,
                    runner.model.clone(),
                    Box::new(CodexModel::new(
                        runner.model.clone(),
                        agent_timeout,
                        self.output_limit_bytes,
                    )),
                )))
            })
            .collect()
    }
}

fn ensure_provider(provider: Option<&str>, owner: &str) -> Result<()> {
    match provider.unwrap_or(SUPPORTED_PROVIDER) {
        SUPPORTED_PROVIDER => Ok(()),
        other => bail!("{owner}: unsupported provider {other:?} (only {SUPPORTED_PROVIDER:?})"),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()` rooted at the
/// file's directory. Plugin tables are checked structurally before typed
/// parsing; a [`PluginValidationError`](crate::core::plugin_check::PluginValidationError)
/// stays downcastable through the returned error.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let mut cfg = HarnessConfig::default();
        cfg.validate()?;
        cfg.resolve_paths(&base);
        return Ok(cfg);
    }

    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let raw: toml::Table =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    check_plugins(&raw).with_context(|| format!("invalid plugins in {}", path.display()))?;
    let mut cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    cfg.resolve_paths(&base);
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plugin_check::PluginValidationError;

    fn write(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join(DEFAULT_CONFIG_FILE);
        fs::write(&path, contents).expect("write config");
        path
    }

    #[test]
    fn load_missing_returns_default_rooted_at_config_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg.output_dir, temp.path().join(".harness"));
        assert_eq!(cfg.timeouts, TimeoutConfig::default());
        assert_eq!(cfg.judge.max_retries, 2);
        assert!(cfg.runners.is_empty());
    }

    #[test]
    fn parses_full_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"
            workspace = "repo"
            before_each = ["npm ci"]
            after_each = ["npm run lint"]

            [thresholds]
            warn = 0.9
            fail = 0.6

            [timeouts]
            agent_secs = 900

            [judge]
            command = "claude -p {{prompt}}"
            model = "claude-sonnet"
            max_retries = 4

            [[runners]]
            name = "claude"
            command = "claude -p {{prompt}}"

            [[runners]]
            name = "codex"
            model = "gpt-5"
            "#,
        );
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.workspace, temp.path().join("repo"));
        assert_eq!(
            cfg.thresholds,
            Some(Thresholds {
                warn: 0.9,
                fail: 0.6
            })
        );
        assert_eq!(cfg.timeouts.agent_secs, 900);
        assert_eq!(cfg.timeouts.command_secs, 120);
        assert_eq!(cfg.judge.max_retries, 4);
        assert_eq!(cfg.build_judge().expect("judge").label(None), "claude-sonnet");

        let runners = cfg.build_runners(None).expect("runners");
        let names: Vec<&str> = runners.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["claude", "codex"]);
        let only = cfg.build_runners(Some("codex")).expect("runners");
        assert_eq!(only.len(), 1);
        assert!(cfg.build_runners(Some("missing")).is_err());

        let settings = cfg.run_settings();
        assert_eq!(settings.agent_timeout, Duration::from_secs(900));
        assert_eq!(settings.before_each, vec!["npm ci"]);
    }

    #[test]
    fn plugin_violations_surface_as_typed_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"
            [judge]
            command = "judge"

            [[runners]]
            command = "agent {{prompt}}"
            "#,
        );
        let err = load_config(&path).unwrap_err();
        let report = err
            .downcast_ref::<PluginValidationError>()
            .expect("plugin report");
        assert_eq!(report.violations.len(), 2);
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"
            [thresholds]
            warn = 0.4
            fail = 0.7
            "#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("must not exceed"));
    }

    #[test]
    fn duplicate_runner_names_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"
            [[runners]]
            name = "codex"
            command = "codex exec {{prompt}}"

            [[runners]]
            name = "codex"
            command = "codex exec --full-auto {{prompt}}"
            "#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate runner name \"codex\""));
    }

    #[test]
    fn model_runners_require_git_environment() {
        let cfg: HarnessConfig = toml::from_str(
            r#"
            [environment]
            kind = "command"
            exec = "docker exec box sh -c {{command}}"
            diff = "docker exec box git diff"

            [[runners]]
            name = "model"
            model = "gpt-5"

            [[runners]]
            name = "cli"
            command = "agent {{prompt}}"
            "#,
        )
        .expect("config");
        let err = cfg.build_runners(None).err().expect("model runner rejected");
        assert!(err.to_string().contains("environment.kind"));
        assert_eq!(cfg.build_runners(Some("cli")).expect("cli runner").len(), 1);
    }

    #[test]
    fn default_judge_is_model_judge() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.build_judge().expect("judge").label(None), "codex");
        assert!(cfg.build_runners(None).is_err());
    }

    #[test]
    fn unsupported_provider_is_an_error() {
        let mut cfg = HarnessConfig::default();
        cfg.judge.provider = Some("bedrock".to_string());
        cfg.judge.model = Some("m".to_string());
        let err = cfg.build_judge().err().expect("error");
        assert!(err.to_string().contains("unsupported provider"));
    }

    #[test]
    fn command_environment_is_built_from_config() {
        let mut cfg = HarnessConfig::default();
        cfg.environment = EnvironmentConfig {
            kind: "command".to_string(),
            setup: None,
            exec: Some("docker exec box sh -c {{command}}".to_string()),
            diff: Some("docker exec box git diff".to_string()),
            teardown: None,
        };
        assert_eq!(cfg.build_environment().expect("env").name(), "command");
    }
}
