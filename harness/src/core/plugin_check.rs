//! Structural validation of plugin tables in `harness.toml`.
//!
//! Runs on the raw TOML table before typed deserialization so a broken
//! config produces one report listing every problem instead of failing on
//! the first serde error.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;
use toml::{Table, Value};

use crate::core::template::{COMMAND, has_prompt_placeholder};

/// One missing or mistyped member of a plugin table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginViolation {
    pub plugin: String,
    pub member: String,
    pub expected_kind: String,
    pub message: String,
}

impl fmt::Display for PluginViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}: expected {}: {}",
            self.plugin, self.member, self.expected_kind, self.message
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct PluginValidationError {
    pub violations: Vec<PluginViolation>,
}

impl fmt::Display for PluginValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plugin configuration is invalid ({} problem{})",
            self.violations.len(),
            if self.violations.len() == 1 { "" } else { "s" }
        )?;
        for (index, violation) in self.violations.iter().enumerate() {
            write!(f, "\n  {}. {violation}", index + 1)?;
        }
        Ok(())
    }
}

/// Check the `environment`, `ledger`, `judge` and `runners` tables.
pub fn check_plugins(config: &Table) -> Result<(), PluginValidationError> {
    let mut report = Report::default();
    if let Some(value) = config.get("environment") {
        check_environment(&mut report, value);
    }
    if let Some(value) = config.get("ledger") {
        check_ledger(&mut report, value);
    }
    if let Some(value) = config.get("judge") {
        check_judge(&mut report, value);
    }
    if let Some(value) = config.get("runners") {
        check_runners(&mut report, value);
    }
    if report.violations.is_empty() {
        Ok(())
    } else {
        Err(PluginValidationError {
            violations: report.violations,
        })
    }
}

#[derive(Default)]
struct Report {
    violations: Vec<PluginViolation>,
}

impl Report {
    fn push(&mut self, plugin: &str, member: &str, expected_kind: &str, message: impl Into<String>) {
        self.violations.push(PluginViolation {
            plugin: plugin.to_string(),
            member: member.to_string(),
            expected_kind: expected_kind.to_string(),
            message: message.into(),
        });
    }

    fn table<'a>(&mut self, plugin: &str, value: &'a Value) -> Option<&'a Table> {
        match value.as_table() {
            Some(table) => Some(table),
            None => {
                self.push(plugin, "*", "table", format!("got {}", value.type_str()));
                None
            }
        }
    }

    /// Optional string member; reports a violation when present with the wrong type.
    fn opt_str<'a>(&mut self, plugin: &str, table: &'a Table, member: &str) -> Option<&'a str> {
        match table.get(member) {
            None => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(other) => {
                self.push(plugin, member, "string", format!("got {}", other.type_str()));
                None
            }
        }
    }

    fn required_str<'a>(&mut self, plugin: &str, table: &'a Table, member: &str) -> Option<&'a str> {
        if !table.contains_key(member) {
            self.push(plugin, member, "string", "missing required member");
            return None;
        }
        let value = self.opt_str(plugin, table, member)?;
        if value.trim().is_empty() {
            self.push(plugin, member, "non-empty string", "value is blank");
            return None;
        }
        Some(value)
    }

    fn opt_integer(&mut self, plugin: &str, table: &Table, member: &str, min: i64) {
        match table.get(member) {
            None => {}
            Some(Value::Integer(n)) if *n >= min => {}
            Some(Value::Integer(n)) => self.push(
                plugin,
                member,
                &format!("integer >= {min}"),
                format!("got {n}"),
            ),
            Some(other) => self.push(
                plugin,
                member,
                &format!("integer >= {min}"),
                format!("got {}", other.type_str()),
            ),
        }
    }
}

fn check_environment(report: &mut Report, value: &Value) {
    const PLUGIN: &str = "environment";
    let Some(table) = report.table(PLUGIN, value) else {
        return;
    };
    match report.opt_str(PLUGIN, table, "kind").unwrap_or("git") {
        "git" => {}
        "command" => {
            if let Some(exec) = report.required_str(PLUGIN, table, "exec")
                && !exec.contains(COMMAND)
            {
                report.push(
                    PLUGIN,
                    "exec",
                    "string containing {{command}}",
                    "exec template has no {{command}} placeholder",
                );
            }
            report.required_str(PLUGIN, table, "diff");
            report.opt_str(PLUGIN, table, "setup");
            report.opt_str(PLUGIN, table, "teardown");
        }
        other => report.push(
            PLUGIN,
            "kind",
            "\"git\" or \"command\"",
            format!("unknown environment kind {other:?}"),
        ),
    }
}

fn check_ledger(report: &mut Report, value: &Value) {
    const PLUGIN: &str = "ledger";
    let Some(table) = report.table(PLUGIN, value) else {
        return;
    };
    if let Some(kind) = report.opt_str(PLUGIN, table, "kind")
        && kind != "sqlite"
    {
        report.push(
            PLUGIN,
            "kind",
            "\"sqlite\"",
            format!("unknown ledger kind {kind:?}"),
        );
    }
    report.opt_str(PLUGIN, table, "file");
}

fn check_judge(report: &mut Report, value: &Value) {
    const PLUGIN: &str = "judge";
    let Some(table) = report.table(PLUGIN, value) else {
        return;
    };
    report.opt_integer(PLUGIN, table, "max_retries", 0);
    report.opt_integer(PLUGIN, table, "timeout_secs", 1);

    if table.contains_key("command") {
        if let Some(command) = report.required_str(PLUGIN, table, "command")
            && !has_prompt_placeholder(command)
        {
            report.push(
                PLUGIN,
                "command",
                "string containing {{prompt}} or {{prompt_file}}",
                "judge command has no prompt placeholder",
            );
        }
        return;
    }

    // Provider + model is a plain judge config, not a plugin.
    let provider = report.opt_str(PLUGIN, table, "provider");
    let model = report.opt_str(PLUGIN, table, "model");
    match (provider, model) {
        (Some(_), Some(_)) => {}
        (Some(_), None) => report.push(PLUGIN, "model", "string", "provider set without model"),
        (None, _) => report.push(
            PLUGIN,
            "command",
            "string",
            "judge needs either command or provider + model",
        ),
    }
}

fn check_runners(report: &mut Report, value: &Value) {
    let Some(runners) = value.as_array() else {
        report.push(
            "runners",
            "*",
            "array of tables",
            format!("got {}", value.type_str()),
        );
        return;
    };
    let mut names = BTreeSet::new();
    for (index, runner) in runners.iter().enumerate() {
        let plugin = format!("runners[{index}]");
        let Some(table) = report.table(&plugin, runner) else {
            continue;
        };
        if let Some(name) = report.required_str(&plugin, table, "name")
            && !names.insert(name.to_string())
        {
            report.push(
                &plugin,
                "name",
                "unique string",
                format!("duplicate runner name {name:?}"),
            );
        }
        let command = report.opt_str(&plugin, table, "command");
        let model = report.opt_str(&plugin, table, "model");
        report.opt_str(&plugin, table, "provider");
        match (command, model) {
            (Some(command), None) => {
                if !has_prompt_placeholder(command) {
                    report.push(
                        &plugin,
                        "command",
                        "string containing {{prompt}} or {{prompt_file}}",
                        "runner command has no prompt placeholder",
                    );
                }
            }
            (None, Some(_)) => {}
            (Some(_), Some(_)) => report.push(
                &plugin,
                "command",
                "exactly one of command or model",
                "both command and model are set",
            ),
            (None, None) => {
                if !table.contains_key("command") && !table.contains_key("model") {
                    report.push(
                        &plugin,
                        "command",
                        "exactly one of command or model",
                        "neither command nor model is set",
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Table {
        toml::from_str(source).expect("toml")
    }

    #[test]
    fn accepts_plain_judge_config_and_git_environment() {
        let config = parse(
            r#"
            [environment]
            kind = "git"

            [judge]
            provider = "codex"
            model = "gpt-5"

            [[runners]]
            name = "claude"
            command = "claude -p {{prompt}}"
            "#,
        );
        assert_eq!(check_plugins(&config), Ok(()));
    }

    #[test]
    fn accepts_empty_config() {
        assert_eq!(check_plugins(&Table::new()), Ok(()));
    }

    #[test]
    fn accumulates_every_violation() {
        let config = parse(
            r#"
            [environment]
            kind = "command"
            exec = "docker exec box sh -c"

            [judge]
            command = "judge --fast"
            max_retries = -1

            [[runners]]
            name = "a"
            command = "agent {{prompt}}"
            model = "gpt-5"

            [[runners]]
            name = "a"
            "#,
        );
        let err = check_plugins(&config).unwrap_err();
        let members: Vec<(String, String)> = err
            .violations
            .iter()
            .map(|v| (v.plugin.clone(), v.member.clone()))
            .collect();
        assert!(members.contains(&("environment".to_string(), "exec".to_string())));
        assert!(members.contains(&("environment".to_string(), "diff".to_string())));
        assert!(members.contains(&("judge".to_string(), "max_retries".to_string())));
        assert!(members.contains(&("judge".to_string(), "command".to_string())));
        assert!(members.contains(&("runners[0]".to_string(), "command".to_string())));
        assert!(members.contains(&("runners[1]".to_string(), "name".to_string())));
        assert!(members.contains(&("runners[1]".to_string(), "command".to_string())));
        assert_eq!(err.violations.len(), 7);
    }

    #[test]
    fn report_is_numbered() {
        let config = parse(
            r#"
            [ledger]
            kind = "postgres"

            [judge]
            temperature = 0.2
            "#,
        );
        let err = check_plugins(&config).unwrap_err();
        let report = err.to_string();
        assert!(report.starts_with("plugin configuration is invalid (2 problems)"));
        assert!(report.contains("\n  1. ledger.kind"));
        assert!(report.contains("\n  2. judge.command"));
    }

    #[test]
    fn wrong_types_are_reported_with_kind() {
        let config = parse(
            r#"
            runners = "claude"
            environment = 3
            "#,
        );
        let err = check_plugins(&config).unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert_eq!(err.violations[0].expected_kind, "table");
        assert_eq!(err.violations[1].expected_kind, "array of tables");
    }
}
