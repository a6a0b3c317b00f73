//! Shared deterministic types for scoring and command transcripts.
//!
//! These types are the contract between the pipeline, the judge and the
//! ledger. They carry no I/O and serialize in the camelCase shape the
//! dashboard reads.

use serde::{Deserialize, Serialize};

/// Graded outcome of a judged iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Warn,
    Fail,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pass => "PASS",
            Status::Warn => "WARN",
            Status::Fail => "FAIL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PASS" => Some(Status::Pass),
            "WARN" => Some(Status::Warn),
            "FAIL" => Some(Status::Fail),
            _ => None,
        }
    }

    /// `pass` is true for everything except `FAIL`.
    pub fn is_pass(self) -> bool {
        self != Status::Fail
    }
}

/// Score cutoffs mapping a continuous score to PASS/WARN/FAIL.
///
/// The field names are historical: `warn` is the PASS cutoff and `fail` is
/// the WARN cutoff. Persisted ledgers and config files use these names, so
/// they stay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warn: f64,
    pub fail: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warn: 0.8,
            fail: 0.5,
        }
    }
}

impl Thresholds {
    /// `score >= warn` is PASS, `score >= fail` is WARN, anything else FAIL.
    pub fn status_for(&self, score: f64) -> Status {
        if score >= self.warn {
            Status::Pass
        } else if score >= self.fail {
            Status::Warn
        } else {
            Status::Fail
        }
    }

    /// Per-call thresholds win over global ones, which win over defaults.
    pub fn resolve(per_call: Option<Thresholds>, global: Option<Thresholds>) -> Thresholds {
        per_call.or(global).unwrap_or_default()
    }

    /// Returns stable error messages (empty when valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (label, value) in [("warn", self.warn), ("fail", self.fail)] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("thresholds.{label} must be within [0, 1] (got {value})"));
            }
        }
        if self.fail > self.warn {
            errors.push(format!(
                "thresholds.fail ({}) must not exceed thresholds.warn ({})",
                self.fail, self.warn
            ));
        }
        errors
    }
}

/// One executed command, captured in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub name: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed (timeout or signal).
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Raw verdict returned by a judge, before thresholds are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    pub score: f64,
    pub reason: String,
    pub improvement: String,
}

/// A judge verdict graded against the thresholds in effect for the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub score: f64,
    pub status: Status,
    pub pass: bool,
    pub reason: String,
    pub improvement: String,
    pub thresholds: Thresholds,
}

impl Verdict {
    pub fn grade(result: JudgeResult, thresholds: Thresholds) -> Self {
        let status = thresholds.status_for(result.score);
        Self {
            score: result.score,
            status,
            pass: status.is_pass(),
            reason: result.reason,
            improvement: result.improvement,
            thresholds,
        }
    }

    /// A zero-score FAIL carrying `reason`.
    pub fn failed(reason: impl Into<String>, thresholds: Thresholds) -> Self {
        Self {
            score: 0.0,
            status: Status::Fail,
            pass: false,
            reason: reason.into(),
            improvement: String::new(),
            thresholds,
        }
    }
}
