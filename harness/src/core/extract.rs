//! Verdict extraction from free-form judge command output.
//!
//! CLI judges print whatever they like around the verdict: prose, markdown
//! fences, tool logs. Extraction strips fences, scans for balanced JSON
//! objects and validates the chosen one against the judge output schema.
//! Each failure kind maps to its own error variant so callers can decide
//! what to retry.

use std::sync::LazyLock;

use jsonschema::Validator;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::JudgeResult;

const JUDGE_OUTPUT_SCHEMA: &str = include_str!("../../schemas/judge_output.schema.json");
const PREVIEW_CHARS: usize = 120;

static SCHEMA_VALUE: LazyLock<Value> = LazyLock::new(|| {
    serde_json::from_str(JUDGE_OUTPUT_SCHEMA).expect("judge output schema should be valid JSON")
});

static SCHEMA_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    jsonschema::validator_for(&SCHEMA_VALUE).expect("judge output schema should compile")
});

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z0-9_-]*").expect("fence regex should be valid"));

/// Why a judge's output could not be turned into a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JudgeOutputError {
    #[error("judge output does not contain valid JSON (output starts with {preview:?})")]
    NoJson { preview: String },
    #[error("judge output contains malformed JSON: {message}")]
    Malformed { message: String },
    #[error("judge output failed schema validation: {}", .errors.join("; "))]
    Schema { errors: Vec<String> },
}

/// JSON Schema every verdict object must satisfy.
pub fn judge_output_schema() -> &'static Value {
    &SCHEMA_VALUE
}

/// Find, parse and validate the verdict object in `output`.
pub fn extract_judge_result(output: &str) -> Result<JudgeResult, JudgeOutputError> {
    let cleaned = FENCE_RE.replace_all(output, "");
    let scan = scan_objects(&cleaned);

    if scan.candidates.is_empty() {
        if scan.unterminated {
            return Err(JudgeOutputError::Malformed {
                message: "unterminated JSON object".to_string(),
            });
        }
        return Err(JudgeOutputError::NoJson {
            preview: output.trim().chars().take(PREVIEW_CHARS).collect(),
        });
    }

    let mut parsed = Vec::new();
    let mut first_error = None;
    for candidate in scan.candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) if value.is_object() => parsed.push(value),
            Ok(_) => {}
            Err(err) => {
                first_error.get_or_insert_with(|| err.to_string());
            }
        }
    }

    // Prefer the last object that looks like a verdict; judges often echo
    // other JSON (tool calls, configs) before the final answer.
    let chosen = parsed
        .iter()
        .rev()
        .find(|value| value.get("score").is_some())
        .or(parsed.last())
        .ok_or_else(|| JudgeOutputError::Malformed {
            message: first_error.unwrap_or_else(|| "no JSON object found".to_string()),
        })?;

    validate_verdict(chosen)?;
    serde_json::from_value(chosen.clone()).map_err(|err| JudgeOutputError::Schema {
        errors: vec![err.to_string()],
    })
}

/// Check a verdict object against the judge output schema.
pub fn validate_verdict(value: &Value) -> Result<(), JudgeOutputError> {
    let errors: Vec<String> = SCHEMA_VALIDATOR
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(JudgeOutputError::Schema { errors })
    }
}

struct ObjectScan<'a> {
    candidates: Vec<&'a str>,
    unterminated: bool,
}

/// Collect top-level balanced `{...}` substrings, string- and escape-aware.
fn scan_objects(text: &str) -> ObjectScan<'_> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();
    let mut unterminated = false;
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find('{') {
        let start = cursor + offset;
        match matching_brace(bytes, start) {
            Some(end) => {
                candidates.push(&text[start..=end]);
                cursor = end + 1;
            }
            None => {
                unterminated = true;
                cursor = start + 1;
            }
        }
    }
    ObjectScan {
        candidates,
        unterminated,
    }
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str =
        r#"{"pass": true, "score": 0.9, "reason": "looks right", "improvement": "none"}"#;

    #[test]
    fn extracts_bare_object() {
        let result = extract_judge_result(VALID).expect("extract");
        assert!(result.pass);
        assert_eq!(result.score, 0.9);
        assert_eq!(result.reason, "looks right");
    }

    #[test]
    fn extracts_from_fenced_block_with_prose() {
        let output = format!("Here is my evaluation:\n```json\n{VALID}\n```\nThanks!");
        let result = extract_judge_result(&output).expect("extract");
        assert_eq!(result.improvement, "none");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_scanner() {
        let output = r#"log {"pass": false, "score": 0.2, "reason": "missing } brace in fn main() {", "improvement": "add {}"}"#;
        let result = extract_judge_result(output).expect("extract");
        assert_eq!(result.reason, "missing } brace in fn main() {");
    }

    #[test]
    fn prefers_last_object_with_score() {
        let output = format!(r#"{{"tool": "read"}} then {VALID} and {{"done": true}}"#);
        let result = extract_judge_result(&output).expect("extract");
        assert_eq!(result.score, 0.9);
    }

    #[test]
    fn plain_text_is_no_json() {
        let err = extract_judge_result("no evaluation possible").unwrap_err();
        assert!(matches!(err, JudgeOutputError::NoJson { .. }));
        assert!(err.to_string().contains("does not contain valid JSON"));
    }

    #[test]
    fn unparseable_object_is_malformed() {
        let err = extract_judge_result("{pass: yes, score: high}").unwrap_err();
        assert!(matches!(err, JudgeOutputError::Malformed { .. }));
        assert!(err.to_string().contains("malformed JSON"));
    }

    #[test]
    fn truncated_object_is_malformed() {
        let err = extract_judge_result(r#"{"pass": true, "score": 0.4"#).unwrap_err();
        assert!(matches!(err, JudgeOutputError::Malformed { .. }));
    }

    #[test]
    fn out_of_range_score_fails_schema() {
        let output = r#"{"pass": true, "score": 1.5, "reason": "r", "improvement": "i"}"#;
        let err = extract_judge_result(output).unwrap_err();
        assert!(matches!(err, JudgeOutputError::Schema { .. }));
    }

    #[test]
    fn missing_field_fails_schema() {
        let output = r#"{"pass": true, "score": 0.5, "reason": "r"}"#;
        let err = extract_judge_result(output).unwrap_err();
        match err {
            JudgeOutputError::Schema { errors } => {
                assert!(errors.iter().any(|e| e.contains("improvement")));
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn extra_fields_fail_schema() {
        let output =
            r#"{"pass": true, "score": 0.5, "reason": "r", "improvement": "i", "mood": "ok"}"#;
        let err = extract_judge_result(output).unwrap_err();
        assert!(matches!(err, JudgeOutputError::Schema { .. }));
    }
}
