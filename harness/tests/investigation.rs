//! Investigation tests against the real Codex CLI.
//!
//! Excluded from regular runs: they need the `codex` binary on PATH and
//! working credentials.
//!
//! Run with: `cargo test -p harness --test investigation -- --ignored`

use std::process::Command;
use std::time::Duration;

use harness::io::judge::{Judge, JudgeRequest, ModelJudge};
use harness::io::model::CodexModel;

const CODEX_TIMEOUT: Duration = Duration::from_secs(180);

#[test]
#[ignore]
fn codex_cli_available() {
    let output = Command::new("codex")
        .arg("--version")
        .output()
        .expect("codex not in PATH");
    assert!(
        output.status.success(),
        "codex --version failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    println!("Codex CLI version: {}", String::from_utf8_lossy(&output.stdout).trim());
}

/// A model judge returns a schema-conforming verdict for an obvious diff.
#[test]
#[ignore]
fn model_judge_scores_an_obvious_diff() {
    let temp = tempfile::tempdir().expect("tempdir");
    let judge = ModelJudge::new(Box::new(CodexModel::new(None, CODEX_TIMEOUT, 100_000)));
    let diff = "diff --git a/hello.txt b/hello.txt\n\
                new file mode 100644\n\
                --- /dev/null\n\
                +++ b/hello.txt\n\
                @@ -0,0 +1 @@\n\
                +hello world\n";
    let expected = vec!["hello.txt".to_string()];

    let result = judge
        .judge(&JudgeRequest {
            criteria: "A file named hello.txt containing 'hello world' was added.",
            diff,
            commands: &[],
            model: None,
            expected_files: Some(expected.as_slice()),
            cwd: temp.path(),
        })
        .expect("judge verdict");

    println!("score={} reason={}", result.score, result.reason);
    assert!((0.0..=1.0).contains(&result.score));
    assert!(result.score >= 0.5, "obvious diff should score well: {result:?}");
}
