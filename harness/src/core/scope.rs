//! File scope analysis: which files a diff touched versus which were expected.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static DIFF_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^diff --git a/(\S+) b/").expect("diff header regex should be valid")
});

/// Paths named in `diff --git a/<path> b/...` headers, in first-seen order.
pub fn changed_files(diff: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut files = Vec::new();
    for caps in DIFF_HEADER_RE.captures_iter(diff) {
        let path = normalize(&caps[1]);
        if seen.insert(path.clone()) {
            files.push(path);
        }
    }
    files
}

/// Expected-versus-actual comparison rendered into the judge prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileScope {
    pub expected: Vec<String>,
    pub actual: Vec<String>,
    /// Expected but left unchanged.
    pub missing: Vec<String>,
    /// Changed but not expected.
    pub unexpected: Vec<String>,
}

impl FileScope {
    pub fn analyze(expected: &[String], diff: &str) -> Self {
        let expected: Vec<String> = expected.iter().map(|p| normalize(p)).collect();
        let actual = changed_files(diff);
        let missing = expected
            .iter()
            .filter(|path| !actual.contains(path))
            .cloned()
            .collect();
        let unexpected = actual
            .iter()
            .filter(|path| !expected.contains(path))
            .cloned()
            .collect();
        Self {
            expected,
            actual,
            missing,
            unexpected,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

fn normalize(path: &str) -> String {
    path.trim().trim_start_matches("./").to_string()
}
