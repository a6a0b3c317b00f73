//! Git adapter for the default environment.
//!
//! The harness resets one shared working tree between iterations and reads
//! the agent's changes back as a unified diff, so we keep a small, explicit
//! wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Discard tracked changes and remove untracked files (ignored files survive).
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn reset_clean(&self) -> Result<()> {
        debug!("resetting working tree");
        self.run_checked(&["reset", "--hard", "--quiet", "HEAD"])?;
        self.run_checked(&["clean", "-fd", "--quiet"])?;
        Ok(())
    }

    /// Unified diff of the working tree against HEAD, including untracked files.
    ///
    /// Untracked files are marked intent-to-add first so they show up as new
    /// files; the next reset clears the marks.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn diff_head(&self) -> Result<String> {
        self.run_checked(&["add", "--intent-to-add", "--all"])?;
        let diff = self.run_capture(&["diff", "--no-color", "--no-ext-diff", "HEAD"])?;
        debug!(bytes = diff.len(), "captured diff");
        Ok(diff)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo(root: &Path) {
        for args in [
            vec!["init", "--quiet"],
            vec!["config", "user.email", "harness@example.com"],
            vec!["config", "user.name", "Harness"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success());
        }
        fs::write(root.join("tracked.txt"), "original\n").expect("write");
        for args in [vec!["add", "."], vec!["commit", "--quiet", "-m", "init"]] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success());
        }
    }

    #[test]
    fn diff_includes_modified_and_untracked_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        fs::write(temp.path().join("tracked.txt"), "changed\n").expect("write");
        fs::write(temp.path().join("new.txt"), "fresh\n").expect("write");

        let git = Git::new(temp.path());
        let diff = git.diff_head().expect("diff");
        assert!(diff.contains("diff --git a/tracked.txt b/tracked.txt"));
        assert!(diff.contains("diff --git a/new.txt b/new.txt"));
        assert!(diff.contains("+fresh"));
    }

    #[test]
    fn reset_clean_restores_head() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        fs::write(temp.path().join("tracked.txt"), "changed\n").expect("write");
        fs::write(temp.path().join("new.txt"), "fresh\n").expect("write");

        let git = Git::new(temp.path());
        git.diff_head().expect("diff");
        git.reset_clean().expect("reset");

        assert_eq!(
            fs::read_to_string(temp.path().join("tracked.txt")).expect("read"),
            "original\n"
        );
        assert!(!temp.path().join("new.txt").exists());
        assert!(git.diff_head().expect("diff").is_empty());
    }

    #[test]
    fn detects_non_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repo());
    }
}
