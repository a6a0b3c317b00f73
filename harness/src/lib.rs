//! Evaluation harness for AI coding agents.
//!
//! A test instructs an agent to change a working tree, then a judge scores
//! the resulting diff and command transcripts against natural-language
//! criteria. Every verdict is recorded in a ledger that supports human
//! score overrides, a suite tree and aggregate statistics.
//!
//! - **[`core`]**: pure logic (verdict grading, judge output extraction,
//!   templates, hook ordering, file scope, plugin checks). No I/O.
//! - **[`io`]**: side effects (processes, git, environments, agents, judges,
//!   the SQLite ledger, configuration).
//!
//! [`dsl`] registers tests, [`handle`] is what a test body drives, and
//! [`pipeline`] runs every (test, runner) pair.

pub mod core;
pub mod dsl;
pub mod exit_codes;
pub mod handle;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
