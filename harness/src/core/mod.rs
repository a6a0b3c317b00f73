//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod extract;
pub mod hooks;
pub mod plugin_check;
pub mod scope;
pub mod template;
pub mod test_tree;
pub mod types;
