//! Side-effecting collaborators: processes, git, environments, agents,
//! judges, the ledger and configuration.

pub mod agent;
pub mod config;
pub mod environment;
pub mod git;
pub mod judge;
pub mod ledger;
pub mod model;
pub mod process;
pub mod prompt;
