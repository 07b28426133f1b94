//! Subcommand groups.

pub mod deploy;
pub mod task;
pub mod version;
