//! Subcommand implementations, one module per top-level command.

pub mod action;
pub mod init;
pub mod serve;
pub mod sweep;
pub mod task;
pub mod tenant;
