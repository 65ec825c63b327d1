//! Shared types, traits and errors for the sshsock workspace.

pub mod config;
pub mod logging;
pub mod ssh;
pub mod tunnel;
