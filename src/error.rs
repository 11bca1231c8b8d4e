//! Error taxonomy shared by every component.
//!
//! Functions return `anyhow::Result` and attach context the usual way; the
//! variants below are raised where a failure belongs to one of the fatal
//! classes, so callers (and tests) can recover the class with
//! `err.downcast_ref::<Error>()`.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed or duplicate directives, reserved variant names.
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing Containerfiles, unknown base images, absent labels.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// A child process exited unsuccessfully.
    #[error("command failed with exit code {code}: {command}")]
    ExternalTool { command: String, code: i32 },

    /// Registry state that should be impossible (e.g. two booted deployments).
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error(
        "deployment {requested} not found (resolved to index {resolved}, {len} deployments)"
    )]
    DeploymentNotFound {
        requested: isize,
        resolved: isize,
        len: usize,
    },

    #[error("Must be run as root")]
    Privilege,
}

impl Error {
    /// Exit code a CLI should report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ExternalTool { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }
}
