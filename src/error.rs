use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProbeError>;

/// Fatal errors. Per-probe failures are never surfaced through this type;
/// they are credited to the tracker as plain booleans.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid target: {target} - {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("target file format is invalid at line {line}")]
    FileFormat { line: usize },

    #[error("no probe tasks to run, check the target arguments")]
    NoTasks,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ProbeError {
    pub fn config(message: impl Into<String>) -> Self {
        ProbeError::Config(message.into())
    }

    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        ProbeError::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }
}
