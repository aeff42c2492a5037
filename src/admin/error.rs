use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::TesseraError;

/// Failure of an admin command.
#[derive(Debug, Error)]
pub enum AdminError {
    /// A log file or data directory the command was pointed at is absent.
    #[error("{kind} not found: {}", path.display())]
    Missing {
        /// What was expected at `path`.
        kind: &'static str,
        path: PathBuf,
    },
    /// Invalid invocation or configuration value.
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Core(#[from] TesseraError),
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    /// The TOML config did not parse.
    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),
}

/// Result alias for admin commands.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_log(path: impl AsRef<Path>) -> Self {
        AdminError::Missing {
            kind: "operation log",
            path: path.as_ref().to_path_buf(),
        }
    }

    pub(crate) fn missing_data_dir(path: impl AsRef<Path>) -> Self {
        AdminError::Missing {
            kind: "data directory",
            path: path.as_ref().to_path_buf(),
        }
    }
}
