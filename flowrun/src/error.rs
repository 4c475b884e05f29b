//! Error taxonomy for unit execution.
//!
//! Only configuration and storage problems surface as `Err`. A unit whose own
//! code fails is not an error at this level: the runner records it as a
//! `failure` status together with the diagnostic text in the log artifact.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    /// Document unreadable or malformed, value not representable, or an
    /// invalid unit/instance name. Raised before the unit starts.
    #[error("config error: {message}")]
    Config { message: String },

    /// Directory or file creation/write failed.
    #[error("storage error: {action} {}: {source}", path.display())]
    Storage {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another writer holds the instance lock.
    #[error("instance {} is in flight (lock {} exists)", dir.display(), lock.display())]
    InstanceBusy { dir: PathBuf, lock: PathBuf },
}

impl FlowError {
    pub fn config(message: impl Into<String>) -> Self {
        FlowError::Config {
            message: message.into(),
        }
    }

    pub fn storage(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        FlowError::Storage {
            action,
            path: path.into(),
            source,
        }
    }

    /// Short label used in logs and the status tree.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Config { .. } => "ConfigError",
            FlowError::Storage { .. } | FlowError::InstanceBusy { .. } => "StorageError",
        }
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
