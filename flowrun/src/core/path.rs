//! Deterministic instance paths and per-instance artifact names.

use std::path::{Path, PathBuf};

use crate::error::{FlowError, FlowResult};

/// Directory of the `(kind, instance)` pair under `base`.
///
/// Pure function of its inputs: the same pair always maps to the same
/// directory and distinct valid pairs never collide, because both names are
/// validated to be a single path segment.
pub fn instance_dir(base: &Path, kind: &str, instance: &str) -> FlowResult<PathBuf> {
    validate_segment("unit", kind)?;
    validate_segment("instance", instance)?;
    Ok(base.join(kind).join(instance))
}

/// Reject names that are not exactly one normal path segment.
pub fn validate_segment(label: &str, name: &str) -> FlowResult<()> {
    if name.is_empty() {
        return Err(FlowError::config(format!("{label} name must not be empty")));
    }
    if name == "." || name == ".." {
        return Err(FlowError::config(format!(
            "{label} name {name:?} is not a valid directory name"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
    {
        return Err(FlowError::config(format!(
            "{label} name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// File names of every artifact a unit writes into its instance directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub bindings: PathBuf,
    pub log: PathBuf,
    pub executed: PathBuf,
    pub result: PathBuf,
    pub failed_config: PathBuf,
    pub lock: PathBuf,
}

pub const LOCK_FILE: &str = ".flowrun.lock";
pub const LOG_SUFFIX: &str = "_execution_output.txt";

impl ArtifactPaths {
    pub fn new(dir: &Path, unit: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            config: dir.join(format!("{unit}_config.json")),
            bindings: dir.join(format!("{unit}_bindings.json")),
            log: dir.join(format!("{unit}{LOG_SUFFIX}")),
            executed: dir.join(format!("{unit}_executed.json")),
            result: dir.join(format!("{unit}_result.json")),
            failed_config: dir.join(format!("{unit}_failed_config.json")),
            lock: dir.join(LOCK_FILE),
        }
    }

    /// Log of a single replayed step.
    pub fn step_log(&self, unit: &str, step: &str) -> PathBuf {
        self.dir.join(format!("{unit}_step_{step}_output.txt"))
    }
}
