//! Shared deterministic types for flowrun core logic.
//!
//! These types define stable contracts between the runner, the orchestrator,
//! and the report builder. They are serialized into per-instance artifacts,
//! so field names are part of the on-disk format.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Health of a unit, build, or conductor.
///
/// Variants are declared in severity order so `Ord` gives
/// `Success < Warning < Failure`, and the worst of a set is its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Warning,
    Failure,
}

impl Status {
    /// Worst status of `statuses`; an empty set is `Success`.
    pub fn worst_of<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        statuses.into_iter().max().unwrap_or(Status::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Warning => "warning",
            Status::Failure => "failure",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Status::Success => "✅",
            Status::Warning => "⚠️",
            Status::Failure => "❌",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grouping of a unit. Both kinds execute the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Flow,
    Build,
}

/// How the runner walks a unit's steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// All steps end to end.
    #[default]
    Batch,
    /// A gate is consulted after every step and may stop the run.
    Interactive,
}

/// How a unit's step sequence ended, before log classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Every step ran and exited zero.
    Completed,
    /// A step raised (non-zero exit, spawn failure, or timeout).
    Raised { message: String, exit_code: Option<i32> },
    /// The interactive gate stopped the run before the last step.
    Halted { after_step: String },
}

/// Persisted execution record of one instance (`{unit}_result.json`).
///
/// Written with `status=failure, completed=false` when the run starts and
/// replaced wholesale when the run ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub unit: String,
    pub kind: UnitKind,
    pub instance: String,
    pub status: Status,
    /// True once the run reached its end (successfully or not).
    pub completed: bool,
    pub log_path: PathBuf,
    pub artifact_path: PathBuf,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_ms: Option<u64>,
    /// Hex SHA-256 of the snapshotted configuration.
    pub config_digest: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A finalized, non-failed result may be reused by the cache policy.
    pub fn is_reusable(&self) -> bool {
        self.completed && self.ended_at.is_some() && self.status != Status::Failure
    }
}

/// One step of a unit: a named command run in the instance directory.
///
/// Arguments may contain `{config}`, `{bindings}`, `{output_dir}` and
/// `{project_root}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub name: String,
    pub command: Vec<String>,
}

/// Per-step record kept in the execution artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub started_at: String,
    pub ended_at: String,
    pub output: String,
    pub output_truncated: usize,
    pub error: Option<String>,
}

impl StepRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.timed_out && self.exit_code == Some(0)
    }
}
