//! Executor abstraction for step invocation.
//!
//! The [`Executor`] trait decouples the runner from how a step is actually
//! run. [`ProcessExecutor`] spawns the step command; tests use scripted
//! executors that write predetermined output into the capture log without
//! spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::capture::CaptureLog;
use crate::io::process::run_command_with_tee;

/// Parameters for one step invocation.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub unit: String,
    pub step: String,
    /// Command with placeholders already expanded; the first element is the program.
    pub command: Vec<String>,
    /// Working directory (the instance directory).
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Time left in the unit's budget, if it has one.
    pub timeout: Option<Duration>,
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub timed_out: bool,
}

impl StepExit {
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            timed_out: false,
        }
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }
}

/// Abstraction over step execution backends.
///
/// `Err` means the step could not be run at all (for example a spawn
/// failure). A step that ran and failed is reported through [`StepExit`].
pub trait Executor {
    fn exec(&self, request: &StepRequest, capture: &CaptureLog) -> Result<StepExit>;
}

/// Executor that spawns the step command as a child process.
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    #[instrument(skip_all, fields(unit = %request.unit, step = %request.step))]
    fn exec(&self, request: &StepRequest, capture: &CaptureLog) -> Result<StepExit> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("step `{}` has an empty command", request.step))?;
        info!(workdir = %request.workdir.display(), program = %program, "starting step");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let output = run_command_with_tee(cmd, request.timeout, capture)
            .with_context(|| format!("run step `{}`", request.step))?;

        if output.timed_out {
            warn!(timeout = ?request.timeout, "step timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "step failed");
        } else {
            debug!("step completed successfully");
        }
        Ok(StepExit {
            code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::storage::{MemoryStorage, Storage};
    use std::path::Path;

    fn request(workdir: &Path, command: &[&str]) -> StepRequest {
        StepRequest {
            unit: "prep".to_string(),
            step: "load".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            workdir: workdir.to_path_buf(),
            env: vec![("FLOWRUN_TEST_VALUE".to_string(), "42".to_string())],
            timeout: None,
        }
    }

    /// Verifies the step runs inside the instance directory with its env.
    #[test]
    fn process_executor_uses_workdir_and_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = MemoryStorage::new();
        let log = Path::new("log.txt");
        let capture = CaptureLog::open(&storage, log, false, 1024).expect("open");
        let exit = ProcessExecutor
            .exec(
                &request(
                    temp.path(),
                    &["sh", "-c", "echo $FLOWRUN_TEST_VALUE > out.txt; echo done"],
                ),
                &capture,
            )
            .expect("exec");
        assert!(exit.success());
        let written = std::fs::read_to_string(temp.path().join("out.txt")).expect("out");
        assert_eq!(written.trim(), "42");
        assert_eq!(storage.read_to_string(log).expect("log"), "done\n");
    }

    #[test]
    fn process_executor_rejects_empty_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = MemoryStorage::new();
        let capture =
            CaptureLog::open(&storage, Path::new("log.txt"), false, 1024).expect("open");
        let err = ProcessExecutor
            .exec(&request(temp.path(), &[]), &capture)
            .unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn step_exit_success_requires_zero_and_no_timeout() {
        assert!(StepExit::ok().success());
        assert!(!StepExit::code(2).success());
        assert!(
            !StepExit {
                code: Some(0),
                timed_out: true
            }
            .success()
        );
    }
}
