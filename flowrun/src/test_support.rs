//! Test-only helpers: scripted executors and in-memory fixtures.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::config::Config;
use crate::core::types::StepSpec;
use crate::io::capture::CaptureLog;
use crate::io::executor::{Executor, StepExit, StepRequest};
use crate::io::instance::InstanceStore;
use crate::io::storage::MemoryStorage;

/// Canned behaviour of one step.
#[derive(Debug, Clone)]
pub struct Script {
    pub stdout: String,
    pub stderr: String,
    pub exit: StepExit,
    /// Return `Err` as if the program could not be spawned.
    pub spawn_error: Option<String>,
}

impl Script {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit: StepExit::ok(),
            spawn_error: None,
        }
    }

    pub fn warn(line: &str) -> Self {
        Self::ok(&format!("{line}\n"))
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit: StepExit::code(code),
            spawn_error: None,
        }
    }

    pub fn spawn_error(message: &str) -> Self {
        Self {
            spawn_error: Some(message.to_string()),
            ..Self::ok("")
        }
    }
}

/// Executor that replays [`Script`]s instead of spawning processes.
///
/// Scripts are keyed `unit/step`, optionally narrowed to one instance with
/// `unit/step@instance` (the instance is the last component of the working
/// directory). Unscripted steps print `ran unit/step` and succeed. Every call
/// is recorded as `unit/step@instance`.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, key: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls whose `unit/step@instance` key starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &StepRequest, capture: &CaptureLog) -> Result<StepExit> {
        let instance = request
            .workdir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = format!("{}/{}", request.unit, request.step);
        let call = format!("{key}@{instance}");
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());

        let script = {
            let scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
            scripts.get(&call).or_else(|| scripts.get(&key)).cloned()
        };
        let script = script.unwrap_or_else(|| Script::ok(&format!("ran {key}\n")));
        if let Some(message) = script.spawn_error {
            return Err(anyhow!("spawn command: {message}"));
        }
        if !script.stdout.is_empty() {
            capture.write_stdout(script.stdout.as_bytes());
        }
        if !script.stderr.is_empty() {
            capture.write_stderr(script.stderr.as_bytes());
        }
        Ok(script.exit)
    }
}

/// Instance store over fresh memory storage, rooted at `runs`.
pub fn memory_store() -> InstanceStore {
    InstanceStore::new(Arc::new(MemoryStorage::new()), "runs")
}

/// Configuration from a JSON object literal.
pub fn config(value: Value) -> Config {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Steps named `names`, each running `true`.
pub fn steps(names: &[&str]) -> Vec<StepSpec> {
    names
        .iter()
        .map(|name| StepSpec {
            name: name.to_string(),
            command: vec!["true".to_string()],
        })
        .collect()
}

/// Write `contents` to `root/relative`, creating parents.
pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(&path, contents).expect("write file");
}

/// PID of a process that has already exited and been reaped.
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait true");
    pid
}
