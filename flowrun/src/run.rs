//! Execution runner: one unit run inside its instance directory.
//!
//! A run takes the instance lock, snapshots the configuration and bindings,
//! records a provisional failed result, then walks the unit's steps while
//! [`CaptureLog`] tees their output into `{unit}_execution_output.txt`. The
//! log ends with a completion marker only when every step succeeded; the
//! final status comes from [`classify`] over that log.
//!
//! Log layout:
//!
//! ```text
//! [flowrun] unit: prep (flow)
//! [flowrun] instance: A
//! [flowrun] started: 2026-01-01T00:00:00.000000Z
//! [flowrun] working directory: /project/runs/prep/A
//! [flowrun] config: /project/runs/prep/A/prep_config.json
//! ============================================================
//! --- step 1/2: load ---
//! ...step output...
//! [flowrun] execution completed at 2026-01-01T00:00:02.000000Z
//! ```

use std::io::{BufRead, StdinLock, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{COMPLETION_MARKER, FAILURE_MARKER, classify};
use crate::core::config::{self, Config, PROJECT_ROOT_KEY};
use crate::core::flatten::{BindingSet, PathRule, flatten};
use crate::core::path::ArtifactPaths;
use crate::core::types::{
    ExecMode, ExecutionResult, Status, StepRecord, StepSpec, Termination, UnitKind,
};
use crate::error::{FlowError, FlowResult};
use crate::io::capture::CaptureLog;
use crate::io::executor::{Executor, StepExit, StepRequest};
use crate::io::instance::InstanceStore;
use crate::io::manifest::Settings;

const SEPARATOR_WIDTH: usize = 60;

/// RFC 3339 UTC timestamp with microsecond precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub path_rule: PathRule,
    pub echo: bool,
    pub unit_timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            path_rule: PathRule::default(),
            echo: false,
            unit_timeout: None,
            output_limit_bytes: 100_000,
        }
    }
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> FlowResult<Self> {
        Ok(Self {
            path_rule: PathRule::compile(&settings.path_keys)?,
            echo: settings.echo,
            unit_timeout: settings.unit_timeout_secs.map(Duration::from_secs),
            output_limit_bytes: settings.output_limit_bytes,
        })
    }
}

/// One unit invocation.
#[derive(Debug, Clone)]
pub struct UnitRun<'a> {
    pub unit: &'a str,
    pub kind: UnitKind,
    pub instance: &'a str,
    pub steps: &'a [StepSpec],
    pub mode: ExecMode,
    /// Final configuration, reserved fields included.
    pub config: &'a Config,
}

/// Instance prepared for execution (no-execute mode stops here).
#[derive(Debug, Clone)]
pub struct Prepared {
    pub dir: PathBuf,
    pub paths: ArtifactPaths,
    pub bindings: BindingSet,
}

/// Reviewable record of a run (`{unit}_executed.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedUnit {
    pub unit: String,
    pub kind: UnitKind,
    pub instance: String,
    pub mode: ExecMode,
    /// Markdown overview of the configuration the unit ran with.
    pub config_summary: String,
    pub steps: Vec<StepRecord>,
    pub halted_after: Option<String>,
}

/// Decides, in interactive mode, whether to continue after a step.
pub trait StepGate {
    fn proceed(&self, unit: &str, finished: &str, next: &str) -> bool;
}

/// Never stops.
pub struct BatchGate;

impl StepGate for BatchGate {
    fn proceed(&self, _unit: &str, _finished: &str, _next: &str) -> bool {
        true
    }
}

/// Asks on stderr and reads the answer from `input`.
///
/// An empty answer, `y` or `yes` continues; anything else, end of input or a
/// read error stops the run.
pub struct PromptGate<R> {
    input: Mutex<R>,
}

impl<R: BufRead> PromptGate<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }
}

impl PromptGate<StdinLock<'static>> {
    pub fn stdin() -> Self {
        Self::new(std::io::stdin().lock())
    }
}

impl<R: BufRead> StepGate for PromptGate<R> {
    fn proceed(&self, unit: &str, finished: &str, next: &str) -> bool {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(
            stderr,
            "[flowrun] {unit}: step `{finished}` finished. Run `{next}`? [Y/n] "
        );
        let _ = stderr.flush();

        let mut answer = String::new();
        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        match input.read_line(&mut answer) {
            Ok(0) => false,
            Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "" | "y" | "yes"),
            Err(err) => {
                warn!(err = %err, "failed to read gate answer");
                false
            }
        }
    }
}

/// Step invocation context shared by every step of one run.
struct StepContext<'a> {
    unit: &'a str,
    workdir: PathBuf,
    vars: Vec<(&'static str, String)>,
    env: Vec<(String, String)>,
    deadline: Option<Instant>,
}

/// How a single step ended, when it did not succeed.
struct Raised {
    message: String,
    exit_code: Option<i32>,
}

pub struct Runner<'a, E: Executor> {
    executor: &'a E,
    gate: &'a dyn StepGate,
    options: RunOptions,
}

impl<'a, E: Executor> Runner<'a, E> {
    pub fn new(executor: &'a E, options: RunOptions) -> Self {
        Self {
            executor,
            gate: &BatchGate,
            options,
        }
    }

    /// Gate consulted between steps of interactive units.
    pub fn with_gate(mut self, gate: &'a dyn StepGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Allocate the instance and write its configuration and bindings.
    pub fn prepare(&self, store: &InstanceStore, unit: &UnitRun<'_>) -> FlowResult<Prepared> {
        let dir = store.allocate(unit.unit, unit.instance)?;
        let _lock = store.lock(&dir)?;
        self.write_inputs(store, &dir, unit)
    }

    fn write_inputs(
        &self,
        store: &InstanceStore,
        dir: &Path,
        unit: &UnitRun<'_>,
    ) -> FlowResult<Prepared> {
        let paths = ArtifactPaths::new(dir, unit.unit);
        let bindings = flatten(unit.config, &self.options.path_rule);
        store.snapshot(&paths, unit.config)?;
        store.write_json(&paths.bindings, &bindings)?;
        debug!(bindings = bindings.len(), "instance prepared");
        Ok(Prepared {
            dir: dir.to_path_buf(),
            paths,
            bindings,
        })
    }

    /// Run every step of `unit` and return its finalized result.
    ///
    /// Only configuration and storage problems are returned as `Err`; a
    /// failing step yields `Ok` with status failure.
    #[instrument(skip_all, fields(unit = unit.unit, instance = unit.instance))]
    pub fn run(&self, store: &InstanceStore, unit: &UnitRun<'_>) -> FlowResult<ExecutionResult> {
        let dir = store.allocate(unit.unit, unit.instance)?;
        let _lock = store.lock(&dir)?;
        let prepared = self.write_inputs(store, &dir, unit)?;
        let paths = &prepared.paths;

        let started = Instant::now();
        let started_at = timestamp();
        let mut result = ExecutionResult {
            unit: unit.unit.to_string(),
            kind: unit.kind,
            instance: unit.instance.to_string(),
            status: Status::Failure,
            completed: false,
            log_path: paths.log.clone(),
            artifact_path: paths.executed.clone(),
            started_at: started_at.clone(),
            ended_at: None,
            duration_ms: None,
            config_digest: config::digest(unit.config),
            exit_code: None,
            error: None,
        };
        store.write_result(paths, &result)?;

        let capture = CaptureLog::open(
            store.storage(),
            &paths.log,
            self.options.echo,
            self.options.output_limit_bytes,
        )?;
        capture.line(&format!("[flowrun] unit: {} ({})", unit.unit, kind_label(unit.kind)));
        capture.line(&format!("[flowrun] instance: {}", unit.instance));
        capture.line(&format!("[flowrun] started: {started_at}"));
        capture.line(&format!(
            "[flowrun] working directory: {}",
            store.location(&prepared.dir).display()
        ));
        capture.line(&format!(
            "[flowrun] config: {}",
            store.location(&paths.config).display()
        ));
        capture.line(&"=".repeat(SEPARATOR_WIDTH));

        let context = self.step_context(store, &prepared, unit.unit, unit.config, started);
        let (termination, records) = self.run_steps(&capture, &context, unit);

        let ended_at = timestamp();
        match &termination {
            Termination::Completed => {
                capture.line(&format!("{COMPLETION_MARKER} at {ended_at}"));
            }
            Termination::Raised { message, .. } => {
                capture.line(&format!("{FAILURE_MARKER}: {message}"));
            }
            Termination::Halted { after_step } => {
                capture.line(&format!("{FAILURE_MARKER}: stopped after step `{after_step}`"));
            }
        }
        capture.finish(&paths.log)?;

        let log_text = store.read_log(&paths.log)?.unwrap_or_default();
        let status = classify(&termination, &log_text);
        if status == Status::Failure {
            store.write_json(&paths.failed_config, unit.config)?;
        }

        let executed = ExecutedUnit {
            unit: unit.unit.to_string(),
            kind: unit.kind,
            instance: unit.instance.to_string(),
            mode: unit.mode,
            config_summary: config::summary_markdown(unit.config, Some(unit.unit)),
            steps: records,
            halted_after: match &termination {
                Termination::Halted { after_step } => Some(after_step.clone()),
                _ => None,
            },
        };
        store.write_json(&paths.executed, &executed)?;

        result.status = status;
        result.completed = true;
        result.ended_at = Some(ended_at);
        result.duration_ms = Some(elapsed_ms(started));
        match termination {
            Termination::Completed => result.exit_code = Some(0),
            Termination::Raised { message, exit_code } => {
                result.exit_code = exit_code;
                result.error = Some(message);
            }
            Termination::Halted { after_step } => {
                result.error = Some(format!("stopped after step `{after_step}`"));
            }
        }
        store.write_result(paths, &result)?;

        match status {
            Status::Failure => warn!(error = ?result.error, "unit failed"),
            _ => info!(status = %status, duration_ms = ?result.duration_ms, "unit finished"),
        }
        Ok(result)
    }

    /// Re-run one step from the instance's persisted configuration snapshot.
    ///
    /// Output goes to `{unit}_step_{step}_output.txt`; the unit's own log and
    /// result are left untouched.
    #[instrument(skip_all, fields(unit = %unit, instance = %instance, step = %step_name))]
    pub fn replay_step(
        &self,
        store: &InstanceStore,
        unit: &str,
        instance: &str,
        steps: &[StepSpec],
        step_name: &str,
    ) -> FlowResult<StepRecord> {
        let dir = store.dir_of(unit, instance)?;
        if !store.storage().is_dir(&dir) {
            return Err(FlowError::config(format!(
                "instance {} has never been prepared",
                dir.display()
            )));
        }
        let (index, step) = steps
            .iter()
            .enumerate()
            .find(|(_, step)| step.name == step_name)
            .ok_or_else(|| {
                FlowError::config(format!("unit `{unit}` has no step `{step_name}`"))
            })?;

        let _lock = store.lock(&dir)?;
        let paths = ArtifactPaths::new(&dir, unit);
        let config = store.load_snapshot(&paths)?;
        let bindings = flatten(&config, &self.options.path_rule);
        store.write_json(&paths.bindings, &bindings)?;
        let prepared = Prepared {
            dir,
            paths,
            bindings,
        };

        let log = prepared.paths.step_log(unit, step_name);
        let capture = CaptureLog::open(
            store.storage(),
            &log,
            self.options.echo,
            self.options.output_limit_bytes,
        )?;
        capture.line(&format!(
            "[flowrun] replay of step `{step_name}` of {unit} instance {instance}"
        ));
        capture.line(&format!("[flowrun] started: {}", timestamp()));
        capture.line(&"=".repeat(SEPARATOR_WIDTH));

        let context = self.step_context(store, &prepared, unit, &config, Instant::now());
        let (record, raised) = self.run_step(&capture, &context, index, steps.len(), step);
        match raised {
            None => capture.line(&format!("{COMPLETION_MARKER} at {}", timestamp())),
            Some(raised) => capture.line(&format!("{FAILURE_MARKER}: {}", raised.message)),
        }
        capture.finish(&log)?;
        Ok(record)
    }

    fn step_context<'c>(
        &self,
        store: &InstanceStore,
        prepared: &Prepared,
        unit: &'c str,
        config: &Config,
        started: Instant,
    ) -> StepContext<'c> {
        let workdir = store.location(&prepared.dir);
        let config_path = store.location(&prepared.paths.config);
        let bindings_path = store.location(&prepared.paths.bindings);
        let project_root = config
            .get(PROJECT_ROOT_KEY)
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();

        let vars = vec![
            ("config", config_path.to_string_lossy().into_owned()),
            ("bindings", bindings_path.to_string_lossy().into_owned()),
            ("output_dir", workdir.to_string_lossy().into_owned()),
            ("project_root", project_root.clone()),
        ];
        let mut env = vec![
            ("FLOWRUN_CONFIG".to_string(), vars[0].1.clone()),
            ("FLOWRUN_BINDINGS".to_string(), vars[1].1.clone()),
            ("FLOWRUN_INSTANCE_DIR".to_string(), vars[2].1.clone()),
        ];
        if !project_root.is_empty() {
            env.push(("FLOWRUN_PROJECT_ROOT".to_string(), project_root));
        }
        StepContext {
            unit,
            workdir,
            vars,
            env,
            deadline: self.options.unit_timeout.map(|limit| started + limit),
        }
    }

    fn run_steps(
        &self,
        capture: &CaptureLog,
        context: &StepContext<'_>,
        unit: &UnitRun<'_>,
    ) -> (Termination, Vec<StepRecord>) {
        let total = unit.steps.len();
        let mut records = Vec::with_capacity(total);
        for (index, step) in unit.steps.iter().enumerate() {
            let (record, raised) = self.run_step(capture, context, index, total, step);
            records.push(record);
            if let Some(raised) = raised {
                return (
                    Termination::Raised {
                        message: raised.message,
                        exit_code: raised.exit_code,
                    },
                    records,
                );
            }
            if unit.mode == ExecMode::Interactive
                && let Some(next) = unit.steps.get(index + 1)
                && !self.gate.proceed(unit.unit, &step.name, &next.name)
            {
                capture.line(&format!("[flowrun] stopped after step `{}`", step.name));
                info!(step = %step.name, "run stopped by gate");
                return (
                    Termination::Halted {
                        after_step: step.name.clone(),
                    },
                    records,
                );
            }
        }
        (Termination::Completed, records)
    }

    fn run_step(
        &self,
        capture: &CaptureLog,
        context: &StepContext<'_>,
        index: usize,
        total: usize,
        step: &StepSpec,
    ) -> (StepRecord, Option<Raised>) {
        capture.line(&format!("--- step {}/{total}: {} ---", index + 1, step.name));
        capture.begin_step();
        let started_at = timestamp();
        let command = expand_command(&step.command, &context.vars);

        let timeout = context
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let outcome = if timeout.is_some_and(|left| left.is_zero()) {
            Ok(StepExit {
                code: None,
                timed_out: true,
            })
        } else {
            let request = StepRequest {
                unit: context.unit.to_string(),
                step: step.name.clone(),
                command: command.clone(),
                workdir: context.workdir.clone(),
                env: context.env.clone(),
                timeout,
            };
            self.executor.exec(&request, capture)
        };

        let raised = match &outcome {
            Ok(exit) if exit.success() => None,
            Ok(exit) if exit.timed_out => Some(Raised {
                message: format!("step `{}` exceeded the unit time budget", step.name),
                exit_code: None,
            }),
            Ok(exit) => Some(Raised {
                message: match exit.code {
                    Some(code) => format!("step `{}` exited with code {code}", step.name),
                    None => format!("step `{}` was terminated by a signal", step.name),
                },
                exit_code: exit.code,
            }),
            Err(err) => Some(Raised {
                message: format!("step `{}` could not run: {err:#}", step.name),
                exit_code: None,
            }),
        };
        if let Some(raised) = &raised {
            capture.line(&format!("[flowrun] error: {}", raised.message));
        }

        let (output, output_truncated) = capture.take_step();
        let (exit_code, timed_out) = match &outcome {
            Ok(exit) => (exit.code, exit.timed_out),
            Err(_) => (None, false),
        };
        let record = StepRecord {
            name: step.name.clone(),
            command,
            exit_code,
            timed_out,
            started_at,
            ended_at: timestamp(),
            output,
            output_truncated,
            error: raised.as_ref().map(|raised| raised.message.clone()),
        };
        (record, raised)
    }
}

fn kind_label(kind: UnitKind) -> &'static str {
    match kind {
        UnitKind::Flow => "flow",
        UnitKind::Build => "build",
    }
}

/// Replace `{name}` placeholders in every argument.
pub fn expand_command(command: &[String], vars: &[(&str, String)]) -> Vec<String> {
    command
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::has_completion_marker;
    use crate::io::storage::{FsStorage, Storage};
    use crate::test_support::{Script, ScriptedExecutor, config, memory_store, steps};
    use serde_json::json;
    use std::sync::Arc;

    fn unit<'a>(steps: &'a [StepSpec], config: &'a Config) -> UnitRun<'a> {
        UnitRun {
            unit: "prep",
            kind: UnitKind::Flow,
            instance: "A",
            steps,
            mode: ExecMode::Batch,
            config,
        }
    }

    struct StopAfter(&'static str);

    impl StepGate for StopAfter {
        fn proceed(&self, _unit: &str, finished: &str, _next: &str) -> bool {
            finished != self.0
        }
    }

    /// Verifies the full artifact set of a successful batch run.
    #[test]
    fn batch_run_writes_log_artifacts_and_result() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        executor.script("prep/load", Script::ok("loaded 3 rows\n"));
        let steps = steps(&["load", "clean"]);
        let config = config(json!({"threshold": 0.5, "data_dir": "/data"}));
        let runner = Runner::new(&executor, RunOptions::default());

        let result = runner.run(&store, &unit(&steps, &config)).expect("run");
        assert_eq!(result.status, Status::Success);
        assert!(result.completed);
        assert!(result.is_reusable());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(executor.calls(), vec!["prep/load@A", "prep/clean@A"]);

        let paths = ArtifactPaths::new(Path::new("runs/prep/A"), "prep");
        let log = store.read_log(&paths.log).expect("read").expect("log");
        assert!(log.starts_with("[flowrun] unit: prep (flow)\n"));
        assert!(log.contains("--- step 1/2: load ---\nloaded 3 rows\n"));
        assert!(log.contains("--- step 2/2: clean ---"));
        assert!(has_completion_marker(&log));

        let executed: ExecutedUnit = store
            .read_json(&paths.executed)
            .expect("read")
            .expect("executed");
        assert_eq!(executed.steps.len(), 2);
        assert_eq!(executed.steps[0].output, "loaded 3 rows\n");
        assert!(executed.config_summary.contains("| threshold | 0.5 |"));

        let bindings: Config = store
            .read_json(&paths.bindings)
            .expect("read")
            .expect("bindings");
        assert_eq!(bindings["data_dir"], json!("/data"));
        assert_eq!(bindings["threshold"], json!(0.5));
        assert!(!store.storage().is_file(&paths.failed_config));
        assert!(!store.is_locked(&paths.dir));
        assert_eq!(store.load_result(&paths), Some(result));
    }

    #[test]
    fn warning_line_in_output_yields_warning() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        executor.script("prep/load", Script::ok("⚠️ sparse input\n"));
        let steps = steps(&["load"]);
        let config = Config::new();
        let result = Runner::new(&executor, RunOptions::default())
            .run(&store, &unit(&steps, &config))
            .expect("run");
        assert_eq!(result.status, Status::Warning);
        assert!(result.is_reusable());
    }

    /// Verifies a failing step halts the unit and keeps the partial log.
    #[test]
    fn failing_step_stops_remaining_steps() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        executor.script("prep/load", Script::fail(3, "Traceback: boom\n"));
        let steps = steps(&["load", "clean"]);
        let config = config(json!({"threshold": 0.5}));
        let result = Runner::new(&executor, RunOptions::default())
            .run(&store, &unit(&steps, &config))
            .expect("unit failure is not an Err");

        assert_eq!(result.status, Status::Failure);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.completed);
        assert!(!result.is_reusable());
        assert_eq!(executor.calls(), vec!["prep/load@A"]);

        let paths = ArtifactPaths::new(Path::new("runs/prep/A"), "prep");
        let log = store.read_log(&paths.log).expect("read").expect("log");
        assert!(log.contains("Traceback: boom"));
        assert!(log.contains("[flowrun] error: step `load` exited with code 3"));
        assert!(!has_completion_marker(&log));
        assert!(!log.contains("--- step 2/2"));

        let failed: Config = store
            .read_json(&paths.failed_config)
            .expect("read")
            .expect("failed config");
        assert_eq!(failed, config);
    }

    #[test]
    fn spawn_failure_is_recorded_as_failure() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        executor.script("prep/load", Script::spawn_error("no such program"));
        let steps = steps(&["load"]);
        let config = Config::new();
        let result = Runner::new(&executor, RunOptions::default())
            .run(&store, &unit(&steps, &config))
            .expect("run");
        assert_eq!(result.status, Status::Failure);
        assert!(
            result
                .error
                .as_deref()
                .is_some_and(|e| e.contains("no such program"))
        );
    }

    /// Verifies an interactive stop leaves no completion marker.
    #[test]
    fn interactive_stop_classifies_as_failure() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        let steps = steps(&["load", "clean", "report"]);
        let config = Config::new();
        let gate = StopAfter("clean");
        let runner = Runner::new(&executor, RunOptions::default()).with_gate(&gate);
        let mut run = unit(&steps, &config);
        run.mode = ExecMode::Interactive;

        let result = runner.run(&store, &run).expect("run");
        assert_eq!(result.status, Status::Failure);
        assert_eq!(executor.calls(), vec!["prep/load@A", "prep/clean@A"]);

        let paths = ArtifactPaths::new(Path::new("runs/prep/A"), "prep");
        let executed: ExecutedUnit = store
            .read_json(&paths.executed)
            .expect("read")
            .expect("executed");
        assert_eq!(executed.halted_after.as_deref(), Some("clean"));
    }

    #[test]
    fn batch_mode_never_consults_the_gate() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        let steps = steps(&["load", "clean"]);
        let config = Config::new();
        let gate = StopAfter("load");
        let result = Runner::new(&executor, RunOptions::default())
            .with_gate(&gate)
            .run(&store, &unit(&steps, &config))
            .expect("run");
        assert_eq!(result.status, Status::Success);
    }

    #[test]
    fn busy_instance_is_refused_without_touching_the_log() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        let steps = steps(&["load"]);
        let config = Config::new();
        let dir = store.allocate("prep", "A").expect("allocate");
        let _held = store.lock(&dir).expect("lock");

        let err = Runner::new(&executor, RunOptions::default())
            .run(&store, &unit(&steps, &config))
            .unwrap_err();
        assert!(matches!(err, FlowError::InstanceBusy { .. }));
        assert!(executor.calls().is_empty());
        let paths = ArtifactPaths::new(&dir, "prep");
        assert!(!store.storage().is_file(&paths.log));
    }

    #[test]
    fn prepare_writes_inputs_only() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        let steps = steps(&["load"]);
        let config = config(json!({"database": {"host": "db"}}));
        let prepared = Runner::new(&executor, RunOptions::default())
            .prepare(&store, &unit(&steps, &config))
            .expect("prepare");
        assert_eq!(prepared.bindings.get_str("host"), Some("db"));
        assert!(store.storage().is_file(&prepared.paths.config));
        assert!(store.storage().is_file(&prepared.paths.bindings));
        assert!(!store.storage().is_file(&prepared.paths.log));
        assert!(store.load_result(&prepared.paths).is_none());
        assert!(executor.calls().is_empty());
    }

    /// Verifies replay reads only the persisted snapshot and leaves the unit log alone.
    #[test]
    fn replay_step_uses_persisted_snapshot() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        let steps = steps(&["load", "clean"]);
        let config = config(json!({"threshold": 0.5}));
        let runner = Runner::new(&executor, RunOptions::default());
        runner.run(&store, &unit(&steps, &config)).expect("run");
        let paths = ArtifactPaths::new(Path::new("runs/prep/A"), "prep");
        let log_before = store.read_log(&paths.log).expect("read");

        executor.script("prep/clean", Script::ok("cleaned again\n"));
        let record = runner
            .replay_step(&store, "prep", "A", &steps, "clean")
            .expect("replay");
        assert!(record.succeeded());
        assert_eq!(record.output, "cleaned again\n");
        let step_log = store
            .read_log(&paths.step_log("prep", "clean"))
            .expect("read")
            .expect("step log");
        assert!(has_completion_marker(&step_log));
        assert_eq!(store.read_log(&paths.log).expect("read"), log_before);

        let err = runner
            .replay_step(&store, "prep", "A", &steps, "missing")
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        let err = runner
            .replay_step(&store, "prep", "Z", &steps, "clean")
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn placeholders_expand_in_every_argument() {
        let command = vec![
            "python".to_string(),
            "run.py".to_string(),
            "--config={config}".to_string(),
            "{output_dir}/out.csv".to_string(),
        ];
        let vars = vec![
            ("config", "/p/runs/prep/A/prep_config.json".to_string()),
            ("output_dir", "/p/runs/prep/A".to_string()),
        ];
        assert_eq!(
            expand_command(&command, &vars),
            vec![
                "python",
                "run.py",
                "--config=/p/runs/prep/A/prep_config.json",
                "/p/runs/prep/A/out.csv",
            ]
        );
    }

    #[test]
    fn prompt_gate_reads_answers() {
        let gate = PromptGate::new(std::io::Cursor::new("y\n\nn\n"));
        assert!(gate.proceed("prep", "a", "b"));
        assert!(gate.proceed("prep", "b", "c"));
        assert!(!gate.proceed("prep", "c", "d"));
        assert!(!gate.proceed("prep", "d", "e"));
    }

    /// Verifies real processes run in the instance directory with the env contract.
    #[test]
    fn process_run_uses_instance_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(temp.path()));
        let store = InstanceStore::new(storage, temp.path().join("runs"));
        let executor = crate::io::executor::ProcessExecutor;
        let steps = vec![
            StepSpec {
                name: "write".to_string(),
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "cat \"$FLOWRUN_CONFIG\" > seen.json; echo wrote".to_string(),
                ],
            },
            StepSpec {
                name: "check".to_string(),
                command: vec![
                    "test".to_string(),
                    "-f".to_string(),
                    "{output_dir}/seen.json".to_string(),
                ],
            },
        ];
        let config = config(json!({"threshold": 0.5}));
        let result = Runner::new(&executor, RunOptions::default())
            .run(&store, &unit(&steps, &config))
            .expect("run");
        assert_eq!(result.status, Status::Success);
        let seen =
            std::fs::read_to_string(temp.path().join("runs/prep/A/seen.json")).expect("seen");
        assert!(seen.contains("\"threshold\": 0.5"));
    }

    #[test]
    fn exhausted_time_budget_fails_without_running() {
        let store = memory_store();
        let executor = ScriptedExecutor::new();
        let steps = steps(&["load"]);
        let config = Config::new();
        let options = RunOptions {
            unit_timeout: Some(Duration::ZERO),
            ..RunOptions::default()
        };
        let result = Runner::new(&executor, options)
            .run(&store, &unit(&steps, &config))
            .expect("run");
        assert_eq!(result.status, Status::Failure);
        assert!(executor.calls().is_empty());
    }
}
