//! Orchestrator: flows, builds of flows, and the conductor sweep.
//!
//! - A build runs its flows in the order the manifest lists them. Declared
//!   inputs are validated and exposed to the flow, never used for ordering.
//! - A conductor runs every listed build once per scenario, with the
//!   scenario name as the instance name, and re-renders the status report
//!   after each scenario.
//! - An instance whose last result is finalized, not failed, and whose log
//!   ends with the completion marker is reused without running.
//! - A failed unit never stops the sweep. Config and storage errors of a unit
//!   are logged and recorded as failure, and the next unit proceeds.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::aggregate::{BuildNode, FlowNode, StatusTree};
use crate::core::classifier::{COMPLETION_MARKER, has_completion_marker};
use crate::core::config::{self, Config, INPUTS_KEY};
use crate::core::path::ArtifactPaths;
use crate::core::types::{ExecutionResult, Status, StepRecord, UnitKind};
use crate::error::{FlowError, FlowResult};
use crate::io::capture::CaptureLog;
use crate::io::executor::Executor;
use crate::io::instance::{InstanceStore, inject_project_root};
use crate::io::manifest::{FlowDef, Manifest, load_optional_config};
use crate::io::report::{self, read_build_node};
use crate::run::{Prepared, Runner, UnitRun, elapsed_ms, timestamp};

/// Result of one flow invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowOutcome {
    pub result: ExecutionResult,
    /// Reused from an earlier run.
    pub cached: bool,
}

impl FlowOutcome {
    fn node(&self, dir: PathBuf) -> FlowNode {
        FlowNode {
            flow: self.result.unit.clone(),
            instance: self.result.instance.clone(),
            dir,
            status: self.result.status,
            cached: self.cached,
            running: false,
            duration_ms: self.result.duration_ms,
            error: self.result.error.clone(),
        }
    }
}

pub struct Orchestrator<'a, E: Executor> {
    root: PathBuf,
    manifest: &'a Manifest,
    store: InstanceStore,
    runner: Runner<'a, E>,
}

impl<'a, E: Executor> Orchestrator<'a, E> {
    /// `root` is the project root; `store` is rooted at the run root.
    pub fn new(
        root: &Path,
        manifest: &'a Manifest,
        store: InstanceStore,
        runner: Runner<'a, E>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            manifest,
            store,
            runner,
        }
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    /// Configuration of a standalone flow: its document, `overrides`, and
    /// the project root.
    fn flow_config(&self, flow: &FlowDef, overrides: &Config) -> FlowResult<Config> {
        let document = load_optional_config(&self.root, flow.config.as_deref())?;
        Ok(inject_project_root(
            &config::overlay(&document, overrides),
            &self.root,
        ))
    }

    /// Run a standalone flow instance under the run root.
    #[instrument(skip_all, fields(flow = %flow, instance = %instance))]
    pub fn run_flow(
        &self,
        flow: &str,
        instance: &str,
        overrides: &Config,
    ) -> FlowResult<FlowOutcome> {
        let def = self.manifest.flow(flow)?;
        let config = self.flow_config(def, overrides)?;
        self.run_flow_in(&self.store, def, &def.name, instance, &config)
    }

    /// Prepare a standalone flow instance without running it.
    pub fn prepare_flow(
        &self,
        flow: &str,
        instance: &str,
        overrides: &Config,
    ) -> FlowResult<Prepared> {
        let def = self.manifest.flow(flow)?;
        let config = self.flow_config(def, overrides)?;
        self.runner.prepare(&self.store, &UnitRun {
            unit: &def.name,
            kind: UnitKind::Flow,
            instance,
            steps: &def.steps,
            mode: def.mode,
            config: &config,
        })
    }

    /// Cached result of an instance, if it may be reused.
    fn reusable(
        &self,
        store: &InstanceStore,
        unit: &str,
        instance: &str,
    ) -> FlowResult<Option<ExecutionResult>> {
        let dir = store.dir_of(unit, instance)?;
        let paths = ArtifactPaths::new(&dir, unit);
        if store.is_locked(&dir) {
            return Ok(None);
        }
        let Some(previous) = store.load_result(&paths) else {
            return Ok(None);
        };
        if !previous.is_reusable() {
            return Ok(None);
        }
        let marked = store
            .read_log(&paths.log)?
            .is_some_and(|log| has_completion_marker(&log));
        Ok(marked.then_some(previous))
    }

    fn run_flow_in(
        &self,
        store: &InstanceStore,
        def: &FlowDef,
        node: &str,
        instance: &str,
        config: &Config,
    ) -> FlowResult<FlowOutcome> {
        if let Some(previous) = self.reusable(store, node, instance)? {
            let digest = config::digest(config);
            if previous.config_digest != digest {
                warn!(
                    flow = %node,
                    instance = %instance,
                    "configuration changed since the cached run; reusing it anyway \
                     (pick a new instance name to rerun)"
                );
            }
            info!(
                flow = %node,
                instance = %instance,
                status = %previous.status,
                "reusing cached result"
            );
            return Ok(FlowOutcome {
                result: previous,
                cached: true,
            });
        }
        let result = self.runner.run(store, &UnitRun {
            unit: node,
            kind: UnitKind::Flow,
            instance,
            steps: &def.steps,
            mode: def.mode,
            config,
        })?;
        Ok(FlowOutcome {
            result,
            cached: false,
        })
    }

    /// Run a build instance: every flow in author order, each in the build's
    /// nested store, folding flow statuses into `tree` as they finish.
    ///
    /// `params` overlay the build's configuration document.
    #[instrument(skip_all, fields(build = %build, instance = %instance))]
    pub fn run_build(
        &self,
        build: &str,
        instance: &str,
        params: &Config,
        tree: &mut StatusTree,
    ) -> FlowResult<BuildNode> {
        let def = self.manifest.build(build)?;
        let graph = def.graph()?;
        for message in graph.validate(self.manifest.settings.detect_cycles)? {
            warn!(build = %build, "{message}");
        }
        let document = load_optional_config(&self.root, def.config.as_deref())?;
        let build_config =
            inject_project_root(&config::overlay(&document, params), &self.root);

        if self.reusable(&self.store, build, instance)?.is_some() {
            info!("reusing cached build");
            let mut node = read_build_node(&self.store, build, instance)?;
            node.cached = true;
            for flow in &mut node.flows {
                flow.cached = true;
            }
            tree.record_build(node.clone());
            return Ok(node);
        }

        let dir = self.store.allocate(build, instance)?;
        let _lock = self.store.lock(&dir)?;
        let paths = ArtifactPaths::new(&dir, build);
        self.store.snapshot(&paths, &build_config)?;

        let started = Instant::now();
        let mut result = ExecutionResult {
            unit: build.to_string(),
            kind: UnitKind::Build,
            instance: instance.to_string(),
            status: Status::Failure,
            completed: false,
            log_path: paths.log.clone(),
            artifact_path: paths.config.clone(),
            started_at: timestamp(),
            ended_at: None,
            duration_ms: None,
            config_digest: config::digest(&build_config),
            exit_code: None,
            error: None,
        };
        self.store.write_result(&paths, &result)?;

        let settings = &self.manifest.settings;
        let capture = CaptureLog::open(
            self.store.storage(),
            &paths.log,
            settings.echo,
            settings.output_limit_bytes,
        )?;
        capture.line(&format!("[flowrun] unit: {build} (build)"));
        capture.line(&format!("[flowrun] instance: {instance}"));
        capture.line(&format!("[flowrun] started: {}", result.started_at));
        capture.line(&format!(
            "[flowrun] flows: {}",
            def.flows
                .iter()
                .map(|node| node.node_name())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        capture.line(&"=".repeat(60));

        let nested = self.store.nested(&dir);
        let mut node = BuildNode::new(build, instance, dir.clone());
        tree.record_build(node.clone());
        for entry in &def.flows {
            let name = entry.node_name();
            capture.line(&format!("[flowrun] flow {name}: started"));
            let flow_dir = nested.dir_of(name, instance)?;
            let inputs = graph.inputs_of(name);
            let outcome = self.run_build_flow(
                &nested,
                &entry.flow,
                name,
                instance,
                &inputs,
                &build_config,
            );
            let flow_node = match outcome {
                Ok(outcome) => outcome.node(flow_dir),
                Err(err) => {
                    warn!(flow = %name, kind = err.kind(), err = %err, "flow did not run");
                    FlowNode {
                        flow: name.to_string(),
                        instance: instance.to_string(),
                        dir: flow_dir,
                        status: Status::Failure,
                        cached: false,
                        running: false,
                        duration_ms: None,
                        error: Some(format!("{}: {err}", err.kind())),
                    }
                }
            };
            capture.line(&format!(
                "[flowrun] flow {name}: {}{}",
                flow_node.status,
                if flow_node.cached { " (cached)" } else { "" }
            ));
            tree.record_flow(build, instance, dir.clone(), flow_node.clone());
            node.record_flow(flow_node);
        }

        let status = node.status();
        let ended_at = timestamp();
        capture.line(&format!("[flowrun] build status: {status}"));
        capture.line(&format!("{COMPLETION_MARKER} at {ended_at}"));
        capture.finish(&paths.log)?;

        node.duration_ms = Some(elapsed_ms(started));
        result.status = status;
        result.completed = true;
        result.ended_at = Some(ended_at);
        result.duration_ms = node.duration_ms;
        let failed: Vec<&str> = node
            .flows
            .iter()
            .filter(|flow| flow.status == Status::Failure)
            .map(|flow| flow.flow.as_str())
            .collect();
        if !failed.is_empty() {
            result.error = Some(format!("failed flows: {}", failed.join(", ")));
        }
        self.store.write_result(&paths, &result)?;
        info!(status = %status, duration_ms = ?node.duration_ms, "build finished");
        tree.record_build(node.clone());
        Ok(node)
    }

    /// Run build node `name` (an instance of `flow`) in the build's nested
    /// store, exposing the directories of its declared `inputs`.
    fn run_build_flow(
        &self,
        nested: &InstanceStore,
        flow: &str,
        name: &str,
        instance: &str,
        inputs: &[&str],
        build_config: &Config,
    ) -> FlowResult<FlowOutcome> {
        let def = self.manifest.flow(flow)?;
        let document = load_optional_config(&self.root, def.config.as_deref())?;
        let mut config =
            inject_project_root(&config::overlay(&document, build_config), &self.root);

        if !inputs.is_empty() {
            let mut declared = Config::new();
            for input in inputs {
                let dir = nested.location(&nested.dir_of(input, instance)?);
                let dir = std::path::absolute(&dir).unwrap_or(dir);
                declared.insert(
                    input.to_string(),
                    Value::String(dir.to_string_lossy().into_owned()),
                );
            }
            config.insert(INPUTS_KEY.to_string(), Value::Object(declared));
        }
        debug!(flow = %name, keys = config.len(), "flow configuration assembled");
        self.run_flow_in(nested, def, name, instance, &config)
    }

    /// Run every conductor build for every scenario.
    ///
    /// Returns the final status tree. The report under the run root is
    /// rewritten after each scenario; a failure to write it is logged.
    #[instrument(skip_all)]
    pub fn conduct(&self) -> FlowResult<StatusTree> {
        let conductor = self.manifest.conductor()?;
        let scenarios = conductor.scenarios()?;
        info!(conductor = %conductor.name, scenarios = scenarios.len(), "starting sweep");

        let mut tree = StatusTree::new(&conductor.name);
        for scenario in &scenarios {
            info!(scenario = %scenario.name, "starting scenario");
            for build in &conductor.builds {
                match self.run_build(build, &scenario.name, &scenario.params, &mut tree) {
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            build = %build,
                            scenario = %scenario.name,
                            kind = err.kind(),
                            err = %err,
                            "build did not run"
                        );
                        let dir = self
                            .store
                            .base()
                            .join(build)
                            .join(&scenario.name);
                        let mut node = tree
                            .build(build, &scenario.name)
                            .cloned()
                            .unwrap_or_else(|| BuildNode::new(build, &scenario.name, dir));
                        node.error = Some(format!("{}: {err}", err.kind()));
                        tree.record_build(node);
                    }
                }
            }
            if let Err(err) = report::write_report(&self.store, &tree) {
                warn!(err = %err, "failed to write status report");
            }
        }
        info!(status = %tree.status(), "sweep finished");
        Ok(tree)
    }

    /// Re-run one step of a flow instance from its persisted configuration.
    ///
    /// With `build`, the flow is the build node named `flow` inside build
    /// instance `instance`.
    pub fn replay_step(
        &self,
        flow: &str,
        instance: &str,
        step: &str,
        build: Option<&str>,
    ) -> FlowResult<StepRecord> {
        match build {
            None => {
                let def = self.manifest.flow(flow)?;
                self.runner
                    .replay_step(&self.store, &def.name, instance, &def.steps, step)
            }
            Some(build) => {
                let build_def = self.manifest.build(build)?;
                let entry = build_def
                    .flows
                    .iter()
                    .find(|entry| entry.node_name() == flow)
                    .ok_or_else(|| {
                        FlowError::config(format!("build `{build}` has no flow `{flow}`"))
                    })?;
                let def = self.manifest.flow(&entry.flow)?;
                let nested = self.store.nested(&self.store.dir_of(build, instance)?);
                self.runner
                    .replay_step(&nested, flow, instance, &def.steps, step)
            }
        }
    }
}
