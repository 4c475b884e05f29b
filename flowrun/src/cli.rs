//! CLI command implementations.
//!
//! Each command returns the process exit code; `Err` is reserved for problems
//! that stop the command before any unit could run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::aggregate::{BuildNode, StatusTree};
use crate::core::config::Config;
use crate::core::types::{ExecMode, ExecutionResult, Status};
use crate::exit_codes;
use crate::io::executor::ProcessExecutor;
use crate::io::instance::InstanceStore;
use crate::io::manifest::{Manifest, load_config_document};
use crate::io::report::{self, REPORT_FILE};
use crate::io::storage::FsStorage;
use crate::orchestrate::Orchestrator;
use crate::run::{PromptGate, RunOptions, Runner};

/// A loaded project: its root, manifest and run root store.
pub struct Project {
    pub root: PathBuf,
    pub manifest: Manifest,
    pub store: InstanceStore,
}

impl Project {
    /// Load the manifest under `root`; `output_dir` replaces the run root.
    pub fn open(root: &Path, output_dir: Option<&Path>) -> Result<Self> {
        let root = std::path::absolute(root)
            .with_context(|| format!("resolve project root {}", root.display()))?;
        let path = Manifest::find(&root)?;
        let manifest =
            Manifest::load(&path).with_context(|| format!("load {}", path.display()))?;
        let base = match output_dir {
            Some(dir) => std::path::absolute(dir)
                .with_context(|| format!("resolve output directory {}", dir.display()))?,
            None => manifest.settings.run_root.clone(),
        };
        debug!(root = %root.display(), base = %base.display(), "project opened");
        let store = InstanceStore::new(Arc::new(FsStorage::new(&root)), base);
        Ok(Self {
            root,
            manifest,
            store,
        })
    }

    fn options(&self) -> Result<RunOptions> {
        RunOptions::from_settings(&self.manifest.settings).context("invalid settings")
    }

    /// Where an artifact lives on disk, for printing.
    fn show(&self, path: &Path) -> String {
        self.store.location(path).display().to_string()
    }
}

/// Options of `flowrun flow`.
#[derive(Debug, Clone, Default)]
pub struct FlowArgs {
    pub name: String,
    pub instance: String,
    pub config: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub no_execute: bool,
    pub interactive: bool,
}

/// Overrides read from `--config`, or none.
fn overrides(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config_document(path)
            .with_context(|| format!("load overrides {}", path.display())),
        None => Ok(Config::new()),
    }
}

/// Run (or only prepare) one standalone flow instance.
pub fn run_flow(root: &Path, args: &FlowArgs) -> Result<i32> {
    let mut project = Project::open(root, args.output_dir.as_deref())?;
    let overrides = overrides(args.config.as_deref())?;
    if args.interactive {
        let flow = project
            .manifest
            .flows
            .iter_mut()
            .find(|flow| flow.name == args.name);
        if let Some(flow) = flow {
            flow.mode = ExecMode::Interactive;
        }
    }

    let executor = ProcessExecutor;
    let gate = args.interactive.then(PromptGate::stdin);
    let mut runner = Runner::new(&executor, project.options()?);
    if let Some(gate) = &gate {
        runner = runner.with_gate(gate);
    }
    let orchestrator = Orchestrator::new(
        &project.root,
        &project.manifest,
        project.store.clone(),
        runner,
    );

    if args.no_execute {
        let prepared = orchestrator.prepare_flow(&args.name, &args.instance, &overrides)?;
        println!(
            "prepared: flow={} instance={} dir={} bindings={}",
            args.name,
            args.instance,
            project.show(&prepared.dir),
            prepared.bindings.len()
        );
        return Ok(exit_codes::OK);
    }

    let outcome = orchestrator.run_flow(&args.name, &args.instance, &overrides)?;
    print_result(&project, &outcome.result, outcome.cached);
    Ok(unit_exit_code(&outcome.result))
}

fn print_result(project: &Project, result: &ExecutionResult, cached: bool) {
    println!(
        "flow: name={} instance={} status={}{} log={}",
        result.unit,
        result.instance,
        result.status,
        if cached { " (cached)" } else { "" },
        project.show(&result.log_path)
    );
    if let Some(error) = &result.error {
        eprintln!("error: {error}");
    }
}

/// Exit code for a unit: its own failing code, else 1 on failure, else 0.
pub fn unit_exit_code(result: &ExecutionResult) -> i32 {
    if result.status != Status::Failure {
        return exit_codes::OK;
    }
    result
        .exit_code
        .filter(|code| *code != 0)
        .unwrap_or(exit_codes::INVALID)
}

/// Run one build instance with parameters read from `params`.
pub fn run_build(root: &Path, build: &str, instance: &str, params: Option<&Path>) -> Result<i32> {
    let project = Project::open(root, None)?;
    let params = overrides(params)?;
    let executor = ProcessExecutor;
    let orchestrator = Orchestrator::new(
        &project.root,
        &project.manifest,
        project.store.clone(),
        Runner::new(&executor, project.options()?),
    );
    let mut tree = StatusTree::new(build);
    let node = orchestrator.run_build(build, instance, &params, &mut tree)?;
    print_build(&project, &node);
    Ok(tree_exit_code(&tree))
}

fn print_build(project: &Project, node: &BuildNode) {
    println!(
        "build: name={} instance={} status={}{} dir={}",
        node.build,
        node.instance,
        node.status(),
        if node.cached { " (cached)" } else { "" },
        project.show(&node.dir)
    );
    for flow in &node.flows {
        println!(
            "  flow: name={} status={}{}",
            flow.flow,
            flow.status,
            if flow.cached { " (cached)" } else { "" }
        );
    }
    if let Some(error) = &node.error {
        eprintln!("error: {error}");
    }
}

fn tree_exit_code(tree: &StatusTree) -> i32 {
    match tree.status() {
        Status::Failure => exit_codes::FAILED,
        Status::Success | Status::Warning => exit_codes::OK,
    }
}

/// Sweep the conductor's builds over every scenario.
pub fn conduct(root: &Path) -> Result<i32> {
    let project = Project::open(root, None)?;
    let executor = ProcessExecutor;
    let orchestrator = Orchestrator::new(
        &project.root,
        &project.manifest,
        project.store.clone(),
        Runner::new(&executor, project.options()?),
    );
    let tree = orchestrator.conduct()?;
    print_tree(&project, &tree);
    Ok(tree_exit_code(&tree))
}

fn print_tree(project: &Project, tree: &StatusTree) {
    for node in &tree.builds {
        print_build(project, node);
    }
    let summary = tree.summary();
    println!(
        "summary: conductor={} status={} total={} success={} warning={} failure={}",
        tree.conductor,
        tree.status(),
        summary.total,
        summary.success,
        summary.warning,
        summary.failure
    );
    println!(
        "report: {}",
        project.show(&project.store.base().join(REPORT_FILE))
    );
}

/// Rebuild the status tree from disk and rewrite the report.
pub fn status(root: &Path) -> Result<i32> {
    let project = Project::open(root, None)?;
    let conductor = project
        .manifest
        .conductor
        .as_ref()
        .map_or("flowrun", |conductor| conductor.name.as_str());
    let tree = report::rebuild_tree(&project.store, conductor)?;
    report::write_report(&project.store, &tree)?;
    info!(builds = tree.builds.len(), "status rebuilt");
    print_tree(&project, &tree);
    Ok(exit_codes::OK)
}

/// Replay one step of a flow instance from its configuration snapshot.
pub fn replay_step(
    root: &Path,
    flow: &str,
    instance: &str,
    step: &str,
    build: Option<&str>,
) -> Result<i32> {
    let project = Project::open(root, None)?;
    let executor = ProcessExecutor;
    let orchestrator = Orchestrator::new(
        &project.root,
        &project.manifest,
        project.store.clone(),
        Runner::new(&executor, project.options()?),
    );
    let record = orchestrator.replay_step(flow, instance, step, build)?;
    println!(
        "step: flow={flow} instance={instance} step={} exit_code={}",
        record.name,
        record
            .exit_code
            .map_or_else(|| "none".to_string(), |code| code.to_string())
    );
    if let Some(error) = &record.error {
        eprintln!("error: {error}");
    }
    if record.succeeded() {
        return Ok(exit_codes::OK);
    }
    Ok(record
        .exit_code
        .filter(|code| *code != 0)
        .unwrap_or(exit_codes::INVALID))
}
