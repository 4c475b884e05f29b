//! Status report: rebuild the status tree from persisted artifacts and
//! render it to `status_report.html` and `status.json` under the run root.
//!
//! Rebuilding only reads. A unit whose log has no completion marker, or
//! whose instance lock is still present, never counts as successful.

use std::path::{Path, PathBuf};

use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::core::aggregate::{BuildNode, FlowNode, StatusTree, Summary};
use crate::core::classifier::{classify_persisted, has_completion_marker};
use crate::core::path::ArtifactPaths;
use crate::core::types::{Status, UnitKind};
use crate::error::{FlowError, FlowResult};
use crate::io::instance::InstanceStore;
use crate::run::timestamp;

const REPORT_TEMPLATE: &str = include_str!("../../templates/status_report.html");

pub const REPORT_FILE: &str = "status_report.html";
pub const STATUS_FILE: &str = "status.json";

/// Read one flow instance back from disk.
pub fn read_flow_node(
    store: &InstanceStore,
    flow: &str,
    instance: &str,
) -> FlowResult<FlowNode> {
    let dir = store.dir_of(flow, instance)?;
    let paths = ArtifactPaths::new(&dir, flow);
    let running = store.is_locked(&dir);
    let result = store.load_result(&paths);
    let log = store.read_log(&paths.log)?;

    let status = if running {
        Status::Failure
    } else {
        let from_log = log.as_deref().map_or(Status::Failure, classify_persisted);
        let recorded = result.as_ref().map_or(Status::Failure, |r| r.status);
        from_log.max(recorded)
    };
    Ok(FlowNode {
        flow: flow.to_string(),
        instance: instance.to_string(),
        dir,
        status,
        cached: false,
        running,
        duration_ms: result.as_ref().and_then(|r| r.duration_ms),
        error: result.and_then(|r| r.error),
    })
}

/// Read one build instance and its flows back from disk.
///
/// Flows are ordered by their recorded start time, which is the order the
/// build ran them in.
pub fn read_build_node(
    store: &InstanceStore,
    build: &str,
    instance: &str,
) -> FlowResult<BuildNode> {
    let dir = store.dir_of(build, instance)?;
    let paths = ArtifactPaths::new(&dir, build);
    let mut node = BuildNode::new(build, instance, dir.clone());
    node.running = store.is_locked(&dir);
    node.interrupted = !node.running
        && store
            .read_log(&paths.log)?
            .is_some_and(|log| !has_completion_marker(&log));
    if let Some(result) = store.load_result(&paths) {
        node.duration_ms = result.duration_ms;
        node.error = result.error;
    }

    let nested = store.nested(&dir);
    let mut flows = Vec::new();
    for flow in list_dirs(&nested, nested.base())? {
        let flow_dir = nested.base().join(&flow);
        if list_dirs(&nested, &flow_dir)?.iter().any(|name| name == instance) {
            let started = nested
                .load_result(&ArtifactPaths::new(&flow_dir.join(instance), &flow))
                .map(|result| result.started_at);
            flows.push((started, read_flow_node(&nested, &flow, instance)?));
        }
    }
    flows.sort_by(|a, b| match (&a.0, &b.0) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.1.flow.cmp(&b.1.flow),
    });
    node.flows = flows.into_iter().map(|(_, flow)| flow).collect();
    Ok(node)
}

/// Re-scan every build instance under the store's base.
///
/// An instance is a build when its result says so or when it holds nested
/// flow runs; standalone flow instances are not part of the tree.
#[instrument(skip_all, fields(base = %store.base().display()))]
pub fn rebuild_tree(store: &InstanceStore, conductor: &str) -> FlowResult<StatusTree> {
    let mut tree = StatusTree::new(conductor);
    for unit in list_dirs(store, store.base())? {
        let unit_dir = store.base().join(&unit);
        for instance in list_dirs(store, &unit_dir)? {
            let dir = unit_dir.join(&instance);
            let recorded_kind = store
                .load_result(&ArtifactPaths::new(&dir, &unit))
                .map(|result| result.kind);
            let is_build = match recorded_kind {
                Some(kind) => kind == UnitKind::Build,
                None => store.storage().is_dir(&dir.join("runs")),
            };
            if is_build {
                tree.record_build(read_build_node(store, &unit, &instance)?);
            } else {
                debug!(unit = %unit, instance = %instance, "skipping standalone flow");
            }
        }
    }
    debug!(builds = tree.builds.len(), "tree rebuilt");
    Ok(tree)
}

fn list_dirs(store: &InstanceStore, dir: &Path) -> FlowResult<Vec<String>> {
    store
        .storage()
        .list_dirs(dir)
        .map_err(|err| FlowError::storage("list", dir, err))
}

#[derive(Serialize)]
struct FlowView<'a> {
    flow: &'a str,
    status: &'static str,
    icon: &'static str,
    duration: Option<String>,
    cached: bool,
    running: bool,
    error: Option<&'a str>,
    dir: String,
}

#[derive(Serialize)]
struct BuildView<'a> {
    build: &'a str,
    instance: &'a str,
    status: &'static str,
    icon: &'static str,
    dir: String,
    duration: Option<String>,
    cached: bool,
    running: bool,
    interrupted: bool,
    error: Option<&'a str>,
    flows: Vec<FlowView<'a>>,
}

fn format_duration(ms: Option<u64>) -> Option<String> {
    let ms = ms?;
    Some(if ms < 1_000 {
        format!("{ms} ms")
    } else if ms < 60_000 {
        format!("{:.1} s", ms as f64 / 1_000.0)
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1_000)
    })
}

fn build_view(build: &BuildNode) -> BuildView<'_> {
    let status = build.status();
    BuildView {
        build: &build.build,
        instance: &build.instance,
        status: status.as_str(),
        icon: status.icon(),
        dir: build.dir.display().to_string(),
        duration: format_duration(build.duration_ms),
        cached: build.cached,
        running: build.running,
        interrupted: build.interrupted,
        error: build.error.as_deref(),
        flows: build
            .flows
            .iter()
            .map(|flow| FlowView {
                flow: &flow.flow,
                status: flow.status.as_str(),
                icon: flow.status.icon(),
                duration: format_duration(flow.duration_ms),
                cached: flow.cached,
                running: flow.running,
                error: flow.error.as_deref(),
                dir: flow.dir.display().to_string(),
            })
            .collect(),
    }
}

/// Render the tree as a standalone HTML page.
pub fn render_html(tree: &StatusTree, generated_at: &str) -> FlowResult<String> {
    let mut env = Environment::new();
    env.add_template(REPORT_FILE, REPORT_TEMPLATE)
        .map_err(|err| FlowError::config(format!("report template: {err}")))?;
    let template = env
        .get_template(REPORT_FILE)
        .map_err(|err| FlowError::config(format!("report template: {err}")))?;
    let status = tree.status();
    let builds: Vec<BuildView<'_>> = tree.builds.iter().map(build_view).collect();
    template
        .render(context! {
            conductor => &tree.conductor,
            status => status.as_str(),
            status_icon => status.icon(),
            generated_at => generated_at,
            summary => tree.summary(),
            builds => builds,
        })
        .map_err(|err| FlowError::config(format!("render report: {err}")))
}

#[derive(Serialize)]
struct StatusDocument<'a> {
    conductor: &'a str,
    status: Status,
    generated_at: &'a str,
    summary: Summary,
    builds: &'a [BuildNode],
}

/// Write `status_report.html` and `status.json` under the store's base.
#[instrument(skip_all, fields(conductor = %tree.conductor))]
pub fn write_report(store: &InstanceStore, tree: &StatusTree) -> FlowResult<PathBuf> {
    let generated_at = timestamp();
    let html = render_html(tree, &generated_at)?;
    let report = store.base().join(REPORT_FILE);
    store
        .storage()
        .write_atomic(&report, html.as_bytes())
        .map_err(|err| FlowError::storage("write report", &report, err))?;

    let document = StatusDocument {
        conductor: &tree.conductor,
        status: tree.status(),
        generated_at: &generated_at,
        summary: tree.summary(),
        builds: &tree.builds,
    };
    store.write_json(&store.base().join(STATUS_FILE), &document)?;
    info!(status = %tree.status(), builds = tree.builds.len(), "status report written");
    Ok(report)
}
