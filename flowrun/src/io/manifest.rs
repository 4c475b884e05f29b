//! Project manifest (`flowrun.toml` or `flowrun.json`) and configuration documents.
//!
//! The manifest declares flows (named step lists), builds (ordered flow
//! references with optional declared inputs) and at most one conductor
//! (builds swept over a scenario table). It is checked against the embedded
//! JSON Schema before deserialization, then semantically by
//! [`Manifest::validate`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::config::Config;
use crate::core::flatten::{PathKeys, PathRule};
use crate::core::graph::{BuildGraph, GraphEntry};
use crate::core::path::validate_segment;
use crate::core::scenario::{self, Scenario};
use crate::core::types::{ExecMode, StepSpec};
use crate::error::{FlowError, FlowResult};

const MANIFEST_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/manifest/v1.schema.json"
));

/// Manifest file names looked up at the project root, in order.
pub const MANIFEST_FILES: [&str; 2] = ["flowrun.toml", "flowrun.json"];

/// Engine settings (`[settings]`). Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Run root, relative to the project root.
    pub run_root: PathBuf,
    pub path_keys: PathKeys,
    /// Reject builds whose declared inputs form a cycle.
    pub detect_cycles: bool,
    /// Forward unit output to the console while capturing it.
    pub echo: bool,
    /// Wall-clock budget for all steps of one unit.
    pub unit_timeout_secs: Option<u64>,
    /// Bound on the per-step output kept in the execution artifact.
    pub output_limit_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            run_root: PathBuf::from("runs"),
            path_keys: PathKeys::default(),
            detect_cycles: false,
            echo: true,
            unit_timeout_secs: None,
            output_limit_bytes: 100_000,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> FlowResult<()> {
        if self.run_root.as_os_str().is_empty() {
            return Err(FlowError::config("settings.run_root must not be empty"));
        }
        if self.unit_timeout_secs == Some(0) {
            return Err(FlowError::config("settings.unit_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(FlowError::config("settings.output_limit_bytes must be > 0"));
        }
        PathRule::compile(&self.path_keys)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FlowDef {
    pub name: String,
    pub steps: Vec<StepSpec>,
    /// Configuration document, relative to the project root.
    #[serde(default)]
    pub config: Option<PathBuf>,
    #[serde(default)]
    pub mode: ExecMode,
}

/// A flow as it appears inside a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BuildFlowRef {
    pub flow: String,
    /// Node name when the same flow appears more than once.
    #[serde(default)]
    pub alias: Option<String>,
    /// Upstream nodes whose instance directories this flow reads.
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl BuildFlowRef {
    /// Name of this node within the build (and of its instance directory).
    pub fn node_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.flow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BuildDef {
    pub name: String,
    pub flows: Vec<BuildFlowRef>,
    #[serde(default)]
    pub config: Option<PathBuf>,
}

impl BuildDef {
    pub fn graph(&self) -> FlowResult<BuildGraph> {
        BuildGraph::new(self.flows.iter().map(|node| GraphEntry {
            name: node.node_name(),
            inputs: &node.inputs,
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConductorDef {
    pub name: String,
    pub builds: Vec<String>,
    /// Explicit rows, each with a `name`.
    #[serde(default)]
    pub scenarios: Vec<Config>,
    /// Named dimensions expanded to their cartesian product.
    #[serde(default)]
    pub matrix: Option<Config>,
}

impl ConductorDef {
    pub fn scenarios(&self) -> FlowResult<Vec<Scenario>> {
        match (&self.matrix, self.scenarios.is_empty()) {
            (Some(_), false) => Err(FlowError::config(format!(
                "conductor `{}` declares both scenarios and a matrix",
                self.name
            ))),
            (Some(matrix), true) => scenario::from_matrix(matrix),
            (None, false) => scenario::from_rows(&self.scenarios),
            (None, true) => Err(FlowError::config(format!(
                "conductor `{}` declares no scenarios",
                self.name
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub flows: Vec<FlowDef>,
    #[serde(default)]
    pub builds: Vec<BuildDef>,
    #[serde(default)]
    pub conductor: Option<ConductorDef>,
}

impl Manifest {
    /// Locate the manifest under `root`.
    pub fn find(root: &Path) -> FlowResult<PathBuf> {
        MANIFEST_FILES
            .iter()
            .map(|name| root.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                FlowError::config(format!(
                    "no {} found in {}",
                    MANIFEST_FILES.join(" or "),
                    root.display()
                ))
            })
    }

    /// Read, schema-check, deserialize and validate a manifest file.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> FlowResult<Self> {
        let value = read_document(path)?;
        let manifest = Self::from_value(value)?;
        debug!(
            flows = manifest.flows.len(),
            builds = manifest.builds.len(),
            "manifest loaded"
        );
        Ok(manifest)
    }

    /// Schema-check, deserialize and validate an already parsed document.
    pub fn from_value(value: Value) -> FlowResult<Self> {
        validate_schema(&value)?;
        let manifest: Manifest = serde_json::from_value(value)
            .map_err(|err| FlowError::config(format!("invalid manifest: {err}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn flow(&self, name: &str) -> FlowResult<&FlowDef> {
        self.flows
            .iter()
            .find(|flow| flow.name == name)
            .ok_or_else(|| FlowError::config(format!("unknown flow `{name}`")))
    }

    pub fn build(&self, name: &str) -> FlowResult<&BuildDef> {
        self.builds
            .iter()
            .find(|build| build.name == name)
            .ok_or_else(|| FlowError::config(format!("unknown build `{name}`")))
    }

    pub fn conductor(&self) -> FlowResult<&ConductorDef> {
        self.conductor
            .as_ref()
            .ok_or_else(|| FlowError::config("manifest declares no [conductor]"))
    }

    /// Cross-reference checks the schema cannot express.
    pub fn validate(&self) -> FlowResult<()> {
        self.settings.validate()?;

        let mut flow_names = BTreeSet::new();
        for flow in &self.flows {
            validate_segment("flow", &flow.name)?;
            if !flow_names.insert(flow.name.as_str()) {
                return Err(FlowError::config(format!("duplicate flow `{}`", flow.name)));
            }
            validate_steps(flow)?;
        }

        let mut build_names = BTreeSet::new();
        for build in &self.builds {
            validate_segment("build", &build.name)?;
            if !build_names.insert(build.name.as_str()) {
                return Err(FlowError::config(format!(
                    "duplicate build `{}`",
                    build.name
                )));
            }
            // Flows and builds share the run root.
            if flow_names.contains(build.name.as_str()) {
                return Err(FlowError::config(format!(
                    "build `{}` has the same name as a flow; both would share one run directory",
                    build.name
                )));
            }
            for node in &build.flows {
                if !flow_names.contains(node.flow.as_str()) {
                    return Err(FlowError::config(format!(
                        "build `{}` references unknown flow `{}`",
                        build.name, node.flow
                    )));
                }
                validate_segment("flow", node.node_name())?;
            }
            build.graph()?.validate(self.settings.detect_cycles)?;
        }

        if let Some(conductor) = &self.conductor {
            validate_segment("conductor", &conductor.name)?;
            for build in &conductor.builds {
                if !build_names.contains(build.as_str()) {
                    return Err(FlowError::config(format!(
                        "conductor `{}` references unknown build `{build}`",
                        conductor.name
                    )));
                }
            }
            conductor.scenarios()?;
        }
        Ok(())
    }
}

fn validate_steps(flow: &FlowDef) -> FlowResult<()> {
    if flow.steps.is_empty() {
        return Err(FlowError::config(format!("flow `{}` has no steps", flow.name)));
    }
    let mut names = BTreeSet::new();
    for step in &flow.steps {
        validate_segment("step", &step.name)?;
        if !names.insert(step.name.as_str()) {
            return Err(FlowError::config(format!(
                "flow `{}` has duplicate step `{}`",
                flow.name, step.name
            )));
        }
        if step.command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(FlowError::config(format!(
                "step `{}` of flow `{}` needs a non-empty command",
                step.name, flow.name
            )));
        }
    }
    Ok(())
}

/// Validate a manifest document against the embedded schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> FlowResult<()> {
    let schema: Value = serde_json::from_str(MANIFEST_SCHEMA)
        .map_err(|err| FlowError::config(format!("parse manifest schema: {err}")))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| FlowError::config(format!("compile manifest schema: {err}")))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(FlowError::config(format!(
            "manifest schema validation failed:\n- {}",
            messages.join("\n- ")
        )));
    }
    Ok(())
}

/// Parse a JSON or TOML document (chosen by extension; anything but
/// `.toml` is read as JSON).
pub fn read_document(path: &Path) -> FlowResult<Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| FlowError::config(format!("read {}: {err}", path.display())))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&text)
            .map_err(|err| FlowError::config(format!("parse {}: {err}", path.display())))
    } else {
        serde_json::from_str(&text)
            .map_err(|err| FlowError::config(format!("parse {}: {err}", path.display())))
    }
}

/// Load a configuration document; its top level must be a mapping.
pub fn load_config_document(path: &Path) -> FlowResult<Config> {
    match read_document(path)? {
        Value::Object(config) => Ok(config),
        other => Err(FlowError::config(format!(
            "{} must contain a mapping at the top level, found {}",
            path.display(),
            json_kind(&other)
        ))),
    }
}

/// Load `relative` under `root`, or an empty configuration when absent.
pub fn load_optional_config(root: &Path, relative: Option<&Path>) -> FlowResult<Config> {
    match relative {
        Some(path) => load_config_document(&root.join(path)),
        None => Ok(Config::new()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}
