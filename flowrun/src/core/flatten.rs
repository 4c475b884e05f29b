//! Configuration flattening into an explicit binding set.
//!
//! Rules:
//! - A top-level scalar is bound under its own key.
//! - A top-level mapping is bound under its own key **and** each of its
//!   children is bound at top level. Only one level is promoted.
//! - Entries are processed in the configuration's key order and a later
//!   binding silently replaces an earlier one with the same key. A child
//!   promoted from a mapping can therefore overwrite a top-level scalar that
//!   appears before the mapping, and is overwritten by one that appears after.
//! - A string bound under a key accepted by the [`PathRule`] becomes a
//!   [`Binding::Path`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::config::{Config, PROJECT_ROOT_KEY};
use crate::error::{FlowError, FlowResult};

/// Declared naming convention for path-valued keys (`[settings.path_keys]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathKeys {
    /// A key ending in any of these is path-like.
    pub suffixes: Vec<String>,
    /// Keys that are path-like regardless of suffix.
    pub exact: Vec<String>,
    /// Optional regex; a key matching it is path-like.
    pub pattern: Option<String>,
}

impl Default for PathKeys {
    fn default() -> Self {
        Self {
            suffixes: vec!["_dir".to_string(), "_path".to_string(), "_file".to_string()],
            exact: vec![PROJECT_ROOT_KEY.to_string()],
            pattern: None,
        }
    }
}

/// Compiled [`PathKeys`].
#[derive(Debug, Clone)]
pub struct PathRule {
    suffixes: Vec<String>,
    exact: Vec<String>,
    pattern: Option<Regex>,
}

impl PathRule {
    pub fn compile(keys: &PathKeys) -> FlowResult<Self> {
        let pattern = match &keys.pattern {
            Some(raw) => Some(Regex::new(raw).map_err(|err| {
                FlowError::config(format!("invalid path_keys.pattern {raw:?}: {err}"))
            })?),
            None => None,
        };
        Ok(Self {
            suffixes: keys.suffixes.clone(),
            exact: keys.exact.clone(),
            pattern,
        })
    }

    /// A rule that never coerces.
    pub fn none() -> Self {
        Self {
            suffixes: Vec::new(),
            exact: Vec::new(),
            pattern: None,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.exact.iter().any(|exact| exact == key)
            || self.suffixes.iter().any(|suffix| key.ends_with(suffix.as_str()))
            || self.pattern.as_ref().is_some_and(|re| re.is_match(key))
    }
}

impl Default for PathRule {
    fn default() -> Self {
        let keys = PathKeys::default();
        Self {
            suffixes: keys.suffixes,
            exact: keys.exact,
            pattern: None,
        }
    }
}

/// One bound value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Binding {
    Path(PathBuf),
    Value(Value),
}

impl Binding {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Binding::Value(value) => Some(value),
            Binding::Path(_) => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Binding::Path(path) => Some(path),
            Binding::Value(_) => None,
        }
    }
}

/// Flat name -> binding map consumed by explicit lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BindingSet {
    bindings: BTreeMap<String, Binding>,
}

impl BindingSet {
    pub fn get(&self, key: &str) -> Option<&Binding> {
        self.bindings.get(key)
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.get(key).and_then(Binding::as_value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get_value(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_value(key).and_then(Value::as_i64)
    }

    pub fn get_path(&self, key: &str) -> Option<&Path> {
        self.get(key).and_then(Binding::as_path)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter()
    }

    fn bind(&mut self, key: &str, value: &Value, rule: &PathRule) {
        let binding = match value {
            Value::String(raw) if rule.matches(key) => Binding::Path(PathBuf::from(raw)),
            other => Binding::Value(other.clone()),
        };
        self.bindings.insert(key.to_string(), binding);
    }
}

/// Flatten `config` one level deep. See the module docs for the rules.
pub fn flatten(config: &Config, rule: &PathRule) -> BindingSet {
    let mut set = BindingSet::default();
    for (key, value) in config {
        match value {
            Value::Object(children) => {
                set.bindings
                    .insert(key.clone(), Binding::Value(value.clone()));
                for (child_key, child_value) in children {
                    set.bind(child_key, child_value, rule);
                }
            }
            scalar => set.bind(key, scalar, rule),
        }
    }
    set
}
