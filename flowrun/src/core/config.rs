//! Configuration documents as ordered JSON maps.
//!
//! A configuration is the only parameterization channel of a unit. Key order
//! is preserved (`serde_json` `preserve_order`), which the flattener relies on
//! for its collision policy.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Ordered key -> value configuration document.
pub type Config = Map<String, Value>;

/// Reserved field carrying the absolute project root.
pub const PROJECT_ROOT_KEY: &str = "_project_root";
/// Reserved field mapping declared upstream flows to their instance directories.
pub const INPUTS_KEY: &str = "_inputs";

/// Look up `section/param`, or search for a bare `param`.
///
/// A bare name matches a top-level key first, then the first nested section
/// (in document order) that contains it.
pub fn lookup<'a>(config: &'a Config, param_path: &str) -> Option<&'a Value> {
    if let Some((section, param)) = param_path.split_once('/') {
        return config.get(section)?.as_object()?.get(param);
    }
    if let Some(value) = config.get(param_path) {
        return Some(value);
    }
    config
        .values()
        .filter_map(Value::as_object)
        .find_map(|section| section.get(param_path))
}

/// Overlay `overrides` onto `base`.
///
/// Mappings present on both sides merge recursively; any other value in
/// `overrides` replaces the base value. New keys are appended in override order.
pub fn overlay(base: &Config, overrides: &Config) -> Config {
    let mut merged = base.clone();
    for (key, value) in overrides {
        match (merged.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                let nested = overlay(existing, incoming);
                *existing = nested;
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Hex SHA-256 of the canonical (compact) JSON encoding.
pub fn digest(config: &Config) -> String {
    let encoded = serde_json::to_vec(config).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

/// Markdown overview of a configuration: flat keys as one table, each
/// nested section as its own table.
pub fn summary_markdown(config: &Config, title: Option<&str>) -> String {
    if config.is_empty() {
        return "**No configuration provided**\n".to_string();
    }
    let mut lines = Vec::new();
    match title {
        Some(name) => lines.push(format!("## Configuration for {name}\n")),
        None => lines.push("## Configuration\n".to_string()),
    }

    let (sections, flat): (Vec<_>, Vec<_>) = config
        .iter()
        .partition(|(_, value)| matches!(value, Value::Object(map) if !map.is_empty()));

    if !flat.is_empty() {
        push_table(&mut lines, flat.into_iter());
        lines.push(String::new());
    }

    for (name, value) in sections {
        lines.push(format!("### {}", title_case(name)));
        lines.push(String::new());
        if let Value::Object(section) = value {
            push_table(&mut lines, section.iter());
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

fn push_table<'a>(lines: &mut Vec<String>, rows: impl Iterator<Item = (&'a String, &'a Value)>) {
    lines.push("| Parameter | Value |".to_string());
    lines.push("|-----------|-------|".to_string());
    for (key, value) in rows {
        lines.push(format!("| {key} | {} |", display_value(value)));
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "*None*".to_string(),
        Value::Bool(true) => "✓".to_string(),
        Value::Bool(false) => "✗".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => format!("*{} items*", map.len()),
        Value::String(s) => {
            let escaped = s.replace('|', "\\|");
            if escaped.chars().count() > 50 {
                let head: String = escaped.chars().take(47).collect();
                format!("{head}...")
            } else {
                escaped
            }
        }
    }
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Config {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn lookup_section_path() {
        let cfg = config(json!({"processing": {"method": "standard"}}));
        assert_eq!(lookup(&cfg, "processing/method"), Some(&json!("standard")));
        assert_eq!(lookup(&cfg, "processing/missing"), None);
        assert_eq!(lookup(&cfg, "missing/method"), None);
    }

    #[test]
    fn lookup_bare_name_prefers_top_level_then_sections() {
        let cfg = config(json!({
            "a": {"iterations": 1},
            "b": {"iterations": 2},
        }));
        assert_eq!(lookup(&cfg, "iterations"), Some(&json!(1)));

        let cfg = config(json!({
            "a": {"iterations": 1},
            "iterations": 9,
        }));
        assert_eq!(lookup(&cfg, "iterations"), Some(&json!(9)));
    }

    #[test]
    fn overlay_merges_nested_sections() {
        let base = config(json!({"db": {"host": "x", "port": 1}, "mode": "a"}));
        let overrides = config(json!({"db": {"port": 2}, "param": 3}));
        let merged = overlay(&base, &overrides);
        assert_eq!(
            Value::Object(merged),
            json!({"db": {"host": "x", "port": 2}, "mode": "a", "param": 3})
        );
    }

    #[test]
    fn digest_changes_with_content() {
        let a = config(json!({"param": 1}));
        let b = config(json!({"param": 2}));
        assert_eq!(digest(&a), digest(&a.clone()));
        assert_ne!(digest(&a), digest(&b));
        assert_eq!(digest(&a).len(), 64);
    }

    #[test]
    fn summary_renders_flat_and_sections() {
        let cfg = config(json!({
            "threshold": 10,
            "enabled": true,
            "processing_params": {"method": "standard"},
        }));
        let md = summary_markdown(&cfg, Some("prep"));
        assert!(md.starts_with("## Configuration for prep"));
        assert!(md.contains("| threshold | 10 |"));
        assert!(md.contains("| enabled | ✓ |"));
        assert!(md.contains("### Processing Params"));
        assert!(md.contains("| method | standard |"));
    }

    #[test]
    fn summary_of_empty_config() {
        assert_eq!(
            summary_markdown(&Config::new(), None),
            "**No configuration provided**\n"
        );
    }
}
