//! Scenario tables: explicit rows or the cartesian product of dimensions.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::core::config::Config;
use crate::core::path::validate_segment;
use crate::error::{FlowError, FlowResult};

/// Key holding a row's instance name.
pub const NAME_KEY: &str = "name";

/// One row of the parameter table.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    /// Instance name used for every build invoked for this row.
    pub name: String,
    /// Row parameters, overlaid onto the build configuration.
    pub params: Config,
}

/// Scenarios from explicit rows, each carrying a `name`.
pub fn from_rows(rows: &[Config]) -> FlowResult<Vec<Scenario>> {
    let mut scenarios = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let name = row
            .get(NAME_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                FlowError::config(format!("scenario row {index} is missing a string `name`"))
            })?
            .to_string();
        let mut params = row.clone();
        params.shift_remove(NAME_KEY);
        scenarios.push(Scenario { name, params });
    }
    ensure_unique_names(&scenarios)?;
    Ok(scenarios)
}

/// Scenarios from the cartesian product of named dimensions.
///
/// Dimensions vary in declaration order with the last one fastest. A
/// scenario is named `dim-value` pairs joined with `__`, for example
/// `param-1__mode-a`.
pub fn from_matrix(matrix: &Config) -> FlowResult<Vec<Scenario>> {
    if matrix.is_empty() {
        return Err(FlowError::config(
            "scenario matrix must declare at least one dimension",
        ));
    }
    let mut dimensions = Vec::with_capacity(matrix.len());
    for (name, values) in matrix {
        let values = values
            .as_array()
            .filter(|values| !values.is_empty())
            .ok_or_else(|| {
                FlowError::config(format!(
                    "matrix dimension `{name}` must be a non-empty array"
                ))
            })?;
        dimensions.push((name, values));
    }

    let mut scenarios = vec![Scenario {
        name: String::new(),
        params: Config::new(),
    }];
    for (dimension, values) in dimensions {
        let mut next = Vec::with_capacity(scenarios.len() * values.len());
        for partial in &scenarios {
            for value in values {
                let mut params = partial.params.clone();
                params.insert(dimension.clone(), value.clone());
                let part = format!("{dimension}-{}", name_fragment(value));
                let name = if partial.name.is_empty() {
                    part
                } else {
                    format!("{}__{part}", partial.name)
                };
                next.push(Scenario { name, params });
            }
        }
        scenarios = next;
    }
    ensure_unique_names(&scenarios)?;
    Ok(scenarios)
}

fn name_fragment(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    raw.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn ensure_unique_names(scenarios: &[Scenario]) -> FlowResult<()> {
    let mut seen = BTreeSet::new();
    for scenario in scenarios {
        validate_segment("scenario", &scenario.name)?;
        if !seen.insert(scenario.name.as_str()) {
            return Err(FlowError::config(format!(
                "duplicate scenario name `{}`",
                scenario.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Config {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn rows_keep_order_and_strip_name() {
        let rows = vec![
            config(json!({"name": "A", "param": 1})),
            config(json!({"name": "B", "param": 2})),
            config(json!({"name": "C", "param": 3})),
        ];
        let scenarios = from_rows(&rows).expect("rows");
        let names: Vec<&str> = scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(Value::Object(scenarios[1].params.clone()), json!({"param": 2}));
    }

    #[test]
    fn row_without_name_is_config_error() {
        let rows = vec![config(json!({"param": 1}))];
        let err = from_rows(&rows).unwrap_err();
        assert!(err.to_string().contains("missing a string `name`"));
    }

    #[test]
    fn duplicate_row_names_are_rejected() {
        let rows = vec![config(json!({"name": "A"})), config(json!({"name": "A"}))];
        assert!(from_rows(&rows).is_err());
    }

    #[test]
    fn row_name_must_be_single_segment() {
        let rows = vec![config(json!({"name": "../A"}))];
        assert!(from_rows(&rows).is_err());
    }

    #[test]
    fn matrix_is_cartesian_product_last_dimension_fastest() {
        let matrix = config(json!({"param": [1, 2], "mode": ["a", "b"]}));
        let scenarios = from_matrix(&matrix).expect("matrix");
        let names: Vec<&str> = scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "param-1__mode-a",
                "param-1__mode-b",
                "param-2__mode-a",
                "param-2__mode-b",
            ]
        );
        assert_eq!(
            Value::Object(scenarios[3].params.clone()),
            json!({"param": 2, "mode": "b"})
        );
    }

    #[test]
    fn matrix_sanitizes_value_fragments() {
        let matrix = config(json!({"path": ["a/b c"]}));
        let scenarios = from_matrix(&matrix).expect("matrix");
        assert_eq!(scenarios[0].name, "path-a_b_c");
    }

    #[test]
    fn matrix_rejects_empty_or_scalar_dimensions() {
        assert!(from_matrix(&Config::new()).is_err());
        assert!(from_matrix(&config(json!({"param": []}))).is_err());
        assert!(from_matrix(&config(json!({"param": 1}))).is_err());
    }
}
