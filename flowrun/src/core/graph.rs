//! Build structure as a directed graph of flow nodes.
//!
//! Edges run from a declared input to the flow that reads it. The graph is
//! advisory: execution always follows the author's order, and the graph only
//! validates declared inputs (unknown names, cycles, inputs that run later).

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{FlowError, FlowResult};

/// One flow node of a build, in author order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEntry<'a> {
    pub name: &'a str,
    pub inputs: &'a [String],
}

#[derive(Debug)]
pub struct BuildGraph {
    graph: DiGraph<String, ()>,
    order: Vec<NodeIndex>,
    index: HashMap<String, NodeIndex>,
}

impl BuildGraph {
    /// Build the graph. Duplicate node names or unknown inputs are config errors.
    pub fn new<'a>(entries: impl IntoIterator<Item = GraphEntry<'a>>) -> FlowResult<Self> {
        let entries: Vec<GraphEntry<'a>> = entries.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut order = Vec::with_capacity(entries.len());
        let mut index = HashMap::new();

        for entry in &entries {
            if index.contains_key(entry.name) {
                return Err(FlowError::config(format!(
                    "flow `{}` appears twice in the build (give one an alias)",
                    entry.name
                )));
            }
            let node = graph.add_node(entry.name.to_string());
            index.insert(entry.name.to_string(), node);
            order.push(node);
        }

        for entry in &entries {
            let target = index[entry.name];
            for input in entry.inputs {
                let source = *index.get(input.as_str()).ok_or_else(|| {
                    FlowError::config(format!(
                        "flow `{}` declares unknown input `{input}`",
                        entry.name
                    ))
                })?;
                graph.add_edge(source, target, ());
            }
        }

        Ok(Self {
            graph,
            order,
            index,
        })
    }

    /// Flow names in author order.
    pub fn author_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|node| self.graph[*node].as_str())
            .collect()
    }

    /// Declared inputs of `flow`, in author order.
    pub fn inputs_of(&self, flow: &str) -> Vec<&str> {
        let Some(node) = self.index.get(flow) else {
            return Vec::new();
        };
        let mut inputs: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(*node, petgraph::Direction::Incoming)
            .collect();
        inputs.sort_by_key(|input| self.position(*input));
        inputs.dedup();
        inputs
            .into_iter()
            .map(|input| self.graph[input].as_str())
            .collect()
    }

    /// Name of a flow that takes part in a cycle, if any.
    pub fn find_cycle(&self) -> Option<&str> {
        toposort(&self.graph, None)
            .err()
            .map(|cycle| self.graph[cycle.node_id()].as_str())
    }

    /// `(flow, input)` pairs where the input does not run before the flow.
    pub fn late_inputs(&self) -> Vec<(&str, &str)> {
        let mut late = Vec::new();
        for node in &self.order {
            let name = self.graph[*node].as_str();
            for input in self.inputs_of(name) {
                if self.position(self.index[input]) >= self.position(*node) {
                    late.push((name, input));
                }
            }
        }
        late
    }

    /// Check the graph. Cycles fail only when `detect_cycles` is set; late
    /// inputs are returned as warning messages.
    pub fn validate(&self, detect_cycles: bool) -> FlowResult<Vec<String>> {
        if detect_cycles && let Some(flow) = self.find_cycle() {
            return Err(FlowError::config(format!(
                "declared inputs form a cycle through flow `{flow}`"
            )));
        }
        Ok(self
            .late_inputs()
            .into_iter()
            .map(|(flow, input)| {
                format!("flow `{flow}` reads input `{input}` which does not run before it")
            })
            .collect())
    }

    fn position(&self, node: NodeIndex) -> usize {
        self.order
            .iter()
            .position(|candidate| *candidate == node)
            .unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(table: &[(&'static str, Vec<String>)]) -> Vec<(String, Vec<String>)> {
        table
            .iter()
            .map(|(name, inputs)| (name.to_string(), inputs.clone()))
            .collect()
    }

    fn graph(table: &[(String, Vec<String>)]) -> FlowResult<BuildGraph> {
        BuildGraph::new(table.iter().map(|(name, inputs)| GraphEntry {
            name,
            inputs,
        }))
    }

    #[test]
    fn keeps_author_order_and_inputs() {
        let table = entries(&[
            ("load", vec![]),
            ("clean", vec!["load".to_string()]),
            ("report", vec!["clean".to_string(), "load".to_string()]),
        ]);
        let graph = graph(&table).expect("graph");
        assert_eq!(graph.author_order(), vec!["load", "clean", "report"]);
        assert_eq!(graph.inputs_of("report"), vec!["load", "clean"]);
        assert!(graph.find_cycle().is_none());
        assert!(graph.validate(true).expect("valid").is_empty());
    }

    #[test]
    fn unknown_input_is_config_error() {
        let table = entries(&[("clean", vec!["missing".to_string()])]);
        let err = graph(&table).unwrap_err();
        assert!(err.to_string().contains("unknown input `missing`"));
    }

    #[test]
    fn duplicate_flow_is_config_error() {
        let table = entries(&[("load", vec![]), ("load", vec![])]);
        assert!(graph(&table).is_err());
    }

    #[test]
    fn cycle_detection_is_optional() {
        let table = entries(&[
            ("a", vec!["b".to_string()]),
            ("b", vec!["a".to_string()]),
        ]);
        let graph = graph(&table).expect("graph");
        assert!(graph.find_cycle().is_some());
        assert!(graph.validate(true).is_err());
        let warnings = graph.validate(false).expect("advisory");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("flow `a` reads input `b`"));
    }

    #[test]
    fn late_input_is_reported() {
        let table = entries(&[("report", vec!["load".to_string()]), ("load", vec![])]);
        let graph = graph(&table).expect("graph");
        assert_eq!(graph.late_inputs(), vec![("report", "load")]);
    }
}
