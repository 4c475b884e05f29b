//! Status tree: conductor -> build instances -> flow instances.
//!
//! The tree is a cache of what is on disk. It can be folded incrementally as
//! units finish, or rebuilt from persisted artifacts (`io::report`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::types::Status;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNode {
    pub flow: String,
    pub instance: String,
    pub dir: PathBuf,
    pub status: Status,
    /// Reused from an earlier run by the cache policy.
    pub cached: bool,
    /// Instance lock present: the unit is still being written.
    pub running: bool,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNode {
    pub build: String,
    pub instance: String,
    pub dir: PathBuf,
    pub flows: Vec<FlowNode>,
    /// The build's own log exists without a completion marker.
    pub interrupted: bool,
    /// Instance lock present: the build is still running.
    pub running: bool,
    pub cached: bool,
    pub duration_ms: Option<u64>,
    /// Build-level config or storage error.
    pub error: Option<String>,
}

impl BuildNode {
    pub fn new(build: &str, instance: &str, dir: PathBuf) -> Self {
        Self {
            build: build.to_string(),
            instance: instance.to_string(),
            dir,
            flows: Vec::new(),
            interrupted: false,
            running: false,
            cached: false,
            duration_ms: None,
            error: None,
        }
    }

    /// Worst of the flow statuses, or failure if the build itself failed or
    /// has not finished.
    pub fn status(&self) -> Status {
        if self.interrupted || self.running || self.error.is_some() {
            return Status::Failure;
        }
        Status::worst_of(self.flows.iter().map(|flow| flow.status))
    }

    /// Insert or replace the node for `flow.flow`, keeping first-seen order.
    pub fn record_flow(&mut self, flow: FlowNode) {
        match self.flows.iter_mut().find(|node| node.flow == flow.flow) {
            Some(existing) => *existing = flow,
            None => self.flows.push(flow),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTree {
    pub conductor: String,
    pub builds: Vec<BuildNode>,
}

/// Counts of build instances per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub success: usize,
    pub warning: usize,
    pub failure: usize,
}

impl StatusTree {
    pub fn new(conductor: &str) -> Self {
        Self {
            conductor: conductor.to_string(),
            builds: Vec::new(),
        }
    }

    /// Worst of the build statuses; an empty conductor is success.
    pub fn status(&self) -> Status {
        Status::worst_of(self.builds.iter().map(BuildNode::status))
    }

    pub fn build(&self, build: &str, instance: &str) -> Option<&BuildNode> {
        self.builds
            .iter()
            .find(|node| node.build == build && node.instance == instance)
    }

    /// Node for `(build, instance)`, created empty if absent.
    pub fn build_mut(&mut self, build: &str, instance: &str, dir: PathBuf) -> &mut BuildNode {
        let position = self
            .builds
            .iter()
            .position(|node| node.build == build && node.instance == instance);
        match position {
            Some(index) => &mut self.builds[index],
            None => {
                self.builds.push(BuildNode::new(build, instance, dir));
                let last = self.builds.len() - 1;
                &mut self.builds[last]
            }
        }
    }

    /// Fold one finished flow into its build.
    pub fn record_flow(&mut self, build: &str, instance: &str, build_dir: PathBuf, flow: FlowNode) {
        self.build_mut(build, instance, build_dir).record_flow(flow);
    }

    /// Insert or replace a whole build node.
    pub fn record_build(&mut self, node: BuildNode) {
        let slot = self.build_mut(&node.build, &node.instance, node.dir.clone());
        *slot = node;
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for build in &self.builds {
            summary.total += 1;
            match build.status() {
                Status::Success => summary.success += 1,
                Status::Warning => summary.warning += 1,
                Status::Failure => summary.failure += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(name: &str, status: Status) -> FlowNode {
        FlowNode {
            flow: name.to_string(),
            instance: "A".to_string(),
            dir: PathBuf::from(format!("runs/model/A/runs/{name}/A")),
            status,
            cached: false,
            running: false,
            duration_ms: None,
            error: None,
        }
    }

    fn build_with(statuses: &[Status]) -> BuildNode {
        let mut node = BuildNode::new("model", "A", PathBuf::from("runs/model/A"));
        for (i, status) in statuses.iter().enumerate() {
            node.record_flow(flow(&format!("f{i}"), *status));
        }
        node
    }

    #[test]
    fn build_aggregates_worst_flow() {
        assert_eq!(
            build_with(&[Status::Success, Status::Warning]).status(),
            Status::Warning
        );
        assert_eq!(
            build_with(&[Status::Warning, Status::Failure]).status(),
            Status::Failure
        );
        assert_eq!(build_with(&[]).status(), Status::Success);
    }

    #[test]
    fn interrupted_errored_or_running_build_is_failure() {
        let mut node = build_with(&[Status::Success]);
        node.interrupted = true;
        assert_eq!(node.status(), Status::Failure);

        let mut node = build_with(&[Status::Success]);
        node.error = Some("ConfigError: bad".to_string());
        assert_eq!(node.status(), Status::Failure);

        let mut node = build_with(&[Status::Success]);
        node.running = true;
        assert_eq!(node.status(), Status::Failure);
    }

    #[test]
    fn conductor_aggregates_worst_build() {
        let mut tree = StatusTree::new("sweep");
        assert_eq!(tree.status(), Status::Success);

        let mut a = build_with(&[Status::Success]);
        a.instance = "A".to_string();
        let mut b = build_with(&[Status::Success]);
        b.instance = "B".to_string();
        tree.record_build(a);
        tree.record_build(b);
        assert_eq!(tree.status(), Status::Success);

        tree.record_flow(
            "model",
            "B",
            PathBuf::from("runs/model/B"),
            flow("late", Status::Warning),
        );
        assert_eq!(tree.status(), Status::Warning);
        assert_eq!(
            tree.summary(),
            Summary {
                total: 2,
                success: 1,
                warning: 1,
                failure: 0,
            }
        );
    }

    #[test]
    fn record_flow_replaces_existing_entry() {
        let mut node = build_with(&[Status::Failure]);
        node.record_flow(flow("f0", Status::Success));
        assert_eq!(node.flows.len(), 1);
        assert_eq!(node.status(), Status::Success);
    }
}
