//! BP-004: Task nodes and action bodies.
//!
//! A `TaskTree` is one level of an action body: its nodes in declaration
//! order, each naming the siblings that must finish first. Decision and loop
//! nodes own nested trees behind an `Arc` so a body is shared, never copied.

use super::reference::Ref;
use super::types::{EntityKind, ScriptType};
use indexmap::IndexMap;
use std::sync::Arc;

/// Direction of a scaling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Out,
    In,
}

impl ScaleDirection {
    pub fn wire(self) -> &'static str {
        match self {
            Self::Out => "SCALEOUT",
            Self::In => "SCALEIN",
        }
    }
}

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Exec {
        script_type: ScriptType,
        script: String,
    },
    SetVariable {
        script_type: ScriptType,
        script: String,
        variables: Vec<String>,
    },
    Http {
        method: String,
        url: String,
        body: String,
        headers: IndexMap<String, String>,
        status_codes: Vec<u16>,
        response_paths: IndexMap<String, String>,
    },
    Scaling {
        direction: ScaleDirection,
        count: String,
    },
    Delay {
        seconds: u64,
    },
    Input {
        inputs: Vec<String>,
    },
    Decision {
        script_type: ScriptType,
        script: String,
        success: Arc<TaskTree>,
        failure: Arc<TaskTree>,
    },
    Loop {
        iterations: String,
        loop_variable: String,
        body: Arc<TaskTree>,
    },
}

impl TaskKind {
    /// Wire task type.
    pub fn wire(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "EXEC",
            Self::SetVariable { .. } => "SET_VARIABLE",
            Self::Http { .. } => "HTTP",
            Self::Scaling { .. } => "SCALING",
            Self::Delay { .. } => "DELAY",
            Self::Input { .. } => "INPUT",
            Self::Decision { .. } => "DECISION",
            Self::Loop { .. } => "WHILE_LOOP",
        }
    }

    /// Kinds that run on a concrete entity and so need a target.
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            Self::Exec { .. } | Self::SetVariable { .. } | Self::Scaling { .. } | Self::Decision { .. }
        )
    }

    /// Entity kind the target must have, when constrained.
    pub fn required_target_kind(&self) -> Option<EntityKind> {
        match self {
            Self::Scaling { .. } => Some(EntityKind::Deployment),
            _ => None,
        }
    }

    /// Free text that may carry run-time macros.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            Self::Exec { script, .. }
            | Self::SetVariable { script, .. }
            | Self::Decision { script, .. } => vec![script.as_str()],
            Self::Http {
                url, body, headers, ..
            } => {
                let mut out = vec![url.as_str(), body.as_str()];
                out.extend(headers.values().map(String::as_str));
                out
            }
            Self::Scaling { count, .. } => vec![count.as_str()],
            Self::Loop { iterations, .. } => vec![iterations.as_str()],
            Self::Delay { .. } | Self::Input { .. } => Vec::new(),
        }
    }
}

/// One step of an action body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub name: String,
    pub description: String,
    pub kind: TaskKind,
    /// Explicit target; `None` falls back to the owning entity's default.
    pub target: Option<Ref>,
    /// Sibling tasks that must complete first, in declaration order.
    pub predecessors: Vec<String>,
    pub retries: u32,
    pub timeout_secs: u32,
}

/// One level of an action body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskTree {
    nodes: Vec<TaskNode>,
}

impl TaskTree {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_nodes(nodes: Vec<TaskNode>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, name: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Predecessor edges `(from, to)` of this level.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.predecessors
                    .iter()
                    .map(move |p| (p.as_str(), n.name.as_str()))
            })
            .collect()
    }

    /// Visit every node, nested ones included, depth-first in declaration order.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a TaskNode)) {
        for node in &self.nodes {
            visit(node);
            match &node.kind {
                TaskKind::Decision {
                    success, failure, ..
                } => {
                    success.walk(visit);
                    failure.walk(visit);
                }
                TaskKind::Loop { body, .. } => body.walk(visit),
                _ => {}
            }
        }
    }

    /// Every node of the tree, nested ones included.
    pub fn all_nodes(&self) -> Vec<&TaskNode> {
        let mut out = Vec::new();
        self.walk(&mut |n| out.push(n));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(name: &str, preds: &[&str]) -> TaskNode {
        TaskNode {
            name: name.to_string(),
            description: String::new(),
            kind: TaskKind::Exec {
                script_type: ScriptType::Sh,
                script: format!("echo {}", name),
            },
            target: None,
            predecessors: preds.iter().map(|s| s.to_string()).collect(),
            retries: 0,
            timeout_secs: 0,
        }
    }

    #[test]
    fn test_bp004_edges() {
        let tree = TaskTree::from_nodes(vec![exec("a", &[]), exec("b", &["a"]), exec("c", &["a"])]);
        assert_eq!(tree.edges(), vec![("a", "b"), ("a", "c")]);
        assert_eq!(tree.len(), 3);
        assert!(tree.get("b").is_some());
    }

    #[test]
    fn test_bp004_walk_nested() {
        let body = Arc::new(TaskTree::from_nodes(vec![exec("inner", &[])]));
        let looped = TaskNode {
            name: "l".to_string(),
            description: String::new(),
            kind: TaskKind::Loop {
                iterations: "3".to_string(),
                loop_variable: "iteration".to_string(),
                body,
            },
            target: None,
            predecessors: vec!["a".to_string()],
            retries: 0,
            timeout_secs: 0,
        };
        let tree = TaskTree::from_nodes(vec![exec("a", &[]), looped]);
        let names: Vec<&str> = tree.all_nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "l", "inner"]);
    }

    #[test]
    fn test_bp004_kind_properties() {
        let scale = TaskKind::Scaling {
            direction: ScaleDirection::Out,
            count: "1".to_string(),
        };
        assert!(scale.needs_target());
        assert_eq!(scale.required_target_kind(), Some(EntityKind::Deployment));
        assert_eq!(scale.wire(), "SCALING");
        assert!(!TaskKind::Delay { seconds: 5 }.needs_target());
        assert_eq!(ScaleDirection::In.wire(), "SCALEIN");
    }
}
