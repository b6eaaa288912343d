//! Pure classification of a node's lifecycle state from observed facts.

use std::fmt;

use k8s_openapi::api::core::v1::{Node, Pod};

use crate::ANNOTATION_NODE_STATE;

/// Per-node lifecycle state, derived from taint presence and agent pod
/// readiness on every pass. The stored annotation only disambiguates `new`
/// from `unknown`; everything else comes from live observation, so replayed
/// or missed events converge to the same classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    New,
    Pending,
    Initialized,
    Ready,
    Unknown,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::New => "new",
            NodeState::Pending => "pending",
            NodeState::Initialized => "initialized",
            NodeState::Ready => "ready",
            NodeState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn has_taint_with_key(node: &Node, key: &str) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .map(|taints| taints.iter().any(|taint| taint.key == key))
        .unwrap_or(false)
}

/// A pod counts as a live agent once its `Ready` condition is `True`.
/// Phase is deliberately ignored; readiness gates flapping during restarts
/// are exactly the signal we want to react to.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|cond| cond.type_ == "Ready" && cond.status == "True")
        })
        .unwrap_or(false)
}

pub fn classify(node: &Node, agent_taint_key: &str, has_ready_agent_pod: bool) -> NodeState {
    let annotated = node
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_NODE_STATE))
        .map(String::as_str);
    let tainted = has_taint_with_key(node, agent_taint_key);

    if matches!(annotated, None | Some("new")) && !has_ready_agent_pod && !tainted {
        return NodeState::New;
    }

    match (tainted, has_ready_agent_pod) {
        (true, false) => NodeState::Pending,
        (true, true) => NodeState::Initialized,
        (false, true) => NodeState::Ready,
        (false, false) => NodeState::Unknown,
    }
}
