use serde::{Deserialize, Serialize};

pub mod patch;
pub mod queue;
pub mod reconciler;
pub mod state;

/// Taint applied to nodes whose containerd registry config has not yet been
/// confirmed by a running agent pod. The key is configurable, this is the default.
pub const TAINT_AGENT_NOT_READY: &str = "node.containerd-registrar.io/agent-not-ready";

/// Annotation recording the last lifecycle state written by the controller.
/// Audit trail only; classification is re-derived from taints and pods.
pub const ANNOTATION_NODE_STATE: &str = "node.containerd-registrar.io/node-state";

#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ControllerConfig {
    pub agent_taint_key: String,
    pub agent_pod_namespace: String,
    pub agent_pod_labels: String,
    pub node_labels: Option<String>,
    pub resync_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            agent_taint_key: TAINT_AGENT_NOT_READY.to_string(),
            agent_pod_namespace: "kube-system".to_string(),
            agent_pod_labels: "app.kubernetes.io/name=containerd-registrar-agent".to_string(),
            node_labels: None,
            resync_interval_secs: 60,
        }
    }
}

#[derive(Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    pub controller: ControllerConfig,
}
