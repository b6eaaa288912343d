//! Builds the single JSON patch document that moves a node between states.

use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::core::v1::{Node, Taint};
use serde_json::json;

use crate::state::NodeState;
use crate::ANNOTATION_NODE_STATE;

/// JSON pointer segment escaping per RFC 6901: `~` -> `~0`, `/` -> `~1`.
pub fn escape_pointer_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Builds one atomic patch updating the state annotation and the full taint
/// list together, so the two are never observable out of sync.
///
/// The taint list is recomputed from the observed node: every taint with a
/// different key is preserved verbatim, the managed taint is re-added only
/// when the target state requires it. `add` operations are used throughout
/// since `add` on an existing path replaces the value but, unlike `replace`,
/// also succeeds when the annotation key doesn't exist yet.
pub fn transition_patch(node: &Node, agent_taint_key: &str, target: NodeState) -> Patch {
    let mut taints: Vec<Taint> = node
        .spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .filter(|taint| taint.key != agent_taint_key)
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    if target == NodeState::Pending {
        taints.push(Taint {
            key: agent_taint_key.to_string(),
            value: Some("true".to_string()),
            effect: "NoSchedule".to_string(),
            ..Taint::default()
        });
    }

    let annotation_op = if node.metadata.annotations.is_none() {
        // A member add needs its parent map to exist.
        AddOperation {
            path: "/metadata/annotations".to_string(),
            value: json!({ ANNOTATION_NODE_STATE: target.as_str() }),
        }
    } else {
        AddOperation {
            path: format!(
                "/metadata/annotations/{}",
                escape_pointer_segment(ANNOTATION_NODE_STATE)
            ),
            value: json!(target.as_str()),
        }
    };

    Patch(vec![
        PatchOperation::Add(annotation_op),
        PatchOperation::Add(AddOperation {
            path: "/spec/taints".to_string(),
            value: json!(taints),
        }),
    ])
}
