// Watches Nodes and agent Pods, funneling every event into a single queue of
// node names. Each dequeued node is classified from observed facts (agent
// taint present? ready agent pod scheduled here?) and, when a transition is
// due, patched with the taint list and state annotation in one document:
//  * new         -> taint the node, annotate "pending"
//  * initialized -> drop the taint, annotate "ready"
// Pod events enqueue their node's key, since pod readiness changes the node's
// classification without touching the node object itself.

use std::sync::Arc;
use std::time::Duration;

use futures::{pin_mut, Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{store, ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::patch::transition_patch;
use crate::queue::WorkQueue;
use crate::state::{classify, is_pod_ready, NodeState};
use crate::ControllerConfig;

#[derive(Debug, Error)]
pub enum Error {
    #[error("k8s error: {0}")]
    Kube(#[from] kube::Error),
    #[error("object cache dropped before initial sync")]
    CacheSync,
}

struct Reconciler {
    nodes: Api<Node>,
    node_store: Store<Node>,
    pod_store: Store<Pod>,
    cfg: ControllerConfig,
}

/// The corrective patch target for an observed state, if any. `pending` and
/// `ready` are steady, `unknown` gets no automated action.
fn target_state(observed: NodeState) -> Option<NodeState> {
    match observed {
        NodeState::New => Some(NodeState::Pending),
        NodeState::Initialized => Some(NodeState::Ready),
        NodeState::Pending | NodeState::Ready | NodeState::Unknown => None,
    }
}

fn has_ready_agent_pod(pods: &Store<Pod>, node_name: &str) -> bool {
    pods.state().iter().any(|pod| {
        pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) == Some(node_name)
            && is_pod_ready(pod)
    })
}

impl Reconciler {
    async fn process(&self, key: &str) -> Result<(), Error> {
        let Some(node) = self.node_store.get(&ObjectRef::new(key)) else {
            // Deleted between enqueue and processing, nothing to do.
            debug!(node = %key, "node no longer in cache, dropping");
            return Ok(());
        };

        let observed = classify(
            &node,
            &self.cfg.agent_taint_key,
            has_ready_agent_pod(&self.pod_store, key),
        );
        let Some(target) = target_state(observed) else {
            if observed == NodeState::Unknown {
                warn!(node = %key, "node state is unknown");
            }
            return Ok(());
        };

        debug!(node = %key, from = %observed, to = %target, "patching node");
        let patch = transition_patch(&node, &self.cfg.agent_taint_key, target);
        self.nodes
            .patch(key, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;
        info!(node = %key, state = %target, "node state updated");
        Ok(())
    }
}

async fn pump_node_events<S>(events: S, queue: Arc<WorkQueue>)
where
    S: Stream<Item = Result<watcher::Event<Node>, watcher::Error>>,
{
    pin_mut!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Applied(node)) => queue.add(&node.name_any()),
            // A deleted node needs no further action, only release of any
            // in-flight marker.
            Ok(watcher::Event::Deleted(node)) => queue.done(&node.name_any()),
            Ok(watcher::Event::Restarted(nodes)) => {
                for node in nodes {
                    queue.add(&node.name_any());
                }
            }
            Err(err) => warn!(error = %err, "node watch error"),
        }
    }
}

async fn pump_pod_events<S>(events: S, queue: Arc<WorkQueue>)
where
    S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>>,
{
    let enqueue_node_of = |pod: &Pod| {
        if let Some(node_name) = pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) {
            queue.add(node_name);
        }
    };

    pin_mut!(events);
    while let Some(event) = events.next().await {
        match event {
            // A pod deletion can change its node's classification, so it
            // enqueues the node key like any other pod event.
            Ok(watcher::Event::Applied(pod) | watcher::Event::Deleted(pod)) => {
                enqueue_node_of(&pod)
            }
            Ok(watcher::Event::Restarted(pods)) => pods.iter().for_each(&enqueue_node_of),
            Err(err) => warn!(error = %err, "pod watch error"),
        }
    }
}

/// Runs the reconciliation loop until `queue` is shut down.
pub async fn run(client: Client, cfg: ControllerConfig, queue: Arc<WorkQueue>) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let pods: Api<Pod> = Api::namespaced(client, &cfg.agent_pod_namespace);

    let mut node_watch = watcher::Config::default();
    if let Some(labels) = &cfg.node_labels {
        node_watch = node_watch.labels(labels);
    }
    let pod_watch = watcher::Config::default().labels(&cfg.agent_pod_labels);

    let (node_store, node_writer) = store();
    let (pod_store, pod_writer) = store();

    let node_pump = tokio::spawn(pump_node_events(
        reflector(node_writer, watcher(nodes.clone(), node_watch).default_backoff()),
        queue.clone(),
    ));
    let pod_pump = tokio::spawn(pump_pod_events(
        reflector(pod_writer, watcher(pods, pod_watch).default_backoff()),
        queue.clone(),
    ));

    // Don't classify until both caches hold a full listing; an empty pod
    // cache would misread every tainted node as still pending.
    node_store
        .wait_until_ready()
        .await
        .map_err(|_| Error::CacheSync)?;
    pod_store
        .wait_until_ready()
        .await
        .map_err(|_| Error::CacheSync)?;
    info!("object caches synced");

    let resync = {
        let node_store = node_store.clone();
        let queue = queue.clone();
        let interval = Duration::from_secs(cfg.resync_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("resyncing all cached nodes");
                for node in node_store.state() {
                    queue.add(&node.name_any());
                }
            }
        })
    };

    let reconciler = Reconciler {
        nodes,
        node_store,
        pod_store,
        cfg,
    };

    while let Some(key) = queue.get().await {
        match reconciler.process(&key).await {
            Ok(()) => queue.forget(&key),
            Err(err) => {
                let attempt = queue.requeue(&key);
                warn!(node = %key, attempt, error = %err, "failed reconciling node, requeued");
            }
        }
        queue.done(&key);
    }

    node_pump.abort();
    pod_pump.abort();
    resync.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use kube::core::ObjectMeta;

    use super::*;

    fn agent_pod(name: &str, node_name: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kube-system".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node_name.to_string()),
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn only_new_and_initialized_trigger_patches() {
        assert_eq!(target_state(NodeState::New), Some(NodeState::Pending));
        assert_eq!(target_state(NodeState::Initialized), Some(NodeState::Ready));
        assert_eq!(target_state(NodeState::Pending), None);
        assert_eq!(target_state(NodeState::Ready), None);
        assert_eq!(target_state(NodeState::Unknown), None);
    }

    #[test]
    fn agent_pod_scan_matches_node_and_readiness() {
        let (pod_store, mut writer) = store();
        writer.apply_watcher_event(&watcher::Event::Applied(agent_pod(
            "agent-a", "worker-1", true,
        )));
        writer.apply_watcher_event(&watcher::Event::Applied(agent_pod(
            "agent-b", "worker-2", false,
        )));

        assert!(has_ready_agent_pod(&pod_store, "worker-1"));
        assert!(!has_ready_agent_pod(&pod_store, "worker-2"));
        assert!(!has_ready_agent_pod(&pod_store, "worker-3"));
    }

    #[tokio::test]
    async fn pod_events_enqueue_their_node_once() {
        let queue = Arc::new(WorkQueue::new());
        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Applied(agent_pod("agent-a", "worker-1", true))),
            Ok(watcher::Event::Deleted(agent_pod("agent-a", "worker-1", true))),
        ]);
        pump_pod_events(events, queue.clone()).await;

        assert_eq!(queue.get().await.as_deref(), Some("worker-1"));
        queue.done("worker-1");
        queue.shutdown();
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn deleted_pod_reenqueues_node_during_processing() {
        // worker-1 was dequeued when its only ready agent pod went away; the
        // deletion must redeliver the key so the node is reclassified.
        let queue = Arc::new(WorkQueue::new());
        queue.add("worker-1");
        let key = queue.get().await.unwrap();

        let events = futures::stream::iter(vec![Ok(watcher::Event::Deleted(agent_pod(
            "agent-a", "worker-1", true,
        )))]);
        pump_pod_events(events, queue.clone()).await;

        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn node_listing_enqueues_every_node() {
        let queue = Arc::new(WorkQueue::new());
        let listed = vec![
            Node {
                metadata: ObjectMeta {
                    name: Some("worker-1".to_string()),
                    ..ObjectMeta::default()
                },
                ..Node::default()
            },
            Node {
                metadata: ObjectMeta {
                    name: Some("worker-2".to_string()),
                    ..ObjectMeta::default()
                },
                ..Node::default()
            },
        ];
        let events = futures::stream::iter(vec![Ok(watcher::Event::Restarted(listed))]);
        pump_node_events(events, queue.clone()).await;

        assert_eq!(queue.get().await.as_deref(), Some("worker-1"));
        assert_eq!(queue.get().await.as_deref(), Some("worker-2"));
    }
}
