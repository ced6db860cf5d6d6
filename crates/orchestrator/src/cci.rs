//! CCI burst-node scaling branch: temporarily flips elastic "bursting
//! node" virtual nodes schedulable, applies a `ScheduleProfile` custom
//! resource steering new pods onto them, patches the replica count, then
//! restores the nodes' schedulability regardless of whether the patch
//! succeeded.
//!
//! Grounded on the source's `cci_scaler.py`: bursting nodes are identified
//! by name or label containing `bursting-node` (case insensitive) rather
//! than a fixed label key, since the CCI controller names them
//! inconsistently across clusters; the `ScheduleProfile` GVK is resolved
//! through [`kubedoor_k8s::DiscoveryCache`] rather than a hardcoded plural,
//! matching the agent's general policy of not assuming CRD shape.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Api, Client};

use kubedoor_core::error::{KubedoorError, KubedoorResult};
use kubedoor_core::model::DeploymentTarget;
use kubedoor_k8s::DiscoveryCache;
use kubedoor_ops::KubedoorOps;

const CCI_SCHEDULE_GROUP: &str = "scheduling.cci.io";
const CCI_SCHEDULE_VERSION: &str = "v2";
const BURSTING_NODE_KEYWORD: &str = "bursting-node";
const FIELD_MANAGER: &str = "kubedoor-agent";
const PATCH_RETRY_ATTEMPTS: u32 = 3;
const PATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

fn schedule_profile_gvk() -> GroupVersionKind {
    GroupVersionKind { group: CCI_SCHEDULE_GROUP.to_string(), version: CCI_SCHEDULE_VERSION.to_string(), kind: "ScheduleProfile".to_string() }
}

/// Names of nodes that look like CCI's elastic burst capacity.
pub fn bursting_nodes(nodes: &[Node]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| {
            let name_hit = n.metadata.name.as_deref().map(|name| name.to_lowercase().contains(BURSTING_NODE_KEYWORD)).unwrap_or(false);
            let label_hit = n
                .metadata
                .labels
                .as_ref()
                .map(|labels| labels.iter().any(|(k, v)| k.to_lowercase().contains(BURSTING_NODE_KEYWORD) || v.to_lowercase().contains(BURSTING_NODE_KEYWORD)))
                .unwrap_or(false);
            name_hit || label_hit
        })
        .filter_map(|n| n.metadata.name.clone())
        .collect()
}

pub struct CciScaler {
    pub client: Client,
    pub discovery: Arc<DiscoveryCache>,
    pub ops: Arc<KubedoorOps>,
    pub node_api: Api<Node>,
}

impl CciScaler {
    /// Runs the full burst-and-restore cycle for one deployment. The node
    /// restoration happens whether `apply_and_patch` succeeds or not, like
    /// the source's `finally` block.
    pub async fn execute(&self, target: &DeploymentTarget, app_label: &str, replicas: i32) -> KubedoorResult<()> {
        let nodes = self.node_api.list(&Default::default()).await.map_err(KubedoorError::from)?.items;
        let bursting = bursting_nodes(&nodes);
        if bursting.is_empty() {
            tracing::warn!(deployment = %target.deployment, "cci scaling requested but no bursting nodes found in cluster");
        }
        for name in &bursting {
            if let Err(e) = set_schedulable(&self.node_api, name, true).await {
                tracing::warn!(error = %e, node = name, "failed to mark bursting node schedulable");
            }
        }

        let result = self.apply_and_patch(target, app_label, replicas).await;

        for name in &bursting {
            if let Err(e) = set_schedulable(&self.node_api, name, false).await {
                tracing::warn!(error = %e, node = name, "failed to restore bursting node to unschedulable after cci scaling");
            }
        }

        result
    }

    async fn apply_and_patch(&self, target: &DeploymentTarget, app_label: &str, replicas: i32) -> KubedoorResult<()> {
        let gvk = schedule_profile_gvk();
        let (ar, namespaced) = self.discovery.resolve(&gvk).await?;
        let api: Api<DynamicObject> =
            if namespaced { Api::namespaced_with(self.client.clone(), &target.namespace, &ar) } else { Api::all_with(self.client.clone(), &ar) };

        let mut profile = DynamicObject::new(&target.deployment, &ar).within(&target.namespace);
        profile.data = serde_json::json!({
            "spec": {
                "location": {
                    "cci": { "scaleDownPriority": 100 },
                    "local": { "maxNum": replicas, "scaleDownPriority": 10 }
                },
                "objectLabels": { "matchLabels": { "app": app_label } },
                "strategy": "localPrefer",
                "virtualNodes": [{ "type": "bursting-node" }]
            }
        });
        api.patch(&target.deployment, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&profile))
            .await
            .map_err(KubedoorError::from)?;

        self.patch_replicas_with_retry(target, replicas).await
    }

    /// Up to three attempts, one second apart, on any failure — the source
    /// retries unconditionally on a 409 conflict; this collapses that to a
    /// blanket retry since the error taxonomy here doesn't preserve the raw
    /// status code past `ops.scale`'s own error mapping (see DESIGN.md).
    async fn patch_replicas_with_retry(&self, target: &DeploymentTarget, replicas: i32) -> KubedoorResult<()> {
        let mut last_err = None;
        for attempt in 0..PATCH_RETRY_ATTEMPTS {
            match self.ops.scale(&target.namespace, &target.deployment, replicas).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, deployment = %target.deployment, "cci replica patch failed, retrying");
                    last_err = Some(e);
                    if attempt + 1 < PATCH_RETRY_ATTEMPTS {
                        tokio::time::sleep(PATCH_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }
}

async fn set_schedulable(api: &Api<Node>, name: &str, schedulable: bool) -> KubedoorResult<()> {
    let patch = serde_json::json!({ "spec": { "unschedulable": !schedulable } });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(&patch))
        .await
        .map_err(KubedoorError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, labels: &[(&str, &str)]) -> Node {
        let mut n = Node::default();
        n.metadata.name = Some(name.to_string());
        if !labels.is_empty() {
            n.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        }
        n
    }

    #[test]
    fn detects_bursting_node_by_name() {
        let nodes = vec![node("cci-bursting-node-7f3a", &[]), node("worker-1", &[])];
        assert_eq!(bursting_nodes(&nodes), vec!["cci-bursting-node-7f3a".to_string()]);
    }

    #[test]
    fn detects_bursting_node_by_label_case_insensitive() {
        let nodes = vec![node("virtual-kubelet-01", &[("node-type", "Bursting-Node")])];
        assert_eq!(bursting_nodes(&nodes), vec!["virtual-kubelet-01".to_string()]);
    }

    #[test]
    fn ordinary_nodes_are_not_flagged() {
        let nodes = vec![node("worker-1", &[("zone", "a")])];
        assert!(bursting_nodes(&nodes).is_empty());
    }

    #[test]
    fn gvk_matches_discovery_cache_test_fixture() {
        let gvk = schedule_profile_gvk();
        assert_eq!(gvk.group, "scheduling.cci.io");
        assert_eq!(gvk.version, "v2");
        assert_eq!(gvk.kind, "ScheduleProfile");
    }
}
