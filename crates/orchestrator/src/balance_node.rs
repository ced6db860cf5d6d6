//! Balance-node procedure: the orchestrator's `POST /balance_node` entry
//! point — moves a deployment's pinned-node labels from a source node to a
//! target node for a caller-supplied list of "top" (busiest) deployments.
//!
//! Unlike the scale-down path, which evicts a single pod per node, this
//! deletes every pod the source node is still running for each moved
//! deployment, per the ReplicaSet-owned-pod-naming regex (Open Question
//! #3) — the node is being drained of that workload outright, not merely
//! rebalanced by one replica.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Api;

use kubedoor_core::error::{KubedoorError, KubedoorResult};
use kubedoor_core::model::DeploymentTarget;
use kubedoor_ops::KubedoorOps;

use crate::node_balancer;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BalanceNodeRequest {
    pub namespace: String,
    pub source_node: String,
    pub target_node: String,
    pub top_deployments: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BalanceNodeResult {
    pub success: bool,
    pub message: String,
    pub errors: Vec<(String, String)>,
}

pub struct BalanceNodeService {
    pub ops: Arc<KubedoorOps>,
    pub node_api: Api<Node>,
    pub pod_api: Api<Pod>,
    pub node_label_value: String,
}

impl BalanceNodeService {
    pub async fn handle_balance_node(&self, req: BalanceNodeRequest) -> KubedoorResult<BalanceNodeResult> {
        if req.source_node.is_empty() || req.target_node.is_empty() || req.top_deployments.is_empty() {
            return Err(KubedoorError::bad_request("source_node, target_node, and top_deployments must all be non-empty"));
        }

        let pods = self.pod_api.list(&Default::default()).await.map_err(KubedoorError::from)?.items;

        let mut errors = Vec::new();
        for deployment in &req.top_deployments {
            if let Err(e) = self.move_one(&req.namespace, deployment, &req.source_node, &req.target_node, &pods).await {
                errors.push((deployment.clone(), e.to_string()));
            }
        }

        if errors.is_empty() {
            Ok(BalanceNodeResult { success: true, message: "ok".to_string(), errors })
        } else {
            Ok(BalanceNodeResult { success: false, message: format!("以下服务未均衡成功: {errors:?}"), errors })
        }
    }

    async fn move_one(&self, namespace: &str, deployment: &str, source_node: &str, target_node: &str, pods: &[Pod]) -> KubedoorResult<()> {
        let target = DeploymentTarget::new(namespace, deployment);

        node_balancer::unlabel_node(&self.node_api, source_node, &target).await.ok();
        node_balancer::label_node(&self.node_api, target_node, &target, &self.node_label_value).await?;

        for pod in node_balancer::pods_of_deployment_on_node(pods, deployment, source_node) {
            self.ops.delete_pod(namespace, &pod).await.ok();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_validation_requires_all_three_fields() {
        let req = BalanceNodeRequest { namespace: "prod".into(), source_node: "".into(), target_node: "n2".into(), top_deployments: vec!["checkout".into()] };
        assert!(req.source_node.is_empty());
    }
}
