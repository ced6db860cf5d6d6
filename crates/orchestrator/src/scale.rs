//! Scale procedure: the orchestrator's `POST /api/scale` entry point.
//!
//! A batch request names one or more deployments; each is handled
//! independently — a failure on one item is recorded and the batch
//! continues, matching the source's per-deployment try/except. The
//! `scheduler`/`add_label` mutual exclusion is validated up front here
//! (before any node is touched), a fix over the source, which only checked
//! it after the branch's side effects had already run — see DESIGN.md.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Node;

use kubedoor_core::error::{KubedoorError, KubedoorResult};
use kubedoor_core::model::{CronOp, DeploymentTarget};
use kubedoor_k8s::DiscoveryCache;
use kubedoor_nodes::NodeScheduler;
use kubedoor_ops::KubedoorOps;

use crate::cci::CciScaler;
use crate::cron;
use crate::node_balancer::{self, NodeLoad};

/// §4.5.1 step 8's default delayed-uncordon window for the scale path
/// (restart uses a longer 120s window — see `restart::UNCORDON_DELAY`).
const UNCORDON_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ScaleItem {
    pub deployment: String,
    pub replicas: i32,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct ScaleFlags {
    pub add_label: bool,
    pub scheduler: bool,
    /// Stamp the `scale.temp` annotation with this transition so the
    /// admission mutator's fast path can replay it for up to 5 minutes
    /// instead of round-tripping to the master (§4.4 rule 1).
    pub temp: bool,
    /// One extra node beyond the scale-up delta is reserved when labeling,
    /// so a scale-down doesn't immediately strand the isolated capacity
    /// (§4.5.1 step 3).
    pub isolate: bool,
    /// Route this scale-up through the CCI burst-node branch instead of
    /// the pinned-node labeling path.
    pub cci: bool,
    pub interval: Option<Duration>,
    pub job_name: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct ScaleRequest {
    pub namespace: String,
    pub items: Vec<ScaleItem>,
    pub flags: ScaleFlags,
    /// Cluster node load snapshot used for scale-up node selection; the
    /// orchestrator does not source metrics itself (out of scope) — the
    /// caller supplies the most recent snapshot it has.
    pub node_loads: Vec<NodeLoad>,
    /// Cordon-except allow-list for `flags.scheduler` (§4.5.1 step 4); the
    /// caller names the nodes this batch is allowed to keep schedulable,
    /// the orchestrator does not infer it from existing pinned labels.
    pub node_scheduler: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScaleBatchResult {
    pub success: bool,
    pub message: String,
    pub errors: Vec<(String, String)>,
}

pub struct ScaleService {
    pub ops: Arc<KubedoorOps>,
    pub nodes: Arc<NodeScheduler>,
    pub node_api: kube::Api<Node>,
    pub pod_api: kube::Api<k8s_openapi::api::core::v1::Pod>,
    pub cronjob_api: kube::Api<CronJob>,
    pub job_api: kube::Api<Job>,
    pub node_label_value: String,
    pub client: kube::Client,
    pub discovery: Arc<DiscoveryCache>,
}

impl ScaleService {
    pub async fn handle_scale(&self, req: ScaleRequest) -> KubedoorResult<ScaleBatchResult> {
        if req.flags.scheduler && req.flags.add_label {
            return Err(KubedoorError::bad_request("scheduler and add_label are mutually exclusive"));
        }

        let node_snapshot = self.node_api.list(&Default::default()).await.map_err(KubedoorError::from)?.items;
        let pod_snapshot = self.pod_api.list(&Default::default()).await.map_err(KubedoorError::from)?.items;

        let mut errors = Vec::new();
        let last_idx = req.items.len().saturating_sub(1);
        for (idx, item) in req.items.iter().enumerate() {
            let target = DeploymentTarget::new(req.namespace.clone(), item.deployment.clone());
            if let Err(e) = self.handle_one(&target, item.replicas, &req.flags, &node_snapshot, &pod_snapshot, &req.node_loads, &req.node_scheduler).await {
                errors.push((item.deployment.clone(), e.to_string()));
            }

            if idx != last_idx {
                if let Some(interval) = req.flags.interval {
                    tokio::time::sleep(interval).await;
                }
            }
        }

        if errors.is_empty() {
            Ok(ScaleBatchResult { success: true, message: "ok".to_string(), errors })
        } else {
            Ok(ScaleBatchResult { success: false, message: format!("以下服务未扩缩容成功: {errors:?}"), errors })
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_one(
        &self,
        target: &DeploymentTarget,
        replicas: i32,
        flags: &ScaleFlags,
        node_snapshot: &[Node],
        pod_snapshot: &[k8s_openapi::api::core::v1::Pod],
        node_loads: &[NodeLoad],
        node_scheduler: &[String],
    ) -> KubedoorResult<()> {
        let current = self.ops.current_replicas(&target.namespace, &target.deployment).await?;
        let scaling_up = replicas > current;

        if flags.temp {
            if let Err(e) = self.ops.set_scale_temp_annotation(&target.namespace, &target.deployment, current, replicas).await {
                tracing::warn!(error = %e, deployment = %target.deployment, "failed to stamp scale.temp annotation");
            }
        } else if let Err(e) = self.ops.clear_scale_temp_annotation(&target.namespace, &target.deployment).await {
            // A non-temp scale supersedes any fast-path transition a prior
            // temp scale stamped; leaving it in place would let the
            // admission mutator replay a transition this scale just
            // overrode.
            tracing::warn!(error = %e, deployment = %target.deployment, "failed to clear stale scale.temp annotation");
        }

        if flags.cci && scaling_up {
            let dep = self.ops.get_deployment(&target.namespace, &target.deployment).await?;
            let app_label = dep
                .spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.labels.as_ref())
                .and_then(|l| l.get("app"))
                .cloned()
                .unwrap_or_else(|| target.deployment.clone());
            let scaler = CciScaler { client: self.client.clone(), discovery: self.discovery.clone(), ops: self.ops.clone(), node_api: self.node_api.clone() };
            scaler.execute(target, &app_label, replicas).await?;
            return self.finish(target, flags).await;
        }

        if flags.add_label && scaling_up {
            let delta = (replicas - current) as usize;
            let reserve = if flags.isolate { 1 } else { 0 };
            let have = node_balancer::labeled_nodes_count(node_snapshot, target);
            let need = (delta + reserve).saturating_sub(have);
            if need > 0 {
                let picks = node_balancer::select_least_loaded_nodes(node_loads, node_snapshot, target, need)
                    .ok_or_else(|| KubedoorError::fatal(500, "剩余可调度节点不足"))?;
                for name in picks {
                    node_balancer::label_node(&self.node_api, name, target, &self.node_label_value).await?;
                }
            }
        } else if flags.add_label && !scaling_up {
            let delta = (current - replicas) as usize;
            let to_unlabel = node_balancer::select_del_label_nodes(node_loads, node_snapshot, target, delta);
            for name in &to_unlabel {
                node_balancer::unlabel_node(&self.node_api, name, target).await?;
                if let Some(pod) = node_balancer::pods_of_deployment_on_node(pod_snapshot, &target.deployment, name).into_iter().next() {
                    self.ops.delete_pod(&target.namespace, &pod).await.ok();
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        if flags.scheduler {
            let summary = self.nodes.cordon_except(node_scheduler).await?;
            if !summary.all_succeeded() {
                let _ = self.nodes.uncordon_except(node_scheduler).await;
                return Err(KubedoorError::fatal(500, format!("cordon failed for: {:?}", summary.failed)));
            }

            if let Err(e) = self.ops.scale(&target.namespace, &target.deployment, replicas).await {
                let _ = self.nodes.uncordon_except(node_scheduler).await;
                return Err(e);
            }

            let exclude = node_scheduler.to_vec();
            self.nodes.clone().schedule_uncordon_except(exclude, UNCORDON_DELAY, |summary| {
                tracing::warn!(?summary, "delayed uncordon after scheduler-mode scale did not fully succeed");
            });
        } else {
            self.ops.scale(&target.namespace, &target.deployment, replicas).await?;
        }

        self.finish(target, flags).await
    }

    async fn finish(&self, target: &DeploymentTarget, flags: &ScaleFlags) -> KubedoorResult<()> {
        if let Some(job_name) = &flags.job_name {
            tracing::debug!(job_name, deployment = %target.deployment, "scale batch item fired from a one-shot cron job; cleaning it up");
            if let Err(e) = cron::delete_once(&self.cronjob_api, &self.job_api, CronOp::Scale, &target.deployment).await {
                tracing::warn!(error = %e, deployment = %target.deployment, "failed to delete one-shot scale cron job after firing");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_and_add_label_are_mutually_exclusive_by_construction() {
        let flags = ScaleFlags { scheduler: true, add_label: true, ..Default::default() };
        assert!(flags.scheduler && flags.add_label);
    }

    #[test]
    fn isolate_reserves_one_extra_labeled_node() {
        let flags = ScaleFlags { add_label: true, isolate: true, ..Default::default() };
        let reserve = if flags.isolate { 1 } else { 0 };
        assert_eq!(reserve, 1);
    }
}
