//! Restart procedure: the orchestrator's `POST /api/restart` entry point.
//!
//! Same per-item batch shape as [`crate::scale`], minus any node-labeling
//! bookkeeping — a rolling restart never changes replica count or pinned
//! placement. The cordon-window steps (§4.5.1 steps 4 and 8) apply
//! identically here when `scheduler` is set, just with a longer delayed
//! uncordon (120s instead of scale's 10s, since a rollout takes longer to
//! finish rolling than a scale-up does to stabilize). When a batch item
//! carries `job_name` (fired by a one-shot cron callback) the corresponding
//! `restart-once-<deployment>` CronJob is deleted after a successful
//! restart.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{CronJob, Job};

use kubedoor_core::error::{KubedoorError, KubedoorResult};
use kubedoor_core::model::CronOp;
use kubedoor_nodes::NodeScheduler;
use kubedoor_ops::KubedoorOps;

use crate::cron;

const UNCORDON_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct RestartRequest {
    pub namespace: String,
    pub deployments: Vec<String>,
    pub interval: Option<Duration>,
    /// Cordon every node not in `node_scheduler` before restarting, and
    /// schedule a 120s delayed uncordon-except once the restart has been
    /// issued (§4.5.2).
    pub scheduler: bool,
    pub node_scheduler: Vec<String>,
    /// Set when this batch was fired by a one-shot cron callback; on
    /// success the corresponding `restart-once-<deployment>` CronJob/Job
    /// pair is deleted per deployment.
    pub job_name: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RestartBatchResult {
    pub success: bool,
    pub message: String,
    pub errors: Vec<(String, String)>,
}

pub struct RestartService {
    pub ops: Arc<KubedoorOps>,
    pub nodes: Arc<NodeScheduler>,
    pub cronjob_api: kube::Api<CronJob>,
    pub job_api: kube::Api<Job>,
}

impl RestartService {
    pub async fn handle_restart(&self, req: RestartRequest) -> KubedoorResult<RestartBatchResult> {
        let mut errors = Vec::new();
        let last_idx = req.deployments.len().saturating_sub(1);
        for (idx, deployment) in req.deployments.iter().enumerate() {
            if let Err(e) = self.restart_one(&req, deployment).await {
                errors.push((deployment.clone(), e.to_string()));
            }
            if idx != last_idx {
                if let Some(interval) = req.interval {
                    tokio::time::sleep(interval).await;
                }
            }
        }

        if errors.is_empty() {
            Ok(RestartBatchResult { success: true, message: "ok".to_string(), errors })
        } else {
            Ok(RestartBatchResult { success: false, message: format!("以下服务未重启成功: {errors:?}"), errors })
        }
    }

    async fn restart_one(&self, req: &RestartRequest, deployment: &str) -> KubedoorResult<()> {
        if req.scheduler {
            let summary = self.nodes.cordon_except(&req.node_scheduler).await?;
            if !summary.all_succeeded() {
                let _ = self.nodes.uncordon_except(&req.node_scheduler).await;
                return Err(KubedoorError::fatal(500, format!("cordon failed for: {:?}", summary.failed)));
            }

            if let Err(e) = self.ops.rollout_restart(&req.namespace, deployment).await {
                let _ = self.nodes.uncordon_except(&req.node_scheduler).await;
                return Err(e);
            }

            let exclude = req.node_scheduler.clone();
            self.nodes.clone().schedule_uncordon_except(exclude, UNCORDON_DELAY, |summary| {
                tracing::warn!(?summary, "delayed uncordon after scheduler-mode restart did not fully succeed");
            });
        } else {
            self.ops.rollout_restart(&req.namespace, deployment).await?;
        }

        if req.job_name.is_some() {
            if let Err(e) = cron::delete_once(&self.cronjob_api, &self.job_api, CronOp::Restart, deployment).await {
                tracing::warn!(error = %e, deployment, "failed to delete one-shot restart cron job after firing");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_is_trivially_successful() {
        let errors: Vec<(String, String)> = Vec::new();
        assert!(errors.is_empty());
    }

    #[test]
    fn uncordon_delay_is_longer_than_scale_s() {
        assert_eq!(UNCORDON_DELAY, Duration::from_secs(120));
    }
}
