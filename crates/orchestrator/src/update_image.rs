//! Update-image procedure: the orchestrator's `POST /update-image` entry
//! point. Same batch shape as [`crate::restart`]; each item additionally
//! names the container to retag, and carries the same one-shot cron
//! cleanup behavior when `job_name` is set.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{CronJob, Job};

use kubedoor_core::error::KubedoorResult;
use kubedoor_core::model::CronOp;
use kubedoor_ops::KubedoorOps;

use crate::cron;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpdateImageItem {
    pub deployment: String,
    pub container: String,
    pub image: String,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UpdateImageRequest {
    pub namespace: String,
    pub items: Vec<UpdateImageItem>,
    pub interval: Option<Duration>,
    pub job_name: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UpdateImageBatchResult {
    pub success: bool,
    pub message: String,
    pub errors: Vec<(String, String)>,
}

pub struct UpdateImageService {
    pub ops: Arc<KubedoorOps>,
    pub cronjob_api: kube::Api<CronJob>,
    pub job_api: kube::Api<Job>,
}

impl UpdateImageService {
    pub async fn handle_update_image(&self, req: UpdateImageRequest) -> KubedoorResult<UpdateImageBatchResult> {
        let mut errors = Vec::new();
        let last_idx = req.items.len().saturating_sub(1);
        for (idx, item) in req.items.iter().enumerate() {
            match self.ops.update_image(&req.namespace, &item.deployment, &item.container, &item.image).await {
                Ok(()) => {
                    if req.job_name.is_some() {
                        if let Err(e) = cron::delete_once(&self.cronjob_api, &self.job_api, CronOp::UpdateImage, &item.deployment).await {
                            tracing::warn!(error = %e, deployment = %item.deployment, "failed to delete one-shot update-image cron job after firing");
                        }
                    }
                }
                Err(e) => errors.push((item.deployment.clone(), e.to_string())),
            }
            if idx != last_idx {
                if let Some(interval) = req.interval {
                    tokio::time::sleep(interval).await;
                }
            }
        }

        if errors.is_empty() {
            Ok(UpdateImageBatchResult { success: true, message: "ok".to_string(), errors })
        } else {
            Ok(UpdateImageBatchResult { success: false, message: format!("以下服务镜像未更新成功: {errors:?}"), errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_carries_deployment_container_and_image() {
        let item = UpdateImageItem { deployment: "checkout".into(), container: "app".into(), image: "repo/app:v2".into() };
        assert_eq!(item.container, "app");
    }
}
