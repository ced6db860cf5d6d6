//! Scale/restart orchestrator: the agent's five write-path entry points
//! (`scale`, `restart`, `update-image`, cron scheduling, `balance_node`)
//! plus the pinned-node balancing engine and CronJob factory they share.

#![forbid(unsafe_code)]

pub mod balance_node;
pub mod cci;
pub mod cron;
pub mod cron_request;
pub mod node_balancer;
pub mod restart;
pub mod scale;
pub mod update_image;

use std::sync::Arc;

use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::Api;

use kubedoor_core::config::AgentConfig;
use kubedoor_k8s::{DiscoveryCache, K8sSession};
use kubedoor_nodes::NodeScheduler;
use kubedoor_ops::KubedoorOps;
use kubedoor_persist::AuditStore;

pub use balance_node::{BalanceNodeRequest, BalanceNodeResult, BalanceNodeService};
pub use cron_request::{CronRequest, CronRequestService};
pub use restart::{RestartRequest, RestartService};
pub use scale::{ScaleRequest, ScaleService};
pub use update_image::{UpdateImageRequest, UpdateImageService};

/// Wires the six write-path services onto one shared [`K8sSession`],
/// [`KubedoorOps`], [`NodeScheduler`], and [`DiscoveryCache`], plus an audit
/// sink every procedure records its outcome to. Built once at startup and
/// shared behind an `Arc` by the agent's HTTP router and the master
/// tunnel's relayed requests alike.
pub struct Orchestrator {
    pub config: Arc<AgentConfig>,
    pub ops: Arc<KubedoorOps>,
    pub nodes: Arc<NodeScheduler>,
    pub discovery: Arc<DiscoveryCache>,
    pub audit: Arc<dyn AuditStore>,
    session: K8sSession,
}

impl Orchestrator {
    pub fn new(config: Arc<AgentConfig>, session: K8sSession, audit: Arc<dyn AuditStore>) -> Self {
        let ops = Arc::new(KubedoorOps::new(session.clone()));
        let nodes = Arc::new(NodeScheduler::new(session.clone()));
        let discovery = Arc::new(DiscoveryCache::new(session.client.clone()));
        Self { config, ops, nodes, discovery, audit, session }
    }

    pub fn scale_service(&self) -> ScaleService {
        ScaleService {
            ops: self.ops.clone(),
            nodes: self.nodes.clone(),
            node_api: self.session.nodes.clone(),
            pod_api: self.session.pods.clone(),
            cronjob_api: self.cronjobs_api(),
            job_api: self.jobs_api(),
            node_label_value: self.config.node_label_value.clone(),
            client: self.session.client.clone(),
            discovery: self.discovery.clone(),
        }
    }

    pub fn restart_service(&self) -> RestartService {
        RestartService { ops: self.ops.clone(), nodes: self.nodes.clone(), cronjob_api: self.cronjobs_api(), job_api: self.jobs_api() }
    }

    pub fn cron_request_service(&self) -> CronRequestService {
        CronRequestService { cronjob_api: self.cronjobs_api() }
    }

    pub fn update_image_service(&self) -> UpdateImageService {
        UpdateImageService { ops: self.ops.clone(), cronjob_api: self.cronjobs_api(), job_api: self.jobs_api() }
    }

    pub fn balance_node_service(&self) -> BalanceNodeService {
        BalanceNodeService {
            ops: self.ops.clone(),
            node_api: self.session.nodes.clone(),
            pod_api: self.session.pods.clone(),
            node_label_value: self.config.node_label_value.clone(),
        }
    }

    pub fn cronjobs_api(&self) -> Api<CronJob> {
        self.session.cronjobs_kubedoor_ns.clone()
    }

    pub fn jobs_api(&self) -> Api<Job> {
        Api::namespaced(self.session.client.clone(), "kubedoor")
    }
}

#[cfg(test)]
mod tests {
    // `Orchestrator::new` requires a live `kube::Client`, so its wiring is
    // covered indirectly through the per-service unit tests in each
    // submodule; nothing additional to assert here without a cluster.
}
