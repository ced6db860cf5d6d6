//! The process-wide Kubernetes client session.
//!
//! Grounded on the source's `k8s_client_manager.py`/`init_kubernetes()`: a
//! single in-cluster config load backs a bundle of typed clients, built
//! once at startup and cloned cheaply (`kube::Client` multiplexes over one
//! connection pool, so no additional locking is required around it — see
//! the concurrency design). Short-lived operations that need their own
//! session (the delayed-uncordon callback) call [`K8sSession::connect`]
//! again rather than reusing the shared one.
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client};

use kubedoor_core::error::{KubedoorError, KubedoorResult};

/// Bundle of typed API handles shared across the admission mutator, the
/// orchestrator, and the node scheduler. Mirrors the six-handle bundle the
/// source builds once in `init_kubernetes()`.
#[derive(Clone)]
pub struct K8sSession {
    pub client: Client,
    pub deployments: Api<Deployment>,
    pub pods: Api<Pod>,
    pub nodes: Api<Node>,
    pub cronjobs_kubedoor_ns: Api<CronJob>,
    pub replicasets: Api<ReplicaSet>,
}

impl K8sSession {
    /// Loads in-cluster config and builds every typed handle. Fatal on
    /// failure — there is no meaningful way for the agent to run without a
    /// Kubernetes session (mirrors `load_incluster_config()`'s raise).
    pub async fn connect() -> KubedoorResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| KubedoorError::fatal(500, format!("failed to load in-cluster config: {e}")))?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            deployments: Api::all(client.clone()),
            pods: Api::all(client.clone()),
            nodes: Api::all(client.clone()),
            cronjobs_kubedoor_ns: Api::namespaced(client.clone(), "kubedoor"),
            replicasets: Api::all(client.clone()),
            client,
        }
    }

    pub fn deployments_in(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn pods_in(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn replicasets_in(&self, namespace: &str) -> Api<ReplicaSet> {
        Api::namespaced(self.client.clone(), namespace)
    }
}
