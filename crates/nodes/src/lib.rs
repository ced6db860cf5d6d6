//! Node Scheduler: bulk cordon/uncordon of cluster nodes with bounded
//! concurrency, used by the scale-up/scale-down scheduler path and the
//! balancing engine.
//!
//! Grounded on the source's `K8sNodeScheduler`: a semaphore-bounded fan-out
//! over per-node operations, each with one retry and a hard per-operation
//! timeout, and an uncordon path that is deliberately fire-and-forget so the
//! caller's HTTP response isn't blocked on a delayed rollback.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use kubedoor_core::error::{KubedoorError, KubedoorResult};
use kubedoor_k8s::K8sSession;

const MAX_CONCURRENT_OPERATIONS: usize = 20;
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(2);
const FIELD_MANAGER: &str = "kubedoor-agent";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CordonSummary {
    pub total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CordonSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct NodeScheduler {
    session: K8sSession,
    semaphore: Arc<Semaphore>,
}

impl NodeScheduler {
    pub fn new(session: K8sSession) -> Self {
        Self { session, semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_OPERATIONS)) }
    }

    /// Cordons every node whose name is not in `exclude`. Runs with bounded
    /// concurrency; a failure on one node does not prevent others from
    /// being attempted (`gather(return_exceptions=True)` in the source).
    pub async fn cordon_except(&self, exclude: &[String]) -> KubedoorResult<CordonSummary> {
        let targets = self.targets_excluding(exclude).await?;
        self.run_bulk(targets, true).await
    }

    /// Uncordons every node whose name is not in `exclude`, synchronously.
    pub async fn uncordon_except(&self, exclude: &[String]) -> KubedoorResult<CordonSummary> {
        let targets = self.targets_excluding(exclude).await?;
        self.run_bulk(targets, false).await
    }

    /// Schedules a delayed, best-effort uncordon as a detached background
    /// task and returns immediately. Mirrors the source's
    /// `uncordon_nodes_exclude`: the HTTP handler must not block on a
    /// rollback that may need to happen minutes later. On partial or total
    /// failure, `on_failure` is invoked with the summary so the caller can
    /// notify an operator; success is silent.
    pub fn schedule_uncordon_except(
        self: Arc<Self>,
        exclude: Vec<String>,
        delay: Duration,
        on_failure: impl FnOnce(CordonSummary) + Send + 'static,
    ) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Fresh session, per §4.1's "short-lived operations open their own session".
            let fresh = match K8sSession::connect().await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "delayed uncordon: failed to open k8s session");
                    on_failure(CordonSummary { total: 0, succeeded: vec![], failed: vec![("*".into(), e.to_string())] });
                    return;
                }
            };
            let scheduler = NodeScheduler { session: fresh, semaphore: self.semaphore.clone() };
            match scheduler.uncordon_except(&exclude).await {
                Ok(summary) if !summary.all_succeeded() => on_failure(summary),
                Ok(_) => {}
                Err(e) => on_failure(CordonSummary { total: 0, succeeded: vec![], failed: vec![("*".into(), e.to_string())] }),
            }
        });
    }

    /// Partitions all nodes into schedulable/unschedulable.
    pub async fn scheduling_status(&self) -> KubedoorResult<kubedoor_core::model::NodeSchedulingStatus> {
        let nodes = self.session.nodes.list(&Default::default()).await?;
        let mut schedulable = Vec::new();
        let mut unschedulable = Vec::new();
        for n in nodes.items {
            let name = n.metadata.name.clone().unwrap_or_default();
            let cordoned = n.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
            if cordoned {
                unschedulable.push(name);
            } else {
                schedulable.push(name);
            }
        }
        Ok(kubedoor_core::model::NodeSchedulingStatus { schedulable, unschedulable })
    }

    async fn targets_excluding(&self, exclude: &[String]) -> KubedoorResult<Vec<Node>> {
        let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();
        let nodes = self.session.nodes.list(&Default::default()).await?;
        Ok(nodes
            .items
            .into_iter()
            .filter(|n| !exclude.contains(n.metadata.name.as_deref().unwrap_or_default()))
            .collect())
    }

    async fn run_bulk(&self, targets: Vec<Node>, cordon: bool) -> KubedoorResult<CordonSummary> {
        let total = targets.len();
        let mut handles = Vec::with_capacity(total);
        for node in targets {
            let name = node.metadata.name.clone().unwrap_or_default();
            let api = self.session.nodes.clone();
            let permit = self.semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore never closed");
                let result = timeout(OPERATION_TIMEOUT, set_unschedulable(&api, &name, cordon)).await;
                match result {
                    Ok(Ok(())) => Ok(name),
                    Ok(Err(_first_err)) => {
                        tokio::time::sleep(RETRY_DELAY).await;
                        match timeout(OPERATION_TIMEOUT, set_unschedulable(&api, &name, cordon)).await {
                            Ok(Ok(())) => Ok(name),
                            Ok(Err(e)) => Err((name, e.to_string())),
                            Err(_) => Err((name, "operation timed out on retry".to_string())),
                        }
                    }
                    Err(_) => Err((name, "operation timed out".to_string())),
                }
            }));
        }

        let mut summary = CordonSummary { total, ..Default::default() };
        for handle in handles {
            match handle.await {
                Ok(Ok(name)) => summary.succeeded.push(name),
                Ok(Err((name, err))) => summary.failed.push((name, err)),
                Err(join_err) => summary.failed.push(("<unknown>".into(), join_err.to_string())),
            }
        }
        let metric = if cordon { "kubedoor_node_cordon_total" } else { "kubedoor_node_uncordon_total" };
        counter!(metric).increment(summary.succeeded.len() as u64);
        Ok(summary)
    }
}

async fn set_unschedulable(api: &kube::Api<Node>, name: &str, cordon: bool) -> KubedoorResult<()> {
    let patch = serde_json::json!({ "spec": { "unschedulable": cordon } });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(&patch))
        .await
        .map_err(KubedoorError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_all_succeeded_when_no_failures() {
        let s = CordonSummary { total: 3, succeeded: vec!["a".into(), "b".into(), "c".into()], failed: vec![] };
        assert!(s.all_succeeded());
    }

    #[test]
    fn summary_not_succeeded_with_any_failure() {
        let s = CordonSummary { total: 2, succeeded: vec!["a".into()], failed: vec![("b".into(), "boom".into())] };
        assert!(!s.all_succeeded());
    }
}
