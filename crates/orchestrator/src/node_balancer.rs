//! Pinned-node label bookkeeping shared by the scale procedure and the
//! balancing engine. Grounded on the source's `node_balancer.py`.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::Api;

use kubedoor_core::error::{KubedoorError, KubedoorResult};
use kubedoor_core::model::DeploymentTarget;

const FIELD_MANAGER: &str = "kubedoor-agent";

/// A node's name plus whatever load figure the caller is sorting by (CPU
/// utilization percent, typically supplied by the caller from its own
/// metrics source — this crate has no opinion on where it comes from).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NodeLoad {
    pub name: String,
    pub percent: f64,
}

/// Counts how many nodes already carry `target`'s pinned-node label.
pub fn labeled_nodes_count(nodes: &[Node], target: &DeploymentTarget) -> usize {
    let key = target.label_key();
    nodes.iter().filter(|n| has_label(n, &key)).count()
}

/// Picks `count` least-loaded, not-yet-labeled nodes from `candidates`,
/// trusting the caller-supplied order (ascending load). Returns `None` if
/// fewer than `count` unlabeled candidates are available — the scale
/// procedure aborts the whole batch on this, it does not partially label.
pub fn select_least_loaded_nodes<'a>(candidates: &'a [NodeLoad], nodes: &[Node], target: &DeploymentTarget, count: usize) -> Option<Vec<&'a str>> {
    let key = target.label_key();
    let labeled: HashSet<&str> = nodes.iter().filter(|n| has_label(n, &key)).filter_map(|n| n.metadata.name.as_deref()).collect();
    let picks: Vec<&str> = candidates.iter().filter(|c| !labeled.contains(c.name.as_str())).map(|c| c.name.as_str()).take(count).collect();
    if picks.len() < count {
        None
    } else {
        Some(picks)
    }
}

/// Picks up to `count` already-labeled nodes to unlabel, most-loaded
/// first. Unlike `select_least_loaded_nodes`, this does NOT check
/// sufficiency — it may silently return fewer than `count` nodes if not
/// enough are labeled (matches the source's `select_del_label_nodes`).
pub fn select_del_label_nodes(candidates: &[NodeLoad], nodes: &[Node], target: &DeploymentTarget, count: usize) -> Vec<String> {
    let key = target.label_key();
    let labeled: HashSet<&str> = nodes.iter().filter(|n| has_label(n, &key)).filter_map(|n| n.metadata.name.as_deref()).collect();
    let mut sorted: Vec<&NodeLoad> = candidates.iter().filter(|c| labeled.contains(c.name.as_str())).collect();
    sorted.sort_by(|a, b| b.percent.partial_cmp(&a.percent).unwrap_or(std::cmp::Ordering::Equal));
    sorted.into_iter().take(count).map(|c| c.name.clone()).collect()
}

fn has_label(node: &Node, key: &str) -> bool {
    node.metadata.labels.as_ref().map(|l| l.contains_key(key)).unwrap_or(false)
}

/// Names of pods belonging to `deployment` (matched by its ReplicaSet-owned
/// pod-naming convention, `^{name}-[a-z0-9]+-[a-z0-9]+$`, Open Question #3)
/// currently scheduled on `node_name`.
pub fn pods_of_deployment_on_node(pods: &[k8s_openapi::api::core::v1::Pod], deployment: &str, node_name: &str) -> Vec<String> {
    let re = owned_pod_regex(deployment);
    pods.iter()
        .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name))
        .filter_map(|p| p.metadata.name.clone())
        .filter(|name| re.is_match(name))
        .collect()
}

fn owned_pod_regex(deployment: &str) -> regex::Regex {
    regex::Regex::new(&format!("^{}-[a-z0-9]+-[a-z0-9]+$", regex::escape(deployment))).expect("valid regex")
}

#[cfg(test)]
mod pod_naming_tests {
    use super::*;

    #[test]
    fn owned_pod_regex_matches_replicaset_owned_names_only() {
        let re = owned_pod_regex("checkout");
        assert!(re.is_match("checkout-7d8f9c6b5-abcde"));
        assert!(!re.is_match("checkout-job-runner-abcde"));
        assert!(!re.is_match("checkout"));
    }
}

pub async fn label_node(api: &Api<Node>, node_name: &str, target: &DeploymentTarget, node_label_value: &str) -> KubedoorResult<()> {
    let patch = serde_json::json!({ "metadata": { "labels": { target.label_key(): node_label_value } } });
    api.patch(node_name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(&patch))
        .await
        .map_err(KubedoorError::from)?;
    Ok(())
}

pub async fn unlabel_node(api: &Api<Node>, node_name: &str, target: &DeploymentTarget) -> KubedoorResult<()> {
    let token = target.label_key().replace('~', "~0").replace('/', "~1");
    let patch = json_patch_remove_label(&token);
    api.patch(node_name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Json(patch))
        .await
        .map_err(KubedoorError::from)?;
    Ok(())
}

fn json_patch_remove_label(token: &str) -> json_patch::Patch {
    json_patch::Patch(vec![json_patch::PatchOperation::Remove(json_patch::RemoveOperation {
        path: format!("/metadata/labels/{token}"),
    })])
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
    fn select_least_loaded_requires_full_count() {
        let target = DeploymentTarget::new("prod", "checkout");
        let nodes = vec![node("a", &[]), node("b", &[])];
        let candidates = vec![NodeLoad { name: "a".into(), percent: 10.0 }, NodeLoad { name: "b".into(), percent: 20.0 }];
        assert!(select_least_loaded_nodes(&candidates, &nodes, &target, 3).is_none());
        assert_eq!(select_least_loaded_nodes(&candidates, &nodes, &target, 2).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn select_del_label_nodes_sorts_by_load_descending_without_sufficiency_check() {
        let target = DeploymentTarget::new("prod", "checkout");
        let nodes = vec![node("a", &[("prod.checkout", "kubedoor-scheduler")])];
        let candidates = vec![NodeLoad { name: "a".into(), percent: 50.0 }];
        let picks = select_del_label_nodes(&candidates, &nodes, &target, 5);
        assert_eq!(picks, vec!["a".to_string()]);
    }

    #[test]
    fn labeled_nodes_count_only_counts_matching_key() {
        let target = DeploymentTarget::new("prod", "checkout");
        let nodes = vec![node("a", &[("prod.checkout", "x")]), node("b", &[("other.ns", "x")])];
        assert_eq!(labeled_nodes_count(&nodes, &target), 1);
    }
}
