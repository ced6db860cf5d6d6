//! JSONPatch construction for the admission mutator's mutation paths:
//! pinned-node affinity/anti-affinity, container 0 resources, and the
//! rolling-update `maxUnavailable` adjustment. Grounded on the source's
//! `_update_all`/`_get_deployment_affinity`.

use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation};
use serde_json::Value as Json;

use kubedoor_core::model::{DeploymentTarget, LongAnswer};

use crate::policy::max_unavailable_ratio;

fn add_op(path: &str, value: Json) -> PatchOperation {
    PatchOperation::Add(AddOperation { path: path.to_string(), value })
}

fn replace_op(path: &str, value: Json) -> PatchOperation {
    PatchOperation::Replace(ReplaceOperation { path: path.to_string(), value })
}

fn remove_op(path: &str) -> PatchOperation {
    PatchOperation::Remove(RemoveOperation { path: path.to_string() })
}

/// `requiredDuringSchedulingIgnoredDuringExecution` node affinity pinning
/// the deployment's pods onto nodes carrying its `<namespace>.<deployment>`
/// label, plus a pod anti-affinity keeping its own replicas off the same
/// host. Mirrors the source's `_get_deployment_affinity`.
fn affinity_value(target: &DeploymentTarget, node_label_value: &str, pod_label: &str) -> Json {
    serde_json::json!({
        "nodeAffinity": {
            "requiredDuringSchedulingIgnoredDuringExecution": {
                "nodeSelectorTerms": [{
                    "matchExpressions": [{
                        "key": target.label_key(),
                        "operator": "In",
                        "values": [node_label_value]
                    }]
                }]
            }
        },
        "podAntiAffinity": {
            "requiredDuringSchedulingIgnoredDuringExecution": [{
                "labelSelector": {
                    "matchExpressions": [{
                        "key": "app",
                        "operator": "In",
                        "values": [pod_label]
                    }]
                },
                "topologyKey": "kubernetes.io/hostname"
            }]
        }
    })
}

/// True if the object already carries a pinned-node affinity built by this
/// agent (a nodeAffinity expression whose values include `node_label_value`).
fn has_our_affinity(spec: &Json, node_label_value: &str) -> bool {
    spec.pointer("/template/spec/affinity/nodeAffinity/requiredDuringSchedulingIgnoredDuringExecution/nodeSelectorTerms")
        .and_then(Json::as_array)
        .map(|terms| {
            terms.iter().any(|term| {
                term.pointer("/matchExpressions")
                    .and_then(Json::as_array)
                    .map(|exprs| {
                        exprs.iter().any(|e| {
                            e.pointer("/values")
                                .and_then(Json::as_array)
                                .map(|vals| vals.iter().any(|v| v.as_str() == Some(node_label_value)))
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Builds container 0's resources object: the existing value merged with
/// whatever of request-cpu/request-mem/limit-cpu/limit-mem the answer
/// supplies a positive value for. Mirrors the source's single-container
/// assumption (`containers[0]` only).
fn container0_resources(spec: &Json, answer: &LongAnswer) -> Json {
    let mut resources = spec
        .pointer("/template/spec/containers/0/resources")
        .cloned()
        .unwrap_or_else(|| Json::Object(Default::default()));
    if !resources.is_object() {
        resources = Json::Object(Default::default());
    }
    let obj = resources.as_object_mut().unwrap();
    obj.entry("requests").or_insert_with(|| Json::Object(Default::default()));
    obj.entry("limits").or_insert_with(|| Json::Object(Default::default()));

    let req_cpu = answer.effective_req_cpu_m();
    let req_mem = answer.effective_req_mem_mb();
    if req_cpu > 0 {
        set_bucket(&mut resources, "requests", "cpu", format!("{req_cpu}m"));
    }
    if req_mem > 0 {
        set_bucket(&mut resources, "requests", "memory", format!("{req_mem}Mi"));
    }
    if answer.lim_cpu_m > 0 {
        set_bucket(&mut resources, "limits", "cpu", format!("{}m", answer.lim_cpu_m));
    }
    if answer.lim_mem_mb > 0 {
        set_bucket(&mut resources, "limits", "memory", format!("{}Mi", answer.lim_mem_mb));
    }
    resources
}

fn set_bucket(resources: &mut Json, bucket: &str, key: &str, value: String) {
    let entry = resources.as_object_mut().unwrap().entry(bucket).or_insert(Json::Object(Default::default()));
    entry.as_object_mut().unwrap().insert(key.to_string(), Json::String(value));
}

/// Builds the JSONPatch for a `Decision::ScaleOnly` admission: the replica
/// count only, nothing else (§4.4 rule 6).
pub fn build_scale_only_patch(replicas: i64) -> Vec<PatchOperation> {
    vec![replace_op("/spec/replicas", Json::from(replicas))]
}

/// Builds the full JSONPatch for a deployment being pinned/resized per the
/// master's long-form policy answer. `existing` is the incoming object's
/// own JSON: the source of the live pod label, the current `maxUnavailable`
/// scalar, and the current container 0 resources to merge onto.
pub fn build_full_patch(target: &DeploymentTarget, node_label_value: &str, existing: &Json, answer: &LongAnswer) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    let spec = existing.pointer("/spec").cloned().unwrap_or(Json::Null);

    if answer.scheduler_flag {
        let pod_label = spec
            .pointer("/template/metadata/labels/app")
            .and_then(Json::as_str)
            .unwrap_or(&target.deployment)
            .to_string();
        let affinity = affinity_value(target, node_label_value, &pod_label);
        let has_affinity = spec.pointer("/template/spec/affinity").is_some();
        ops.push(if has_affinity {
            replace_op("/spec/template/spec/affinity", affinity)
        } else {
            add_op("/spec/template/spec/affinity", affinity)
        });

        if let Some(raw_mu) = existing.pointer("/spec/strategy/rollingUpdate/maxUnavailable") {
            let replicas = answer.effective_replicas();
            let ratio = max_unavailable_ratio(raw_mu);
            // Leave the original scalar untouched unless it would leave
            // zero pods available at the new replica count (§4.4 rule 7).
            if (replicas as f64) * ratio < 1.0 {
                ops.push(replace_op("/spec/strategy/rollingUpdate/maxUnavailable", Json::from(1)));
            }
        }
    } else if has_our_affinity(&spec, node_label_value) {
        ops.push(remove_op("/spec/template/spec/affinity/nodeAffinity"));
    }

    ops.push(replace_op("/spec/replicas", Json::from(answer.effective_replicas())));

    let resources = container0_resources(&spec, answer);
    ops.push(add_op("/spec/template/spec/containers/0/resources", resources));

    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(scheduler_flag: bool) -> LongAnswer {
        LongAnswer {
            pod_count: 7,
            pod_count_ai: -1,
            pod_count_manual: -1,
            req_cpu_m: 500,
            req_mem_mb: 1024,
            lim_cpu_m: 1000,
            lim_mem_mb: 2048,
            scheduler_flag,
        }
    }

    #[test]
    fn scale_only_patch_touches_only_replicas() {
        let ops = build_scale_only_patch(5);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], PatchOperation::Replace(r) if r.path.to_string() == "/spec/replicas"));
    }

    #[test]
    fn adds_affinity_when_scheduler_enabled_and_none_present() {
        let target = DeploymentTarget::new("prod", "checkout");
        let existing = serde_json::json!({"spec": {"replicas": 3, "template": {"metadata": {"labels": {"app": "checkout"}}, "spec": {"containers": [{}]}}}});
        let ops = build_full_patch(&target, "kubedoor-scheduler", &existing, &long(true));
        assert!(ops.iter().any(|op| matches!(op, PatchOperation::Add(a) if a.path.to_string().ends_with("affinity"))));
    }

    #[test]
    fn s2_worked_example_keeps_original_max_unavailable_and_splits_requests_limits() {
        // Scenario S2: 7 replicas, 25% maxUnavailable (7*0.25=1.75 >= 1, so
        // the original scalar is left untouched, not rewritten).
        let target = DeploymentTarget::new("prod", "api");
        let existing = serde_json::json!({
            "spec": {
                "replicas": 3,
                "strategy": {"rollingUpdate": {"maxUnavailable": "25%"}},
                "template": {"metadata": {"labels": {"app": "api"}}, "spec": {"containers": [{}]}}
            }
        });
        let ops = build_full_patch(&target, "kubedoor-scheduler", &existing, &long(true));
        assert!(!ops.iter().any(|op| matches!(op, PatchOperation::Replace(r) if r.path.to_string().ends_with("maxUnavailable"))));

        let resources_op = ops
            .iter()
            .find_map(|op| match op {
                PatchOperation::Add(a) if a.path.to_string().ends_with("resources") => Some(&a.value),
                _ => None,
            })
            .expect("resources op present");
        assert_eq!(resources_op["requests"]["cpu"], "500m");
        assert_eq!(resources_op["requests"]["memory"], "1024Mi");
        assert_eq!(resources_op["limits"]["cpu"], "1000m");
        assert_eq!(resources_op["limits"]["memory"], "2048Mi");
    }

    #[test]
    fn max_unavailable_overridden_to_one_when_ratio_would_strand_all_pods() {
        let target = DeploymentTarget::new("prod", "api");
        let existing = serde_json::json!({
            "spec": {
                "replicas": 3,
                "strategy": {"rollingUpdate": {"maxUnavailable": "25%"}},
                "template": {"metadata": {"labels": {"app": "api"}}, "spec": {"containers": [{}]}}
            }
        });
        let mut answer = long(true);
        answer.pod_count = 3;
        let ops = build_full_patch(&target, "kubedoor-scheduler", &existing, &answer);
        let mu = ops.iter().find_map(|op| match op {
            PatchOperation::Replace(r) if r.path.to_string().ends_with("maxUnavailable") => Some(&r.value),
            _ => None,
        });
        assert_eq!(mu, Some(&Json::from(1)));
    }

    #[test]
    fn scheduler_disabled_removes_stale_pinned_affinity() {
        let target = DeploymentTarget::new("prod", "api");
        let existing = serde_json::json!({
            "spec": {
                "replicas": 3,
                "template": {
                    "metadata": {"labels": {"app": "api"}},
                    "spec": {
                        "containers": [{}],
                        "affinity": {"nodeAffinity": {"requiredDuringSchedulingIgnoredDuringExecution": {"nodeSelectorTerms": [{
                            "matchExpressions": [{"key": "prod.api", "operator": "In", "values": ["kubedoor-scheduler"]}]
                        }]}}}
                    }
                }
            }
        });
        let ops = build_full_patch(&target, "kubedoor-scheduler", &existing, &long(false));
        assert!(ops.iter().any(|op| matches!(op, PatchOperation::Remove(r) if r.path.to_string().ends_with("nodeAffinity"))));
    }

    #[test]
    fn resources_only_touch_container_zero_and_preserve_other_fields() {
        let target = DeploymentTarget::new("prod", "checkout");
        let existing = serde_json::json!({"spec": {"replicas": 1, "template": {"metadata": {"labels": {"app": "checkout"}}, "spec": {"containers": [
            {"name": "app", "image": "repo/app:v1", "env": [{"name": "FOO", "value": "bar"}]}
        ]}}}});
        let ops = build_full_patch(&target, "kubedoor-scheduler", &existing, &long(false));
        let resources_op = ops
            .iter()
            .find_map(|op| match op {
                PatchOperation::Add(a) if a.path.to_string() == "/spec/template/spec/containers/0/resources" => Some(&a.value),
                _ => None,
            })
            .expect("resources op present");
        assert_eq!(resources_op["requests"]["cpu"], "500m");
        assert_eq!(resources_op["limits"]["memory"], "2048Mi");
    }
}
