//! HTTP surface: `GET/POST /api/admis_switch` (probe/enable/disable the
//! webhook) and `POST /api/admis` (the `AdmissionReview` webhook entry
//! point itself).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use json_patch::Patch;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::core::admission::{AdmissionResponse, AdmissionReview};
use metrics::counter;
use serde_json::Value as JsonValue;

use kubedoor_core::model::{DeploymentTarget, SCALE_TEMP_ANNOTATION};

use crate::patch::{build_full_patch, build_scale_only_patch};
use crate::policy::{decide, fast_path_replay, AdmissionContext, Decision};
use crate::webhook;

pub struct AdmissionState {
    pub tunnel: kubedoor_tunnel::TunnelHandle,
    pub node_label_value: String,
    pub audit: Arc<dyn kubedoor_persist::AuditStore>,
    pub client: kube::Client,
    pub namespace: String,
    pub service_name: String,
    pub ca_bundle_b64: String,
}

impl AdmissionState {
    pub fn new(
        tunnel: kubedoor_tunnel::TunnelHandle,
        node_label_value: String,
        client: kube::Client,
        namespace: String,
        service_name: String,
        ca_bundle_b64: String,
    ) -> Self {
        let audit: Arc<dyn kubedoor_persist::AuditStore> = match kubedoor_persist::SqliteAuditStore::open_default() {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, "audit store unavailable; admission decisions will not be persisted");
                Arc::new(kubedoor_persist::NullAuditStore)
            }
        };
        Self { tunnel, node_label_value, audit, client, namespace, service_name, ca_bundle_b64 }
    }
}

/// `get|on|off` against the actual `MutatingWebhookConfiguration`. Matches
/// the source's `admis_switch` response shapes verbatim, including the
/// "already opened/closed" early returns.
pub async fn admis_switch(State(state): State<Arc<AdmissionState>>, Query(params): Query<HashMap<String, String>>) -> (StatusCode, Json<JsonValue>) {
    let action = params.get("action").map(String::as_str).unwrap_or("get");
    match action {
        "get" => match webhook::probe(&state.client).await {
            Ok(is_on) => (StatusCode::OK, Json(serde_json::json!({ "is_on": is_on }))),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "message": e.to_string(), "success": false }))),
        },
        "on" => {
            let is_on = webhook::probe(&state.client).await.unwrap_or(false);
            if is_on {
                return (StatusCode::OK, Json(serde_json::json!({ "message": "Webhook is already opened!", "success": true })));
            }
            match webhook::register(state.client.clone(), &state.namespace, &state.service_name, &state.ca_bundle_b64).await {
                Ok(()) => {
                    if let Err(e) = webhook::set_namespace_ignore_label(&state.client, true).await {
                        tracing::warn!(error = %e, "failed to label namespaces kubedoor-ignore after enabling webhook");
                    }
                    (StatusCode::OK, Json(serde_json::json!({ "message": "执行成功", "success": true })))
                }
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "message": e.to_string(), "success": false }))),
            }
        }
        "off" => {
            let is_on = webhook::probe(&state.client).await.unwrap_or(false);
            if !is_on {
                return (StatusCode::OK, Json(serde_json::json!({ "message": "Webhook is already closed!", "success": true })));
            }
            match webhook::unregister(state.client.clone()).await {
                Ok(()) => {
                    if let Err(e) = webhook::set_namespace_ignore_label(&state.client, false).await {
                        tracing::warn!(error = %e, "failed to clear kubedoor-ignore label after disabling webhook");
                    }
                    (StatusCode::OK, Json(serde_json::json!({ "message": "执行成功", "success": true })))
                }
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "message": e.to_string(), "success": false }))),
            }
        }
        other => (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "message": format!("unknown action: {other}"), "success": false }))),
    }
}

pub async fn admis(State(state): State<Arc<AdmissionState>>, Json(review): Json<AdmissionReview<JsonValue>>) -> Json<AdmissionReview<JsonValue>> {
    let Some(request) = review.request.clone() else {
        return Json(AdmissionReview { response: Some(AdmissionResponse::invalid("missing request".to_string()).into()), ..review });
    };
    let response = AdmissionResponse::from(&request);

    let object = request.object.clone().unwrap_or(JsonValue::Null);
    let old_object = request.old_object.clone().unwrap_or(JsonValue::Null);
    let namespace = object.pointer("/metadata/namespace").and_then(JsonValue::as_str).unwrap_or_default().to_string();
    let name = object.pointer("/metadata/name").and_then(JsonValue::as_str).unwrap_or_default().to_string();
    let target = DeploymentTarget::new(namespace.clone(), name.clone());
    let kind = request.kind.kind.clone();

    let ctx = AdmissionContext { kind: &kind, operation: request.operation.clone(), object: &object, old_object: &old_object };

    let scale_temp = object.pointer("/metadata/annotations").and_then(|a| a.get(SCALE_TEMP_ANNOTATION)).and_then(JsonValue::as_str);

    let decision = if fast_path_replay(&ctx, scale_temp, chrono::Utc::now().naive_utc()) {
        tracing::debug!(namespace = %target.namespace, deployment = %target.deployment, "admission fast path: replaying orchestrator's own recent scale, master not contacted");
        Decision::Pass
    } else {
        let outcome = state.tunnel.query_policy(&namespace, &name).await;
        decide(&ctx, outcome)
    };

    let outcome_ok = !matches!(decision, Decision::Deny { .. });
    let detail = format!("{decision:?}");
    counter!("kubedoor_admission_decisions_total", "outcome" => if outcome_ok { "allow" } else { "deny" }).increment(1);
    let _ = state.audit.record(&kubedoor_core::model::AuditRecord {
        ts: kubedoor_persist::now_ts(),
        kind: kubedoor_core::model::AuditKind::AdmissionDecision,
        namespace: target.namespace.clone(),
        name: target.deployment.clone(),
        detail,
        outcome: outcome_ok,
    });

    let response = match decision {
        Decision::Pass => response,
        Decision::Deny { code, reason } => deny(response, code, reason),
        Decision::ScaleOnly { replicas } => match apply_json_patch(response, build_scale_only_patch(replicas)) {
            Ok(r) => r,
            Err(e) => deny(AdmissionResponse::from(&request), 500, format!("internal error building patch: {e}")),
        },
        Decision::FullPatch(long) => {
            let ops = build_full_patch(&target, &state.node_label_value, &object, &long);
            match apply_json_patch(response, ops) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, namespace = %target.namespace, deployment = %target.deployment, "failed to encode admission patch");
                    deny(AdmissionResponse::from(&request), 500, format!("internal error building patch: {e}"))
                }
            }
        }
    };

    Json(finish(review, response))
}

fn deny(mut response: AdmissionResponse, code: u16, msg: String) -> AdmissionResponse {
    response.allowed = false;
    response.result = Status { code: Some(code as i32), message: Some(msg), ..Default::default() };
    response
}

fn apply_json_patch(response: AdmissionResponse, ops: Vec<json_patch::PatchOperation>) -> anyhow::Result<AdmissionResponse> {
    let patch = Patch(ops);
    Ok(response.with_patch(patch)?)
}

fn finish(review: AdmissionReview<JsonValue>, response: AdmissionResponse) -> AdmissionReview<JsonValue> {
    AdmissionReview { response: Some(response.into()), ..review }
}
