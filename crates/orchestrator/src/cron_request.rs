//! `POST /api/cron`: the CronJob factory's public entry point (§4.5.5,
//! scenario S6). Turns a one-shot or recurring schedule request into one
//! `CronJob` artifact per named deployment, each firing a `curl` callback
//! back into this agent's own `/api/<op>` route carrying the deployment's
//! batch body as its JSON payload.

use std::sync::Arc;

use k8s_openapi::api::batch::v1::CronJob;
use kube::Api;

use kubedoor_core::error::{KubedoorError, KubedoorResult};
use kubedoor_core::model::{cronjob_name, CronOp};

use crate::cron::{self, CronCallbackFlags, Schedule};

/// Where the CronJob's callback curl command reaches this same agent.
/// Fixed by the Service/namespace convention §6 documents for the
/// in-cluster admission webhook target — the CronJob pod talks to the same
/// Service the API server's webhook calls talk to.
const AGENT_INTERNAL_BASE_URL: &str = "https://kubedoor-agent.kubedoor.svc.cluster.local";

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CronDeploymentEntry {
    pub namespace: String,
    pub deployment_name: String,
    /// Target replica count, used only when `op == "scale"`.
    pub replicas: Option<i32>,
    /// Container/image pair, used only when `op == "update-image"`.
    pub container: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct CronServiceBody {
    pub deployment_list: Vec<CronDeploymentEntry>,
}

/// `time` is `[year, month, day, hour, minute]`, resolved to a one-shot
/// `<minute> <hour> <day> <month> *` expression; `cron` is a raw recurring
/// cron expression. Exactly one of the two must be set.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct CronRequest {
    #[serde(rename = "type")]
    pub op: String,
    pub time: Option<[String; 5]>,
    pub cron: Option<String>,
    pub service: CronServiceBody,
    pub add_label: bool,
    pub scheduler: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CronBatchResult {
    pub success: bool,
    pub message: String,
    pub errors: Vec<(String, String)>,
}

pub struct CronRequestService {
    pub cronjob_api: Api<CronJob>,
}

impl CronRequestService {
    pub async fn handle_cron(&self, req: CronRequest) -> KubedoorResult<CronBatchResult> {
        let op = parse_op(&req.op)?;
        let schedule = build_schedule(&req)?;
        let flags = CronCallbackFlags { add_label: req.add_label, scheduler: req.scheduler };

        let mut errors = Vec::new();
        for entry in &req.service.deployment_list {
            if let Err(e) = self.create_one(op, &schedule, &flags, entry).await {
                errors.push((entry.deployment_name.clone(), e.to_string()));
            }
        }

        if errors.is_empty() {
            Ok(CronBatchResult { success: true, message: "ok".to_string(), errors })
        } else {
            Ok(CronBatchResult { success: false, message: format!("以下 CronJob 创建失败: {errors:?}"), errors })
        }
    }

    async fn create_one(&self, op: CronOp, schedule: &Schedule, flags: &CronCallbackFlags, entry: &CronDeploymentEntry) -> KubedoorResult<()> {
        let job_name = cronjob_name(op, schedule.recurring(), &entry.deployment_name);
        let body = callback_body(op, entry, &job_name);
        let callback_url = format!("{AGENT_INTERNAL_BASE_URL}/api/{}", op.as_str());
        let job = cron::build(op, &entry.deployment_name, schedule.clone(), &callback_url, &body, flags)?;
        cron::apply(&self.cronjob_api, &job).await
    }
}

fn parse_op(raw: &str) -> KubedoorResult<CronOp> {
    match raw {
        "scale" => Ok(CronOp::Scale),
        "restart" => Ok(CronOp::Restart),
        "update-image" => Ok(CronOp::UpdateImage),
        other => Err(KubedoorError::bad_request(format!("unknown cron type: {other}"))),
    }
}

fn build_schedule(req: &CronRequest) -> KubedoorResult<Schedule> {
    match (&req.time, &req.cron) {
        (Some(time), None) => Ok(Schedule::Once(one_shot_cron_expr(time))),
        (None, Some(expr)) => Ok(Schedule::Recurring(expr.clone())),
        (None, None) => Err(KubedoorError::bad_request("cron request needs either `time` or `cron`")),
        (Some(_), Some(_)) => Err(KubedoorError::bad_request("cron request cannot set both `time` and `cron`")),
    }
}

/// `[year, month, day, hour, minute]` → `<minute> <hour> <day> <month> *`.
/// The year has no place in a cron expression; it only disambiguates which
/// occurrence the caller meant.
fn one_shot_cron_expr(time: &[String; 5]) -> String {
    let [_year, month, day, hour, minute] = time;
    format!("{minute} {hour} {day} {month} *")
}

fn callback_body(op: CronOp, entry: &CronDeploymentEntry, job_name: &str) -> serde_json::Value {
    match op {
        CronOp::Scale => serde_json::json!({
            "namespace": entry.namespace,
            "items": [{ "deployment": entry.deployment_name, "replicas": entry.replicas.unwrap_or(0) }],
            "flags": { "job_name": job_name },
            "node_loads": [],
            "node_scheduler": [],
        }),
        CronOp::Restart => serde_json::json!({
            "namespace": entry.namespace,
            "deployments": [entry.deployment_name],
            "job_name": job_name,
        }),
        CronOp::UpdateImage => serde_json::json!({
            "namespace": entry.namespace,
            "deployment": entry.deployment_name,
            "container": entry.container.clone().unwrap_or_default(),
            "image": entry.image.clone().unwrap_or_default(),
            "job_name": job_name,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_time_becomes_minute_hour_dom_month_star() {
        let time = ["2026".to_string(), "6".to_string(), "5".to_string(), "10".to_string(), "30".to_string()];
        assert_eq!(one_shot_cron_expr(&time), "30 10 5 6 *");
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(parse_op("delete-everything").is_err());
    }

    #[test]
    fn time_and_cron_together_is_rejected() {
        let req = CronRequest { op: "restart".into(), time: Some(["2026".into(), "6".into(), "5".into(), "10".into(), "30".into()]), cron: Some("* * * * *".into()), ..Default::default() };
        assert!(build_schedule(&req).is_err());
    }

    #[test]
    fn restart_callback_body_carries_job_name_for_self_cleanup() {
        let entry = CronDeploymentEntry { namespace: "prod".into(), deployment_name: "checkout".into(), ..Default::default() };
        let body = callback_body(CronOp::Restart, &entry, "restart-once-checkout");
        assert_eq!(body["job_name"], "restart-once-checkout");
        assert_eq!(body["deployments"][0], "checkout");
    }
}
