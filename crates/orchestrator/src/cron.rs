//! CronJob artifact factory: builds the one-shot/recurring `CronJob`
//! objects the scale/restart/update-image entry points schedule, and the
//! one-shot cleanup that deletes them after they've fired.
//!
//! Namespace, image, and naming convention are fixed per §3/§6. The query
//! string the job's callback curl command carries is deliberately built
//! with at most one of `add_label`/`scheduler` (Open Question #4) rather
//! than the source's double-concatenation.

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::Api;

use kubedoor_core::error::{KubedoorError, KubedoorResult};
use kubedoor_core::model::{cronjob_name, CronOp};

const NAMESPACE: &str = "kubedoor";
const IMAGE: &str = "busybox-curl";
const FIELD_MANAGER: &str = "kubedoor-agent";

/// At most one of these may be set on a given callback — setting both is a
/// caller error, not silently tolerated (Open Question #4).
#[derive(Debug, Clone, Default)]
pub struct CronCallbackFlags {
    pub add_label: bool,
    pub scheduler: bool,
}

impl CronCallbackFlags {
    fn query_string(&self) -> KubedoorResult<String> {
        match (self.add_label, self.scheduler) {
            (true, true) => Err(KubedoorError::bad_request("at most one of add_label/scheduler may be set")),
            (true, false) => Ok("?add_label=true".to_string()),
            (false, true) => Ok("?scheduler=true".to_string()),
            (false, false) => Ok(String::new()),
        }
    }
}

/// Either a one-shot six-field time spec (already resolved to a cron
/// expression by the caller from a concrete timestamp) or a raw recurring
/// cron string.
#[derive(Debug, Clone)]
pub enum Schedule {
    Once(String),
    Recurring(String),
}

impl Schedule {
    fn cron_expr(&self) -> &str {
        match self {
            Schedule::Once(s) | Schedule::Recurring(s) => s,
        }
    }

    pub fn recurring(&self) -> bool {
        matches!(self, Schedule::Recurring(_))
    }
}

pub fn build(op: CronOp, deployment: &str, schedule: Schedule, callback_url: &str, body: &serde_json::Value, flags: &CronCallbackFlags) -> KubedoorResult<CronJob> {
    let qs = flags.query_string()?;
    let name = cronjob_name(op, schedule.recurring(), deployment);
    let escaped_body = body.to_string().replace('\'', "'\\''");
    let command = format!("curl -sk -X POST -H 'Content-Type: application/json' -d '{escaped_body}' '{callback_url}{qs}'");

    let job_spec = JobSpec {
        template: PodTemplateSpec {
            spec: Some(PodSpec {
                restart_policy: Some("OnFailure".to_string()),
                containers: vec![Container {
                    name: "callback".to_string(),
                    image: Some(IMAGE.to_string()),
                    command: Some(vec!["sh".to_string(), "-c".to_string(), command]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            metadata: ObjectMeta::default(),
        },
        backoff_limit: Some(1),
        ..Default::default()
    };

    Ok(CronJob {
        metadata: ObjectMeta { name: Some(name), namespace: Some(NAMESPACE.to_string()), ..Default::default() },
        spec: Some(CronJobSpec {
            schedule: schedule.cron_expr().to_string(),
            successful_jobs_history_limit: Some(0),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec { spec: Some(job_spec), metadata: ObjectMeta::default() },
            ..Default::default()
        }),
        status: None,
    })
}

pub async fn apply(api: &Api<CronJob>, job: &CronJob) -> KubedoorResult<()> {
    let name = job.metadata.name.clone().unwrap_or_default();
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(job))
        .await
        .map_err(KubedoorError::from)?;
    Ok(())
}

/// Deletes a one-shot CronJob (and its spawned Job, if any) after it has
/// fired — the "cron one-shot cleanup" scenario.
pub async fn delete_once(cronjobs: &Api<CronJob>, jobs: &Api<Job>, op: CronOp, deployment: &str) -> KubedoorResult<()> {
    let name = cronjob_name(op, false, deployment);
    match cronjobs.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(resp)) if resp.code == 404 => {}
        Err(e) => return Err(KubedoorError::from(e)),
    }
    match jobs.delete(&name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(KubedoorError::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_flags_set_is_rejected() {
        let flags = CronCallbackFlags { add_label: true, scheduler: true };
        assert!(flags.query_string().is_err());
    }

    #[test]
    fn single_flag_produces_single_param() {
        let flags = CronCallbackFlags { add_label: true, scheduler: false };
        assert_eq!(flags.query_string().unwrap(), "?add_label=true");
    }

    #[test]
    fn naming_distinguishes_once_and_cron() {
        let body = serde_json::json!({"namespace": "prod", "deployments": ["checkout"]});
        let job = build(CronOp::Scale, "checkout", Schedule::Once("0 3 5 6 *".into()), "https://agent/api/scale", &body, &CronCallbackFlags::default()).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("scale-once-checkout"));
        assert_eq!(job.metadata.namespace.as_deref(), Some(NAMESPACE));
    }

    #[test]
    fn command_embeds_json_body_as_curl_payload() {
        let body = serde_json::json!({"namespace": "prod", "deployments": ["checkout"]});
        let job = build(CronOp::Restart, "checkout", Schedule::Once("30 10 5 6 *".into()), "https://agent/api/restart", &body, &CronCallbackFlags::default()).unwrap();
        let command = job.spec.unwrap().job_template.spec.unwrap().template.spec.unwrap().containers[0].command.clone().unwrap();
        assert!(command[2].contains("\"deployments\":[\"checkout\"]"));
        assert!(command[2].contains("-d '"));
    }
}
