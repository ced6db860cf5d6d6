//! Admission decision table: turns a policy answer from the master (or the
//! absence of one) into a mutation decision, in priority order. Each row is
//! checked top to bottom; the first match wins. Grounded on the source's
//! `admis_service.py`.

use kube::core::admission::Operation;
use serde_json::Value as Json;

use kubedoor_core::model::{LongAnswer, PolicyAnswer, ShortAnswer};
use kubedoor_tunnel::QueryOutcome;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Admit unmodified.
    Pass,
    /// Deny the request outright, with the HTTP code/message to surface.
    Deny { code: u16, reason: String },
    /// Admit, patching only `/spec/replicas`.
    ScaleOnly { replicas: i64 },
    /// Admit with a full patch: affinity, resources, maxUnavailable, and
    /// the replica count.
    FullPatch(LongAnswer),
}

/// The admitted object's kind/operation and the before/after JSON needed to
/// evaluate rules that depend on what actually changed. `old_object` is
/// `Null` on CREATE.
pub struct AdmissionContext<'a> {
    pub kind: &'a str,
    pub operation: Operation,
    pub object: &'a Json,
    pub old_object: &'a Json,
}

impl AdmissionContext<'_> {
    pub fn is_scale(&self) -> bool {
        self.kind == "Scale"
    }

    pub fn is_deployment(&self) -> bool {
        self.kind == "Deployment"
    }

    pub fn template_changed(&self) -> bool {
        self.object.pointer("/spec/template") != self.old_object.pointer("/spec/template")
    }

    pub fn replicas_changed(&self) -> bool {
        self.object.pointer("/spec/replicas") != self.old_object.pointer("/spec/replicas")
    }

    pub fn objects_equal(&self) -> bool {
        self.object == self.old_object
    }
}

/// Row 1: a `scale.temp` annotation stamped by the orchestrator within the
/// last 5 minutes, on a request shaped like the very scale it just
/// performed, is replayed without contacting the master at all (§4.4 rule
/// 1, scenario S1). `now`/`stamped_at` are both naive local timestamps in
/// the `%Y-%m-%d %H:%M:%S` format the orchestrator writes.
pub fn fast_path_replay(ctx: &AdmissionContext, scale_temp: Option<&str>, now: chrono::NaiveDateTime) -> bool {
    let Some(raw) = scale_temp else { return false };
    let Some(ts) = raw.split('@').next() else { return false };
    let Ok(stamped_at) = chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S") else {
        return false;
    };
    let within_5_min = (now - stamped_at).num_seconds().abs() <= 300;
    if !within_5_min {
        return false;
    }
    (ctx.is_scale() && ctx.operation == Operation::Update)
        || (ctx.is_deployment() && ctx.operation == Operation::Update && !ctx.template_changed() && ctx.replicas_changed())
}

/// Builds the decision for a deployment/scale create/update from the
/// master's query outcome, given the admission context rule 1's fast path
/// didn't already resolve. `NoTunnel`/`TimedOut` deny with the literal
/// messages scenario S3 exercises; an answered short form passes or denies
/// verbatim; an answered long form is evaluated against rules 6-9.
pub fn decide(ctx: &AdmissionContext, outcome: QueryOutcome) -> Decision {
    match outcome {
        QueryOutcome::NoTunnel => Decision::Deny { code: 503, reason: "连接 kubedoor-master 失败".to_string() },
        QueryOutcome::TimedOut => Decision::Deny { code: 504, reason: "等待 kubedoor-master 响应超时".to_string() },
        QueryOutcome::Answered(PolicyAnswer::Short(short)) => decide_short(&short),
        QueryOutcome::Answered(PolicyAnswer::Long(long)) => decide_long(ctx, long),
    }
}

fn decide_short(short: &ShortAnswer) -> Decision {
    if short.is_pass() {
        Decision::Pass
    } else {
        Decision::Deny { code: short.code, reason: short.msg.clone() }
    }
}

fn decide_long(ctx: &AdmissionContext, long: LongAnswer) -> Decision {
    if long.all_replicas_negative() {
        // Open Question #1: treat as malformed rather than a silent no-op.
        return Decision::Deny { code: 500, reason: "malformed policy answer: all replica fields negative".into() };
    }

    if ctx.is_scale() && ctx.operation == Operation::Update {
        return Decision::ScaleOnly { replicas: long.effective_replicas() };
    }
    if ctx.is_deployment() && (ctx.operation == Operation::Create || (ctx.operation == Operation::Update && ctx.template_changed())) {
        return Decision::FullPatch(long);
    }
    if ctx.is_scale() && ctx.operation == Operation::Create && ctx.objects_equal() {
        return Decision::Pass;
    }
    if ctx.is_deployment() && ctx.operation == Operation::Update && !ctx.template_changed() && !ctx.replicas_changed() {
        return Decision::Pass;
    }

    tracing::warn!(kind = ctx.kind, operation = ?ctx.operation, "admission request matched no decision rule; passing through");
    Decision::Pass
}

/// Verbatim-preserved branch order from the source's
/// `_process_max_unavailable` (Open Question #2): percent-string, then
/// dotted-string-as-float, then bare integer. Passthrough numerics are
/// returned unchanged.
pub fn process_max_unavailable(value: &Json) -> Json {
    match value {
        Json::Number(_) => value.clone(),
        Json::String(s) => {
            if let Some(pct) = s.strip_suffix('%') {
                if let Ok(f) = pct.parse::<f64>() {
                    return Json::from(f / 100.0);
                }
                value.clone()
            } else if s.contains('.') {
                s.parse::<f64>().map(Json::from).unwrap_or_else(|_| value.clone())
            } else {
                s.parse::<i64>().map(Json::from).unwrap_or_else(|_| value.clone())
            }
        }
        other => other.clone(),
    }
}

/// Ratio a `maxUnavailable` scalar represents, for the "would this leave
/// zero pods available" check in rule 7. Bare-integer strings produce a
/// nonsensical ratio (matches the source's own quirk — Open Question #2).
pub fn max_unavailable_ratio(value: &Json) -> f64 {
    process_max_unavailable(value).as_f64().unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(kind: &'a str, operation: Operation, object: &'a Json, old_object: &'a Json) -> AdmissionContext<'a> {
        AdmissionContext { kind, operation, object, old_object }
    }

    fn long(pod_count: i64, pod_count_ai: i64, pod_count_manual: i64, scheduler_flag: bool) -> LongAnswer {
        LongAnswer { pod_count, pod_count_ai, pod_count_manual, req_cpu_m: 0, req_mem_mb: 0, lim_cpu_m: 0, lim_mem_mb: 0, scheduler_flag }
    }

    #[test]
    fn no_tunnel_denies_503_with_literal_message() {
        let d = decide(&ctx("Deployment", Operation::Create, &Json::Null, &Json::Null), QueryOutcome::NoTunnel);
        assert_eq!(d, Decision::Deny { code: 503, reason: "连接 kubedoor-master 失败".to_string() });
    }

    #[test]
    fn timed_out_denies_504_with_literal_message() {
        let d = decide(&ctx("Deployment", Operation::Create, &Json::Null, &Json::Null), QueryOutcome::TimedOut);
        assert_eq!(d, Decision::Deny { code: 504, reason: "等待 kubedoor-master 响应超时".to_string() });
    }

    #[test]
    fn short_pass_on_200() {
        let d = decide_short(&ShortAnswer { code: 200, msg: "ok".into() });
        assert_eq!(d, Decision::Pass);
    }

    #[test]
    fn short_deny_on_non_200() {
        let d = decide_short(&ShortAnswer { code: 403, msg: "nope".into() });
        assert_eq!(d, Decision::Deny { code: 403, reason: "nope".into() });
    }

    #[test]
    fn scale_update_is_scale_only() {
        let obj = serde_json::json!({"spec": {"replicas": 5}});
        let old = serde_json::json!({"spec": {"replicas": 3}});
        let d = decide_long(&ctx("Scale", Operation::Update, &obj, &old), long(5, -1, -1, false));
        assert_eq!(d, Decision::ScaleOnly { replicas: 5 });
    }

    #[test]
    fn deployment_create_is_full_patch() {
        let obj = serde_json::json!({"spec": {"replicas": 3}});
        let d = decide_long(&ctx("Deployment", Operation::Create, &obj, &Json::Null), long(3, -1, -1, true));
        assert!(matches!(d, Decision::FullPatch(_)));
    }

    #[test]
    fn deployment_update_with_changed_template_is_full_patch() {
        let obj = serde_json::json!({"spec": {"replicas": 3, "template": {"spec": {"containers": [{"image": "v2"}]}}}});
        let old = serde_json::json!({"spec": {"replicas": 3, "template": {"spec": {"containers": [{"image": "v1"}]}}}});
        let d = decide_long(&ctx("Deployment", Operation::Update, &obj, &old), long(3, -1, -1, true));
        assert!(matches!(d, Decision::FullPatch(_)));
    }

    #[test]
    fn scale_create_with_unchanged_object_passes() {
        let obj = serde_json::json!({"spec": {"replicas": 3}});
        let d = decide_long(&ctx("Scale", Operation::Create, &obj, &obj.clone()), long(3, -1, -1, false));
        assert_eq!(d, Decision::Pass);
    }

    #[test]
    fn deployment_update_with_nothing_changed_passes() {
        let obj = serde_json::json!({"spec": {"replicas": 3, "template": {"spec": {}}}});
        let d = decide_long(&ctx("Deployment", Operation::Update, &obj, &obj.clone()), long(3, -1, -1, false));
        assert_eq!(d, Decision::Pass);
    }

    #[test]
    fn all_replicas_negative_is_rejected() {
        let obj = serde_json::json!({"spec": {"replicas": 3}});
        let d = decide_long(&ctx("Deployment", Operation::Create, &obj, &Json::Null), long(-1, -1, -1, false));
        assert!(matches!(d, Decision::Deny { code: 500, .. }));
    }

    #[test]
    fn fast_path_matches_scale_update_within_window() {
        let obj = serde_json::json!({"spec": {"replicas": 5}});
        let old = serde_json::json!({"spec": {"replicas": 3}});
        let c = ctx("Scale", Operation::Update, &obj, &old);
        let now = chrono::NaiveDateTime::parse_from_str("2024-01-01 12:02:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert!(fast_path_replay(&c, Some("2024-01-01 12:00:00@3->5"), now));
    }

    #[test]
    fn fast_path_expires_after_5_minutes() {
        let obj = serde_json::json!({"spec": {"replicas": 5}});
        let old = serde_json::json!({"spec": {"replicas": 3}});
        let c = ctx("Scale", Operation::Update, &obj, &old);
        let now = chrono::NaiveDateTime::parse_from_str("2024-01-01 12:06:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert!(!fast_path_replay(&c, Some("2024-01-01 12:00:00@3->5"), now));
    }

    #[test]
    fn max_unavailable_percent_string() {
        let v = process_max_unavailable(&Json::String("20%".into()));
        assert_eq!(v.as_f64().unwrap(), 0.2);
    }

    #[test]
    fn max_unavailable_dotted_string_as_float() {
        let v = process_max_unavailable(&Json::String("1.5".into()));
        assert_eq!(v.as_f64().unwrap(), 1.5);
    }

    #[test]
    fn max_unavailable_bare_integer_string() {
        let v = process_max_unavailable(&Json::String("2".into()));
        assert_eq!(v.as_i64().unwrap(), 2);
    }

    #[test]
    fn max_unavailable_numeric_passthrough() {
        let v = process_max_unavailable(&Json::from(3));
        assert_eq!(v.as_i64().unwrap(), 3);
    }

    #[test]
    fn max_unavailable_ratio_below_one_pod_triggers_override() {
        let ratio = max_unavailable_ratio(&Json::String("25%".into()));
        assert!((7.0 * ratio) >= 1.0);
        assert!((3.0 * ratio) < 1.0);
    }
}
