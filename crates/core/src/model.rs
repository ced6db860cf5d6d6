//! Shared data model: deployment targets, policy answers, tunnel/session
//! bookkeeping, and the audit record shape.

use serde::{Deserialize, Serialize};

/// `<namespace>/<deployment>` pair identifying an orchestrator/admission target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub namespace: String,
    pub deployment: String,
}

impl DeploymentTarget {
    pub fn new(namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), deployment: deployment.into() }
    }

    /// The `<namespace>.<deployment>` pinned-node label key used throughout
    /// the balancing engine.
    pub fn label_key(&self) -> String {
        format!("{}.{}", self.namespace, self.deployment)
    }

    /// `<env>·<namespace>·<deployment>` prefix every human-facing message
    /// carries, per the error handling design.
    pub fn message_prefix(&self, env: &str) -> String {
        format!("<{env}·{}·{}>", self.namespace, self.deployment)
    }
}

/// The master's answer to an `admis` policy query: either the short form
/// (a bare HTTP code plus a human message, used verbatim when denying) or
/// the long form (replica overrides, resource overrides, and whether the
/// pinned-node scheduler is enabled for this deployment).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyAnswer {
    Long(LongAnswer),
    Short(ShortAnswer),
}

/// `(http_code, human_message)`. `code == 200` means pass; any other code
/// is a deny, with `msg` surfaced verbatim as the admission response's
/// denial reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortAnswer {
    pub code: u16,
    pub msg: String,
}

impl ShortAnswer {
    pub fn is_pass(&self) -> bool {
        self.code == 200
    }
}

/// Long-form answer: `(pod_count, pod_count_ai, pod_count_manual, req_cpu_m,
/// req_mem_mb, lim_cpu_m, lim_mem_mb, scheduler_flag)`. Effective replicas
/// is the first non-negative of `pod_count_manual`, `pod_count_ai`,
/// `pod_count`, in that order. All three being negative simultaneously is
/// an edge case spec.md flags as a source ambiguity; this implementation
/// treats it as a malformed answer and rejects it rather than silently
/// no-op'ing (see DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongAnswer {
    pub pod_count: i64,
    pub pod_count_ai: i64,
    pub pod_count_manual: i64,
    pub req_cpu_m: i64,
    pub req_mem_mb: i64,
    pub lim_cpu_m: i64,
    pub lim_mem_mb: i64,
    pub scheduler_flag: bool,
}

impl LongAnswer {
    pub fn all_replicas_negative(&self) -> bool {
        self.pod_count < 0 && self.pod_count_ai < 0 && self.pod_count_manual < 0
    }

    /// First non-negative of manual/ai/count, in that order.
    pub fn effective_replicas(&self) -> i64 {
        [self.pod_count_manual, self.pod_count_ai, self.pod_count]
            .into_iter()
            .find(|n| *n >= 0)
            .unwrap_or(0)
    }

    /// CPU request, floored to 10m if positive but strictly below it.
    pub fn effective_req_cpu_m(&self) -> i64 {
        if self.req_cpu_m > 0 && self.req_cpu_m < 10 {
            10
        } else {
            self.req_cpu_m
        }
    }

    /// Memory request in MiB, floored to 1MiB if exactly zero.
    pub fn effective_req_mem_mb(&self) -> i64 {
        if self.req_mem_mb == 0 {
            1
        } else {
            self.req_mem_mb
        }
    }
}

/// In-deployment annotation the scale orchestrator stamps with the
/// `<timestamp>@<old>-><new>` bookkeeping the admission mutator's rule-1
/// fast path reads back within a 5 minute window (§4.4/§8 S1).
pub const SCALE_TEMP_ANNOTATION: &str = "scale.temp";

/// Lifecycle of the websocket connection to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// A single in-flight admission request awaiting the master's policy
/// answer, keyed by `request_id` in the pending-admission map.
#[derive(Debug)]
pub struct PendingAdmission {
    pub request_id: String,
    pub target: DeploymentTarget,
    pub responder: tokio::sync::oneshot::Sender<PolicyAnswer>,
}

/// Snapshot of a node's cordon/label state, used by the Node Scheduler and
/// the balancing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSchedulingStatus {
    pub schedulable: Vec<String>,
    pub unschedulable: Vec<String>,
}

/// Which one-shot/recurring operation a CronJob artifact performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronOp {
    Scale,
    Restart,
    UpdateImage,
}

impl CronOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CronOp::Scale => "scale",
            CronOp::Restart => "restart",
            CronOp::UpdateImage => "update-image",
        }
    }
}

/// Builds the `<op>-<once|cron>-<deployment>` CronJob name convention from
/// §3/§6.
pub fn cronjob_name(op: CronOp, recurring: bool, deployment: &str) -> String {
    let kind = if recurring { "cron" } else { "once" };
    format!("{}-{kind}-{deployment}", op.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Scale,
    Restart,
    ImageUpdate,
    Cron,
    BalanceNode,
    AdmissionDecision,
    Cordon,
    Uncordon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: i64,
    pub kind: AuditKind,
    pub namespace: String,
    pub name: String,
    pub detail: String,
    pub outcome: bool,
}

/// An event relayed to the master over the tunnel's event streamer task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub data: serde_json::Value,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_key_joins_namespace_and_deployment() {
        let t = DeploymentTarget::new("prod", "checkout");
        assert_eq!(t.label_key(), "prod.checkout");
    }

    #[test]
    fn message_prefix_uses_triple_brackets() {
        let t = DeploymentTarget::new("prod", "checkout");
        assert_eq!(t.message_prefix("staging"), "<staging·prod·checkout>");
    }

    #[test]
    fn cronjob_name_once_vs_cron() {
        assert_eq!(cronjob_name(CronOp::Scale, false, "checkout"), "scale-once-checkout");
        assert_eq!(cronjob_name(CronOp::Scale, true, "checkout"), "scale-cron-checkout");
    }

    fn long(pod_count: i64, pod_count_ai: i64, pod_count_manual: i64) -> LongAnswer {
        LongAnswer {
            pod_count,
            pod_count_ai,
            pod_count_manual,
            req_cpu_m: 0,
            req_mem_mb: 0,
            lim_cpu_m: 0,
            lim_mem_mb: 0,
            scheduler_flag: false,
        }
    }

    #[test]
    fn long_answer_all_negative_detection() {
        let a = long(-5, -1, -1);
        assert!(a.all_replicas_negative());
        let b = long(-5, -1, 2);
        assert!(!b.all_replicas_negative());
    }

    #[test]
    fn effective_replicas_prefers_manual_then_ai_then_count() {
        assert_eq!(long(3, -1, 7).effective_replicas(), 7);
        assert_eq!(long(3, 4, -1).effective_replicas(), 4);
        assert_eq!(long(3, -1, -1).effective_replicas(), 3);
    }

    #[test]
    fn cpu_request_floored_below_10m() {
        let mut a = long(1, -1, -1);
        a.req_cpu_m = 5;
        assert_eq!(a.effective_req_cpu_m(), 10);
        a.req_cpu_m = 0;
        assert_eq!(a.effective_req_cpu_m(), 0);
        a.req_cpu_m = 500;
        assert_eq!(a.effective_req_cpu_m(), 500);
    }

    #[test]
    fn memory_request_floored_when_zero() {
        let mut a = long(1, -1, -1);
        a.req_mem_mb = 0;
        assert_eq!(a.effective_req_mem_mb(), 1);
        a.req_mem_mb = 1024;
        assert_eq!(a.effective_req_mem_mb(), 1024);
    }
}
