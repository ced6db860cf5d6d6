//! Persistent websocket tunnel to the master control plane.
//!
//! Five concurrent tasks run per connection: the inbound dispatcher, the
//! heartbeat, the cluster event streamer, the health monitor, and (dynamic,
//! one per active stream) the pod-log streamers. On the first task failure
//! the others are cancelled and the whole connection is torn down and
//! retried after a fixed 5s backoff — reconnect is not exponential; only
//! the cluster-event watch inside `kubedoor-k8s` backs off exponentially.

#![forbid(unsafe_code)]

pub mod frames;
pub mod relay;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;

use kubedoor_core::config::AgentConfig;
use kubedoor_core::model::PolicyAnswer;
use kubedoor_k8s::K8sSession;
use kubedoor_ops::{KubedoorOps, LogCancelHandle};

use frames::{InboundFrame, OutboundFrame};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const ADMIS_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

type OutboundSender = mpsc::UnboundedSender<Message>;

/// Cloneable front door used by other crates (the admission mutator, the
/// orchestrator's chat bridge) to talk to the master over whatever
/// connection currently happens to be live.
#[derive(Clone)]
pub struct TunnelHandle {
    outbound: Arc<ArcSwapOption<OutboundSender>>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<PolicyAnswer>>>>,
}

impl TunnelHandle {
    fn new() -> Self {
        Self { outbound: Arc::new(ArcSwapOption::empty()), pending: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn send_frame(&self, frame: OutboundFrame) -> bool {
        let Some(sender) = self.outbound.load_full() else {
            return false;
        };
        let Ok(text) = serde_json::to_string(&frame) else { return false };
        sender.send(Message::Text(text)).is_ok()
    }

    /// Asks the master for a policy decision on `namespace`/`deployment`
    /// and awaits the answer, bounded by a fixed timeout so a dead tunnel
    /// can't hang the admission webhook past its own client deadline.
    /// Distinguishes "no tunnel at all" from "tunnel up but no answer in
    /// time" — the admission mutator denies each with a different code
    /// (§4.4 rules 2/3).
    pub async fn query_policy(&self, namespace: &str, deployment: &str) -> QueryOutcome {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let sent = self.send_frame(OutboundFrame::Admis {
            request_id: request_id.clone(),
            namespace: namespace.to_string(),
            deployment: deployment.to_string(),
        });
        if !sent {
            self.pending.lock().await.remove(&request_id);
            return QueryOutcome::NoTunnel;
        }

        match tokio::time::timeout(ADMIS_QUERY_TIMEOUT, rx).await {
            Ok(Ok(answer)) => QueryOutcome::Answered(answer),
            _ => {
                self.pending.lock().await.remove(&request_id);
                QueryOutcome::TimedOut
            }
        }
    }
}

/// Outcome of a policy query against the master tunnel.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// No tunnel connection was up to even send the request on.
    NoTunnel,
    /// The tunnel was up but the master didn't answer within the deadline.
    TimedOut,
    Answered(PolicyAnswer),
}

pub struct Tunnel {
    config: Arc<AgentConfig>,
    k8s: K8sSession,
    ops: Arc<KubedoorOps>,
    handle: TunnelHandle,
}

impl Tunnel {
    pub fn new(config: Arc<AgentConfig>, k8s: K8sSession) -> Self {
        let ops = Arc::new(KubedoorOps::new(k8s.clone()));
        Self { config, k8s, ops, handle: TunnelHandle::new() }
    }

    pub fn handle(&self) -> TunnelHandle {
        self.handle.clone()
    }

    /// Runs forever: connect, run the five tasks, and on any single task
    /// ending (success or failure) tear the rest down and reconnect after
    /// a fixed backoff.
    pub async fn run(&self) {
        loop {
            tracing::info!(url = %self.config.master_ws_url, "connecting to master tunnel");
            counter!("kubedoor_tunnel_connect_attempts_total").increment(1);
            match self.run_once().await {
                Ok(()) => tracing::warn!("tunnel connection ended cleanly"),
                Err(e) => tracing::warn!(error = %e, "tunnel connection failed"),
            }
            self.handle.outbound.store(None);
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.master_ws_url).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        self.handle.outbound.store(Some(Arc::new(out_tx)));

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(heartbeat_task(self.handle.clone()));
        tasks.spawn(health_monitor_task(self.handle.clone()));
        tasks.spawn(event_streamer_task(self.k8s.client.clone(), self.handle.clone()));

        let dispatcher_handle = self.handle.clone();
        let ops = self.ops.clone();
        tasks.spawn(async move {
            let mut pod_log_tasks: HashMap<String, LogCancelHandle> = HashMap::new();
            while let Some(msg) = ws_rx.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(error = %e, "tunnel read error");
                        break;
                    }
                };
                let Message::Text(text) = msg else { continue };
                let frame: InboundFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::debug!(error = %e, raw = %text, "malformed frame ignored");
                        continue;
                    }
                };
                dispatch_inbound(frame, &dispatcher_handle, &ops, &mut pod_log_tasks).await;
            }
            for (_, handle) in pod_log_tasks {
                handle.cancel();
            }
        });

        // First task to finish (success or error) tears down the rest.
        let _ = tasks.join_next().await;
        tasks.shutdown().await;
        writer.abort();
        Ok(())
    }
}

async fn dispatch_inbound(
    frame: InboundFrame,
    handle: &TunnelHandle,
    ops: &Arc<KubedoorOps>,
    pod_log_tasks: &mut HashMap<String, LogCancelHandle>,
) {
    match frame {
        InboundFrame::Request { request_id, method, path, query, body } => {
            let response = relay::handle_http_request(&method, &path, &query, &body).await;
            handle.send_frame(OutboundFrame::Response { request_id, response });
        }
        InboundFrame::Admis { request_id, deploy_res } => {
            let answer: Option<PolicyAnswer> = serde_json::from_value(deploy_res).ok();
            if let Some(tx) = handle.pending.lock().await.remove(&request_id) {
                if let Some(answer) = answer {
                    let _ = tx.send(answer);
                }
            }
        }
        InboundFrame::StartPodLogs { connection_id, namespace, pod_name, container } => {
            let (tx, mut rx) = mpsc::channel::<String>(256);
            let log_handle = ops.stream_logs(&namespace, &pod_name, container, tx);
            pod_log_tasks.insert(connection_id.clone(), log_handle);

            let forward_handle = handle.clone();
            let forward_id = connection_id.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    forward_handle.send_frame(OutboundFrame::PodLogs {
                        connection_id: forward_id.clone(),
                        status: "streaming",
                        line: Some(line),
                    });
                }
            });
        }
        InboundFrame::StopPodLogs { connection_id } => {
            if let Some(log_handle) = pod_log_tasks.remove(&connection_id) {
                log_handle.cancel();
            }
            handle.send_frame(OutboundFrame::PodLogs { connection_id, status: "disconnected", line: None });
        }
    }
}

async fn heartbeat_task(handle: TunnelHandle) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        if !handle.send_frame(OutboundFrame::Heartbeat) {
            tracing::warn!("heartbeat send failed; ending connection");
            return;
        }
    }
}

async fn health_monitor_task(handle: TunnelHandle) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        let connected = handle.outbound.load().is_some();
        if !connected {
            tracing::warn!("health monitor: tunnel outbound channel missing");
            return;
        }
        let pending = handle.pending.lock().await.len();
        tracing::debug!(pending_admissions = pending, "tunnel health ok");
    }
}

async fn event_streamer_task(client: kube::Client, handle: TunnelHandle) {
    let (tx, mut rx) = mpsc::channel(256);
    let watcher = tokio::spawn(kubedoor_k8s::events::stream_cluster_events(client, tx));
    while let Some(event) = rx.recv().await {
        handle.send_frame(OutboundFrame::K8sEvent { data: event.data, timestamp: event.timestamp });
    }
    watcher.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_policy_reports_no_tunnel_when_disconnected() {
        let handle = TunnelHandle::new();
        let outcome = handle.query_policy("ns", "dep").await;
        assert!(matches!(outcome, QueryOutcome::NoTunnel));
    }
}
