//! Cluster event watcher feeding the master tunnel's event-streamer task.
//!
//! Uses `kube::runtime::watcher` against `core/v1 Event`, with exponential
//! backoff on stream errors (§4.3 item 3) — distinct from the fixed 5s
//! tunnel-reconnect backoff.

use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Event as K8sEvent;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use metrics::counter;
use tokio::sync::mpsc;

use kubedoor_core::model::EventRecord;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Runs forever, restarting the watch with exponential backoff whenever the
/// stream errors out. Never returns under normal operation; the caller
/// spawns this as one of the tunnel's five concurrent tasks.
pub async fn stream_cluster_events(client: Client, tx: mpsc::Sender<EventRecord>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let api: Api<K8sEvent> = Api::all(client.clone());
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);

        let mut saw_any = false;
        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(ev))) => {
                    saw_any = true;
                    backoff = INITIAL_BACKOFF;
                    let record = EventRecord {
                        data: serde_json::to_value(&ev).unwrap_or_default(),
                        timestamp: chrono::Utc::now().timestamp(),
                    };
                    if tx.send(record).await.is_err() {
                        return; // tunnel task gone; stop watching
                    }
                }
                Ok(Some(Event::Deleted(_))) => {}
                Ok(Some(Event::Restarted(_))) => {
                    saw_any = true;
                    backoff = INITIAL_BACKOFF;
                }
                Ok(None) => break,
                Err(e) => {
                    counter!("kubedoor_event_watch_errors_total").increment(1);
                    tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "event watch stream error");
                    break;
                }
            }
        }

        if !saw_any {
            tracing::debug!(backoff_secs = backoff.as_secs(), "event watch restarting");
        }
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
    }
}
