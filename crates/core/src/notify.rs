//! Operator-facing chat notifications, grounded on the source's
//! `utils.send_msg` webhook bridge.

use crate::config::AgentConfig;

/// Posts `text` to the configured chat webhook. A missing `OSS_URL` is a
/// no-op (logged at debug) rather than an error — notification delivery is
/// best-effort and must never fail the caller's operation.
pub async fn send_msg(cfg: &AgentConfig, text: &str) {
    let Some(url) = cfg.oss_url.as_deref() else {
        tracing::debug!(%text, "chat notification skipped: OSS_URL not configured");
        return;
    };

    let client = reqwest::Client::new();
    let body = serde_json::json!({ "token": cfg.msg_token, "text": text });
    if let Err(e) = client.post(url).json(&body).send().await {
        tracing::warn!(error = %e, "chat notification delivery failed");
    }
}
