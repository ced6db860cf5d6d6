//! Master -> agent HTTP relay: the master never talks to the agent
//! directly, it sends a `request` frame over the tunnel and the agent
//! replays it against its own HTTP surface (or the port-81 pod-manager
//! sidecar for `/api/pod/*` paths) and ships the result back as a
//! `response` frame.

use serde_json::Value;

const AGENT_BASE: &str = "https://127.0.0.1:443";
const POD_MANAGER_BASE: &str = "http://127.0.0.1:81";
const POD_MANAGER_PREFIX: &str = "/api/pod/";

/// Executes one relayed request. Never propagates an error to the
/// caller — any failure becomes `{"success": false, "error": ...}` so the
/// inbound dispatcher can always send a `response` frame back.
pub async fn handle_http_request(method: &str, path: &str, query: &Value, body: &Value) -> Value {
    let base = if path.starts_with(POD_MANAGER_PREFIX) { POD_MANAGER_BASE } else { AGENT_BASE };
    let url = format!("{base}{path}");

    let client = match reqwest::Client::builder().danger_accept_invalid_certs(true).build() {
        Ok(c) => c,
        Err(e) => return serde_json::json!({"success": false, "error": e.to_string()}),
    };

    let mut req = match method.to_ascii_uppercase().as_str() {
        "GET" => client.get(&url),
        "POST" => client.post(&url),
        "DELETE" => client.delete(&url),
        other => return serde_json::json!({"success": false, "error": format!("unsupported method {other}")}),
    };

    if let Some(map) = query.as_object() {
        let pairs: Vec<(String, String)> = map
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
            .collect();
        req = req.query(&pairs);
    }
    if !body.is_null() {
        req = req.json(body);
    }

    match req.send().await {
        Ok(resp) => match resp.json::<Value>().await {
            Ok(v) => v,
            Err(e) => serde_json::json!({"success": false, "error": e.to_string()}),
        },
        Err(e) => serde_json::json!({"success": false, "error": e.to_string()}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_prefixed_path_targets_pod_manager_base() {
        let path = "/api/pod/logs";
        let base = if path.starts_with(POD_MANAGER_PREFIX) { POD_MANAGER_BASE } else { AGENT_BASE };
        assert_eq!(base, POD_MANAGER_BASE);
    }

    #[test]
    fn other_paths_target_agent_base() {
        let path = "/api/scale";
        let base = if path.starts_with(POD_MANAGER_PREFIX) { POD_MANAGER_BASE } else { AGENT_BASE };
        assert_eq!(base, AGENT_BASE);
    }
}
