//! Wire protocol between the agent and the master, tagged on `type`.
//! Field names are part of the external contract and must not be renamed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Request {
        request_id: String,
        method: String,
        path: String,
        #[serde(default)]
        query: Value,
        #[serde(default)]
        body: Value,
    },
    Admis {
        request_id: String,
        deploy_res: Value,
    },
    StartPodLogs {
        connection_id: String,
        namespace: String,
        pod_name: String,
        #[serde(default)]
        container: Option<String>,
    },
    StopPodLogs {
        connection_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Heartbeat,
    Response {
        request_id: String,
        response: Value,
    },
    Admis {
        request_id: String,
        namespace: String,
        deployment: String,
    },
    PodLogs {
        connection_id: String,
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<String>,
    },
    K8sEvent {
        data: Value,
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_request_frame_parses_expected_fields() {
        let raw = serde_json::json!({
            "type": "request",
            "request_id": "r1",
            "method": "GET",
            "path": "/api/pod/logs",
            "query": {"a": "b"},
            "body": null
        });
        let frame: InboundFrame = serde_json::from_value(raw).unwrap();
        match frame {
            InboundFrame::Request { request_id, method, path, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(method, "GET");
                assert_eq!(path, "/api/pod/logs");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn outbound_heartbeat_serializes_to_bare_type_tag() {
        let v = serde_json::to_value(OutboundFrame::Heartbeat).unwrap();
        assert_eq!(v, serde_json::json!({"type": "heartbeat"}));
    }

    #[test]
    fn malformed_frame_fails_to_parse_without_panicking() {
        let raw = serde_json::json!({"type": "unknown_type"});
        let result: Result<InboundFrame, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }
}
