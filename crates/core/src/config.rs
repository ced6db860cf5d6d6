//! Process-wide immutable configuration, loaded once at startup.
//!
//! Mirrors the source implementation's module-level globals (Design Notes:
//! "global singletons ... become one immutable configuration value built at
//! startup and passed down"), but as a plain struct injected through `Arc`
//! rather than mutable process state.

use std::env;

use crate::error::{KubedoorError, KubedoorResult};

const DEFAULT_TLS_CERT: &str = "/app/serving-certs/tls.crt";
const DEFAULT_TLS_KEY: &str = "/app/serving-certs/tls.key";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the master tunnel endpoint, e.g. `wss://master.example.com/ws`.
    pub master_ws_url: String,
    /// Label key identifying this cluster to the master (`PROM_K8S_TAG_KEY`).
    pub cluster_tag_key: String,
    /// Label value identifying this cluster to the master (`PROM_K8S_TAG_VALUE`).
    pub cluster_tag_value: String,
    /// Shared secret used to authenticate chat-bridge notifications.
    pub msg_token: String,
    /// Optional webhook used for operator-facing chat notifications.
    pub oss_url: Option<String>,
    /// Label value applied to pinned/bursting nodes (`NODE_LABLE_VALUE`).
    pub node_label_value: String,
    /// Base64-encoded CA bundle presented to the master over the tunnel.
    pub ca_bundle_b64: String,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    pub agent_version: String,
}

impl AgentConfig {
    /// Reads every setting from the process environment. Fails fast (fatal)
    /// on a missing required variable — mirrors the source's "raise on
    /// startup" behaviour for its own global config load.
    pub fn from_env() -> KubedoorResult<Self> {
        let master_ws_url = required_env("KUBEDOOR_MASTER")?;
        let cluster_tag_key = required_env("PROM_K8S_TAG_KEY")?;
        let cluster_tag_value = required_env("PROM_K8S_TAG_VALUE")?;
        let msg_token = env::var("MSG_TOKEN").unwrap_or_default();
        let oss_url = env::var("OSS_URL").ok().filter(|s| !s.is_empty());
        let node_label_value = env::var("NODE_LABLE_VALUE").unwrap_or_else(|_| "kubedoor-scheduler".to_string());
        let ca_bundle_b64 = env::var("BASE64CA").unwrap_or_default();
        let tls_cert_path = env::var("KUBEDOOR_TLS_CERT").unwrap_or_else(|_| DEFAULT_TLS_CERT.to_string());
        let tls_key_path = env::var("KUBEDOOR_TLS_KEY").unwrap_or_else(|_| DEFAULT_TLS_KEY.to_string());
        let agent_version = env!("CARGO_PKG_VERSION").to_string();

        Ok(AgentConfig {
            master_ws_url,
            cluster_tag_key,
            cluster_tag_value,
            msg_token,
            oss_url,
            node_label_value,
            ca_bundle_b64,
            tls_cert_path,
            tls_key_path,
            agent_version,
        })
    }
}

fn required_env(key: &str) -> KubedoorResult<String> {
    env::var(key).map_err(|_| KubedoorError::fatal(500, format!("missing required environment variable {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_master_url_is_fatal() {
        let err = required_env("KUBEDOOR_MASTER_DOES_NOT_EXIST").unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn node_label_value_defaults_when_unset() {
        let v = env::var("NODE_LABLE_VALUE_DOES_NOT_EXIST").unwrap_or_else(|_| "kubedoor-scheduler".to_string());
        assert_eq!(v, "kubedoor-scheduler");
    }
}
