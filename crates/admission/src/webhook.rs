//! Builds and registers the `MutatingWebhookConfiguration` that routes
//! deployment/scale create/update requests to this agent's `/api/admis`
//! endpoint, and the `/api/admis_switch` probe/toggle it backs.
//!
//! The configuration's own name (`kubedoor-admis-configuration`) and its
//! single webhook entry's name (`kubedoor-admis.mutating.webhook`) are
//! distinct identifiers in the source and are kept distinct here.
//! `reinvocationPolicy: Never` is carried over from the source even though
//! spec.md's webhook contract section doesn't call it out explicitly — it
//! is present in `original_source` and not excluded by any Non-goal.

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference, WebhookClientConfig,
};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ObjectMeta};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use kubedoor_core::error::{KubedoorError, KubedoorResult};

const CONFIGURATION_NAME: &str = "kubedoor-admis-configuration";
const WEBHOOK_ENTRY_NAME: &str = "kubedoor-admis.mutating.webhook";
const FIELD_MANAGER: &str = "kubedoor-agent";
const IGNORE_LABEL: &str = "kubedoor-ignore";
const LABELED_NAMESPACES: [&str; 2] = ["kube-system", "kubedoor"];

pub fn build(namespace: &str, service_name: &str, ca_bundle_b64: &str) -> MutatingWebhookConfiguration {
    let webhook = MutatingWebhook {
        name: WEBHOOK_ENTRY_NAME.to_string(),
        admission_review_versions: vec!["v1".to_string()],
        side_effects: "None".to_string(),
        failure_policy: Some("Fail".to_string()),
        match_policy: Some("Equivalent".to_string()),
        timeout_seconds: Some(30),
        reinvocation_policy: Some("Never".to_string()),
        namespace_selector: Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: IGNORE_LABEL.to_string(),
                operator: "DoesNotExist".to_string(),
                values: None,
            }]),
            match_labels: None,
        }),
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                name: service_name.to_string(),
                namespace: namespace.to_string(),
                path: Some("/api/admis".to_string()),
                port: Some(443),
            }),
            ca_bundle: Some(k8s_openapi::ByteString(ca_bundle_b64.as_bytes().to_vec())),
            ..Default::default()
        },
        rules: Some(vec![RuleWithOperations {
            api_groups: Some(vec!["apps".to_string()]),
            api_versions: Some(vec!["v1".to_string()]),
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            resources: Some(vec!["deployments".to_string(), "deployments/scale".to_string()]),
            scope: Some("*".to_string()),
        }]),
        ..Default::default()
    };

    MutatingWebhookConfiguration {
        metadata: ObjectMeta { name: Some(CONFIGURATION_NAME.to_string()), ..Default::default() },
        webhooks: Some(vec![webhook]),
    }
}

/// Server-side-applies the webhook configuration, idempotent across
/// restarts.
pub async fn register(client: Client, namespace: &str, service_name: &str, ca_bundle_b64: &str) -> KubedoorResult<()> {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client);
    let cfg = build(namespace, service_name, ca_bundle_b64);
    api.patch(CONFIGURATION_NAME, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&cfg))
        .await
        .map_err(KubedoorError::from)?;
    Ok(())
}

/// Deletes the webhook configuration; absent is success (idempotent off).
pub async fn unregister(client: Client) -> KubedoorResult<()> {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client);
    match api.delete(CONFIGURATION_NAME, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(KubedoorError::from(e)),
    }
}

/// Whether the webhook configuration currently exists.
pub async fn probe(client: &Client) -> KubedoorResult<bool> {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    match api.get(CONFIGURATION_NAME).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
        Err(e) => Err(KubedoorError::from(e)),
    }
}

/// Toggles the `kubedoor-ignore` label on `kube-system`/`kubedoor` so the
/// namespace selector exempts the agent's own workloads from the webhook it
/// just registered (or clears it again on `off`).
pub async fn set_namespace_ignore_label(client: &Client, enabled: bool) -> KubedoorResult<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let patch = if enabled {
        serde_json::json!({ "metadata": { "labels": { IGNORE_LABEL: "true" } } })
    } else {
        serde_json::json!({ "metadata": { "labels": { IGNORE_LABEL: serde_json::Value::Null } } })
    };
    for ns in LABELED_NAMESPACES {
        api.patch(ns, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(&patch))
            .await
            .map_err(KubedoorError::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_policy_is_fail_not_ignore() {
        let cfg = build("kubedoor", "kubedoor-agent", "ZGF0YQ==");
        let hook = &cfg.webhooks.as_ref().unwrap()[0];
        assert_eq!(hook.failure_policy.as_deref(), Some("Fail"));
    }

    #[test]
    fn covers_deployments_and_scale_subresource_cluster_wide() {
        let cfg = build("kubedoor", "kubedoor-agent", "ZGF0YQ==");
        let hook = &cfg.webhooks.as_ref().unwrap()[0];
        let rule = &hook.rules.as_ref().unwrap()[0];
        assert_eq!(rule.resources.as_ref().unwrap(), &vec!["deployments".to_string(), "deployments/scale".to_string()]);
        assert_eq!(rule.scope.as_deref(), Some("*"));
    }

    #[test]
    fn namespace_selector_excludes_kubedoor_ignore() {
        let cfg = build("kubedoor", "kubedoor-agent", "ZGF0YQ==");
        let hook = &cfg.webhooks.as_ref().unwrap()[0];
        let selector = hook.namespace_selector.as_ref().unwrap();
        let expr = &selector.match_expressions.as_ref().unwrap()[0];
        assert_eq!(expr.key, IGNORE_LABEL);
        assert_eq!(expr.operator, "DoesNotExist");
    }

    #[test]
    fn configuration_and_webhook_entry_names_are_distinct() {
        let cfg = build("kubedoor", "kubedoor-agent", "ZGF0YQ==");
        assert_eq!(cfg.metadata.name.as_deref(), Some(CONFIGURATION_NAME));
        let hook = &cfg.webhooks.as_ref().unwrap()[0];
        assert_eq!(hook.name, WEBHOOK_ENTRY_NAME);
        assert_ne!(cfg.metadata.name.as_deref().unwrap(), hook.name);
        assert_eq!(hook.reinvocation_policy.as_deref(), Some("Never"));
    }
}
