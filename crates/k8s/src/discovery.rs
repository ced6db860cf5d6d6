//! GVK discovery cache: a dispatch table mapping `(group, version, kind)` to
//! the `ApiResource` + namespaced-ness Kubernetes needs to build a dynamic
//! `Api<DynamicObject>` handle.
//!
//! Replaces the source's runtime polymorphism over resource kinds (Design
//! Notes: "dispatch table ... keyed by apiVersion+kind") with a single
//! memoized lookup so the admission mutator, orchestrator, and balancing
//! engine don't each re-run full API discovery per request.

use std::collections::HashMap;
use std::sync::RwLock;

use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;

use kubedoor_core::error::{KubedoorError, KubedoorResult};

pub struct DiscoveryCache {
    client: Client,
    table: RwLock<HashMap<String, (ApiResource, bool)>>,
}

impl DiscoveryCache {
    pub fn new(client: Client) -> Self {
        Self { client, table: RwLock::new(HashMap::new()) }
    }

    /// Returns `(ApiResource, namespaced)` for `gvk`, running discovery at
    /// most once per distinct GVK for the lifetime of the process.
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> KubedoorResult<(ApiResource, bool)> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.table.read().unwrap().get(&key).cloned() {
            return Ok(hit);
        }

        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| KubedoorError::transient(format!("discovery failed: {e}")))?;

        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    let entry = (ar, namespaced);
                    self.table.write().unwrap().insert(key, entry.clone());
                    return Ok(entry);
                }
            }
        }
        Err(KubedoorError::not_found(format!(
            "GVK not found: {}/{}/{}",
            gvk.group, gvk.version, gvk.kind
        )))
    }
}

fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_formats_core_and_grouped_kinds() {
        let core = GroupVersionKind { group: String::new(), version: "v1".into(), kind: "Pod".into() };
        assert_eq!(gvk_key(&core), "v1/Pod");
        let grouped = GroupVersionKind {
            group: "scheduling.cci.io".into(),
            version: "v2".into(),
            kind: "ScheduleProfile".into(),
        };
        assert_eq!(gvk_key(&grouped), "scheduling.cci.io/v2/ScheduleProfile");
    }
}
