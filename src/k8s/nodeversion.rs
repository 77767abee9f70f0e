//! Kubernetes and node image upgrades through the `NodeVersion` resource.
//!
//! The in-cluster operator watching `NodeVersion` rolls nodes towards the
//! requested versions; ccup only records the target.

use std::sync::Arc;

use async_trait::async_trait;
use kube::Api;
use kube::api::{ApiResource, DynamicObject, Patch, PatchParams};
use serde_json::{Value, json};
use tracing::info;

use super::client::ClientProvider;
use super::{FIELD_MANAGER, ImageUpgrader, K8sUpgrader};
use crate::error::{CcupError, Result};

pub const NODE_VERSION_NAME: &str = "constellation-version";
const KUBERNETES_VERSION_FIELD: &str = "kubernetesClusterVersion";
const IMAGE_REFERENCE_FIELD: &str = "imageReference";

/// ApiResource definition for `update.edgeless.systems/v1alpha1` NodeVersion.
fn node_version_api_resource() -> ApiResource {
    ApiResource {
        group: "update.edgeless.systems".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "update.edgeless.systems/v1alpha1".to_string(),
        kind: "NodeVersion".to_string(),
        plural: "nodeversions".to_string(),
    }
}

pub struct NodeVersionUpgrader {
    clients: Arc<ClientProvider>,
}

impl NodeVersionUpgrader {
    pub fn new(clients: Arc<ClientProvider>) -> Self {
        Self { clients }
    }

    async fn set_spec_field(&self, field: &str, value: &str) -> Result<()> {
        let client = self.clients.get(CcupError::Upgrade).await?;
        let ar = node_version_api_resource();
        let api: Api<DynamicObject> = Api::all_with(client, &ar);

        let current = api.get(NODE_VERSION_NAME).await.map_err(|e| {
            CcupError::Upgrade(format!(
                "failed to get NodeVersion {NODE_VERSION_NAME}: {e}"
            ))
        })?;
        if spec_field(&current, field) == Some(value) {
            info!("{} already set to {}", field, value);
            return Ok(());
        }

        let patch = json!({ "spec": { field: value } });
        api.patch(
            NODE_VERSION_NAME,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| {
            CcupError::Upgrade(format!(
                "failed to patch NodeVersion {NODE_VERSION_NAME}: {e}"
            ))
        })?;

        info!(
            "{} changed from {} to {}",
            field,
            spec_field(&current, field).unwrap_or("<unset>"),
            value
        );
        Ok(())
    }
}

fn spec_field<'a>(obj: &'a DynamicObject, field: &str) -> Option<&'a str> {
    obj.data
        .get("spec")
        .and_then(|spec| spec.get(field))
        .and_then(Value::as_str)
}

#[async_trait]
impl K8sUpgrader for NodeVersionUpgrader {
    async fn upgrade_kubernetes(&self, version: &str) -> Result<()> {
        self.set_spec_field(KUBERNETES_VERSION_FIELD, version).await
    }
}

#[async_trait]
impl ImageUpgrader for NodeVersionUpgrader {
    async fn upgrade_image(&self, image: &str) -> Result<()> {
        self.set_spec_field(IMAGE_REFERENCE_FIELD, image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_version(spec: Value) -> DynamicObject {
        DynamicObject::new(NODE_VERSION_NAME, &node_version_api_resource())
            .data(json!({ "spec": spec }))
    }

    #[test]
    fn test_node_version_api_resource() {
        let ar = node_version_api_resource();
        assert_eq!(ar.api_version, format!("{}/{}", ar.group, ar.version));
        assert_eq!(ar.plural, "nodeversions");
    }

    #[test]
    fn test_spec_field() {
        let obj = node_version(json!({
            "kubernetesClusterVersion": "v1.30.6",
            "imageReference": "ref/v2.18.0"
        }));
        assert_eq!(spec_field(&obj, KUBERNETES_VERSION_FIELD), Some("v1.30.6"));
        assert_eq!(spec_field(&obj, IMAGE_REFERENCE_FIELD), Some("ref/v2.18.0"));
    }

    #[test]
    fn test_spec_field_missing() {
        let obj = node_version(json!({}));
        assert_eq!(spec_field(&obj, KUBERNETES_VERSION_FIELD), None);

        let obj = DynamicObject::new(NODE_VERSION_NAME, &node_version_api_resource());
        assert_eq!(spec_field(&obj, IMAGE_REFERENCE_FIELD), None);
    }

    #[tokio::test]
    async fn test_upgrade_without_kubeconfig_fails_as_upgrade_error() {
        let dir = tempfile::tempdir().unwrap();
        let upgrader =
            NodeVersionUpgrader::new(Arc::new(ClientProvider::new(dir.path().join("admin.conf"))));

        let err = upgrader.upgrade_image("ref/v2.19.0").await.unwrap_err();
        assert!(matches!(err, CcupError::Upgrade(_)));
    }
}
