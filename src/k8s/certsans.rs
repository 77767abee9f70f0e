//! API server certificate SANs in the kubeadm `ClusterConfiguration`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube::api::{Patch, PatchParams};
use serde_json::json;
use serde_yaml::{Mapping, Value};
use tracing::info;

use super::client::ClientProvider;
use super::{CertSanUpdater, FIELD_MANAGER, KUBE_SYSTEM};
use crate::error::{CcupError, Result};

pub const KUBEADM_CONFIG_MAP: &str = "kubeadm-config";
const CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";

pub struct KubeCertSanUpdater {
    clients: Arc<ClientProvider>,
}

impl KubeCertSanUpdater {
    pub fn new(clients: Arc<ClientProvider>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl CertSanUpdater for KubeCertSanUpdater {
    async fn update_sans(&self, sans: &[String]) -> Result<()> {
        let client = self.clients.get(CcupError::Update).await?;
        let api: Api<ConfigMap> = Api::namespaced(client, KUBE_SYSTEM);

        let config_map = api.get(KUBEADM_CONFIG_MAP).await.map_err(|e| {
            CcupError::Update(format!(
                "failed to read ConfigMap {KUBE_SYSTEM}/{KUBEADM_CONFIG_MAP}: {e}"
            ))
        })?;
        let raw = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(CLUSTER_CONFIGURATION_KEY))
            .ok_or_else(|| {
                CcupError::Update(format!(
                    "{KUBEADM_CONFIG_MAP} has no {CLUSTER_CONFIGURATION_KEY} entry"
                ))
            })?;

        let Some(updated) = merge_cert_sans(raw, sans)? else {
            info!("API server certificate SANs already up to date");
            return Ok(());
        };

        let patch = json!({ "data": { CLUSTER_CONFIGURATION_KEY: updated } });
        api.patch(
            KUBEADM_CONFIG_MAP,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| {
            CcupError::Update(format!(
                "failed to patch ConfigMap {KUBE_SYSTEM}/{KUBEADM_CONFIG_MAP}: {e}"
            ))
        })?;

        info!("API server certificate SANs updated ({} entries)", sans.len());
        Ok(())
    }
}

/// Merge `sans` into `apiServer.certSANs` of a ClusterConfiguration.
///
/// Returns `None` when every SAN is already present.
fn merge_cert_sans(raw: &str, sans: &[String]) -> Result<Option<String>> {
    let mut doc: Value = serde_yaml::from_str(raw)
        .map_err(|e| CcupError::Update(format!("invalid {CLUSTER_CONFIGURATION_KEY}: {e}")))?;
    let root = doc.as_mapping_mut().ok_or_else(|| {
        CcupError::Update(format!("{CLUSTER_CONFIGURATION_KEY} is not a mapping"))
    })?;

    if !root.contains_key("apiServer") {
        root.insert(Value::from("apiServer"), Value::Mapping(Mapping::new()));
    }
    let api_server = root
        .get_mut("apiServer")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| CcupError::Update("apiServer is not a mapping".to_string()))?;

    let existing: BTreeSet<String> = api_server
        .get("certSANs")
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if sans.iter().all(|san| existing.contains(san)) {
        return Ok(None);
    }

    let merged: BTreeSet<String> = existing.into_iter().chain(sans.iter().cloned()).collect();
    api_server.insert(
        Value::from("certSANs"),
        Value::Sequence(merged.into_iter().map(Value::from).collect()),
    );

    serde_yaml::to_string(&doc)
        .map(Some)
        .map_err(|e| CcupError::Update(format!("failed to encode {CLUSTER_CONFIGURATION_KEY}: {e}")))
}
