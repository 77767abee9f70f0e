//! Attestation policy stored in the `join-config` ConfigMap.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube::api::{Patch, PatchParams};
use serde_json::json;
use tracing::info;

use super::client::ClientProvider;
use super::{AttestationReconciler, FIELD_MANAGER, KUBE_SYSTEM};
use crate::error::{CcupError, Result};
use crate::workspace::AttestationPolicy;

pub const JOIN_CONFIG_MAP: &str = "join-config";
const VARIANT_KEY: &str = "attestationVariant";
const MEASUREMENTS_KEY: &str = "measurements";

pub struct KubeAttestationReconciler {
    clients: Arc<ClientProvider>,
}

impl KubeAttestationReconciler {
    pub fn new(clients: Arc<ClientProvider>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl AttestationReconciler for KubeAttestationReconciler {
    async fn reconcile(&self, policy: &AttestationPolicy) -> Result<()> {
        let client = self.clients.get(CcupError::Policy).await?;
        let api: Api<ConfigMap> = Api::namespaced(client, KUBE_SYSTEM);

        let current = api.get(JOIN_CONFIG_MAP).await.map_err(|e| {
            CcupError::Policy(format!(
                "failed to read ConfigMap {KUBE_SYSTEM}/{JOIN_CONFIG_MAP}: {e}"
            ))
        })?;

        let desired = join_config_data(policy)?;
        if current
            .data
            .as_ref()
            .is_some_and(|data| is_up_to_date(data, &desired))
        {
            info!(
                "Attestation policy ({}) already up to date",
                policy.variant
            );
            return Ok(());
        }

        let patch = json!({ "data": desired });
        api.patch(
            JOIN_CONFIG_MAP,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| {
            CcupError::Policy(format!(
                "failed to patch ConfigMap {KUBE_SYSTEM}/{JOIN_CONFIG_MAP}: {e}"
            ))
        })?;

        info!(
            "Attestation policy updated: {} with {} measurements",
            policy.variant,
            policy.measurements.len()
        );
        Ok(())
    }
}

/// ConfigMap data entries describing `policy`.
fn join_config_data(policy: &AttestationPolicy) -> Result<BTreeMap<String, String>> {
    let measurements = serde_json::to_string(&policy.measurements)
        .map_err(|e| CcupError::Policy(format!("failed to encode measurements: {e}")))?;
    Ok(BTreeMap::from([
        (VARIANT_KEY.to_string(), policy.variant.clone()),
        (MEASUREMENTS_KEY.to_string(), measurements),
    ]))
}

fn is_up_to_date(current: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> bool {
    desired.iter().all(|(k, v)| current.get(k) == Some(v))
}
