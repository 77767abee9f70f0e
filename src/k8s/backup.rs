//! Export of custom resource definitions and their instances to YAML files.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::Api;
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::core::TypeMeta;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::client::ClientProvider;
use crate::backup::{BackupClient, CrdInfo};
use crate::error::{CcupError, Result};

pub struct KubeBackupClient {
    clients: Arc<ClientProvider>,
}

impl KubeBackupClient {
    pub fn new(clients: Arc<ClientProvider>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl BackupClient for KubeBackupClient {
    async fn backup_crds(&self, dest: &Path) -> Result<Vec<CrdInfo>> {
        let client = self.clients.get(CcupError::CrdBackup).await?;
        let api: Api<CustomResourceDefinition> = Api::all(client);
        let list = api.list(&ListParams::default()).await.map_err(|e| {
            CcupError::CrdBackup(format!("failed to list custom resource definitions: {e}"))
        })?;

        let dir = dest.join("crds");
        create_dir(&dir, CcupError::CrdBackup).await?;

        let mut crds = Vec::with_capacity(list.items.len());
        for mut crd in list.items {
            crd.metadata.managed_fields = None;
            let info = crd_info(&crd);
            let path = dir.join(format!("{}.yaml", info.name));
            write_yaml(&path, &crd, CcupError::CrdBackup).await?;
            debug!("Saved CRD {} to {}", info.name, path.display());
            crds.push(info);
        }

        info!("Saved {} CRDs to {}", crds.len(), dir.display());
        Ok(crds)
    }

    async fn backup_crs(&self, crds: &[CrdInfo], dest: &Path) -> Result<Vec<String>> {
        let client = self.clients.get(CcupError::CrBackup).await?;
        let mut skipped = Vec::new();

        for crd in crds {
            let dir = dest.join("crs").join(&crd.name);
            create_dir(&dir, CcupError::CrBackup).await?;

            for version in &crd.versions {
                let ar = crd_api_resource(crd, version);
                let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
                let list = match api.list(&ListParams::default()).await {
                    Ok(list) => list,
                    // Served flags can change between listing CRDs and their instances.
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {
                        warn!("{} version {} is not served, skipping", crd.name, version);
                        skipped.push(skipped_version(crd, version));
                        continue;
                    }
                    Err(e) => {
                        return Err(CcupError::CrBackup(format!(
                            "failed to list {} ({}): {e}",
                            crd.name, version
                        )));
                    }
                };

                let count = list.items.len();
                for mut obj in list.items {
                    obj.metadata.managed_fields = None;
                    obj.types = Some(TypeMeta {
                        api_version: ar.api_version.clone(),
                        kind: ar.kind.clone(),
                    });
                    let path = dir.join(cr_file_name(&obj, version));
                    write_yaml(&path, &obj, CcupError::CrBackup).await?;
                }
                debug!("Saved {} {} objects ({})", count, crd.kind, version);
            }
        }

        info!("Saved custom resources of {} CRDs", crds.len());
        Ok(skipped)
    }
}

fn skipped_version(crd: &CrdInfo, version: &str) -> String {
    format!("{}/{}", crd.name, version)
}

fn crd_info(crd: &CustomResourceDefinition) -> CrdInfo {
    let spec = &crd.spec;
    CrdInfo {
        name: crd.metadata.name.clone().unwrap_or_default(),
        group: spec.group.clone(),
        kind: spec.names.kind.clone(),
        plural: spec.names.plural.clone(),
        namespaced: spec.scope == "Namespaced",
        versions: spec
            .versions
            .iter()
            .filter(|v| v.served)
            .map(|v| v.name.clone())
            .collect(),
    }
}

fn crd_api_resource(crd: &CrdInfo, version: &str) -> ApiResource {
    ApiResource {
        group: crd.group.clone(),
        version: version.to_string(),
        api_version: format!("{}/{}", crd.group, version),
        kind: crd.kind.clone(),
        plural: crd.plural.clone(),
    }
}

/// `<namespace>_<name>_<version>.yaml`, without the namespace when cluster-scoped.
fn cr_file_name(obj: &DynamicObject, version: &str) -> String {
    let name = obj.metadata.name.as_deref().unwrap_or("unnamed");
    match obj.metadata.namespace.as_deref() {
        Some(namespace) => format!("{namespace}_{name}_{version}.yaml"),
        None => format!("{name}_{version}.yaml"),
    }
}

async fn create_dir(dir: &Path, kind: fn(String) -> CcupError) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| kind(format!("failed to create {}: {e}", dir.display())))
}

async fn write_yaml<T: Serialize>(
    path: &Path,
    value: &T,
    kind: fn(String) -> CcupError,
) -> Result<()> {
    let yaml = serde_yaml::to_string(value)
        .map_err(|e| kind(format!("failed to encode {}: {e}", path.display())))?;
    tokio::fs::write(path, yaml)
        .await
        .map_err(|e| kind(format!("failed to write {}: {e}", path.display())))
}
