//! Persisted cluster state and the store it lives in.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CcupError, Result};

/// State file format version written by this tool.
pub const STATE_VERSION: &str = "v1";

/// File name of the state inside the workspace.
pub const STATE_FILE: &str = "cluster-state.yaml";

/// Record of a running cluster: infrastructure facts and identity values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    pub version: String,
    pub infrastructure: Infrastructure,
    #[serde(default)]
    pub cluster_values: ClusterValues,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Infrastructure {
    pub uid: String,
    pub name: String,
    pub cluster_endpoint: String,
    pub in_cluster_endpoint: String,
    #[serde(with = "base64_bytes", default)]
    pub init_secret: Vec<u8>,
    #[serde(rename = "apiServerCertSANs", default)]
    pub api_server_cert_sans: Vec<String>,
    #[serde(default)]
    pub ip_cidr_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsInfrastructure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureInfrastructure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpInfrastructure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openstack: Option<OpenStackInfrastructure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu: Option<QemuInfrastructure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsInfrastructure {
    pub region: String,
    #[serde(default)]
    pub iam_profile_control_plane: String,
    #[serde(default)]
    pub iam_profile_worker_nodes: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureInfrastructure {
    pub resource_group: String,
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    pub network_security_group_name: String,
    pub load_balancer_name: String,
    pub user_assigned_identity: String,
    #[serde(rename = "attestationURL", default)]
    pub attestation_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpInfrastructure {
    #[serde(rename = "projectID")]
    pub project_id: String,
    pub ip_cidr_pod: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackInfrastructure {
    #[serde(rename = "networkID")]
    pub network_id: String,
    #[serde(rename = "subnetID")]
    pub subnet_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QemuInfrastructure {
    pub metadata_endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterValues {
    #[serde(rename = "clusterID", default)]
    pub cluster_id: String,
    #[serde(rename = "ownerID", default)]
    pub owner_id: String,
    #[serde(with = "base64_bytes", default)]
    pub measurement_salt: Vec<u8>,
}

impl ClusterValues {
    /// A cluster is initialized once it has been assigned an ID.
    pub fn is_initialized(&self) -> bool {
        !self.cluster_id.is_empty()
    }
}

impl Infrastructure {
    /// Names of the populated provider sections.
    pub fn providers(&self) -> Vec<&'static str> {
        let mut providers = Vec::new();
        if self.aws.is_some() {
            providers.push("aws");
        }
        if self.azure.is_some() {
            providers.push("azure");
        }
        if self.gcp.is_some() {
            providers.push("gcp");
        }
        if self.openstack.is_some() {
            providers.push("openstack");
        }
        if self.qemu.is_some() {
            providers.push("qemu");
        }
        providers
    }
}

impl ClusterState {
    /// Starting point for a cluster that has not been provisioned yet.
    pub fn new_empty() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            ..Default::default()
        }
    }

    /// Whether infrastructure has been provisioned.
    pub fn has_infrastructure(&self) -> bool {
        !self.infrastructure.uid.is_empty()
    }

    /// Validate a loaded state.
    ///
    /// A version mismatch is tolerated with `force`; a provider section
    /// violation never is.
    pub fn validate(&self, force: bool) -> Result<()> {
        if self.version != STATE_VERSION && !force {
            return Err(CcupError::ConfigValidation(format!(
                "state file version {:?} is not supported (expected {:?}); use --force to continue anyway",
                self.version, STATE_VERSION
            )));
        }

        if self.has_infrastructure() {
            let providers = self.infrastructure.providers();
            if providers.len() != 1 {
                return Err(CcupError::ConfigValidation(format!(
                    "state must describe exactly one cloud provider, found {}: [{}]",
                    providers.len(),
                    providers.join(", ")
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<ClusterState>;
    async fn save(&self, state: &ClusterState) -> Result<()>;
}

/// YAML state file inside the workspace.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            path: workspace.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<ClusterState> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CcupError::StateNotFound(self.path.display().to_string()));
            }
            Err(e) => {
                return Err(CcupError::ConfigValidation(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };

        serde_yaml::from_str(&raw).map_err(|e| {
            CcupError::ConfigValidation(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    /// Write to a sibling file first so the previous state survives a crash.
    async fn save(&self, state: &ClusterState) -> Result<()> {
        let yaml = serde_yaml::to_string(state)
            .map_err(|e| CcupError::StateWrite(format!("failed to serialize state: {e}")))?;

        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml)
            .await
            .map_err(|e| CcupError::StateWrite(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CcupError::StateWrite(format!("{}: {e}", self.path.display())))?;

        debug!("Saved cluster state to {}", self.path.display());
        Ok(())
    }
}

/// Serialize byte fields as base64 strings.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn sample_state() -> ClusterState {
    ClusterState {
        version: STATE_VERSION.to_string(),
        infrastructure: Infrastructure {
            uid: "123".to_string(),
            name: "test-cluster".to_string(),
            cluster_endpoint: "192.0.2.1".to_string(),
            in_cluster_endpoint: "192.0.2.1".to_string(),
            init_secret: vec![0x41],
            api_server_cert_sans: vec!["127.0.0.1".to_string(), "www.example.com".to_string()],
            ip_cidr_node: "0.0.0.0/24".to_string(),
            azure: Some(AzureInfrastructure {
                resource_group: "test-rg".to_string(),
                subscription_id: "test-sub".to_string(),
                network_security_group_name: "test-nsg".to_string(),
                load_balancer_name: "test-lb".to_string(),
                user_assigned_identity: "test-uami".to_string(),
                attestation_url: "test-maaUrl".to_string(),
            }),
            ..Default::default()
        },
        cluster_values: ClusterValues {
            cluster_id: "deadbeef".to_string(),
            owner_id: "deadbeef".to_string(),
            measurement_salt: vec![0x41],
        },
    }
}
