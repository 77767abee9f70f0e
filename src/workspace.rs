//! Workspace layout and the desired-state file `ccup.yaml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{CcupError, Result};
use crate::helm::Release;

pub const CONFIG_FILE: &str = "ccup.yaml";
pub const ADMIN_CONF_FILE: &str = "ccup-admin.conf";
pub const TERRAFORM_DIR: &str = "terraform";
pub const UPGRADE_DIR: &str = "upgrades";

/// Paths inside a workspace directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn admin_conf_path(&self) -> PathBuf {
        self.root.join(ADMIN_CONF_FILE)
    }

    pub fn terraform_dir(&self) -> PathBuf {
        self.root.join(TERRAFORM_DIR)
    }

    /// Backup directory for an upgrade started at `started_at`.
    pub fn backup_dir(&self, started_at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(UPGRADE_DIR)
            .join(started_at.format("%Y%m%d-%H%M%S").to_string())
            .join("backups")
    }
}

/// Desired cluster configuration the phases reconcile towards.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkspaceConfig {
    pub kubernetes_version: String,
    pub image: String,
    pub attestation: AttestationPolicy,
    #[serde(default)]
    pub helm: HelmConfig,
}

/// Expected attestation policy pushed to the cluster's join service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AttestationPolicy {
    pub variant: String,
    /// PCR index to expected hex-encoded digest.
    pub measurements: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HelmConfig {
    #[serde(default)]
    pub releases: Vec<Release>,
}

impl WorkspaceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CcupError::ConfigValidation(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|e| {
            CcupError::ConfigValidation(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kubernetes_version.trim().is_empty() {
            return Err(CcupError::ConfigValidation(
                "kubernetesVersion must not be empty".to_string(),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(CcupError::ConfigValidation(
                "image must not be empty".to_string(),
            ));
        }
        if self.attestation.variant.trim().is_empty() {
            return Err(CcupError::ConfigValidation(
                "attestation.variant must not be empty".to_string(),
            ));
        }
        for (index, digest) in &self.attestation.measurements {
            if !is_lower_hex(digest) {
                return Err(CcupError::ConfigValidation(format!(
                    "measurement {index} must be a non-empty lowercase hex digest"
                )));
            }
        }
        for release in &self.helm.releases {
            if release.name.is_empty() || release.namespace.is_empty() || release.chart.is_empty()
            {
                return Err(CcupError::ConfigValidation(format!(
                    "helm release {:?} needs name, namespace and chart",
                    release.name
                )));
            }
        }
        Ok(())
    }
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

#[cfg(test)]
pub(crate) fn sample_config() -> WorkspaceConfig {
    WorkspaceConfig {
        kubernetes_version: "v1.31.2".to_string(),
        image: "ref/v2.19.0".to_string(),
        attestation: AttestationPolicy {
            variant: "azure-sev-snp".to_string(),
            measurements: BTreeMap::from([(4, "aa".repeat(32)), (9, "bb".repeat(32))]),
        },
        helm: HelmConfig {
            releases: vec![Release {
                name: "cilium".to_string(),
                namespace: "kube-system".to_string(),
                chart: "charts/cilium".to_string(),
                values: None,
            }],
        },
    }
}
