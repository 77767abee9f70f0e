//! Pre-upgrade backup of Helm releases and custom resources.
//!
//! A backup is only handed back to the caller once every step succeeded;
//! the Helm phase must not upgrade anything without one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{Instrument, info, info_span, warn};

use crate::error::{CcupError, Result};
use crate::helm::{HelmApplier, Release};

/// Custom resource definition captured during backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrdInfo {
    pub name: String,
    pub group: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    /// Served versions; instances are exported for each of them.
    pub versions: Vec<String>,
}

/// Read-only export of cluster custom resources.
#[async_trait]
pub trait BackupClient: Send + Sync {
    /// Export every custom resource definition below `dest`.
    async fn backup_crds(&self, dest: &Path) -> Result<Vec<CrdInfo>>;

    /// Export every instance of `crds` below `dest`.
    ///
    /// Returns the `<crd>/<version>` pairs that could not be listed.
    async fn backup_crs(&self, crds: &[CrdInfo], dest: &Path) -> Result<Vec<String>>;
}

/// A completed backup kept on disk for manual rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub includes_crds: bool,
    /// CRD versions whose instances are missing from the export.
    pub skipped_versions: Vec<String>,
}

impl BackupArtifact {
    pub fn is_partial(&self) -> bool {
        !self.skipped_versions.is_empty()
    }
}

pub struct BackupCoordinator<'a> {
    helm: &'a dyn HelmApplier,
    client: &'a dyn BackupClient,
}

impl<'a> BackupCoordinator<'a> {
    pub fn new(helm: &'a dyn HelmApplier, client: &'a dyn BackupClient) -> Self {
        Self { helm, client }
    }

    /// Save charts, then (for upgrades) CRDs followed by their instances.
    ///
    /// Steps run strictly in order and the first failure stops the backup.
    pub async fn backup(
        &self,
        releases: &[Release],
        dest: &Path,
        includes_upgrades: bool,
    ) -> Result<BackupArtifact> {
        tokio::fs::create_dir_all(dest).await.map_err(|e| {
            CcupError::ChartBackup(format!("failed to create {}: {e}", dest.display()))
        })?;

        let charts_dir = dest.join("charts");
        self.helm
            .save_charts(releases, &charts_dir)
            .instrument(info_span!("backup_charts"))
            .await
            .map_err(|e| as_kind(e, CcupError::ChartBackup))?;
        info!("Helm charts backed up to {}", charts_dir.display());

        if !includes_upgrades {
            return Ok(BackupArtifact {
                path: dest.to_path_buf(),
                includes_crds: false,
                skipped_versions: Vec::new(),
            });
        }

        let crds = self
            .client
            .backup_crds(dest)
            .instrument(info_span!("backup_crds"))
            .await
            .map_err(|e| as_kind(e, CcupError::CrdBackup))?;
        info!("Backed up {} custom resource definitions", crds.len());

        let skipped_versions = self
            .client
            .backup_crs(&crds, dest)
            .instrument(info_span!("backup_crs"))
            .await
            .map_err(|e| as_kind(e, CcupError::CrBackup))?;
        if skipped_versions.is_empty() {
            info!("Custom resources backed up to {}", dest.display());
        } else {
            warn!(
                "Custom resources backed up to {} without {}",
                dest.display(),
                skipped_versions.join(", ")
            );
        }

        Ok(BackupArtifact {
            path: dest.to_path_buf(),
            includes_crds: true,
            skipped_versions,
        })
    }
}

/// Label a collaborator error with the backup step it failed in.
fn as_kind(err: CcupError, kind: fn(String) -> CcupError) -> CcupError {
    if err.is_backup_failure() {
        err
    } else {
        kind(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, CallLog, StubBackupClient, StubHelm};

    async fn run_backup(
        helm: &StubHelm,
        client: &StubBackupClient,
        includes_upgrades: bool,
    ) -> Result<BackupArtifact> {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BackupCoordinator::new(helm, client);
        coordinator
            .backup(&[], &dir.path().join("backups"), includes_upgrades)
            .await
    }

    #[tokio::test]
    async fn test_backup_no_upgrades_saves_charts_only() {
        let log = CallLog::default();
        let helm = StubHelm::new(&log);
        let client = StubBackupClient::new(&log);

        let artifact = run_backup(&helm, &client, false).await.unwrap();
        assert!(!artifact.includes_crds);
        assert_eq!(log.calls(), vec![Call::SaveCharts]);
    }

    #[tokio::test]
    async fn test_backup_with_upgrades_calls_each_step_once() {
        let log = CallLog::default();
        let helm = StubHelm::new(&log);
        let client = StubBackupClient::new(&log);

        let artifact = run_backup(&helm, &client, true).await.unwrap();
        assert!(artifact.includes_crds);
        assert!(!artifact.is_partial());
        assert!(artifact.path.ends_with("backups"));
        assert_eq!(
            log.calls(),
            vec![Call::SaveCharts, Call::BackupCrds, Call::BackupCrs]
        );
    }

    #[tokio::test]
    async fn test_backup_charts_failure_stops_everything() {
        let log = CallLog::default();
        let helm = StubHelm::new(&log).fail_save_charts();
        let client = StubBackupClient::new(&log);

        let err = run_backup(&helm, &client, true).await.unwrap_err();
        assert!(matches!(err, CcupError::ChartBackup(_)));
        assert_eq!(log.calls(), vec![Call::SaveCharts]);
    }

    #[tokio::test]
    async fn test_backup_crds_failure_skips_crs() {
        let log = CallLog::default();
        let helm = StubHelm::new(&log);
        let client = StubBackupClient::new(&log).fail_crds();

        let err = run_backup(&helm, &client, true).await.unwrap_err();
        assert!(matches!(err, CcupError::CrdBackup(_)));
        assert_eq!(log.calls(), vec![Call::SaveCharts, Call::BackupCrds]);
    }

    #[tokio::test]
    async fn test_backup_crs_failure_reports_failure() {
        let log = CallLog::default();
        let helm = StubHelm::new(&log);
        let client = StubBackupClient::new(&log).fail_crs();

        let err = run_backup(&helm, &client, true).await.unwrap_err();
        assert!(matches!(err, CcupError::CrBackup(_)));
        assert!(err.is_backup_failure());
        assert_eq!(
            log.calls(),
            vec![Call::SaveCharts, Call::BackupCrds, Call::BackupCrs]
        );
    }

    #[tokio::test]
    async fn test_backup_records_unlisted_crd_versions() {
        let log = CallLog::default();
        let helm = StubHelm::new(&log);
        let client = StubBackupClient::new(&log).unserved("v1alpha1");

        let artifact = run_backup(&helm, &client, true).await.unwrap();
        assert!(artifact.is_partial());
        assert_eq!(
            artifact.skipped_versions,
            vec!["nodeversions.update.edgeless.systems/v1alpha1"]
        );
    }

    #[tokio::test]
    async fn test_backup_creates_destination() {
        let log = CallLog::default();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("upgrades").join("20261019-083005").join("backups");

        let helm = StubHelm::new(&log);
        let client = StubBackupClient::new(&log);
        BackupCoordinator::new(&helm, &client)
            .backup(&[], &dest, false)
            .await
            .unwrap();
        assert!(dest.is_dir());
    }

    #[test]
    fn test_as_kind_relabels_foreign_errors() {
        let err = as_kind(CcupError::HelmApply("boom".into()), CcupError::ChartBackup);
        assert!(matches!(err, CcupError::ChartBackup(ref m) if m.contains("boom")));

        let err = as_kind(CcupError::CrdBackup("keep".into()), CcupError::CrdBackup);
        assert!(matches!(err, CcupError::CrdBackup(ref m) if m == "keep"));
    }
}
