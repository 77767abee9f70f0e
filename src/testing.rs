//! Recording test doubles for every collaborator trait.
//!
//! All doubles of one test share a [`CallLog`], so tests can assert the
//! exact cross-collaborator call order.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::backup::{BackupClient, CrdInfo};
use crate::bootstrap::Bootstrapper;
use crate::config::ApplyConfig;
use crate::error::{CcupError, Result};
use crate::helm::{HelmApplier, Release, WaitMode};
use crate::k8s::{AttestationReconciler, CertSanUpdater, ImageUpgrader, K8sUpgrader};
use crate::runner::{Collaborators, PhaseRunner};
use crate::state::{ClusterState, Infrastructure, StateStore, sample_state};
use crate::workspace::{AttestationPolicy, sample_config};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LoadState,
    SaveState,
    Provision,
    Init,
    ReconcilePolicy(String),
    UpdateSans(Vec<String>),
    SaveCharts,
    BackupCrds,
    BackupCrs,
    HelmUpgrade(WaitMode, Duration),
    UpgradeKubernetes(String),
    UpgradeImage(String),
}

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn record(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    /// Wait until the recorded calls satisfy `done`.
    pub async fn wait_for(&self, done: impl Fn(&[Call]) -> bool) {
        while !done(&self.calls()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn failure<T>(kind: fn(String) -> CcupError) -> Result<T> {
    Err(kind("injected failure".to_string()))
}

pub struct MemStateStore {
    log: CallLog,
    state: Mutex<Option<ClusterState>>,
}

impl MemStateStore {
    pub fn new(log: &CallLog, state: Option<ClusterState>) -> Self {
        Self {
            log: log.clone(),
            state: Mutex::new(state),
        }
    }

    pub fn stored(&self) -> Option<ClusterState> {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateStore for MemStateStore {
    async fn load(&self) -> Result<ClusterState> {
        self.log.record(Call::LoadState);
        self.stored()
            .ok_or_else(|| CcupError::StateNotFound("cluster-state.yaml".to_string()))
    }

    async fn save(&self, state: &ClusterState) -> Result<()> {
        self.log.record(Call::SaveState);
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

pub struct StubProvisioner {
    log: CallLog,
    fail: bool,
}

#[async_trait]
impl crate::terraform::Provisioner for StubProvisioner {
    async fn apply(&self, state: &ClusterState) -> Result<Infrastructure> {
        self.log.record(Call::Provision);
        if self.fail {
            return failure(CcupError::Provision);
        }
        if state.has_infrastructure() {
            Ok(state.infrastructure.clone())
        } else {
            Ok(sample_state().infrastructure)
        }
    }
}

pub struct StubBootstrapper {
    log: CallLog,
}

#[async_trait]
impl Bootstrapper for StubBootstrapper {
    async fn init(&self, state: &ClusterState) -> Result<ClusterState> {
        self.log.record(Call::Init);
        let mut next = state.clone();
        if !next.cluster_values.is_initialized() {
            next.cluster_values = sample_state().cluster_values;
        }
        Ok(next)
    }
}

pub struct StubAttestation {
    log: CallLog,
}

#[async_trait]
impl AttestationReconciler for StubAttestation {
    async fn reconcile(&self, policy: &AttestationPolicy) -> Result<()> {
        self.log.record(Call::ReconcilePolicy(policy.variant.clone()));
        Ok(())
    }
}

pub struct StubCertSans {
    log: CallLog,
    fail: bool,
}

#[async_trait]
impl CertSanUpdater for StubCertSans {
    async fn update_sans(&self, sans: &[String]) -> Result<()> {
        self.log.record(Call::UpdateSans(sans.to_vec()));
        if self.fail {
            return failure(CcupError::Update);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpgradeBehavior {
    Succeed,
    Fail,
    Timeout,
    Hang,
}

pub struct StubHelm {
    log: CallLog,
    fail_save_charts: bool,
    upgrade: UpgradeBehavior,
}

impl StubHelm {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            fail_save_charts: false,
            upgrade: UpgradeBehavior::Succeed,
        }
    }

    pub fn fail_save_charts(mut self) -> Self {
        self.fail_save_charts = true;
        self
    }
}

#[async_trait]
impl HelmApplier for StubHelm {
    async fn save_charts(&self, _releases: &[Release], _dest: &Path) -> Result<()> {
        self.log.record(Call::SaveCharts);
        if self.fail_save_charts {
            return failure(CcupError::ChartBackup);
        }
        Ok(())
    }

    async fn upgrade(
        &self,
        _releases: &[Release],
        wait_mode: WaitMode,
        timeout: Duration,
    ) -> Result<()> {
        self.log.record(Call::HelmUpgrade(wait_mode, timeout));
        match self.upgrade {
            UpgradeBehavior::Succeed => Ok(()),
            UpgradeBehavior::Fail => failure(CcupError::HelmApply),
            UpgradeBehavior::Timeout => Err(CcupError::HelmTimeout {
                release: "cilium".to_string(),
                timeout,
            }),
            UpgradeBehavior::Hang => std::future::pending().await,
        }
    }
}

pub struct StubBackupClient {
    log: CallLog,
    fail_crds: bool,
    fail_crs: bool,
    unserved: Vec<String>,
}

impl StubBackupClient {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            fail_crds: false,
            fail_crs: false,
            unserved: Vec::new(),
        }
    }

    /// Report `version` of every CRD as not listable.
    pub fn unserved(mut self, version: &str) -> Self {
        self.unserved.push(version.to_string());
        self
    }

    pub fn fail_crds(mut self) -> Self {
        self.fail_crds = true;
        self
    }

    pub fn fail_crs(mut self) -> Self {
        self.fail_crs = true;
        self
    }
}

#[async_trait]
impl BackupClient for StubBackupClient {
    async fn backup_crds(&self, _dest: &Path) -> Result<Vec<CrdInfo>> {
        self.log.record(Call::BackupCrds);
        if self.fail_crds {
            return Err(CcupError::CrdBackup("injected failure".to_string()));
        }
        Ok(vec![CrdInfo {
            name: "nodeversions.update.edgeless.systems".to_string(),
            group: "update.edgeless.systems".to_string(),
            kind: "NodeVersion".to_string(),
            plural: "nodeversions".to_string(),
            namespaced: false,
            versions: vec!["v1alpha1".to_string()],
        }])
    }

    async fn backup_crs(&self, crds: &[CrdInfo], _dest: &Path) -> Result<Vec<String>> {
        self.log.record(Call::BackupCrs);
        if self.fail_crs {
            return failure(CcupError::CrBackup);
        }
        let mut skipped = Vec::new();
        for crd in crds {
            for version in crd.versions.iter().filter(|v| self.unserved.contains(v)) {
                skipped.push(format!("{}/{}", crd.name, version));
            }
        }
        Ok(skipped)
    }
}

pub struct StubUpgrader {
    log: CallLog,
}

#[async_trait]
impl K8sUpgrader for StubUpgrader {
    async fn upgrade_kubernetes(&self, version: &str) -> Result<()> {
        self.log.record(Call::UpgradeKubernetes(version.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ImageUpgrader for StubUpgrader {
    async fn upgrade_image(&self, image: &str) -> Result<()> {
        self.log.record(Call::UpgradeImage(image.to_string()));
        Ok(())
    }
}

/// A full set of doubles plus a scratch workspace for [`PhaseRunner`] tests.
pub struct TestRig {
    pub log: CallLog,
    store: Arc<MemStateStore>,
    fail_provision: bool,
    fail_cert_sans: bool,
    fail_crs: bool,
    helm_upgrade: UpgradeBehavior,
    workspace: tempfile::TempDir,
}

impl TestRig {
    pub fn new(state: Option<ClusterState>) -> Self {
        let log = CallLog::default();
        Self {
            store: Arc::new(MemStateStore::new(&log, state)),
            fail_provision: false,
            fail_cert_sans: false,
            fail_crs: false,
            helm_upgrade: UpgradeBehavior::Succeed,
            workspace: tempfile::tempdir().unwrap(),
            log,
        }
    }

    pub fn fail_provision(mut self) -> Self {
        self.fail_provision = true;
        self
    }

    pub fn fail_cert_sans(mut self) -> Self {
        self.fail_cert_sans = true;
        self
    }

    pub fn fail_backup_crs(mut self) -> Self {
        self.fail_crs = true;
        self
    }

    pub fn fail_helm_upgrade(mut self) -> Self {
        self.helm_upgrade = UpgradeBehavior::Fail;
        self
    }

    pub fn timeout_helm(mut self) -> Self {
        self.helm_upgrade = UpgradeBehavior::Timeout;
        self
    }

    pub fn hang_helm_upgrade(mut self) -> Self {
        self.helm_upgrade = UpgradeBehavior::Hang;
        self
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.workspace.path().join("upgrades").join("test").join("backups")
    }

    pub fn stored_state(&self) -> Option<ClusterState> {
        self.store.stored()
    }

    pub fn runner(&self, config: ApplyConfig) -> PhaseRunner {
        let log = &self.log;
        let upgrader = Arc::new(StubUpgrader { log: log.clone() });
        let collaborators = Collaborators {
            store: self.store.clone(),
            provisioner: Arc::new(StubProvisioner {
                log: log.clone(),
                fail: self.fail_provision,
            }),
            bootstrapper: Arc::new(StubBootstrapper { log: log.clone() }),
            attestation: Arc::new(StubAttestation { log: log.clone() }),
            cert_sans: Arc::new(StubCertSans {
                log: log.clone(),
                fail: self.fail_cert_sans,
            }),
            helm: Arc::new(StubHelm {
                log: log.clone(),
                fail_save_charts: false,
                upgrade: self.helm_upgrade,
            }),
            backup: Arc::new(StubBackupClient {
                log: log.clone(),
                fail_crds: false,
                fail_crs: self.fail_crs,
                unserved: Vec::new(),
            }),
            k8s: upgrader.clone(),
            image: upgrader,
        };
        PhaseRunner::new(config, sample_config(), self.backup_dir(), collaborators)
    }
}
