//! Phase runner: drives one apply invocation through every phase in order.
//!
//! Phases run strictly sequentially. A skipped phase never touches its
//! collaborator, and the first failing phase aborts the run. Cluster state
//! is persisted after the phases that change it, so an aborted run leaves
//! the state of the last completed phase on disk.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{Instrument, error, info, info_span, warn};

use crate::backup::{BackupArtifact, BackupClient, BackupCoordinator};
use crate::bootstrap::Bootstrapper;
use crate::config::ApplyConfig;
use crate::error::{CcupError, Result};
use crate::helm::HelmApplier;
use crate::k8s::{AttestationReconciler, CertSanUpdater, ImageUpgrader, K8sUpgrader};
use crate::output;
use crate::phase::Phase;
use crate::state::{ClusterState, StateStore};
use crate::terraform::Provisioner;
use crate::workspace::WorkspaceConfig;

/// External systems the phases act on.
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub provisioner: Arc<dyn Provisioner>,
    pub bootstrapper: Arc<dyn Bootstrapper>,
    pub attestation: Arc<dyn AttestationReconciler>,
    pub cert_sans: Arc<dyn CertSanUpdater>,
    pub helm: Arc<dyn HelmApplier>,
    pub backup: Arc<dyn BackupClient>,
    pub k8s: Arc<dyn K8sUpgrader>,
    pub image: Arc<dyn ImageUpgrader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Skipped,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub duration: Duration,
}

/// Result of a successful apply.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub outcomes: Vec<PhaseOutcome>,
    pub state: ClusterState,
    /// Pre-upgrade backup taken by the Helm phase.
    pub backup: Option<BackupArtifact>,
}

impl ApplyReport {
    pub fn completed(&self) -> impl Iterator<Item = Phase> + '_ {
        self.outcomes
            .iter()
            .filter(|o| o.status == PhaseStatus::Completed)
            .map(|o| o.phase)
    }
}

pub struct PhaseRunner {
    config: ApplyConfig,
    targets: WorkspaceConfig,
    backup_dir: PathBuf,
    collaborators: Collaborators,
}

impl PhaseRunner {
    pub fn new(
        config: ApplyConfig,
        targets: WorkspaceConfig,
        backup_dir: impl Into<PathBuf>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            targets,
            backup_dir: backup_dir.into(),
            collaborators,
        }
    }

    /// Run every phase in order, skipping the configured ones.
    ///
    /// Any phase error, including cancellation through `shutdown`, aborts
    /// the run and is returned as [`CcupError::PhaseFailed`].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<ApplyReport> {
        let mut state = self.load_state().await?;
        let includes_upgrades = state.cluster_values.is_initialized();
        info!(
            "Applying configuration (upgrade: {}, skip: [{}], helm wait: {}, timeout: {:?})",
            includes_upgrades,
            self.config.skip_phases,
            self.config.helm_wait_mode,
            self.config.upgrade_timeout
        );

        let mut outcomes = Vec::with_capacity(Phase::ALL.len());
        let mut backup = None;

        for (index, phase) in Phase::ALL.into_iter().enumerate() {
            let skipped = self.config.skip_phases.contains(phase);
            output::print_phase_header(index + 1, phase, skipped);

            if skipped {
                info!(phase = %phase, "Phase skipped");
                outcomes.push(PhaseOutcome {
                    phase,
                    status: PhaseStatus::Skipped,
                    duration: Duration::ZERO,
                });
                continue;
            }

            let started = Instant::now();
            let work = self.run_phase(phase, &mut state, includes_upgrades, &mut backup);
            if let Err(e) = cancellable(&mut shutdown, work)
                .instrument(info_span!("phase", phase = %phase))
                .await
            {
                error!(phase = %phase, "Phase failed: {}", e);
                return Err(e.in_phase(phase));
            }

            let duration = started.elapsed();
            info!(
                phase = %phase,
                "Phase completed in {:.1}s",
                duration.as_secs_f64()
            );
            outcomes.push(PhaseOutcome {
                phase,
                status: PhaseStatus::Completed,
                duration,
            });
        }

        Ok(ApplyReport {
            outcomes,
            state,
            backup,
        })
    }

    async fn load_state(&self) -> Result<ClusterState> {
        match self.collaborators.store.load().await {
            Ok(state) => {
                state.validate(self.config.force)?;
                Ok(state)
            }
            Err(CcupError::StateNotFound(reason))
                if !self.config.skip_phases.contains(Phase::Infrastructure) =>
            {
                info!("{}; starting from an empty cluster state", reason);
                Ok(ClusterState::new_empty())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_phase(
        &self,
        phase: Phase,
        state: &mut ClusterState,
        includes_upgrades: bool,
        backup: &mut Option<BackupArtifact>,
    ) -> Result<()> {
        let c = &self.collaborators;
        match phase {
            Phase::Infrastructure => {
                state.infrastructure = c.provisioner.apply(state).await?;
                c.store.save(state).await?;
            }
            Phase::Init => {
                *state = c.bootstrapper.init(state).await?;
                c.store.save(state).await?;
            }
            Phase::AttestationConfig => {
                c.attestation.reconcile(&self.targets.attestation).await?;
            }
            Phase::CertSans => {
                c.cert_sans.update_sans(&cert_sans(state)).await?;
            }
            Phase::Helm => {
                let releases = &self.targets.helm.releases;
                let artifact = BackupCoordinator::new(c.helm.as_ref(), c.backup.as_ref())
                    .backup(releases, &self.backup_dir, includes_upgrades)
                    .await?;
                info!("Backup stored in {}", artifact.path.display());
                *backup = Some(artifact);

                c.helm
                    .upgrade(
                        releases,
                        self.config.helm_wait_mode,
                        self.config.upgrade_timeout,
                    )
                    .await?;
            }
            Phase::K8s => {
                c.k8s
                    .upgrade_kubernetes(&self.targets.kubernetes_version)
                    .await?;
            }
            Phase::Image => {
                c.image.upgrade_image(&self.targets.image).await?;
            }
        }
        Ok(())
    }
}

/// SANs the API server certificate must cover: the recorded extra SANs and
/// both cluster endpoints.
fn cert_sans(state: &ClusterState) -> Vec<String> {
    let infra = &state.infrastructure;
    infra
        .api_server_cert_sans
        .iter()
        .chain([&infra.cluster_endpoint, &infra.in_cluster_endpoint])
        .filter(|san| !san.is_empty())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Race `work` against the shutdown signal.
async fn cancellable<F>(shutdown: &mut watch::Receiver<bool>, work: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    if *shutdown.borrow() {
        return Err(CcupError::Cancelled);
    }

    tokio::select! {
        result = work => result,
        () = cancelled(shutdown) => {
            warn!("Cancellation requested, aborting in-flight phase");
            Err(CcupError::Cancelled)
        }
    }
}

async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone: no signal can arrive anymore.
        std::future::pending::<()>().await;
    }
}
