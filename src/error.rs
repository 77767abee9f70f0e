//! Custom error types for ccup.

use std::time::Duration;

use thiserror::Error;

use crate::phase::{Phase, all_phases};

pub type Result<T> = std::result::Result<T, CcupError>;

/// Errors that can occur while applying or upgrading a cluster.
#[derive(Error, Debug)]
pub enum CcupError {
    #[error("Invalid phase name(s): {0} (valid phases: {phases})", phases = all_phases().join(", "))]
    InvalidPhaseName(String),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Cluster state not found: {0}")]
    StateNotFound(String),

    #[error("Failed to write cluster state: {0}")]
    StateWrite(String),

    #[error("Backing up Helm charts failed: {0}")]
    ChartBackup(String),

    #[error("Backing up custom resource definitions failed: {0}")]
    CrdBackup(String),

    #[error("Backing up custom resources failed: {0}")]
    CrBackup(String),

    #[error("Provisioning infrastructure failed: {0}")]
    Provision(String),

    #[error("Initializing cluster failed: {0}")]
    Init(String),

    #[error("Reconciling attestation policy failed: {0}")]
    Policy(String),

    #[error("Updating API server certificate SANs failed: {0}")]
    Update(String),

    #[error("Applying Helm releases failed: {0}")]
    HelmApply(String),

    #[error("Timed out after {timeout:?} waiting for Helm release {release} to become ready")]
    HelmTimeout { release: String, timeout: Duration },

    #[error("Upgrade failed: {0}")]
    Upgrade(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Phase {phase} failed")]
    PhaseFailed {
        phase: Phase,
        #[source]
        source: Box<CcupError>,
    },
}

impl CcupError {
    /// Wrap an error with the phase it aborted.
    pub fn in_phase(self, phase: Phase) -> Self {
        Self::PhaseFailed {
            phase,
            source: Box::new(self),
        }
    }

    /// Phase that aborted the pipeline, if any.
    pub const fn failed_phase(&self) -> Option<Phase> {
        match self {
            Self::PhaseFailed { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn is_backup_failure(&self) -> bool {
        match self {
            Self::ChartBackup(_) | Self::CrdBackup(_) | Self::CrBackup(_) => true,
            Self::PhaseFailed { source, .. } => source.is_backup_failure(),
            _ => false,
        }
    }
}
