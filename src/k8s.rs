//! Kubernetes-side collaborators of the apply pipeline.

pub mod attestation;
pub mod backup;
pub mod certsans;
pub mod client;
pub mod nodeversion;

use async_trait::async_trait;

use crate::error::Result;
use crate::workspace::AttestationPolicy;

/// Namespace holding the cluster's control-plane configuration.
pub const KUBE_SYSTEM: &str = "kube-system";

/// Field manager recorded on every object ccup patches.
pub const FIELD_MANAGER: &str = "ccup";

#[async_trait]
pub trait AttestationReconciler: Send + Sync {
    /// Make the cluster's join service expect `policy`.
    async fn reconcile(&self, policy: &AttestationPolicy) -> Result<()>;
}

#[async_trait]
pub trait CertSanUpdater: Send + Sync {
    /// Ensure the API server certificate covers every name in `sans`.
    async fn update_sans(&self, sans: &[String]) -> Result<()>;
}

#[async_trait]
pub trait K8sUpgrader: Send + Sync {
    async fn upgrade_kubernetes(&self, version: &str) -> Result<()>;
}

#[async_trait]
pub trait ImageUpgrader: Send + Sync {
    async fn upgrade_image(&self, image: &str) -> Result<()>;
}
