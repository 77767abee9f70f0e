//! Kubernetes client built from the workspace admin kubeconfig.
//!
//! The admin kubeconfig only exists once the Init phase ran, so the client
//! is built on first use and shared afterwards.

use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{CcupError, Result};

pub struct ClientProvider {
    kubeconfig: PathBuf,
    client: OnceCell<kube::Client>,
}

impl ClientProvider {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            client: OnceCell::new(),
        }
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    /// Return the shared client, building it on first call.
    ///
    /// Build failures are reported through `kind` so each phase keeps its
    /// own error kind.
    pub async fn get(&self, kind: fn(String) -> CcupError) -> Result<kube::Client> {
        self.client
            .get_or_try_init(|| build_client(&self.kubeconfig))
            .await
            .cloned()
            .map_err(kind)
    }
}

async fn build_client(path: &Path) -> std::result::Result<kube::Client, String> {
    debug!("Loading kubeconfig from {}", path.display());
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| format!("failed to read kubeconfig {}: {e}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| format!("invalid kubeconfig {}: {e}", path.display()))?;
    kube::Client::try_from(config).map_err(|e| format!("failed to build Kubernetes client: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_kubeconfig_uses_caller_error_kind() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ClientProvider::new(dir.path().join("ccup-admin.conf"));

        let Err(err) = provider.get(CcupError::Upgrade).await else {
            panic!("client built without a kubeconfig");
        };
        assert!(matches!(err, CcupError::Upgrade(ref m) if m.contains("ccup-admin.conf")));

        let Err(err) = provider.get(CcupError::Policy).await else {
            panic!("client built without a kubeconfig");
        };
        assert!(matches!(err, CcupError::Policy(_)));
    }
}
