//! ccup - confidential Kubernetes cluster apply and upgrade CLI tool.
//!
//! Runs the apply pipeline against a workspace:
//! - Infrastructure provisioning and cluster initialization
//! - Attestation policy and API server certificate reconciliation
//! - Backed-up Helm upgrades of the control plane
//! - Kubernetes and node image version upgrades

mod backup;
mod bootstrap;
mod config;
mod error;
mod helm;
mod k8s;
mod output;
mod phase;
mod runner;
mod state;
mod terraform;
#[cfg(test)]
mod testing;
mod workspace;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use bootstrap::HttpBootstrapper;
use config::{ApplyArgs, ApplyConfig, Args, Command, GlobalArgs};
use helm::HelmCli;
use k8s::attestation::KubeAttestationReconciler;
use k8s::backup::KubeBackupClient;
use k8s::certsans::KubeCertSanUpdater;
use k8s::client::ClientProvider;
use k8s::nodeversion::NodeVersionUpgrader;
use runner::{Collaborators, PhaseRunner};
use state::FileStateStore;
use terraform::TerraformProvisioner;
use workspace::{Workspace, WorkspaceConfig};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_level = if args.global.debug { "debug" } else { "info" };

    if let Err(e) = init_tracing(log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    debug!("Starting ccup {}", config::VERSION);

    let result = match &args.command {
        Command::Apply(apply) => run_apply(&args.global, apply).await,
    };
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Wire the real collaborators and run the apply pipeline once.
async fn run_apply(global: &GlobalArgs, apply: &ApplyArgs) -> Result<()> {
    let config = ApplyConfig::from_args(apply, global).context("Invalid apply flags")?;
    let workspace = Workspace::new(&global.workspace);
    let targets = WorkspaceConfig::load(&workspace.config_path())
        .context("Failed to load workspace configuration")?;
    if !config.skip_phases.is_empty() {
        debug!("Skipping {} phase(s): {}", config.skip_phases.len(), config.skip_phases);
    }

    let store = FileStateStore::new(workspace.root());
    debug!("Cluster state file: {}", store.path().display());

    let clients = Arc::new(ClientProvider::new(workspace.admin_conf_path()));
    debug!("Admin kubeconfig: {}", clients.kubeconfig().display());
    let node_versions = Arc::new(NodeVersionUpgrader::new(clients.clone()));

    let collaborators = Collaborators {
        store: Arc::new(store),
        provisioner: Arc::new(TerraformProvisioner::new(
            workspace.terraform_dir(),
            &global.tf_log,
        )),
        bootstrapper: Arc::new(
            HttpBootstrapper::new(&targets.kubernetes_version, workspace.admin_conf_path())
                .context("Failed to set up cluster bootstrap client")?,
        ),
        attestation: Arc::new(KubeAttestationReconciler::new(clients.clone())),
        cert_sans: Arc::new(KubeCertSanUpdater::new(clients.clone())),
        helm: Arc::new(HelmCli::new(workspace.admin_conf_path())),
        backup: Arc::new(KubeBackupClient::new(clients)),
        k8s: node_versions.clone(),
        image: node_versions,
    };

    let backup_dir = workspace.backup_dir(Utc::now());
    let runner = PhaseRunner::new(config, targets, backup_dir, collaborators);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling apply");
            let _ = shutdown_tx.send(true);
        }
    });

    match runner.run(shutdown_rx).await {
        Ok(report) => {
            output::print_summary(&report);
            Ok(())
        }
        Err(e) => {
            output::print_failure(&e);
            Err(e.into())
        }
    }
}

/// Initialize tracing subscriber.
///
/// `RUST_LOG` overrides `log_level`; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {}", e))?;

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_target(false)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_apply_rejects_invalid_phase_before_touching_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::try_parse_from([
            "ccup",
            "apply",
            "--workspace",
            dir.path().to_str().unwrap(),
            "--skip-phases",
            "helm,terraform",
        ])
        .unwrap();
        let Command::Apply(apply) = &args.command;

        let err = run_apply(&args.global, apply).await.unwrap_err();
        assert!(format!("{:#}", err).contains("terraform"));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_run_apply_requires_workspace_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::try_parse_from([
            "ccup",
            "apply",
            "--workspace",
            dir.path().to_str().unwrap(),
        ])
        .unwrap();
        let Command::Apply(apply) = &args.command;

        let err = run_apply(&args.global, apply).await.unwrap_err();
        assert!(format!("{:#}", err).contains(workspace::CONFIG_FILE));
    }
}
