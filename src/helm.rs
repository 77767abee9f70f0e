//! Helm release upgrades.
//!
//! The orchestrator depends on [`HelmApplier`] only; [`HelmCli`] drives the
//! `helm` binary and owns readiness waiting and rollback.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{CcupError, Result};

/// How `upgrade` waits for upgraded resources.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitMode {
    /// Return once the release is accepted by the API server.
    None,
    /// Block until ready and roll back automatically on failure or timeout.
    #[default]
    Atomic,
}

impl fmt::Display for WaitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Atomic => write!(f, "atomic"),
        }
    }
}

/// A Helm release managed by the apply pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    /// Chart reference: local path, `repo/chart`, or OCI URL.
    pub chart: String,
    #[serde(default)]
    pub values: Option<PathBuf>,
}

#[async_trait]
pub trait HelmApplier: Send + Sync {
    /// Persist the currently deployed release set below `dest`.
    async fn save_charts(&self, releases: &[Release], dest: &Path) -> Result<()>;

    /// Upgrade (or install) every release in order.
    ///
    /// `timeout` is one deadline for the whole call, not per release; each
    /// release waits at most for what is left of it.
    ///
    /// Under [`WaitMode::Atomic`] a missed deadline is reported as
    /// [`CcupError::HelmTimeout`]; every other failure is
    /// [`CcupError::HelmApply`].
    async fn upgrade(&self, releases: &[Release], wait_mode: WaitMode, timeout: Duration)
    -> Result<()>;
}

/// Output fragments helm prints when `--wait` runs out of time.
const TIMEOUT_MARKERS: &[&str] = &[
    "timed out waiting for the condition",
    "context deadline exceeded",
];

/// [`HelmApplier`] backed by the `helm` CLI.
pub struct HelmCli {
    kubeconfig: PathBuf,
    binary: String,
}

impl HelmCli {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            binary: "helm".to_string(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--kubeconfig").arg(&self.kubeconfig);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn release_exists(&self, release: &Release) -> Result<bool> {
        let output = self
            .command()
            .args(["status", &release.name, "--namespace", &release.namespace])
            .output()
            .await
            .map_err(|e| CcupError::ChartBackup(format!("failed to execute helm: {e}")))?;

        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("release: not found") {
            Ok(false)
        } else {
            Err(CcupError::ChartBackup(format!(
                "helm status {} failed: {}",
                release.name,
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl HelmApplier for HelmCli {
    async fn save_charts(&self, releases: &[Release], dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest).await.map_err(|e| {
            CcupError::ChartBackup(format!("failed to create {}: {e}", dest.display()))
        })?;

        for release in releases {
            if !self.release_exists(release).await? {
                debug!("Release {} not deployed yet, nothing to save", release.name);
                continue;
            }

            let output = self
                .command()
                .args(["get", "all", &release.name, "--namespace", &release.namespace])
                .output()
                .await
                .map_err(|e| CcupError::ChartBackup(format!("failed to execute helm: {e}")))?;
            if !output.status.success() {
                return Err(CcupError::ChartBackup(format!(
                    "helm get all {} failed: {}",
                    release.name,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }

            let path = dest.join(format!("{}.yaml", release.name));
            tokio::fs::write(&path, &output.stdout).await.map_err(|e| {
                CcupError::ChartBackup(format!("failed to write {}: {e}", path.display()))
            })?;
            info!("Saved release {} to {}", release.name, path.display());
        }

        Ok(())
    }

    async fn upgrade(
        &self,
        releases: &[Release],
        wait_mode: WaitMode,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        for release in releases {
            let remaining = match wait_mode {
                WaitMode::Atomic => remaining_timeout(timeout, started.elapsed())
                    .ok_or_else(|| CcupError::HelmTimeout {
                        release: release.name.clone(),
                        timeout,
                    })?,
                WaitMode::None => timeout,
            };
            let args = upgrade_args(release, wait_mode, remaining);
            info!(
                "Upgrading release {} in {} (wait: {})",
                release.name, release.namespace, wait_mode
            );
            debug!("Running: helm {}", args.join(" "));

            let output = self
                .command()
                .args(&args)
                .output()
                .await
                .map_err(|e| CcupError::HelmApply(format!("failed to execute helm: {e}")))?;

            classify_upgrade_output(release, &output, wait_mode, timeout)?;
        }

        Ok(())
    }
}

/// Time left of `timeout` after `elapsed`, `None` once it is used up.
fn remaining_timeout(timeout: Duration, elapsed: Duration) -> Option<Duration> {
    timeout.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Build `helm upgrade` arguments for one release.
fn upgrade_args(release: &Release, wait_mode: WaitMode, timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        "--install".to_string(),
        release.name.clone(),
        release.chart.clone(),
        "--namespace".to_string(),
        release.namespace.clone(),
        "--create-namespace".to_string(),
    ];
    if let Some(values) = &release.values {
        args.push("--values".to_string());
        args.push(values.display().to_string());
    }
    if wait_mode == WaitMode::Atomic {
        args.push("--atomic".to_string());
        args.push("--wait".to_string());
        args.push("--timeout".to_string());
        args.push(format!("{}ms", timeout.as_millis().max(1)));
    }
    args
}

fn classify_upgrade_output(
    release: &Release,
    output: &Output,
    wait_mode: WaitMode,
    timeout: Duration,
) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lowered = stderr.to_lowercase();
    if wait_mode == WaitMode::Atomic && TIMEOUT_MARKERS.iter().any(|m| lowered.contains(m)) {
        warn!(
            "Release {} did not become ready within {:?}, helm rolled it back",
            release.name, timeout
        );
        return Err(CcupError::HelmTimeout {
            release: release.name.clone(),
            timeout,
        });
    }

    Err(CcupError::HelmApply(format!(
        "{}: {}",
        release.name,
        stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn release() -> Release {
        Release {
            name: "cilium".to_string(),
            namespace: "kube-system".to_string(),
            chart: "charts/cilium".to_string(),
            values: None,
        }
    }

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_wait_mode_default_is_atomic() {
        assert_eq!(WaitMode::default(), WaitMode::Atomic);
    }

    #[test]
    fn test_upgrade_args_atomic() {
        let args = upgrade_args(&release(), WaitMode::Atomic, Duration::from_secs(300));
        assert!(args.contains(&"--atomic".to_string()));
        assert!(args.contains(&"--wait".to_string()));
        let idx = args.iter().position(|a| a == "--timeout").unwrap();
        assert_eq!(args[idx + 1], "300000ms");
    }

    #[test]
    fn test_upgrade_args_keeps_subsecond_timeout() {
        let args = upgrade_args(&release(), WaitMode::Atomic, Duration::from_millis(1500));
        let idx = args.iter().position(|a| a == "--timeout").unwrap();
        assert_eq!(args[idx + 1], "1500ms");
    }

    #[test]
    fn test_remaining_timeout_shared_across_releases() {
        let timeout = Duration::from_secs(300);
        assert_eq!(
            remaining_timeout(timeout, Duration::from_secs(120)),
            Some(Duration::from_secs(180))
        );
        assert_eq!(remaining_timeout(timeout, timeout), None);
        assert_eq!(remaining_timeout(timeout, Duration::from_secs(301)), None);
    }

    #[test]
    fn test_upgrade_args_none_has_no_wait() {
        let mut r = release();
        r.values = Some(PathBuf::from("values/cilium.yaml"));
        let args = upgrade_args(&r, WaitMode::None, Duration::from_secs(300));
        assert!(!args.contains(&"--atomic".to_string()));
        assert!(!args.contains(&"--wait".to_string()));
        assert!(!args.contains(&"--timeout".to_string()));
        assert!(args.contains(&"values/cilium.yaml".to_string()));
    }

    #[test]
    fn test_classify_success() {
        let out = output(0, "");
        assert!(
            classify_upgrade_output(&release(), &out, WaitMode::Atomic, Duration::from_secs(1))
                .is_ok()
        );
    }

    #[test]
    fn test_classify_timeout_is_distinct() {
        let out = output(
            1,
            "Error: UPGRADE FAILED: release cilium failed, and has been rolled back due to atomic being set: timed out waiting for the condition",
        );
        let err =
            classify_upgrade_output(&release(), &out, WaitMode::Atomic, Duration::from_secs(300))
                .unwrap_err();
        assert!(matches!(err, CcupError::HelmTimeout { ref release, .. } if release == "cilium"));
    }

    #[test]
    fn test_classify_render_error_is_apply_error() {
        let out = output(1, "Error: template: cilium/templates/ds.yaml:3: bad");
        let err =
            classify_upgrade_output(&release(), &out, WaitMode::Atomic, Duration::from_secs(300))
                .unwrap_err();
        assert!(matches!(err, CcupError::HelmApply(_)));
    }

    #[test]
    fn test_classify_timeout_text_without_wait_is_apply_error() {
        let out = output(1, "Error: context deadline exceeded");
        let err =
            classify_upgrade_output(&release(), &out, WaitMode::None, Duration::from_secs(300))
                .unwrap_err();
        assert!(matches!(err, CcupError::HelmApply(_)));
    }

    #[test]
    fn test_release_deny_unknown_fields() {
        let yaml = "name: a\nnamespace: b\nchart: c\nversion: 1\n";
        assert!(serde_yaml::from_str::<Release>(yaml).is_err());
    }
}
