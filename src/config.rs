//! CLI configuration and argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::error::{CcupError, Result};
use crate::helm::WaitMode;
use crate::phase::PhaseSet;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Helm wait deadline used when `--timeout` is not given.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Confidential Kubernetes cluster apply and upgrade CLI tool.
///
/// Provisions infrastructure, initializes the cluster, reconciles attestation
/// and certificate configuration, and upgrades the Helm-managed control plane.
#[derive(Parser, Debug, Clone)]
#[command(name = "ccup")]
#[command(about = "Confidential Kubernetes cluster apply and upgrade CLI tool")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every subcommand.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Directory holding cluster state, configuration and backups
    #[arg(long, global = true, default_value = ".", env = "CCUP_WORKSPACE")]
    pub workspace: PathBuf,

    /// Terraform log level (NONE, ERROR, WARN, INFO, DEBUG, TRACE)
    #[arg(long = "tf-log", global = true, default_value = "NONE")]
    pub tf_log: String,

    /// Enable debug logging
    #[arg(long, global = true, default_value = "false")]
    pub debug: bool,

    /// Accept a cluster state written by an incompatible tool version
    #[arg(long, global = true, default_value = "false")]
    pub force: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Apply the workspace configuration to the cluster
    Apply(ApplyArgs),
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ApplyArgs {
    /// Comma-separated phases to skip (infrastructure, init, attestationconfig, certsans, helm, k8s, image)
    #[arg(long = "skip-phases", value_delimiter = ',', value_name = "PHASES")]
    pub skip_phases: Vec<String>,

    /// Do not wait for Helm releases to become ready and disable automatic rollback
    #[arg(long, default_value = "false")]
    pub skip_helm_wait: bool,

    /// Deadline for Helm releases to become ready (e.g., 5m, 1h30m, 90s)
    #[arg(long, value_name = "DURATION")]
    pub timeout: Option<String>,
}

/// Resolved settings for one apply invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyConfig {
    pub skip_phases: PhaseSet,
    pub helm_wait_mode: WaitMode,
    pub upgrade_timeout: Duration,
    pub force: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            skip_phases: PhaseSet::new(),
            helm_wait_mode: WaitMode::Atomic,
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            force: false,
        }
    }
}

impl ApplyConfig {
    /// Create config from CLI arguments.
    pub fn from_args(apply: &ApplyArgs, global: &GlobalArgs) -> Result<Self> {
        let skip_phases = PhaseSet::parse(&apply.skip_phases)?;

        let helm_wait_mode = if apply.skip_helm_wait {
            WaitMode::None
        } else {
            WaitMode::Atomic
        };

        let upgrade_timeout = match apply.timeout.as_deref() {
            Some(raw) => parse_duration(raw)?,
            None => DEFAULT_UPGRADE_TIMEOUT,
        };
        if upgrade_timeout.is_zero() {
            return Err(CcupError::ConfigValidation(
                "--timeout must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            skip_phases,
            helm_wait_mode,
            upgrade_timeout,
            force: global.force,
        })
    }
}

/// Parse a duration string such as "5m", "1h30m", "90s" or "500ms".
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let invalid = || CcupError::ConfigValidation(format!("invalid duration {raw:?}"));

    let input = raw.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(value)),
            "ms" => Some(Duration::from_millis(value)),
            _ => return Err(invalid()),
        }
        .ok_or_else(invalid)?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    Ok(total)
}
