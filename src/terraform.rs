//! Infrastructure provisioning through the Terraform CLI.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{CcupError, Result};
use crate::state::{
    AwsInfrastructure, AzureInfrastructure, ClusterState, GcpInfrastructure, Infrastructure,
    OpenStackInfrastructure, QemuInfrastructure,
};

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create or update cloud resources and return the resulting facts.
    async fn apply(&self, state: &ClusterState) -> Result<Infrastructure>;
}

/// [`Provisioner`] running `terraform` in the workspace's terraform directory.
pub struct TerraformProvisioner {
    working_dir: PathBuf,
    tf_log: String,
}

impl TerraformProvisioner {
    pub fn new(working_dir: impl Into<PathBuf>, tf_log: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            tf_log: tf_log.into(),
        }
    }

    async fn terraform(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Command::new("terraform");
        cmd.arg(format!("-chdir={}", self.working_dir.display()))
            .args(args)
            .kill_on_drop(true);
        if !self.tf_log.eq_ignore_ascii_case("NONE") {
            cmd.env("TF_LOG", &self.tf_log);
        }

        debug!("Running: terraform {}", args.join(" "));
        let output = cmd.output().await.map_err(|e| {
            CcupError::Provision(format!(
                "failed to execute 'terraform'. Is Terraform installed? ({e})"
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CcupError::Provision(format!(
                "terraform {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn apply(&self, state: &ClusterState) -> Result<Infrastructure> {
        if state.has_infrastructure() {
            info!(
                "Updating infrastructure of {} ({})",
                state.infrastructure.name, state.infrastructure.uid
            );
        } else {
            info!("Creating infrastructure");
        }

        self.terraform(&["init", "-input=false"]).await?;
        self.terraform(&["apply", "-auto-approve", "-input=false"])
            .await?;
        let raw = self.terraform(&["output", "-json"]).await?;

        let outputs: Value = serde_json::from_slice(&raw)
            .map_err(|e| CcupError::Provision(format!("failed to parse terraform output: {e}")))?;
        parse_outputs(&outputs)
    }
}

/// Map `terraform output -json` to infrastructure facts.
///
/// The provider is detected from which provider-specific outputs exist.
fn parse_outputs(outputs: &Value) -> Result<Infrastructure> {
    let string = |key: &str| -> Result<String> {
        outputs
            .get(key)
            .and_then(|o| o.get("value"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CcupError::Provision(format!("terraform output {key:?} missing")))
    };
    let optional = |key: &str| string(key).ok();

    let api_server_cert_sans = outputs
        .get("api_server_cert_sans")
        .and_then(|o| o.get("value"))
        .and_then(Value::as_array)
        .map(|sans| {
            sans.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut infra = Infrastructure {
        uid: string("uid")?,
        name: string("name")?,
        cluster_endpoint: string("out_of_cluster_endpoint")?,
        in_cluster_endpoint: string("in_cluster_endpoint")?,
        init_secret: string("init_secret")?.into_bytes(),
        api_server_cert_sans,
        ip_cidr_node: optional("ip_cidr_node").unwrap_or_default(),
        ..Default::default()
    };

    if let Some(resource_group) = optional("resource_group") {
        infra.azure = Some(AzureInfrastructure {
            resource_group,
            subscription_id: string("subscription_id")?,
            network_security_group_name: string("network_security_group_name")?,
            load_balancer_name: string("loadbalancer_name")?,
            user_assigned_identity: string("user_assigned_identity")?,
            attestation_url: optional("attestation_url").unwrap_or_default(),
        });
    } else if let Some(project_id) = optional("project") {
        infra.gcp = Some(GcpInfrastructure {
            project_id,
            ip_cidr_pod: string("ip_cidr_pod")?,
        });
    } else if let Some(region) = optional("region") {
        infra.aws = Some(AwsInfrastructure {
            region,
            iam_profile_control_plane: optional("iam_profile_control_plane").unwrap_or_default(),
            iam_profile_worker_nodes: optional("iam_profile_worker_nodes").unwrap_or_default(),
        });
    } else if let Some(network_id) = optional("network_id") {
        infra.openstack = Some(OpenStackInfrastructure {
            network_id,
            subnet_id: string("subnet_id")?,
        });
    } else if let Some(metadata_endpoint) = optional("metadata_endpoint") {
        infra.qemu = Some(QemuInfrastructure { metadata_endpoint });
    } else {
        return Err(CcupError::Provision(
            "terraform outputs do not identify a cloud provider".to_string(),
        ));
    }

    Ok(infra)
}
