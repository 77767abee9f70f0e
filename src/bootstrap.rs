//! Cluster bootstrap through the first control-plane node's init service.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CcupError, Result};
use crate::state::{ClusterState, ClusterValues};

/// Port of the bootstrap service on control-plane nodes.
pub const INIT_PORT: u16 = 9000;

#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Initialize the cluster and return the state with identity values set.
    async fn init(&self, state: &ClusterState) -> Result<ClusterState>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest<'a> {
    cluster_name: &'a str,
    init_secret: String,
    kubernetes_version: &'a str,
    #[serde(rename = "apiServerCertSANs")]
    api_server_cert_sans: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    #[serde(rename = "clusterID")]
    cluster_id: String,
    #[serde(rename = "ownerID")]
    owner_id: String,
    /// Base64-encoded.
    measurement_salt: String,
    /// Base64-encoded admin kubeconfig.
    kubeconfig: String,
}

/// [`Bootstrapper`] talking to the init service over HTTPS.
pub struct HttpBootstrapper {
    client: reqwest::Client,
    kubernetes_version: String,
    admin_conf: PathBuf,
    max_attempts: u32,
    retry_interval: Duration,
}

impl HttpBootstrapper {
    pub fn new(
        kubernetes_version: impl Into<String>,
        admin_conf: impl Into<PathBuf>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10 * 60))
            .build()
            .map_err(|e| CcupError::Init(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            kubernetes_version: kubernetes_version.into(),
            admin_conf: admin_conf.into(),
            max_attempts: 30,
            retry_interval: Duration::from_secs(10),
        })
    }

    async fn send(&self, url: &str, request: &InitRequest<'_>) -> Result<InitResponse> {
        let mut attempt = 1;
        loop {
            match self.client.post(url).json(request).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json::<InitResponse>().await.map_err(|e| {
                        CcupError::Init(format!("invalid response from init service: {e}"))
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(CcupError::Init(format!(
                        "init service returned {status}: {}",
                        body.trim()
                    )));
                }
                // Nodes may still be booting; only connection failures are retried.
                Err(e) if e.is_connect() && attempt < self.max_attempts => {
                    warn!(
                        "Init service not reachable yet (attempt {}/{}): {}",
                        attempt, self.max_attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => {
                    return Err(CcupError::Init(format!("request to {url} failed: {e}")));
                }
            }
        }
    }
}

#[async_trait]
impl Bootstrapper for HttpBootstrapper {
    async fn init(&self, state: &ClusterState) -> Result<ClusterState> {
        if state.cluster_values.is_initialized() {
            info!(
                "Cluster {} is already initialized, nothing to do",
                state.cluster_values.cluster_id
            );
            return Ok(state.clone());
        }
        if !state.has_infrastructure() {
            return Err(CcupError::Init(
                "no infrastructure recorded in state; run the infrastructure phase first"
                    .to_string(),
            ));
        }

        let url = init_url(&state.infrastructure.cluster_endpoint);
        let request = InitRequest {
            cluster_name: &state.infrastructure.name,
            init_secret: STANDARD.encode(&state.infrastructure.init_secret),
            kubernetes_version: &self.kubernetes_version,
            api_server_cert_sans: &state.infrastructure.api_server_cert_sans,
        };

        info!("Initializing cluster via {}", url);
        let response = self.send(&url, &request).await?;

        let next = apply_response(state, &response)?;
        let kubeconfig = STANDARD
            .decode(response.kubeconfig.as_bytes())
            .map_err(|e| CcupError::Init(format!("invalid kubeconfig encoding: {e}")))?;
        tokio::fs::write(&self.admin_conf, kubeconfig)
            .await
            .map_err(|e| {
                CcupError::Init(format!(
                    "failed to write {}: {e}",
                    self.admin_conf.display()
                ))
            })?;

        info!(
            "Cluster initialized (cluster ID: {}), kubeconfig written to {}",
            next.cluster_values.cluster_id,
            self.admin_conf.display()
        );
        Ok(next)
    }
}

fn init_url(endpoint: &str) -> String {
    if endpoint.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("https://[{endpoint}]:{INIT_PORT}/v1/init")
    } else {
        format!("https://{endpoint}:{INIT_PORT}/v1/init")
    }
}

fn apply_response(state: &ClusterState, response: &InitResponse) -> Result<ClusterState> {
    if response.cluster_id.is_empty() {
        return Err(CcupError::Init(
            "init service returned an empty cluster ID".to_string(),
        ));
    }
    let measurement_salt = STANDARD
        .decode(response.measurement_salt.as_bytes())
        .map_err(|e| CcupError::Init(format!("invalid measurement salt encoding: {e}")))?;

    let mut next = state.clone();
    next.cluster_values = ClusterValues {
        cluster_id: response.cluster_id.clone(),
        owner_id: response.owner_id.clone(),
        measurement_salt,
    };
    Ok(next)
}
