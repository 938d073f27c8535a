// SPDX-License-Identifier: MIT

use anyhow::{Context, Result, bail};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const SERVICE_ACCOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const KUBELET_PORT: u16 = 10250;
const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(300);

/// Response envelope of the kubelet checkpoint endpoint.
#[derive(Debug, Deserialize)]
struct CheckpointResponse {
    #[serde(default)]
    items: Vec<String>,
}

/// Client for the node-local kubelet checkpoint API. The peer is the kubelet
/// on this node over loopback or the node IP, so certificate verification is
/// disabled.
pub struct KubeletClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl KubeletClient {
    pub fn new() -> Result<Self> {
        let token = fs::read_to_string(Path::new(SERVICE_ACCOUNT_PATH).join("token"))
            .context("read service account token")?;

        let host = env::var("NODE_IP").unwrap_or_else(|_| "localhost".to_string());
        let base_url = format!("https://{host}:{KUBELET_PORT}");

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(CHECKPOINT_TIMEOUT)
            .build()
            .context("build kubelet HTTP client")?;

        Ok(KubeletClient {
            http,
            token: token.trim().to_string(),
            base_url,
        })
    }

    /// Trigger a checkpoint of one container. Returns the artifact path
    /// relative to the checkpoint root, or `None` when the response body was
    /// unusable and the caller must fall back to scanning the directory.
    pub async fn create_checkpoint(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<Option<String>> {
        let url = format!(
            "{}/checkpoint/{namespace}/{pod}/{container}?timeout=300",
            self.base_url
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .context("call kubelet checkpoint API")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("read checkpoint response body")?;
        if !status.is_success() {
            bail!("kubelet checkpoint API returned {status}: {body}");
        }

        Ok(parse_checkpoint_body(&body))
    }
}

/// Extract the first checkpoint path from the response envelope. Malformed
/// bodies and empty item lists yield `None` rather than an error.
pub(crate) fn parse_checkpoint_body(body: &str) -> Option<String> {
    let response: CheckpointResponse = serde_json::from_str(body).ok()?;
    let first = response.items.into_iter().next()?;
    Some(crds::naming::relative_checkpoint_path(&first))
}
