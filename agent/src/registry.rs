// SPDX-License-Identifier: MIT

use anyhow::{Context, Result, bail};
use crds::Registry;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use log::info;

use crate::builder;

const DEFAULT_SECRET_NAME: &str = "registry-credentials";
const DEFAULT_SECRET_NAMESPACE: &str = "stateful-migration";
const DEFAULT_REGISTRY: &str = "docker.io";

/// Registry credentials resolved from a Secret, cached for the process
/// lifetime.
pub struct RegistryClient {
    username: String,
    password: String,
    registry: String,
}

impl RegistryClient {
    pub async fn from_secret(client: &Client, config: &Registry) -> Result<Self> {
        let (secret_name, secret_namespace) = match &config.secret_ref {
            Some(secret_ref) => (
                secret_ref.name.as_str(),
                if secret_ref.namespace.is_empty() {
                    DEFAULT_SECRET_NAMESPACE
                } else {
                    secret_ref.namespace.as_str()
                },
            ),
            None => (DEFAULT_SECRET_NAME, DEFAULT_SECRET_NAMESPACE),
        };

        let secrets: Api<Secret> = Api::namespaced(client.clone(), secret_namespace);
        let secret = secrets.get(secret_name).await.with_context(|| {
            format!("get registry credentials secret {secret_namespace}/{secret_name}")
        })?;

        let data = secret
            .data
            .with_context(|| format!("no data in secret {secret_namespace}/{secret_name}"))?;
        let field = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .unwrap_or_default()
        };

        let username = field("username");
        let password = field("password");
        if username.is_empty() || password.is_empty() {
            bail!("registry credentials are empty in secret {secret_namespace}/{secret_name}");
        }

        // Config wins, then the secret's registry field, then Docker Hub.
        let mut registry = config.url.clone();
        if registry.is_empty() {
            registry = field("registry");
        }
        if registry.is_empty() {
            registry = DEFAULT_REGISTRY.to_string();
        }

        Ok(RegistryClient {
            username,
            password,
            registry,
        })
    }

    pub fn host(&self) -> &str {
        crds::naming::registry_host(&self.registry)
    }

    /// Log in and push a local image to `{host}/{image}`.
    pub async fn push_image(&self, image_name: &str) -> Result<()> {
        let host = self.host();
        builder::login(&self.username, &self.password, host)
            .await
            .with_context(|| format!("login to registry {host}"))?;

        let destination = format!("{host}/{image_name}");
        builder::push(image_name, &destination)
            .await
            .with_context(|| format!("push image {image_name} to {destination}"))?;
        info!("Pushed checkpoint image {destination}");
        Ok(())
    }
}
