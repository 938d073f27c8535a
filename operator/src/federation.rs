// SPDX-License-Identifier: MIT

//! Access to member clusters through the federation plane's aggregated-API
//! proxy. Every call is a plain API request with a cluster-scoped path
//! prefix, so no per-cluster kubeconfig is needed.

use anyhow::{Context, Result, bail};
use crds::{CheckpointBackup, ResourceRef};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::Client;
use log::debug;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

#[derive(Clone)]
pub struct FederationClient {
    client: Client,
}

impl FederationClient {
    pub fn new(client: Client) -> Self {
        FederationClient { client }
    }

    fn proxy_base(cluster: &str) -> String {
        format!("/apis/cluster.karmada.io/v1alpha1/clusters/{cluster}/proxy")
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> kube::Result<T> {
        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(kube::Error::HttpError)?;
        self.client.request(request).await
    }

    async fn get_json_opt<T: DeserializeOwned>(&self, path: &str) -> kube::Result<Option<T>> {
        match self.get_json(path).await {
            Ok(value) => Ok(Some(value)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get_pod(&self, cluster: &str, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let path = format!(
            "{}/api/v1/namespaces/{namespace}/pods/{name}",
            Self::proxy_base(cluster)
        );
        self.get_json_opt(&path)
            .await
            .with_context(|| format!("get pod {namespace}/{name} from cluster {cluster}"))
    }

    pub async fn list_pods(
        &self,
        cluster: &str,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>> {
        let mut path = format!(
            "{}/api/v1/namespaces/{namespace}/pods",
            Self::proxy_base(cluster)
        );
        if !label_selector.is_empty() {
            path = format!("{path}?labelSelector={label_selector}");
        }
        let list: k8s_openapi::List<Pod> = self
            .get_json(&path)
            .await
            .with_context(|| format!("list pods from cluster {cluster}/{namespace}"))?;
        debug!(
            "Listed {} pods from cluster {cluster}/{namespace}",
            list.items.len()
        );
        Ok(list.items)
    }

    pub async fn get_statefulset(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>> {
        let path = format!(
            "{}/apis/apps/v1/namespaces/{namespace}/statefulsets/{name}",
            Self::proxy_base(cluster)
        );
        self.get_json_opt(&path)
            .await
            .with_context(|| format!("get statefulset {namespace}/{name} from cluster {cluster}"))
    }

    pub async fn get_deployment(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>> {
        let path = format!(
            "{}/apis/apps/v1/namespaces/{namespace}/deployments/{name}",
            Self::proxy_base(cluster)
        );
        self.get_json_opt(&path)
            .await
            .with_context(|| format!("get deployment {namespace}/{name} from cluster {cluster}"))
    }

    /// Member-cluster copy of a propagated CheckpointBackup, carrying the
    /// node agent's status.
    pub async fn get_backup(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CheckpointBackup>> {
        let path = format!(
            "{}/apis/migration.statemig.io/v1/namespaces/{namespace}/checkpointbackups/{name}",
            Self::proxy_base(cluster)
        );
        self.get_json_opt(&path)
            .await
            .with_context(|| format!("get backup {namespace}/{name} from cluster {cluster}"))
    }

    /// Resolve the pods backing a workload on one member cluster. A missing
    /// workload yields an empty list; an unsupported kind is an error.
    pub async fn workload_pods(&self, cluster: &str, resource: &ResourceRef) -> Result<Vec<Pod>> {
        match resource.kind.as_str() {
            "Pod" => Ok(self
                .get_pod(cluster, &resource.namespace, &resource.name)
                .await?
                .into_iter()
                .collect()),
            "StatefulSet" => {
                let Some(sts) = self
                    .get_statefulset(cluster, &resource.namespace, &resource.name)
                    .await?
                else {
                    return Ok(Vec::new());
                };
                let selector = sts.spec.map(|s| s.selector).unwrap_or_default();
                self.list_selected(cluster, resource, selector).await
            }
            "Deployment" => {
                let Some(deployment) = self
                    .get_deployment(cluster, &resource.namespace, &resource.name)
                    .await?
                else {
                    return Ok(Vec::new());
                };
                let selector = deployment.spec.map(|s| s.selector).unwrap_or_default();
                self.list_selected(cluster, resource, selector).await
            }
            other => bail!("unsupported workload kind {other} for checkpoint backup"),
        }
    }

    async fn list_selected(
        &self,
        cluster: &str,
        resource: &ResourceRef,
        selector: LabelSelector,
    ) -> Result<Vec<Pod>> {
        let labels = selector.match_labels.with_context(|| {
            format!(
                "workload {}/{} has no matchLabels selector",
                resource.namespace, resource.name
            )
        })?;
        self.list_pods(cluster, &resource.namespace, &selector_string(&labels))
            .await
    }
}

pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_string_joins_sorted_pairs() {
        let labels = BTreeMap::from([
            ("app".to_string(), "db".to_string()),
            ("tier".to_string(), "backend".to_string()),
        ]);
        assert_eq!(selector_string(&labels), "app=db,tier=backend");
        assert_eq!(selector_string(&BTreeMap::new()), "");
    }
}
