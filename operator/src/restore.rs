// SPDX-License-Identifier: MIT

//! Restore orchestration: detect source clusters evicted from a workload's
//! resource binding, issue CheckpointRestores referencing the captured
//! images, and rewrite the federated manifest for Pod-kind workloads.

use anyhow::{Context, Result};
use crds::{
    BackupRef, CheckpointBackup, CheckpointRestore, CheckpointRestoreSpec, ContainerSpec,
    ResourceRef, StatefulMigration,
};
use ctrl_util::{ControllerError, controller_error_policy, controller_info, info_if_exists};
use futures_util::StreamExt;
use kube::api::{ListParams, ObjectMeta, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use log::{debug, info};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::federation::FederationClient;
use crate::karmada::{
    ClusterAffinity, Placement, PropagationPolicy, PropagationPolicySpec, ResourceBinding,
    ResourceSelector, Work,
};

/// Resource bindings live in the federation plane and cannot be watched from
/// here, so every migration is polled at this interval.
pub const RESTORE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub struct RestoreContext {
    pub client: Client,
    pub federation: FederationClient,
}

pub async fn launch_restore_controller(client: Client, federation: FederationClient) {
    let migrations: Api<StatefulMigration> = Api::all(client.clone());
    Controller::new(migrations, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            reconcile,
            controller_error_policy,
            Arc::new(RestoreContext { client, federation }),
        )
        .for_each(controller_info)
        .await;
}

async fn reconcile(
    migration: Arc<StatefulMigration>,
    ctx: Arc<RestoreContext>,
) -> Result<Action, ControllerError> {
    let name = ctrl_util::name_or_default(&migration.metadata);
    for cluster in &migration.spec.source_clusters {
        process_source_cluster(&ctx, &migration, cluster)
            .await
            .with_context(|| format!("process source cluster {cluster} for migration {name}"))?;
    }
    Ok(Action::requeue(RESTORE_CHECK_INTERVAL))
}

async fn process_source_cluster(
    ctx: &RestoreContext,
    migration: &StatefulMigration,
    source_cluster: &str,
) -> Result<()> {
    let spec = &migration.spec;

    let Some(binding) = find_resource_binding(&ctx.client, &spec.resource_ref).await? else {
        debug!(
            "No resource binding for {} yet, skipping cluster {source_cluster}",
            spec.resource_ref.name
        );
        return Ok(());
    };
    if binding_contains_cluster(&binding, source_cluster) {
        debug!("Source cluster {source_cluster} is still bound, no restore needed");
        return Ok(());
    }

    info!(
        "Source cluster {source_cluster} was evicted from binding {}, starting restore",
        ctrl_util::name_or_default(&binding.metadata)
    );

    let backups = find_checkpoint_backups(&ctx.client, &spec.resource_ref).await?;
    if backups.is_empty() {
        info!(
            "No checkpoint backups found for {}, nothing to restore",
            spec.resource_ref.name
        );
        return Ok(());
    }

    // The member cluster copy carries the agent-written status; prefer it
    // while the evicted cluster still answers.
    let mut refreshed = Vec::with_capacity(backups.len());
    for backup in backups {
        refreshed.push(refresh_backup(ctx, source_cluster, backup).await);
    }

    for backup in &refreshed {
        ensure_restore(ctx, migration, source_cluster, backup).await?;
    }

    if spec.resource_ref.kind == "Pod" {
        rewrite_bound_work(&ctx.client, &spec.resource_ref, &refreshed).await?;
    }
    Ok(())
}

async fn find_resource_binding(
    client: &Client,
    resource: &ResourceRef,
) -> Result<Option<ResourceBinding>> {
    let bindings: Api<ResourceBinding> = Api::all(client.clone());
    let list = bindings
        .list(&ListParams::default())
        .await
        .context("list resource bindings")?;
    Ok(list.into_iter().find(|b| binding_matches(b, resource)))
}

fn binding_matches(binding: &ResourceBinding, resource: &ResourceRef) -> bool {
    let bound = &binding.spec.resource;
    bound.api_version == resource.api_version
        && bound.kind == resource.kind
        && bound.name == resource.name
        && bound.namespace == resource.namespace
}

fn binding_contains_cluster(binding: &ResourceBinding, cluster: &str) -> bool {
    binding.spec.clusters.iter().any(|c| c.name == cluster)
}

async fn find_checkpoint_backups(
    client: &Client,
    resource: &ResourceRef,
) -> Result<Vec<CheckpointBackup>> {
    let backups: Api<CheckpointBackup> = Api::namespaced(client.clone(), &resource.namespace);
    let list = backups
        .list(&ListParams::default())
        .await
        .context("list checkpoint backups")?;
    Ok(list
        .into_iter()
        .filter(|b| {
            b.spec.resource_ref == *resource && b.spec.pod_ref.namespace == resource.namespace
        })
        .collect())
}

async fn refresh_backup(
    ctx: &RestoreContext,
    source_cluster: &str,
    backup: CheckpointBackup,
) -> CheckpointBackup {
    let namespace = backup.namespace().unwrap_or_default();
    let name = ctrl_util::name_or_default(&backup.metadata);
    match ctx.federation.get_backup(source_cluster, &namespace, &name).await {
        Ok(Some(member_copy)) => member_copy,
        Ok(None) => backup,
        Err(e) => {
            debug!("Could not refresh backup {name} from cluster {source_cluster}: {e:#}");
            backup
        }
    }
}

/// Container images to restore: explicitly requested images first, then
/// whatever the capture recorded.
fn restore_containers(backup: &CheckpointBackup) -> Vec<ContainerSpec> {
    let mut containers: Vec<ContainerSpec> = backup
        .spec
        .containers
        .iter()
        .filter(|c| !c.image.is_empty())
        .cloned()
        .collect();
    if let Some(status) = &backup.status {
        for image in &status.built_images {
            if containers.iter().any(|c| c.name == image.container_name) {
                continue;
            }
            containers.push(ContainerSpec {
                name: image.container_name.clone(),
                image: image.image_name.clone(),
            });
        }
    }
    containers
}

async fn ensure_restore(
    ctx: &RestoreContext,
    migration: &StatefulMigration,
    source_cluster: &str,
    backup: &CheckpointBackup,
) -> Result<()> {
    let namespace = backup.namespace().context("backup has no namespace")?;
    let backup_name = ctrl_util::name_or_default(&backup.metadata);
    let restore_name = crds::naming::restore_name(&backup_name);
    let restores: Api<CheckpointRestore> = Api::namespaced(ctx.client.clone(), &namespace);

    if restores
        .get_opt(&restore_name)
        .await
        .context("check existing restore")?
        .is_none()
    {
        let restore = CheckpointRestore {
            metadata: ObjectMeta {
                name: Some(restore_name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(BTreeMap::from([
                    (crds::RESTORE_LABEL.to_string(), "true".to_string()),
                    (crds::BACKUP_LABEL.to_string(), backup_name.clone()),
                ])),
                ..Default::default()
            },
            spec: CheckpointRestoreSpec {
                backup_ref: BackupRef {
                    name: backup_name.clone(),
                },
                pod_name: backup.spec.pod_ref.name.clone(),
                pod_generate_name: String::new(),
                containers: restore_containers(backup),
                default_image: String::new(),
            },
        };
        let create = restores.create(&PostParams::default(), &restore).await;
        info_if_exists!(create, "CheckpointRestore", restore_name);
    } else {
        debug!("CheckpointRestore {restore_name} already exists");
    }

    ensure_restore_policy(ctx, migration, source_cluster, &restore_name, &namespace).await
}

async fn ensure_restore_policy(
    ctx: &RestoreContext,
    migration: &StatefulMigration,
    source_cluster: &str,
    restore_name: &str,
    namespace: &str,
) -> Result<()> {
    let target = choose_target_cluster(&migration.spec.source_clusters, source_cluster)
        .context("no target cluster available for restore")?;
    let policy_name = format!("{restore_name}-restore-policy");

    let desired_spec = PropagationPolicySpec {
        resource_selectors: vec![ResourceSelector {
            api_version: "migration.statemig.io/v1".to_string(),
            kind: "CheckpointRestore".to_string(),
            namespace: String::new(),
            name: restore_name.to_string(),
        }],
        placement: Placement {
            cluster_affinity: Some(ClusterAffinity {
                cluster_names: vec![target.to_string()],
            }),
        },
    };

    let policies: Api<PropagationPolicy> = Api::namespaced(ctx.client.clone(), namespace);
    match policies
        .get_opt(&policy_name)
        .await
        .context("check existing propagation policy")?
    {
        Some(mut existing) => {
            if existing.spec != desired_spec {
                existing.spec = desired_spec;
                policies
                    .replace(&policy_name, &PostParams::default(), &existing)
                    .await
                    .context("update restore propagation policy")?;
                info!("Updated PropagationPolicy {policy_name} to target {target}");
            }
        }
        None => {
            let policy = PropagationPolicy {
                metadata: ObjectMeta {
                    name: Some(policy_name.clone()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: desired_spec,
            };
            let create = policies.create(&PostParams::default(), &policy).await;
            info_if_exists!(create, "PropagationPolicy", policy_name);
        }
    }
    Ok(())
}

/// First surviving cluster other than the one that was evicted.
fn choose_target_cluster<'a>(source_clusters: &'a [String], removed: &str) -> Option<&'a str> {
    source_clusters
        .iter()
        .map(String::as_str)
        .find(|cluster| *cluster != removed)
}

/// Rewrite the Work manifest carrying a Pod-kind workload so replacement
/// pods boot from the captured images.
async fn rewrite_bound_work(
    client: &Client,
    resource: &ResourceRef,
    backups: &[CheckpointBackup],
) -> Result<()> {
    let images = captured_images(backups);
    if images.is_empty() {
        info!(
            "No captured images recorded for {}, skipping work rewrite",
            resource.name
        );
        return Ok(());
    }

    let works: Api<Work> = Api::all(client.clone());
    let list = works.list(&ListParams::default()).await.context("list works")?;
    let Some(work) = list.into_iter().find(|w| work_carries_resource(w, resource)) else {
        info!("No Work found carrying pod {}, skipping rewrite", resource.name);
        return Ok(());
    };
    let work_name = ctrl_util::name_or_default(&work.metadata);
    let work_namespace = work.namespace().context("work has no namespace")?;

    let mut work = work;
    let mut changed = false;
    for manifest in &mut work.spec.workload.manifests {
        changed |= rewrite_pod_manifest(manifest, &images);
    }
    if !changed {
        debug!("Work {work_name} already carries the checkpoint images");
        return Ok(());
    }

    let namespaced: Api<Work> = Api::namespaced(client.clone(), &work_namespace);
    namespaced
        .replace(&work_name, &PostParams::default(), &work)
        .await
        .with_context(|| format!("update work {work_name}"))?;
    info!("Rewrote container images in Work {work_name}");
    Ok(())
}

fn captured_images(backups: &[CheckpointBackup]) -> BTreeMap<String, String> {
    let mut images = BTreeMap::new();
    for backup in backups {
        for container in restore_containers(backup) {
            images.entry(container.name).or_insert(container.image);
        }
    }
    images
}

fn work_carries_resource(work: &Work, resource: &ResourceRef) -> bool {
    work.spec
        .workload
        .manifests
        .iter()
        .any(|manifest| manifest_matches(manifest, resource))
}

fn manifest_matches(manifest: &Value, resource: &ResourceRef) -> bool {
    manifest["apiVersion"] == resource.api_version.as_str()
        && manifest["kind"] == resource.kind.as_str()
        && manifest["metadata"]["name"] == resource.name.as_str()
        && manifest["metadata"]["namespace"] == resource.namespace.as_str()
}

/// Replace container images in a Pod manifest. Only containers present in
/// the map change; everything else is untouched.
fn rewrite_pod_manifest(manifest: &mut Value, images: &BTreeMap<String, String>) -> bool {
    if manifest["kind"] != "Pod" || manifest["apiVersion"] != "v1" {
        return false;
    }
    let Some(containers) = manifest
        .pointer_mut("/spec/containers")
        .and_then(Value::as_array_mut)
    else {
        return false;
    };

    let mut changed = false;
    for container in containers {
        let Some(target) = container
            .get("name")
            .and_then(Value::as_str)
            .and_then(|name| images.get(name))
            .cloned()
        else {
            continue;
        };
        if container["image"] != target.as_str() {
            container["image"] = Value::String(target);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::karmada::{BoundResource, ResourceBindingSpec, TargetCluster};
    use crds::{
        BuiltImage, CheckpointBackupSpec, CheckpointBackupStatus, PodRef,
    };
    use serde_json::json;

    fn pod_resource() -> ResourceRef {
        ResourceRef {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            namespace: "t".to_string(),
            name: "p".to_string(),
        }
    }

    fn binding(clusters: &[&str]) -> ResourceBinding {
        ResourceBinding {
            metadata: ObjectMeta::default(),
            spec: ResourceBindingSpec {
                resource: BoundResource {
                    api_version: "v1".to_string(),
                    kind: "Pod".to_string(),
                    namespace: "t".to_string(),
                    name: "p".to_string(),
                },
                clusters: clusters
                    .iter()
                    .map(|name| TargetCluster {
                        name: name.to_string(),
                        replicas: None,
                    })
                    .collect(),
            },
        }
    }

    fn backup_with_captures(spec_images: &[(&str, &str)], built: &[(&str, &str)]) -> CheckpointBackup {
        CheckpointBackup {
            metadata: ObjectMeta {
                name: Some("cb1".to_string()),
                namespace: Some("t".to_string()),
                ..Default::default()
            },
            spec: CheckpointBackupSpec {
                schedule: "immediately".to_string(),
                stop_pod: None,
                pod_ref: PodRef {
                    namespace: "t".to_string(),
                    name: "p".to_string(),
                },
                resource_ref: pod_resource(),
                registry: None,
                containers: spec_images
                    .iter()
                    .map(|(name, image)| ContainerSpec {
                        name: name.to_string(),
                        image: image.to_string(),
                    })
                    .collect(),
            },
            status: Some(CheckpointBackupStatus {
                built_images: built
                    .iter()
                    .map(|(name, image)| BuiltImage {
                        container_name: name.to_string(),
                        image_name: image.to_string(),
                        build_time: None,
                        pushed: true,
                    })
                    .collect(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn eviction_is_detected_from_binding_clusters() {
        assert!(binding_contains_cluster(&binding(&["c1", "c2"]), "c1"));
        assert!(!binding_contains_cluster(&binding(&["c2"]), "c1"));
        assert!(binding_matches(&binding(&["c2"]), &pod_resource()));
    }

    #[test]
    fn restore_containers_prefer_spec_then_captures() {
        let backup = backup_with_captures(
            &[("web", "reg.example/override:1")],
            &[("web", "reg.example/ckpt/web:abc"), ("db", "reg.example/ckpt/db:def")],
        );
        let containers = restore_containers(&backup);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "web");
        assert_eq!(containers[0].image, "reg.example/override:1");
        assert_eq!(containers[1].name, "db");
        assert_eq!(containers[1].image, "reg.example/ckpt/db:def");
    }

    #[test]
    fn target_cluster_skips_the_evicted_one() {
        let clusters = vec!["c1".to_string(), "c2".to_string()];
        assert_eq!(choose_target_cluster(&clusters, "c1"), Some("c2"));
        assert_eq!(choose_target_cluster(&clusters, "c2"), Some("c1"));
        assert_eq!(choose_target_cluster(&clusters[..1].to_vec(), "c1"), None);
    }

    #[test]
    fn pod_manifest_rewrite_replaces_matching_images() {
        let mut manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p", "namespace": "t"},
            "spec": {"containers": [
                {"name": "web", "image": "nginx:1.25"},
                {"name": "sidecar", "image": "envoy:1.30"},
            ]}
        });
        let images = BTreeMap::from([(
            "web".to_string(),
            "reg.example/ckpt/web:abc".to_string(),
        )]);

        assert!(rewrite_pod_manifest(&mut manifest, &images));
        assert_eq!(
            manifest["spec"]["containers"][0]["image"],
            "reg.example/ckpt/web:abc"
        );
        assert_eq!(manifest["spec"]["containers"][1]["image"], "envoy:1.30");

        // A second pass changes nothing.
        assert!(!rewrite_pod_manifest(&mut manifest, &images));
    }

    #[test]
    fn non_pod_manifests_are_untouched() {
        let mut manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {"name": "db", "namespace": "t"},
        });
        let images = BTreeMap::from([("web".to_string(), "x".to_string())]);
        assert!(!rewrite_pod_manifest(&mut manifest, &images));
    }

    #[test]
    fn manifest_matching_requires_full_identity() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p", "namespace": "t"},
        });
        assert!(manifest_matches(&manifest, &pod_resource()));

        let other = ResourceRef {
            name: "other".to_string(),
            ..pod_resource()
        };
        assert!(!manifest_matches(&manifest, &other));
    }
}
