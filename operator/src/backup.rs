// SPDX-License-Identifier: MIT

//! Backup orchestration: expand a StatefulMigration into one
//! CheckpointBackup per backing pod on each source cluster, propagated to
//! the cluster that owns the pod.

use anyhow::{Context, Result};
use crds::{
    CheckpointBackup, CheckpointBackupSpec, PodRef, StatefulMigration, StatefulMigrationSpec,
};
use ctrl_util::{ControllerError, controller_error_policy, controller_info, info_if_exists};
use futures_util::StreamExt;
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client};
use log::{debug, error, info};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::federation::FederationClient;
use crate::karmada::{
    ClusterAffinity, Placement, PropagationPolicy, PropagationPolicySpec, ResourceSelector,
};

/// Pods behind a workload come and go without touching the migration spec,
/// so the expansion is re-run periodically.
const BACKUP_SYNC_INTERVAL: Duration = Duration::from_secs(300);

pub struct BackupContext {
    pub client: Client,
    pub federation: FederationClient,
}

pub async fn launch_backup_controller(client: Client, federation: FederationClient) {
    let migrations: Api<StatefulMigration> = Api::all(client.clone());
    Controller::new(migrations, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            reconcile,
            controller_error_policy,
            Arc::new(BackupContext { client, federation }),
        )
        .for_each(controller_info)
        .await;
}

async fn reconcile(
    migration: Arc<StatefulMigration>,
    ctx: Arc<BackupContext>,
) -> Result<Action, ControllerError> {
    let name = ctrl_util::name_or_default(&migration.metadata);
    let spec = &migration.spec;
    debug!(
        "Expanding migration {name} for workload {}/{} across {} clusters",
        spec.resource_ref.namespace,
        spec.resource_ref.name,
        spec.source_clusters.len()
    );

    let mut synced_any = false;
    let mut last_error = None;
    for cluster in &spec.source_clusters {
        match sync_cluster(&ctx, &name, spec, cluster).await {
            Ok(()) => synced_any = true,
            Err(e) => {
                error!("Failed to sync migration {name} on cluster {cluster}: {e:#}");
                last_error = Some(e);
            }
        }
    }
    // One reachable cluster is enough to make progress; a fully failed pass
    // surfaces the error so the reconciler retries with backoff.
    if !synced_any {
        if let Some(e) = last_error {
            return Err(e.into());
        }
    }

    Ok(Action::requeue(BACKUP_SYNC_INTERVAL))
}

async fn sync_cluster(
    ctx: &BackupContext,
    migration_name: &str,
    spec: &StatefulMigrationSpec,
    cluster: &str,
) -> Result<()> {
    let namespace = &spec.resource_ref.namespace;
    let pods = ctx.federation.workload_pods(cluster, &spec.resource_ref).await?;
    debug!(
        "Workload {} backs {} pods on cluster {cluster}",
        spec.resource_ref.name,
        pods.len()
    );

    let backups: Api<CheckpointBackup> = Api::namespaced(ctx.client.clone(), namespace);
    let policies: Api<PropagationPolicy> = Api::namespaced(ctx.client.clone(), namespace);

    let mut desired = BTreeSet::new();
    for pod in &pods {
        let Some(pod_name) = pod.metadata.name.as_deref() else {
            continue;
        };
        let backup_name = crds::naming::backup_name(migration_name, pod_name)?;
        ensure_backup(
            &backups,
            migration_name,
            &backup_name,
            spec,
            cluster,
            pod_name,
        )
        .await?;
        ensure_backup_policy(&policies, &backup_name, namespace, cluster).await?;
        desired.insert(backup_name);
    }

    prune_orphans(&backups, &policies, migration_name, cluster, &desired).await
}

fn desired_backup(
    migration_name: &str,
    backup_name: &str,
    spec: &StatefulMigrationSpec,
    cluster: &str,
    pod_name: &str,
) -> CheckpointBackup {
    CheckpointBackup {
        metadata: ObjectMeta {
            name: Some(backup_name.to_string()),
            namespace: Some(spec.resource_ref.namespace.clone()),
            labels: Some(BTreeMap::from([
                (crds::OWNER_LABEL.to_string(), migration_name.to_string()),
                (crds::CLUSTER_LABEL.to_string(), cluster.to_string()),
            ])),
            ..Default::default()
        },
        spec: CheckpointBackupSpec {
            schedule: spec.schedule.clone(),
            stop_pod: None,
            pod_ref: PodRef {
                namespace: spec.resource_ref.namespace.clone(),
                name: pod_name.to_string(),
            },
            resource_ref: spec.resource_ref.clone(),
            registry: spec.registry.clone(),
            containers: Vec::new(),
        },
        status: None,
    }
}

async fn ensure_backup(
    backups: &Api<CheckpointBackup>,
    migration_name: &str,
    backup_name: &str,
    spec: &StatefulMigrationSpec,
    cluster: &str,
    pod_name: &str,
) -> Result<()> {
    let backup = desired_backup(migration_name, backup_name, spec, cluster, pod_name);
    let create = backups.create(&PostParams::default(), &backup).await;
    info_if_exists!(create, "CheckpointBackup", backup_name);
    Ok(())
}

async fn ensure_backup_policy(
    policies: &Api<PropagationPolicy>,
    backup_name: &str,
    namespace: &str,
    cluster: &str,
) -> Result<()> {
    let policy_name = format!("{backup_name}-policy");
    let policy = PropagationPolicy {
        metadata: ObjectMeta {
            name: Some(policy_name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: PropagationPolicySpec {
            resource_selectors: vec![ResourceSelector {
                api_version: "migration.statemig.io/v1".to_string(),
                kind: "CheckpointBackup".to_string(),
                namespace: String::new(),
                name: backup_name.to_string(),
            }],
            placement: Placement {
                cluster_affinity: Some(ClusterAffinity {
                    cluster_names: vec![cluster.to_string()],
                }),
            },
        },
    };
    let create = policies.create(&PostParams::default(), &policy).await;
    info_if_exists!(create, "PropagationPolicy", policy_name);
    Ok(())
}

/// Delete backups whose pods no longer exist; their finalizer runs the node
/// agent's cleanup on the member cluster.
async fn prune_orphans(
    backups: &Api<CheckpointBackup>,
    policies: &Api<PropagationPolicy>,
    migration_name: &str,
    cluster: &str,
    desired: &BTreeSet<String>,
) -> Result<()> {
    let selector = format!(
        "{}={migration_name},{}={cluster}",
        crds::OWNER_LABEL,
        crds::CLUSTER_LABEL
    );
    let owned = backups
        .list(&ListParams::default().labels(&selector))
        .await
        .context("list owned backups")?;

    for backup in owned {
        let name = ctrl_util::name_or_default(&backup.metadata);
        if desired.contains(&name) {
            continue;
        }
        info!("Pod behind CheckpointBackup {name} is gone, deleting");
        match backups.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e).context(format!("delete orphaned backup {name}")),
        }
        let policy_name = format!("{name}-policy");
        match policies.delete(&policy_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e).context(format!("delete propagation policy {policy_name}")),
        }
    }
    Ok(())
}
