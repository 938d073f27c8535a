// SPDX-License-Identifier: MIT

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use cron::Schedule;
use crds::{
    CheckpointBackup, CheckpointBackupSpec, CheckpointPhase, ContainerSpec, Registry,
};
use ctrl_util::ControllerError;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::artifact;
use crate::builder;
use crate::kubelet::KubeletClient;
use crate::registry::RegistryClient;
use crate::scheduler::CheckpointScheduler;
use crate::status;

const RESYNC_INTERVAL: Duration = Duration::from_secs(3600);

/// Shared state of one agent process, bound to a single node identity.
pub struct AgentContext {
    pub client: Client,
    pub node_name: String,
    pub kubelet: KubeletClient,
    pub scheduler: CheckpointScheduler,
    pub checkpoint_root: PathBuf,
    registry: tokio::sync::Mutex<Option<Arc<RegistryClient>>>,
    in_flight: Mutex<HashSet<String>>,
}

impl AgentContext {
    pub fn new(client: Client, node_name: String) -> Result<Self> {
        Ok(AgentContext {
            client,
            node_name,
            kubelet: KubeletClient::new()?,
            scheduler: CheckpointScheduler::new(),
            checkpoint_root: PathBuf::from(crds::CHECKPOINT_BASE_PATH),
            registry: tokio::sync::Mutex::new(None),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Registry credentials are parsed once and cached for the process
    /// lifetime.
    async fn registry_client(&self, config: &Registry) -> Result<Arc<RegistryClient>> {
        let mut cached = self.registry.lock().await;
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }
        let client = Arc::new(RegistryClient::from_secret(&self.client, config).await?);
        *cached = Some(client.clone());
        Ok(client)
    }

    fn begin(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .insert(key.to_string())
    }

    fn finish(&self, key: &str) {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(key);
    }
}

fn phase(backup: &CheckpointBackup) -> Option<CheckpointPhase> {
    backup.status.as_ref().and_then(|s| s.phase)
}

pub async fn reconcile(
    backup: Arc<CheckpointBackup>,
    ctx: Arc<AgentContext>,
) -> Result<Action, ControllerError> {
    let name = ctrl_util::name_or_default(&backup.metadata);
    let namespace = backup
        .namespace()
        .with_context(|| format!("CheckpointBackup {name} has no namespace"))?;
    let key = format!("{namespace}/{name}");
    let api: Api<CheckpointBackup> = Api::namespaced(ctx.client.clone(), &namespace);

    // Deletion runs before the residency gate so requests whose pod is
    // already gone can still be finalized.
    if backup.metadata.deletion_timestamp.is_some() {
        ctx.scheduler.remove(&key);
        remove_finalizer(&api, &backup, &name).await?;
        info!("Cleaned up CheckpointBackup {key}");
        return Ok(Action::await_change());
    }

    if phase(&backup) == Some(CheckpointPhase::CompletedPodDeleted) {
        debug!("Pod for {key} was already deleted after checkpoint, nothing to do");
        return Ok(Action::await_change());
    }

    // Only the agent on the pod's node acts on a request; every other agent
    // observes it without writing anything.
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &backup.spec.pod_ref.namespace);
    let pod = pods.get_opt(&backup.spec.pod_ref.name).await?;
    let resident = pod
        .as_ref()
        .and_then(|p| p.spec.as_ref())
        .and_then(|s| s.node_name.as_deref())
        == Some(ctx.node_name.as_str());
    if !resident {
        debug!(
            "Pod {} is not on node {}, skipping {key}",
            backup.spec.pod_ref.name, ctx.node_name
        );
        return Ok(Action::await_change());
    }

    ensure_finalizer(&api, &backup, &name).await?;

    if backup.spec.schedule == crds::SCHEDULE_IMMEDIATELY {
        if phase(&backup).is_none() {
            info!("Starting immediate checkpoint for {key}");
            perform_checkpoint(&ctx, &namespace, &name).await?;
        } else {
            debug!(
                "Immediate checkpoint for {key} already processed (phase {:?})",
                phase(&backup)
            );
        }
        return Ok(Action::await_change());
    }

    let schedule = Schedule::from_str(&crds::naming::normalize_cron(&backup.spec.schedule))
        .with_context(|| format!("parse cron schedule {:?} for {key}", backup.spec.schedule))?;

    let job_ctx = ctx.clone();
    let job_namespace = namespace.clone();
    let job_name = name.clone();
    ctx.scheduler.replace(&key, schedule, move || {
        let ctx = job_ctx.clone();
        let namespace = job_namespace.clone();
        let name = job_name.clone();
        Box::pin(async move {
            if let Err(e) = perform_checkpoint(&ctx, &namespace, &name).await {
                error!("Scheduled checkpoint for {namespace}/{name} failed: {e:#}");
            }
        })
    });
    info!(
        "Scheduled checkpoint job for {key} ({})",
        backup.spec.schedule
    );

    // The first reconcile of a cron request also captures immediately.
    let never_captured = backup
        .status
        .as_ref()
        .and_then(|s| s.last_checkpoint_time.as_ref())
        .is_none();
    if never_captured {
        perform_checkpoint(&ctx, &namespace, &name).await?;
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Run the capture pipeline once. Concurrent invocations for the same
/// request (a cron fire racing an event-driven reconcile) collapse into one.
pub async fn perform_checkpoint(
    ctx: &Arc<AgentContext>,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let key = format!("{namespace}/{name}");
    if !ctx.begin(&key) {
        info!("Checkpoint for {key} already in flight, skipping duplicate");
        return Ok(());
    }
    let result = run_pipeline(ctx, namespace, name).await;
    ctx.finish(&key);
    result
}

async fn run_pipeline(ctx: &Arc<AgentContext>, namespace: &str, name: &str) -> Result<()> {
    let key = format!("{namespace}/{name}");
    let api: Api<CheckpointBackup> = Api::namespaced(ctx.client.clone(), namespace);

    let Some(mut backup) = api.get_opt(name).await.context("get backup")? else {
        ctx.scheduler.remove(&key);
        return Ok(());
    };

    if let Some(current) = phase(&backup) {
        if current.blocks_recapture() {
            info!("Checkpoint {key} already in phase {current:?}, skipping");
            return Ok(());
        }
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &backup.spec.pod_ref.namespace);
    let Some(pod) = pods
        .get_opt(&backup.spec.pod_ref.name)
        .await
        .context("get pod")?
    else {
        info!(
            "Pod {} not found, skipping checkpoint for {key}",
            backup.spec.pod_ref.name
        );
        return Ok(());
    };
    let running = pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running");
    if !running {
        info!(
            "Pod {} is not running, skipping checkpoint for {key}",
            backup.spec.pod_ref.name
        );
        return Ok(());
    }

    let registry = match &backup.spec.registry {
        Some(config) => Some(ctx.registry_client(config).await?),
        None => None,
    };

    info!("Starting checkpoint operation for {key}");
    let containers = containers_to_process(&backup.spec, &pod);
    for container in &containers {
        backup =
            checkpoint_container(ctx, &api, backup, &pod, container, registry.as_deref()).await?;
    }

    backup = status::mutate_status(&api, name, |s| {
        s.phase = Some(CheckpointPhase::Completed);
        s.message = "All containers checkpointed successfully".to_string();
        s.last_checkpoint_time = Some(Time(Utc::now()));
        true
    })
    .await
    .context("mark backup completed")?;

    if backup.spec.stop_pod.unwrap_or(false) {
        stop_pod(ctx, &api, &pods, namespace, name, &backup.spec.pod_ref.name).await?;
    }

    info!("Completed checkpoint operation for {key}");
    Ok(())
}

async fn stop_pod(
    ctx: &Arc<AgentContext>,
    api: &Api<CheckpointBackup>,
    pods: &Api<Pod>,
    namespace: &str,
    name: &str,
    pod_name: &str,
) -> Result<()> {
    info!("StopPod is set, deleting pod {pod_name} after checkpoint");
    match pods.delete(pod_name, &DeleteParams::default()).await {
        Ok(_) => {
            // No further captures once the pod is gone.
            ctx.scheduler.remove(&format!("{namespace}/{name}"));
            status::update_phase(
                api,
                name,
                CheckpointPhase::CompletedPodDeleted,
                "Checkpoint completed and pod deleted successfully",
            )
            .await
            .context("record pod deletion")?;
            info!("Deleted pod {pod_name} after checkpoint");
            Ok(())
        }
        Err(e) => {
            let message = format!("Checkpoint completed but failed to delete pod: {e}");
            if let Err(update_err) =
                status::update_phase(api, name, CheckpointPhase::CompletedWithError, message).await
            {
                error!("Failed to record pod deletion error: {update_err:#}");
            }
            Err(anyhow::Error::from(e).context(format!("delete pod {pod_name}")))
        }
    }
}

/// Containers the pipeline operates on. An empty list with no registry means
/// every container in the pod, each getting a synthesized local image name.
fn containers_to_process(spec: &CheckpointBackupSpec, pod: &Pod) -> Vec<ContainerSpec> {
    if !spec.containers.is_empty() {
        return spec.containers.clone();
    }
    if spec.registry.is_some() {
        return Vec::new();
    }
    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .map(|c| ContainerSpec {
            name: c.name.clone(),
            image: String::new(),
        })
        .collect()
}

fn container_base_image(pod: &Pod, container_name: &str) -> Option<String> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container_name)
        .and_then(|c| c.image.clone())
}

async fn checkpoint_container(
    ctx: &Arc<AgentContext>,
    api: &Api<CheckpointBackup>,
    mut backup: CheckpointBackup,
    pod: &Pod,
    container: &ContainerSpec,
    registry: Option<&RegistryClient>,
) -> Result<CheckpointBackup> {
    let name = ctrl_util::name_or_default(&backup.metadata);
    let container_name = container.name.as_str();
    let pod_namespace = backup.spec.pod_ref.namespace.clone();
    let pod_name = backup.spec.pod_ref.name.clone();
    info!("Checkpointing container {container_name} of pod {pod_name}");

    // Resume: a recorded artifact still on disk is reused; a recorded image
    // without an artifact means this container already finished.
    let mut checkpoint_rel: Option<String> = None;
    if let Some(current) = &backup.status {
        if let Some(existing) = current
            .checkpoint_files
            .iter()
            .find(|f| f.container_name == container_name)
        {
            if ctx.checkpoint_root.join(&existing.file_path).exists() {
                info!(
                    "Reusing checkpoint artifact {} for container {container_name}",
                    existing.file_path
                );
                checkpoint_rel = Some(existing.file_path.clone());
            } else if current
                .built_images
                .iter()
                .any(|i| i.container_name == container_name)
            {
                info!("Image already built for container {container_name}, nothing to do");
                return Ok(backup);
            } else {
                info!(
                    "Recorded artifact {} is gone, recreating checkpoint",
                    existing.file_path
                );
            }
        }
    }

    if checkpoint_rel.is_none() {
        if let Some(updated) = advance_phase(
            api,
            &name,
            CheckpointPhase::Checkpointing,
            format!("Creating checkpoint for container {container_name}"),
        )
        .await
        {
            backup = updated;
        }

        let candidate = match ctx
            .kubelet
            .create_checkpoint(&pod_namespace, &pod_name, container_name)
            .await
        {
            Ok(candidate) => candidate,
            Err(e) => {
                fail(api, &name, format!("Failed to create checkpoint: {e:#}")).await;
                return Err(e.context(format!("checkpoint container {container_name}")));
            }
        };

        let resolved = match artifact::resolve_checkpoint_artifact(
            &ctx.checkpoint_root,
            &pod_namespace,
            &pod_name,
            container_name,
            candidate,
        ) {
            Ok(path) => path,
            Err(e) => {
                fail(
                    api,
                    &name,
                    format!("Failed to locate checkpoint artifact: {e:#}"),
                )
                .await;
                return Err(e);
            }
        };

        match status::record_checkpoint_file(api, &name, container_name, &resolved).await {
            Ok(updated) => backup = updated,
            Err(e) => warn!("Failed to record checkpoint file {resolved}: {e:#}"),
        }
        if let Some(updated) = advance_phase(
            api,
            &name,
            CheckpointPhase::Checkpointed,
            format!("Checkpoint created for container {container_name}: {resolved}"),
        )
        .await
        {
            backup = updated;
        }
        checkpoint_rel = Some(resolved);
    }

    // The artifact may have moved under us between reconciles; verify again.
    let checkpoint_rel = match artifact::resolve_checkpoint_artifact(
        &ctx.checkpoint_root,
        &pod_namespace,
        &pod_name,
        container_name,
        checkpoint_rel,
    ) {
        Ok(path) => path,
        Err(e) => {
            fail(
                api,
                &name,
                format!("Failed to locate checkpoint artifact: {e:#}"),
            )
            .await;
            return Err(e);
        }
    };
    let checkpoint_path = ctx.checkpoint_root.join(&checkpoint_rel);

    let Some(base_image) = container_base_image(pod, container_name) else {
        let message = format!("could not find base image for container {container_name}");
        fail(api, &name, message.clone()).await;
        return Err(anyhow!(message));
    };

    let image_name = if registry.is_some() && !container.image.is_empty() {
        container.image.clone()
    } else {
        crds::naming::local_image_name(&pod_name, container_name, Utc::now())
    };

    if let Some(updated) = advance_phase(
        api,
        &name,
        CheckpointPhase::ImageBuilding,
        format!("Building checkpoint image for container {container_name}"),
    )
    .await
    {
        backup = updated;
    }

    if let Err(e) = builder::build_checkpoint_image(&checkpoint_path, &image_name, &base_image).await
    {
        fail(api, &name, format!("Failed to build image: {e:#}")).await;
        return Err(e.context(format!("build checkpoint image {image_name}")));
    }

    if let Some(updated) = advance_phase(
        api,
        &name,
        CheckpointPhase::ImageBuilt,
        format!("Image built successfully for container {container_name}: {image_name}"),
    )
    .await
    {
        backup = updated;
    }

    let mut pushed = false;
    if let Some(registry) = registry {
        if let Some(updated) = advance_phase(
            api,
            &name,
            CheckpointPhase::ImagePushing,
            format!("Pushing image {image_name} to registry"),
        )
        .await
        {
            backup = updated;
        }

        if let Err(e) = registry.push_image(&image_name).await {
            fail(api, &name, format!("Failed to push image: {e:#}")).await;
            return Err(e.context(format!("push checkpoint image {image_name}")));
        }
        pushed = true;

        if let Some(updated) = advance_phase(
            api,
            &name,
            CheckpointPhase::ImagePushed,
            format!("Image pushed successfully: {image_name}"),
        )
        .await
        {
            backup = updated;
        }
    }

    match status::record_built_image(api, &name, container_name, &image_name, pushed).await {
        Ok(updated) => backup = updated,
        Err(e) => warn!("Failed to record built image {image_name}: {e:#}"),
    }

    // The artifact is only consumed once the image no longer depends on it.
    if pushed || registry.is_none() {
        if let Err(e) = artifact::delete_checkpoint_file(&checkpoint_path) {
            warn!(
                "Failed to delete checkpoint file {}: {e:#}",
                checkpoint_path.display()
            );
        } else {
            info!(
                "Deleted checkpoint artifact {} after completion",
                checkpoint_path.display()
            );
        }
    }

    Ok(backup)
}

/// Intermediate phase transitions are advisory; failing to record one must
/// not abort the pipeline.
async fn advance_phase(
    api: &Api<CheckpointBackup>,
    name: &str,
    phase: CheckpointPhase,
    message: String,
) -> Option<CheckpointBackup> {
    match status::update_phase(api, name, phase, message).await {
        Ok(updated) => Some(updated),
        Err(e) => {
            warn!("Failed to update phase to {phase:?}: {e:#}");
            None
        }
    }
}

async fn fail(api: &Api<CheckpointBackup>, name: &str, message: String) {
    if let Err(e) = status::update_phase(api, name, CheckpointPhase::Failed, message).await {
        error!("Failed to update phase to Failed: {e:#}");
    }
}

async fn ensure_finalizer(
    api: &Api<CheckpointBackup>,
    backup: &CheckpointBackup,
    name: &str,
) -> Result<()> {
    let present = backup
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == crds::CHECKPOINT_BACKUP_FINALIZER))
        .unwrap_or(false);
    if present {
        return Ok(());
    }

    let mut updated = backup.clone();
    updated
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(crds::CHECKPOINT_BACKUP_FINALIZER.to_string());
    api.replace(name, &PostParams::default(), &updated)
        .await
        .context("add finalizer")?;
    Ok(())
}

async fn remove_finalizer(
    api: &Api<CheckpointBackup>,
    backup: &CheckpointBackup,
    name: &str,
) -> Result<()> {
    let present = backup
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == crds::CHECKPOINT_BACKUP_FINALIZER))
        .unwrap_or(false);
    if !present {
        return Ok(());
    }

    let mut updated = backup.clone();
    if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
        finalizers.retain(|x| x != crds::CHECKPOINT_BACKUP_FINALIZER);
    }
    match api.replace(name, &PostParams::default(), &updated).await {
        Ok(_) => Ok(()),
        // Another agent finished the cleanup first.
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e).context("remove finalizer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{PodRef, ResourceRef};
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn pod_with_containers(containers: &[(&str, &str)]) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|(name, image)| Container {
                        name: name.to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn backup_spec(containers: Vec<ContainerSpec>, registry: Option<Registry>) -> CheckpointBackupSpec {
        CheckpointBackupSpec {
            schedule: crds::SCHEDULE_IMMEDIATELY.to_string(),
            stop_pod: None,
            pod_ref: PodRef {
                namespace: "t".to_string(),
                name: "app-0".to_string(),
            },
            resource_ref: ResourceRef {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
                namespace: "t".to_string(),
                name: "app-0".to_string(),
            },
            registry,
            containers,
        }
    }

    #[test]
    fn explicit_container_list_is_used_verbatim() {
        let spec = backup_spec(
            vec![ContainerSpec {
                name: "web".to_string(),
                image: "reg.example/ckpt/web:abc".to_string(),
            }],
            Some(Registry::default()),
        );
        let pod = pod_with_containers(&[("web", "nginx:1.25"), ("db", "postgres:16")]);

        let containers = containers_to_process(&spec, &pod);
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "web");
        assert_eq!(containers[0].image, "reg.example/ckpt/web:abc");
    }

    #[test]
    fn empty_list_without_registry_defaults_to_all_pod_containers() {
        let spec = backup_spec(Vec::new(), None);
        let pod = pod_with_containers(&[("web", "nginx:1.25"), ("db", "postgres:16")]);

        let containers = containers_to_process(&spec, &pod);
        let names: Vec<_> = containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["web", "db"]);
        assert!(containers.iter().all(|c| c.image.is_empty()));
    }

    #[test]
    fn empty_list_with_registry_processes_nothing() {
        let spec = backup_spec(Vec::new(), Some(Registry::default()));
        let pod = pod_with_containers(&[("web", "nginx:1.25")]);
        assert!(containers_to_process(&spec, &pod).is_empty());
    }

    #[test]
    fn base_image_lookup_requires_a_named_container() {
        let pod = pod_with_containers(&[("web", "nginx:1.25")]);
        assert_eq!(
            container_base_image(&pod, "web").as_deref(),
            Some("nginx:1.25")
        );
        assert_eq!(container_base_image(&pod, "cache"), None);
    }
}
