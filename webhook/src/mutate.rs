// SPDX-License-Identifier: MIT

//! Pod CREATE mutation: replace container images with captured checkpoint
//! images when the pod belongs to an active backup or restore request.
//! Every internal error results in an allow-without-patch response so the
//! webhook can never wedge pod admission.

use axum::Json;
use axum::extract::State;
use base64::{Engine as _, engine::general_purpose};
use crds::{CheckpointBackup, CheckpointRestore};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: RequestKind,
    pub operation: String,
    pub namespace: String,
    pub object: Option<Value>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
}

/// Container-name to image overrides extracted from a matched request.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Overrides {
    map: BTreeMap<String, String>,
    default_image: Option<String>,
}

pub async fn handle_mutate(
    State(client): State<Client>,
    Json(review): Json<AdmissionReview>,
) -> Json<AdmissionReview> {
    let Some(request) = review.request else {
        return Json(respond(String::new(), None));
    };
    let uid = request.uid.clone();

    let patch = match mutate_pod(&client, &request).await {
        Ok(patch) => patch,
        Err(e) => {
            error!("Pod mutation failed, allowing pod unmodified: {e:#}");
            None
        }
    };
    Json(respond(uid, patch))
}

async fn mutate_pod(
    client: &Client,
    request: &AdmissionRequest,
) -> anyhow::Result<Option<Vec<Value>>> {
    if request.operation != "CREATE"
        || request.kind.kind != "Pod"
        || !request.kind.group.is_empty()
    {
        return Ok(None);
    }
    let Some(raw) = &request.object else {
        return Ok(None);
    };
    let pod: Pod = serde_json::from_value(raw.clone())?;

    // Only pods produced by the restore pipeline are candidates, and those
    // are always Job-owned.
    let Some(job_name) = owning_job(&pod) else {
        debug!("Pod is not owned by a Job, skipping mutation");
        return Ok(None);
    };

    let namespace = if request.namespace.is_empty() {
        pod.metadata.namespace.clone().unwrap_or_default()
    } else {
        request.namespace.clone()
    };

    let backups: Api<CheckpointBackup> = Api::namespaced(client.clone(), &namespace);
    let restores: Api<CheckpointRestore> = Api::namespaced(client.clone(), &namespace);
    let backups = backups.list(&ListParams::default()).await?.items;
    let restores = restores.list(&ListParams::default()).await?.items;

    let Some(overrides) = overrides_for_pod(&pod, &job_name, &namespace, &backups, &restores)
    else {
        debug!("No matching checkpoint request for Job {job_name}, skipping mutation");
        return Ok(None);
    };

    let patches = image_patches(&pod, &overrides);
    if patches.is_empty() {
        debug!("Images already match for Job {job_name}, nothing to patch");
        return Ok(None);
    }
    info!(
        "Rewriting {} container image(s) for pod of Job {job_name}",
        patches.len()
    );
    Ok(Some(patches))
}

fn respond(uid: String, patch: Option<Vec<Value>>) -> AdmissionReview {
    let mut response = AdmissionResponse {
        uid,
        allowed: true,
        patch: None,
        patch_type: None,
    };
    if let Some(patch) = patch {
        match serde_json::to_vec(&patch) {
            Ok(bytes) => {
                response.patch = Some(general_purpose::STANDARD.encode(bytes));
                response.patch_type = Some("JSONPatch".to_string());
            }
            Err(e) => error!("Failed to serialize patch, allowing pod unmodified: {e}"),
        }
    }
    AdmissionReview {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        request: None,
        response: Some(response),
    }
}

fn owning_job(pod: &Pod) -> Option<String> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.kind == "Job" && owner.api_version == "batch/v1")
        .map(|owner| owner.name.clone())
}

/// Pick the first matching request and build the image overrides from it.
/// Restores win over backups: they are the replay-side key.
pub(crate) fn overrides_for_pod(
    pod: &Pod,
    job_name: &str,
    namespace: &str,
    backups: &[CheckpointBackup],
    restores: &[CheckpointRestore],
) -> Option<Overrides> {
    for restore in restores {
        if restore_matches(restore, pod) {
            return Some(restore_overrides(restore));
        }
    }
    for backup in backups {
        if backup_matches(backup, job_name, namespace, pod) {
            return Some(backup_overrides(backup));
        }
    }
    None
}

fn backup_matches(
    backup: &CheckpointBackup,
    job_name: &str,
    namespace: &str,
    pod: &Pod,
) -> bool {
    let resource = &backup.spec.resource_ref;

    if resource.kind == "Job" && resource.api_version == "batch/v1" {
        let ref_namespace = if resource.namespace.is_empty() {
            namespace
        } else {
            resource.namespace.as_str()
        };
        if resource.name == job_name && ref_namespace == namespace {
            return true;
        }
    }

    // Jobs spawned by a CronJob are named `{cronjob}-{suffix}`.
    if resource.kind == "CronJob"
        && resource.api_version == "batch/v1"
        && job_name.starts_with(&format!("{}-", resource.name))
    {
        return true;
    }

    pod.metadata.name.as_deref() == Some(backup.spec.pod_ref.name.as_str())
}

fn restore_matches(restore: &CheckpointRestore, pod: &Pod) -> bool {
    let spec = &restore.spec;
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let generate_name = pod.metadata.generate_name.as_deref().unwrap_or_default();

    if !pod_name.is_empty() && spec.pod_name == pod_name {
        return true;
    }
    if !generate_name.is_empty() {
        if !spec.pod_generate_name.is_empty()
            && (spec.pod_generate_name.starts_with(generate_name)
                || generate_name.starts_with(&spec.pod_generate_name))
        {
            return true;
        }
        if !spec.pod_name.is_empty() && spec.pod_name.starts_with(generate_name) {
            return true;
        }
    }
    false
}

fn restore_overrides(restore: &CheckpointRestore) -> Overrides {
    let mut overrides = Overrides::default();
    for container in &restore.spec.containers {
        if container.image.is_empty() {
            continue;
        }
        overrides
            .map
            .insert(container.name.clone(), container.image.clone());
        if overrides.default_image.is_none() {
            overrides.default_image = Some(container.image.clone());
        }
    }
    if !restore.spec.default_image.is_empty() {
        overrides.default_image = Some(restore.spec.default_image.clone());
    }
    overrides
}

fn backup_overrides(backup: &CheckpointBackup) -> Overrides {
    let mut overrides = Overrides::default();
    for container in &backup.spec.containers {
        if !container.image.is_empty() {
            overrides
                .map
                .insert(container.name.clone(), container.image.clone());
        }
    }
    if let Some(status) = &backup.status {
        for image in &status.built_images {
            if image.image_name.is_empty() {
                continue;
            }
            overrides
                .map
                .entry(image.container_name.clone())
                .or_insert_with(|| image.image_name.clone());
        }
    }
    overrides
}

/// JSON-Patch replace operations for every container whose mapped image
/// differs from its current one. Init containers get the same treatment.
pub(crate) fn image_patches(pod: &Pod, overrides: &Overrides) -> Vec<Value> {
    let mut patches = Vec::new();
    let Some(spec) = pod.spec.as_ref() else {
        return patches;
    };

    for (index, container) in spec.containers.iter().enumerate() {
        if let Some(patch) = replace_op(
            "/spec/containers",
            index,
            &container.name,
            container.image.as_deref(),
            overrides,
        ) {
            patches.push(patch);
        }
    }
    for (index, container) in spec.init_containers.iter().flatten().enumerate() {
        if let Some(patch) = replace_op(
            "/spec/initContainers",
            index,
            &container.name,
            container.image.as_deref(),
            overrides,
        ) {
            patches.push(patch);
        }
    }
    patches
}

fn replace_op(
    prefix: &str,
    index: usize,
    name: &str,
    current_image: Option<&str>,
    overrides: &Overrides,
) -> Option<Value> {
    let wanted = overrides
        .map
        .get(name)
        .map(String::as_str)
        .or(overrides.default_image.as_deref())?;
    if current_image == Some(wanted) {
        return None;
    }
    Some(json!({
        "op": "replace",
        "path": format!("{prefix}/{index}/image"),
        "value": wanted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{
        BackupRef, BuiltImage, CheckpointBackupSpec, CheckpointBackupStatus,
        CheckpointRestoreSpec, ContainerSpec, PodRef, ResourceRef,
    };
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    fn job_pod(name: &str, job: &str, containers: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("t".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "batch/v1".to_string(),
                    kind: "Job".to_string(),
                    name: job.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
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

    fn job_backup(kind: &str, workload: &str, built: &[(&str, &str)]) -> CheckpointBackup {
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
                    name: "source-pod".to_string(),
                },
                resource_ref: ResourceRef {
                    api_version: "batch/v1".to_string(),
                    kind: kind.to_string(),
                    namespace: "t".to_string(),
                    name: workload.to_string(),
                },
                registry: None,
                containers: Vec::new(),
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

    fn named_restore(pod_name: &str, generate_name: &str, containers: &[(&str, &str)]) -> CheckpointRestore {
        CheckpointRestore {
            metadata: ObjectMeta {
                name: Some("cb1-restore".to_string()),
                namespace: Some("t".to_string()),
                ..Default::default()
            },
            spec: CheckpointRestoreSpec {
                backup_ref: BackupRef {
                    name: "cb1".to_string(),
                },
                pod_name: pod_name.to_string(),
                pod_generate_name: generate_name.to_string(),
                containers: containers
                    .iter()
                    .map(|(name, image)| ContainerSpec {
                        name: name.to_string(),
                        image: image.to_string(),
                    })
                    .collect(),
                default_image: String::new(),
            },
        }
    }

    #[test]
    fn job_owned_pod_is_patched_from_backup_captures() {
        let pod = job_pod("restore-xyz-r2d2", "restore-xyz", &[("web", "nginx:1.25")]);
        let backup = job_backup("Job", "restore-xyz", &[("web", "reg.example/ckpt/web:abc")]);

        let overrides =
            overrides_for_pod(&pod, "restore-xyz", "t", &[backup], &[]).expect("match");
        let patches = image_patches(&pod, &overrides);
        assert_eq!(
            patches,
            vec![json!({
                "op": "replace",
                "path": "/spec/containers/0/image",
                "value": "reg.example/ckpt/web:abc",
            })]
        );
    }

    #[test]
    fn cronjob_backup_matches_job_name_prefix() {
        let pod = job_pod("nightly-29000000-abcde", "nightly-29000000", &[("web", "nginx:1.25")]);
        let backup = job_backup("CronJob", "nightly", &[("web", "reg.example/ckpt/web:abc")]);
        assert!(overrides_for_pod(&pod, "nightly-29000000", "t", &[backup], &[]).is_some());

        let unrelated = job_backup("CronJob", "weekly", &[("web", "x")]);
        assert!(overrides_for_pod(&pod, "nightly-29000000", "t", &[unrelated], &[]).is_none());
    }

    #[test]
    fn restore_matches_by_generate_name_prefix() {
        let mut pod = job_pod("", "restore-xyz", &[("web", "nginx:1.25")]);
        pod.metadata.name = None;
        pod.metadata.generate_name = Some("app-".to_string());

        let restore = named_restore("", "app-0", &[("web", "reg.example/ckpt/web:abc")]);
        let overrides = overrides_for_pod(&pod, "restore-xyz", "t", &[], &[restore]).expect("match");
        assert_eq!(
            image_patches(&pod, &overrides),
            vec![json!({
                "op": "replace",
                "path": "/spec/containers/0/image",
                "value": "reg.example/ckpt/web:abc",
            })]
        );
    }

    #[test]
    fn equal_images_produce_no_patch() {
        let pod = job_pod("restore-xyz-r2d2", "restore-xyz", &[("web", "reg.example/ckpt/web:abc")]);
        let backup = job_backup("Job", "restore-xyz", &[("web", "reg.example/ckpt/web:abc")]);

        let overrides =
            overrides_for_pod(&pod, "restore-xyz", "t", &[backup], &[]).expect("match");
        assert!(image_patches(&pod, &overrides).is_empty());
    }

    #[test]
    fn init_containers_are_rewritten_too() {
        let mut pod = job_pod("restore-xyz-r2d2", "restore-xyz", &[("web", "nginx:1.25")]);
        pod.spec.as_mut().unwrap().init_containers = Some(vec![Container {
            name: "web".to_string(),
            image: Some("nginx:1.25".to_string()),
            ..Default::default()
        }]);
        let backup = job_backup("Job", "restore-xyz", &[("web", "reg.example/ckpt/web:abc")]);

        let overrides =
            overrides_for_pod(&pod, "restore-xyz", "t", &[backup], &[]).expect("match");
        let patches = image_patches(&pod, &overrides);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1]["path"], "/spec/initContainers/0/image");
    }

    #[test]
    fn default_image_covers_unmapped_containers() {
        let pod = job_pod("app-0", "restore-xyz", &[("web", "nginx:1.25"), ("sidecar", "envoy:1.30")]);
        let mut restore = named_restore("app-0", "", &[("web", "reg.example/ckpt/web:abc")]);
        restore.spec.default_image = "reg.example/ckpt/fallback:1".to_string();

        let overrides = overrides_for_pod(&pod, "restore-xyz", "t", &[], &[restore]).expect("match");
        let patches = image_patches(&pod, &overrides);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1]["value"], "reg.example/ckpt/fallback:1");
    }

    #[test]
    fn non_job_pods_are_ignored() {
        let mut pod = job_pod("app-0", "ignored", &[("web", "nginx:1.25")]);
        pod.metadata.owner_references = None;
        assert!(owning_job(&pod).is_none());
    }

    #[test]
    fn response_encodes_patch_as_base64_json() {
        let review = respond(
            "uid-1".to_string(),
            Some(vec![json!({"op": "replace", "path": "/spec/containers/0/image", "value": "x"})]),
        );
        let response = review.response.unwrap();
        assert!(response.allowed);
        assert_eq!(response.patch_type.as_deref(), Some("JSONPatch"));

        let decoded = general_purpose::STANDARD
            .decode(response.patch.unwrap())
            .unwrap();
        let ops: Vec<Value> = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(ops[0]["op"], "replace");
    }

    #[test]
    fn allow_without_patch_on_no_match() {
        let review = respond("uid-2".to_string(), None);
        let response = review.response.unwrap();
        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert!(response.patch_type.is_none());
    }
}
