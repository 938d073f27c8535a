// SPDX-License-Identifier: MIT

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod naming;

pub const CHECKPOINT_BACKUP_FINALIZER: &str = "checkpointbackup.migration.statemig.io/finalizer";

/// Root of the node agent's checkpoint artifact directory. All
/// `status.checkpointFiles` paths are relative to it.
pub const CHECKPOINT_BASE_PATH: &str = "/var/lib/kubelet/checkpoints";

pub const CHECKPOINT_NAME_ANNOTATION: &str = "io.kubernetes.cri-o.annotations.checkpoint.name";
pub const ROOTFS_IMAGE_ANNOTATION: &str =
    "io.kubernetes.cri-o.annotations.checkpoint.rootfsImageName";

pub const OWNER_LABEL: &str = "migration.statemig.io/owner";
pub const CLUSTER_LABEL: &str = "migration.statemig.io/cluster";
pub const RESTORE_LABEL: &str = "migration.statemig.io/restore";
pub const BACKUP_LABEL: &str = "migration.statemig.io/backup";

/// Schedule token that requests a single synchronous capture instead of a
/// cron schedule.
pub const SCHEDULE_IMMEDIATELY: &str = "immediately";

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.statemig.io",
    version = "v1",
    kind = "StatefulMigration",
    namespaced,
    plural = "statefulmigrations"
)]
#[serde(rename_all = "camelCase")]
pub struct StatefulMigrationSpec {
    /// Workload to migrate, resolved on each source cluster.
    pub resource_ref: ResourceRef,
    /// Member clusters from which captures are taken.
    pub source_clusters: Vec<String>,
    /// Cron expression, or `immediately` for a one-shot capture.
    pub schedule: String,
    /// If absent, checkpoint images stay in node-local storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<Registry>,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.statemig.io",
    version = "v1",
    kind = "CheckpointBackup",
    namespaced,
    plural = "checkpointbackups",
    status = "CheckpointBackupStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Pod", "type":"string", "jsonPath":".spec.podRef.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointBackupSpec {
    /// Cron expression, or `immediately` for a one-shot capture.
    pub schedule: String,
    /// Delete the pod after a successful capture and stop scheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_pod: Option<bool>,
    /// Pod to checkpoint.
    pub pod_ref: PodRef,
    /// Parent workload, used for admission matching.
    pub resource_ref: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<Registry>,
    /// Containers to capture. Empty means every container in the pod when no
    /// registry is configured.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointBackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CheckpointPhase>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_time: Option<Time>,
    /// Artifacts written by the node agent, relative to CHECKPOINT_BASE_PATH.
    /// One entry per container; a recapture after the artifact was lost
    /// replaces the stale entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoint_files: Vec<CheckpointFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub built_images: Vec<BuiltImage>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CheckpointPhase {
    Checkpointing,
    Checkpointed,
    ImageBuilding,
    ImageBuilt,
    ImagePushing,
    ImagePushed,
    Completed,
    CompletedPodDeleted,
    CompletedWithError,
    Failed,
}

impl CheckpointPhase {
    /// Phases after which the capture pipeline must not run again. `Failed`
    /// is deliberately absent so a later reconcile can retry the pipeline.
    pub fn blocks_recapture(self) -> bool {
        matches!(
            self,
            CheckpointPhase::Completed
                | CheckpointPhase::CompletedPodDeleted
                | CheckpointPhase::CompletedWithError
        )
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointFile {
    pub container_name: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_time: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuiltImage {
    pub container_name: String,
    pub image_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time: Option<Time>,
    #[serde(default)]
    pub pushed: bool,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.statemig.io",
    version = "v1",
    kind = "CheckpointRestore",
    namespaced,
    plural = "checkpointrestores"
)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRestoreSpec {
    /// Source CheckpointBackup this restore replays.
    pub backup_ref: BackupRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    /// Prefix matched against `generateName` of newly admitted pods.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_generate_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerSpec>,
    /// Fallback image for containers without an explicit mapping.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_image: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    /// Registry host, optionally carrying a scheme prefix that is stripped
    /// before use.
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    /// Target image. Empty means a local name is synthesized at build time.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupRef {
    pub name: String,
}
