// SPDX-License-Identifier: MIT

use anyhow::{Context, Result};
use crds::{
    BuiltImage, CheckpointBackup, CheckpointBackupStatus, CheckpointFile, CheckpointPhase,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Api;
use kube::api::PostParams;
use std::time::Duration;
use tokio::time;

const MAX_RETRIES: u64 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Fetch-modify-update of the status subresource with bounded conflict
/// retry. The mutator sees the latest status each attempt and returns false
/// to signal that no write is needed (e.g. a duplicate append).
pub async fn mutate_status<F>(
    api: &Api<CheckpointBackup>,
    name: &str,
    mut mutate: F,
) -> Result<CheckpointBackup>
where
    F: FnMut(&mut CheckpointBackupStatus) -> bool,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut latest = api.get(name).await.context("get latest backup")?;

        let mut status = latest.status.clone().unwrap_or_default();
        if !mutate(&mut status) {
            return Ok(latest);
        }
        latest.status = Some(status);

        let body = serde_json::to_vec(&latest).context("serialize backup status")?;
        match api.replace_status(name, &PostParams::default(), body).await {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < MAX_RETRIES => {
                time::sleep(RETRY_BASE_DELAY * attempt as u32).await;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("update backup status after {attempt} attempts")
                });
            }
        }
    }
}

pub async fn update_phase(
    api: &Api<CheckpointBackup>,
    name: &str,
    phase: CheckpointPhase,
    message: impl Into<String>,
) -> Result<CheckpointBackup> {
    let message = message.into();
    mutate_status(api, name, |status| {
        status.phase = Some(phase);
        status.message = message.clone();
        true
    })
    .await
}

/// Record a checkpoint artifact for one container. A recapture after the
/// recorded artifact disappeared replaces the stale entry in place, so each
/// container keeps exactly one entry; recording the same path again is
/// suppressed without a write.
pub async fn record_checkpoint_file(
    api: &Api<CheckpointBackup>,
    name: &str,
    container_name: &str,
    file_path: &str,
) -> Result<CheckpointBackup> {
    mutate_status(api, name, |status| {
        upsert_checkpoint_file(status, container_name, file_path)
    })
    .await
}

fn upsert_checkpoint_file(
    status: &mut CheckpointBackupStatus,
    container_name: &str,
    file_path: &str,
) -> bool {
    match status
        .checkpoint_files
        .iter_mut()
        .find(|f| f.container_name == container_name)
    {
        Some(existing) if existing.file_path == file_path => false,
        Some(existing) => {
            existing.file_path = file_path.to_string();
            existing.checkpoint_time = Some(Time(chrono::Utc::now()));
            true
        }
        None => {
            status.checkpoint_files.push(CheckpointFile {
                container_name: container_name.to_string(),
                file_path: file_path.to_string(),
                checkpoint_time: Some(Time(chrono::Utc::now())),
            });
            true
        }
    }
}

/// Append a built-image record; duplicates (same container and image) are
/// suppressed without a write.
pub async fn record_built_image(
    api: &Api<CheckpointBackup>,
    name: &str,
    container_name: &str,
    image_name: &str,
    pushed: bool,
) -> Result<CheckpointBackup> {
    mutate_status(api, name, |status| {
        let duplicate = status
            .built_images
            .iter()
            .any(|i| i.container_name == container_name && i.image_name == image_name);
        if duplicate {
            return false;
        }
        status.built_images.push(BuiltImage {
            container_name: container_name.to_string(),
            image_name: image_name.to_string(),
            build_time: Some(Time(chrono::Utc::now())),
            pushed,
        });
        true
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_appends_first_entry_per_container() {
        let mut status = CheckpointBackupStatus::default();
        assert!(upsert_checkpoint_file(&mut status, "web", "checkpoint-t_app-0-web-1.tar"));
        assert_eq!(status.checkpoint_files.len(), 1);
        assert_eq!(
            status.checkpoint_files[0].file_path,
            "checkpoint-t_app-0-web-1.tar"
        );
    }

    #[test]
    fn upsert_suppresses_identical_path() {
        let mut status = CheckpointBackupStatus::default();
        assert!(upsert_checkpoint_file(&mut status, "web", "checkpoint-t_app-0-web-1.tar"));
        assert!(!upsert_checkpoint_file(&mut status, "web", "checkpoint-t_app-0-web-1.tar"));
        assert_eq!(status.checkpoint_files.len(), 1);
    }

    #[test]
    fn upsert_replaces_stale_entry_for_same_container() {
        let mut status = CheckpointBackupStatus::default();
        assert!(upsert_checkpoint_file(&mut status, "web", "checkpoint-t_app-0-web-1.tar"));
        assert!(upsert_checkpoint_file(&mut status, "web", "checkpoint-t_app-0-web-2.tar"));
        assert_eq!(status.checkpoint_files.len(), 1);
        assert_eq!(
            status.checkpoint_files[0].file_path,
            "checkpoint-t_app-0-web-2.tar"
        );
    }

    #[test]
    fn upsert_keeps_containers_independent() {
        let mut status = CheckpointBackupStatus::default();
        assert!(upsert_checkpoint_file(&mut status, "web", "checkpoint-t_app-0-web-1.tar"));
        assert!(upsert_checkpoint_file(&mut status, "db", "checkpoint-t_app-0-db-1.tar"));
        assert_eq!(status.checkpoint_files.len(), 2);
    }
}
