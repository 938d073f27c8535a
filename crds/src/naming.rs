// SPDX-License-Identifier: MIT

use anyhow::Result;
use chrono::{DateTime, Utc};
use openssl::hash::{MessageDigest, hash};

use crate::CHECKPOINT_BASE_PATH;

const MAX_NAME_LEN: usize = 63;
const HASH_LEN: usize = 10;

/// Synthesized name for a checkpoint image that never leaves node storage.
pub fn local_image_name(pod: &str, container: &str, at: DateTime<Utc>) -> String {
    format!(
        "localhost/checkpoint-{pod}-{container}:{}",
        at.format("%Y%m%d-%H%M%S")
    )
}

/// Strip a scheme prefix from a registry URL. The remainder is treated as a
/// host, optionally with a port.
pub fn registry_host(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

/// Deterministic CheckpointBackup name for a (migration, pod) pair.
///
/// The hash keeps names unique for pairs that only differ beyond the
/// truncation limit, so repeated orchestrator runs converge on the same
/// object.
pub fn backup_name(migration: &str, pod: &str) -> Result<String> {
    let digest = hash(
        MessageDigest::sha1(),
        format!("{migration}\0{pod}").as_bytes(),
    )?;
    let hash_str = &hex::encode(digest)[..HASH_LEN];
    let mut base = format!("{migration}-{pod}");
    base.truncate(MAX_NAME_LEN - HASH_LEN - 1);
    Ok(format!("{base}-{hash_str}"))
}

pub fn restore_name(backup: &str) -> String {
    format!("{backup}-restore")
}

/// Artifact filename prefix the node agent uses for one container.
pub fn checkpoint_file_prefix(namespace: &str, pod: &str, container: &str) -> String {
    format!("checkpoint-{namespace}_{pod}-{container}-")
}

/// Reduce a checkpoint path from the node agent to a path relative to
/// CHECKPOINT_BASE_PATH. Paths outside the base fall back to the filename.
pub fn relative_checkpoint_path(path: &str) -> String {
    if let Some(rel) = path.strip_prefix(&format!("{CHECKPOINT_BASE_PATH}/")) {
        return rel.to_string();
    }
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Accept Kubernetes five-field cron expressions by prepending a seconds
/// field; six- and seven-field expressions pass through unchanged.
pub fn normalize_cron(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}
