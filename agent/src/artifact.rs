// SPDX-License-Identifier: MIT

use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Files older than this are not considered products of the capture that
/// just ran.
const RECENT_WINDOW: Duration = Duration::from_secs(30);

/// Verify a candidate artifact path, falling back to a directory scan when
/// the candidate is absent or the kubelet response gave us nothing.
pub fn resolve_checkpoint_artifact(
    root: &Path,
    namespace: &str,
    pod: &str,
    container: &str,
    candidate: Option<String>,
) -> Result<String> {
    if let Some(relative) = candidate {
        if root.join(&relative).exists() {
            return Ok(relative);
        }
        info!("Checkpoint artifact {relative} not found on disk, scanning for a match");
    }
    find_checkpoint_file(root, namespace, pod, container)
}

/// Scan the checkpoint root for `checkpoint-{ns}_{pod}-{container}-*.tar`
/// and pick the best match.
pub fn find_checkpoint_file(
    root: &Path,
    namespace: &str,
    pod: &str,
    container: &str,
) -> Result<String> {
    let prefix = crds::naming::checkpoint_file_prefix(namespace, pod, container);

    let mut matches = Vec::new();
    let entries = fs::read_dir(root)
        .with_context(|| format!("read checkpoint directory {}", root.display()))?;
    for entry in entries {
        let entry = entry.context("read checkpoint directory entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(".tar") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        matches.push((name, modified));
    }

    select_checkpoint_candidate(matches, SystemTime::now()).with_context(|| {
        format!(
            "no checkpoint artifact matching {prefix}*.tar in {}",
            root.display()
        )
    })
}

/// Prefer the most recently modified file within the recency window; outside
/// it, fall back to the lexicographically greatest name (filenames carry a
/// timestamp).
fn select_checkpoint_candidate(
    matches: Vec<(String, SystemTime)>,
    now: SystemTime,
) -> Option<String> {
    if matches.is_empty() {
        return None;
    }

    let recent = matches
        .iter()
        .filter(|(_, modified)| {
            now.duration_since(*modified)
                .map(|age| age < RECENT_WINDOW)
                .unwrap_or(true)
        })
        .max_by_key(|(_, modified)| *modified);
    if let Some((name, _)) = recent {
        return Some(name.clone());
    }

    matches.into_iter().map(|(name, _)| name).max()
}

/// Delete an artifact that has been consumed. A missing file is not an
/// error.
pub fn delete_checkpoint_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_file(path).with_context(|| format!("remove checkpoint file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn at(now: SystemTime, seconds_ago: u64) -> SystemTime {
        now - Duration::from_secs(seconds_ago)
    }

    #[test]
    fn recent_files_win_by_mtime() {
        let now = SystemTime::now();
        let matches = vec![
            ("checkpoint-t_app-0-web-a.tar".to_string(), at(now, 20)),
            ("checkpoint-t_app-0-web-b.tar".to_string(), at(now, 5)),
            ("checkpoint-t_app-0-web-z.tar".to_string(), at(now, 120)),
        ];
        assert_eq!(
            select_checkpoint_candidate(matches, now).as_deref(),
            Some("checkpoint-t_app-0-web-b.tar")
        );
    }

    #[test]
    fn stale_files_fall_back_to_lexicographic_order() {
        let now = SystemTime::now();
        let matches = vec![
            ("checkpoint-t_app-0-web-2025-01-01.tar".to_string(), at(now, 600)),
            ("checkpoint-t_app-0-web-2025-01-04.tar".to_string(), at(now, 900)),
        ];
        assert_eq!(
            select_checkpoint_candidate(matches, now).as_deref(),
            Some("checkpoint-t_app-0-web-2025-01-04.tar")
        );
    }

    #[test]
    fn empty_match_set_yields_none() {
        assert_eq!(select_checkpoint_candidate(Vec::new(), SystemTime::now()), None);
    }

    #[test]
    fn scan_filters_by_prefix_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "checkpoint-t_app-0-web-2025-01-04T14:30:22Z.tar",
            "checkpoint-t_app-0-db-2025-01-04T14:30:22Z.tar",
            "checkpoint-t_app-0-web-partial.tmp",
        ] {
            File::create(dir.path().join(name)).unwrap();
        }

        let found = find_checkpoint_file(dir.path(), "t", "app-0", "web").unwrap();
        assert_eq!(found, "checkpoint-t_app-0-web-2025-01-04T14:30:22Z.tar");

        assert!(find_checkpoint_file(dir.path(), "t", "app-0", "cache").is_err());
    }

    #[test]
    fn resolve_prefers_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("checkpoint-t_app-0-web-1.tar")).unwrap();
        File::create(dir.path().join("checkpoint-t_app-0-web-2.tar")).unwrap();

        let resolved = resolve_checkpoint_artifact(
            dir.path(),
            "t",
            "app-0",
            "web",
            Some("checkpoint-t_app-0-web-1.tar".to_string()),
        )
        .unwrap();
        assert_eq!(resolved, "checkpoint-t_app-0-web-1.tar");

        // A stale candidate falls back to the scan.
        let resolved = resolve_checkpoint_artifact(
            dir.path(),
            "t",
            "app-0",
            "web",
            Some("checkpoint-t_app-0-web-gone.tar".to_string()),
        )
        .unwrap();
        assert!(resolved.starts_with("checkpoint-t_app-0-web-"));
    }

    #[test]
    fn delete_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint-t_app-0-web-1.tar");
        File::create(&path).unwrap();

        delete_checkpoint_file(&path).unwrap();
        assert!(!path.exists());
        delete_checkpoint_file(&path).unwrap();
    }
}
