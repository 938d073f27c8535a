// SPDX-License-Identifier: MIT

use anyhow::{Context, Result, bail};
use crds::{CHECKPOINT_NAME_ANNOTATION, ROOTFS_IMAGE_ANNOTATION};
use log::{info, warn};
use std::path::Path;
use tokio::process::Command;

const BUILDAH: &str = "buildah";

/// Compose a checkpoint image: an empty base carrying the checkpoint tarball
/// at `/`, annotated with the checkpoint name and the rootfs image it was
/// taken from.
pub async fn build_checkpoint_image(
    checkpoint_path: &Path,
    image_name: &str,
    base_image: &str,
) -> Result<()> {
    if !checkpoint_path.exists() {
        bail!(
            "checkpoint file does not exist: {}",
            checkpoint_path.display()
        );
    }

    info!(
        "Building checkpoint image {image_name} from {} (rootfs {base_image})",
        checkpoint_path.display()
    );

    let output = Command::new(BUILDAH)
        .args(["from", "scratch"])
        .output()
        .await
        .context("spawn buildah from")?;
    if !output.status.success() {
        bail!(
            "buildah from failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let working_container = String::from_utf8_lossy(&output.stdout).trim().to_string();

    let result = assemble(&working_container, checkpoint_path, image_name, base_image).await;

    // The working container is removed no matter how assembly went.
    if let Err(e) = run(&["rm", &working_container]).await {
        warn!("Failed to remove working container {working_container}: {e:#}");
    }

    result
}

async fn assemble(
    working_container: &str,
    checkpoint_path: &Path,
    image_name: &str,
    base_image: &str,
) -> Result<()> {
    let checkpoint = checkpoint_path.to_string_lossy();
    run(&["add", working_container, &checkpoint, "/"]).await?;
    run(&[
        "config",
        &format!("--annotation={CHECKPOINT_NAME_ANNOTATION}={image_name}"),
        working_container,
    ])
    .await?;
    run(&[
        "config",
        &format!("--annotation={ROOTFS_IMAGE_ANNOTATION}={base_image}"),
        working_container,
    ])
    .await?;
    run(&["commit", working_container, image_name]).await?;
    Ok(())
}

/// Authenticate against a registry.
pub async fn login(username: &str, password: &str, host: &str) -> Result<()> {
    run(&["login", "-u", username, "-p", password, host]).await
}

/// Push a locally committed image under its registry-qualified name.
pub async fn push(local_image: &str, destination: &str) -> Result<()> {
    run(&["push", local_image, destination]).await
}

async fn run(args: &[&str]) -> Result<()> {
    let output = Command::new(BUILDAH)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawn buildah {}", args[0]))?;
    if !output.status.success() {
        bail!(
            "buildah {} failed: {}",
            args[0],
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
