// SPDX-License-Identifier: MIT

use anyhow::{Context, Result};
use crds::CheckpointBackup;
use ctrl_util::{controller_error_policy, controller_info};
use futures_util::StreamExt;
use kube::runtime::{controller::Controller, watcher};
use kube::{Api, Client};
use log::info;
use std::env;
use std::sync::Arc;

mod artifact;
mod builder;
mod checkpoint;
mod kubelet;
mod registry;
mod scheduler;
mod status;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let node_name = env::var("NODE_NAME").context("NODE_NAME environment variable is required")?;
    let client = Client::try_default()
        .await
        .context("build kubernetes client")?;

    let ctx = checkpoint::AgentContext::new(client.clone(), node_name)?;
    info!("Starting checkpoint agent on node {}", ctx.node_name);

    let backups: Api<CheckpointBackup> = Api::all(client);
    Controller::new(backups, watcher::Config::default())
        .shutdown_on_signal()
        .run(checkpoint::reconcile, controller_error_policy, Arc::new(ctx))
        .for_each(controller_info)
        .await;

    Ok(())
}
