// SPDX-License-Identifier: MIT

use anyhow::{Context, Result};
use kube::Client;
use log::info;

mod backup;
mod federation;
mod karmada;
mod restore;

use federation::FederationClient;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let client = Client::try_default()
        .await
        .context("build federation plane client")?;
    let federation = FederationClient::new(client.clone());

    info!("Starting stateful migration controllers");
    tokio::join!(
        backup::launch_backup_controller(client.clone(), federation.clone()),
        restore::launch_restore_controller(client, federation),
    );

    Ok(())
}
