use std::fs::File;
use std::sync::Arc;

use containerd_registrar::queue::WorkQueue;
use containerd_registrar::{reconciler, Config};
use kube::Client;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config: Config = if let Ok(config_filename) = std::env::var("CONFIG") {
        serde_yaml::from_reader(File::open(config_filename)?)?
    } else {
        Config::default()
    };

    let client = Client::try_default().await?;

    let queue = Arc::new(WorkQueue::new());
    let shutdown = queue.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.shutdown();
        }
    });

    info!("running containerd-registrar controller");
    reconciler::run(client, config.controller, queue).await?;

    Ok(())
}
