mod config;
mod connection;
mod stack;

use anyhow::Result;
use config::ControllerConfig;
use connection::ConnectionManager;
use stack::{BluezStack, StackConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ControllerConfig::from_env()?;
    info!("SPP controller starting, {} target peers", config.targets.len());
    for peer in &config.targets {
        info!("  target {peer}");
    }

    let stack = BluezStack::new(StackConfig::default());
    let (manager, handle) = ConnectionManager::new(config, stack)?;

    // Each line on stdin stands in for the button that advances the workflow
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            handle.trigger().await;
        }
    });

    info!("press Enter to advance the workflow");
    manager.run().await;
    Ok(())
}
