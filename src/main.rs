use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use device_broker::{cli, logging, manager::DeviceManager, server};

use tracing::{debug, error, info};

#[cfg(unix)]
async fn hangup() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    hangup.recv().await;

    Ok(())
}

#[cfg(not(unix))]
async fn hangup() -> Result<()> {
    std::future::pending().await
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut cli = cli::Cli::parse();

    if let Some(command) = cli.command.take() {
        cli::handle_command(command)?;

        return Ok(());
    }

    let settings = cli.settings()?;

    logging::init(settings.log_level(), settings.log_file()).await;
    debug!(?settings, "Settings");

    let manager = Arc::new(DeviceManager::from_settings(&settings).await?);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup() => {
            info!("Told to hang up, quitting")
        }
        result = server::run_on_port(manager, settings.address, settings.port) => {
            error!("Server returned");
            result?;
            return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
        }
    }

    logging::shutdown();

    Ok(())
}
