use std::process::ExitCode;

use aether::config::AetherConfig;
use aether::error::Result;
use aether::service::{forward_signal, Daemon};
use aether::utils::logging::init_logging;
use tokio::sync::mpsc;
use tracing::error;

fn load_config() -> Result<AetherConfig> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => AetherConfig::from_file(path)?,
        None => AetherConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

async fn run() -> Result<()> {
    let config = load_config()?;
    init_logging(&config.logging)?;

    let daemon = Daemon::new(config)?;
    let listener = daemon.bind().await?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(forward_signal(tokio::signal::ctrl_c(), shutdown_tx));

    daemon.serve(listener, shutdown_rx).await
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "aetherd failed");
            eprintln!("aetherd: {e}");
            ExitCode::FAILURE
        }
    }
}
