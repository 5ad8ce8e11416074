//! dotrelay
//!
//! Listens for DNS-over-TLS (or any TCP) clients and relays each one to a
//! fixed upstream resolver, terminating and originating TLS as configured.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use dotrelay::config::Args;
use dotrelay::{logging, RelayServer};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_format, &args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Fatal error");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.into_config().context("invalid configuration")?;

    info!("Starting dotrelay");
    let server = RelayServer::bind(config)
        .await
        .context("failed to start relay")?;

    println!(
        "[dotrelay] tcp://{} -> {}",
        server.local_addr(),
        server.config().upstream_authority()
    );

    let handle = server.start();
    wait_for_signal().await?;

    let report = handle.shutdown().await;
    info!(
        drained = report.drained,
        forced = report.forced,
        "dotrelay exited"
    );
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Received SIGINT");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Received shutdown signal");
    Ok(())
}
