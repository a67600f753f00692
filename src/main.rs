mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use std::time::{Duration, SystemTime};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use windsock::auth::{unix_seconds, TokenAuthenticator};
use windsock::config::Config;

const STATS_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Some(Command::Token {
            identity,
            subscribe,
            publish,
            nonce,
            address,
        }) => {
            let authenticator = TokenAuthenticator::new(&config.auth.secret, config.auth.window())
                .context("Invalid auth secret")?;
            let nonce = nonce.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            let token = authenticator
                .issue(
                    &identity,
                    &subscribe,
                    &publish,
                    unix_seconds(SystemTime::now()),
                    &nonce,
                    &address,
                )
                .context("Failed to sign token")?;
            println!("{token}");
            Ok(())
        }
        None => run(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!(version = windsock::VERSION, "Starting windsock");

    if let Some(listen) = &config.metrics.listen {
        windsock::metrics::install_exporter(listen)
            .with_context(|| format!("Failed to start metrics exporter on {listen}"))?;
    }

    let (subscriber, requester) = windsock::broker::connect(&config.broker)
        .await
        .context("Failed to connect to broker")?;
    let gateway = windsock::start(config, subscriber, requester).await?;

    // Refreshes the uptime gauge along the way
    let stats = gateway.stats();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(STATS_INTERVAL);
        loop {
            tick.tick().await;
            let snapshot = stats.snapshot();
            debug!(
                clients = snapshot.clients_current,
                clients_total = snapshot.clients_total,
                broker_messages = snapshot.broker_messages,
                "Gateway stats"
            );
        }
    });

    // Handle UNIX signals
    tokio::select! {
        // SIGINT (Ctrl+C) - graceful shutdown
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating graceful shutdown...");
            gateway.stop().await?;
            info!("Graceful shutdown completed");
        }

        // SIGTERM - immediate quit
        _ = terminate() => {
            warn!("Received SIGTERM, quitting immediately");
            std::process::exit(0);
        }

        // A bridge pipeline gave up
        _ = gateway.closed() => {
            let report = gateway.health().report();
            gateway.stop().await?;
            if !report.healthy {
                error!(inbound = ?report.inbound, outbound = ?report.outbound, "Broker bridge failed");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-Unix systems, just wait forever (SIGTERM not available)
        std::future::pending::<()>().await
    }
}
