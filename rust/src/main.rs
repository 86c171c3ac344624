use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meshmq::{Broker, BrokerConfig, BrokerResult, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match BrokerConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("meshmq: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: BrokerConfig) -> BrokerResult<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    shutdown.cancel();
                }
                Err(e) => warn!("cannot listen for interrupts: {e}"),
            }
        }
    });

    let broker = Broker::start(&config, shutdown.clone()).await?;
    if broker.has_seeds() {
        info!(seeds = config.seeds.len(), "waiting to join cluster");
        tokio::select! {
            () = broker.wait_joined() => info!("joined cluster"),
            () = shutdown.cancelled() => {}
        }
    }
    broker.run().await
}
