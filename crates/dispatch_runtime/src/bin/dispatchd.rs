use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dispatch_core::channel::AmqpConnector;
use dispatch_core::clock::SystemClock;
use dispatch_core::config::DispatchConfig;
use dispatch_core::telemetry;
use dispatch_runtime::{DispatchRuntime, Overrides, RuntimeError};

const SERVICE: &str = "dispatchd";

#[derive(Parser)]
#[command(
    name = "dispatchd",
    about = "Dispatch matching, live location gateway and integrity monitor"
)]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
    /// Validate the configuration, print it and exit
    #[arg(long)]
    check_config: bool,
}

fn load_config(cli: &Cli) -> Result<DispatchConfig, RuntimeError> {
    let mut config = DispatchConfig::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), RuntimeError> {
    let config = load_config(&cli)?;
    if cli.check_config {
        match serde_json::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => eprintln!("configuration is valid but could not be rendered: {err}"),
        }
        return Ok(());
    }

    telemetry::initialise(&config.telemetry, SERVICE)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown signal received");
                    shutdown.cancel();
                }
                Err(err) => warn!(error = %err, "failed to listen for shutdown signal"),
            }
        });
    }

    match config.broker.url.clone() {
        Some(url) => {
            info!(broker = "amqp", prefetch = config.broker.prefetch, "using external broker");
            let connector = AmqpConnector::new(&url, config.broker.prefetch);
            DispatchRuntime::new(config, connector, Arc::new(SystemClock))?
                .run(shutdown)
                .await
        }
        None => {
            info!(broker = "in-memory", "using in-process broker");
            DispatchRuntime::in_memory(config)?.run(shutdown).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "dispatchd exited with an error");
            eprintln!("dispatchd: {err}");
            ExitCode::FAILURE
        }
    }
}
