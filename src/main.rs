use std::io::{self, Read};

use anyhow::Context;
use clap::Parser;

use bosh_deployment_resource::{
    apply,
    config::{CliArgs, RuntimeConfig},
    telemetry,
};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = match RuntimeConfig::from_args(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = telemetry::init(&config.log_level) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    match run(&config).await {
        Ok(response) => println!("{response}"),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(config: &RuntimeConfig) -> anyhow::Result<String> {
    let mut request = String::new();
    io::stdin()
        .read_to_string(&mut request)
        .context("reading request from stdin")?;

    // Losing the race drops the step, which tears down its session and kills the child.
    tokio::select! {
        response = apply::run(config, &request) => {
            response.with_context(|| format!("{} failed", config.action.as_str()))
        }
        signal = shutdown_signal() => {
            signal?;
            anyhow::bail!("{} interrupted", config.action.as_str())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    Ok(())
}
