//! forge CLI entrypoint

use std::fs::File;
use std::sync::Mutex;

use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use swarm_forge::cli::Cli;

/// Open this run's debug log under the configured log directory
fn open_run_log() -> Result<File> {
    let config = swarm_forge::config::config()?;
    std::fs::create_dir_all(&config.log_dir)?;
    Ok(File::create(config.log_file(chrono::Local::now()))?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = swarm_forge::config::log_level().unwrap_or_else(|_| "info".to_string());
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let (file_layer, log_error) = match open_run_log() {
        Ok(file) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), None)
        }
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .with(file_layer)
        .init();

    if let Some(e) = log_error {
        warn!("Run log disabled: {:#}", e);
    }

    // Parse and execute CLI
    let cli = Cli::parse();
    cli.execute().await
}
