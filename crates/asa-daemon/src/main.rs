// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "asa-daemon", version, about = "Activity sync agent daemon")]
struct Args {
    /// Path to config.json. Defaults to the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured log level with `debug` for this run.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, warnings) = asa_config::load(args.config.as_deref()).context("load configuration")?;

    let filter = if args.debug {
        EnvFilter::new("asa=debug")
    } else {
        EnvFilter::new(format!("asa={}", config.log_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for warning in &warnings {
        tracing::warn!(target: "asa.daemon", %warning, "config warning at startup");
    }

    tracing::info!(target: "asa.daemon", device_id = %config.device_id, "starting asa-daemon");

    asa_daemon::run(config).await.context("daemon exited with an error")
}
