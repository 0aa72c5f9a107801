//! qga
//!
//! Command-line client for a QEMU Guest Agent socket.
//! Defaults come from `QGA_CLIENT_CONFIG`, `QGA_SOCKET` and `QGA_TIMEOUT`.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use qga_client::cli::{self, Args};

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args
        .client_config()
        .context("Failed to load configuration")?;

    debug!(
        socket = %config.socket_path.display(),
        timeout_seconds = config.timeout_seconds,
        "Loaded configuration"
    );

    Ok(cli::run(&args, &config))
}
