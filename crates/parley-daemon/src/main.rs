//! `parleyd`: standalone host for out-of-process Parley plugins.
//!
//! Discovers and starts every installed plugin, then treats each line on
//! stdin as a host event to dispatch. Actions the plugins are allowed to
//! take are printed to stdout as JSON lines; logs go to stderr by default.
//! Ctrl+C or end of input stops every plugin and exits.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod stdio;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use parley_plugins::PluginHost;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::stdio::StdoutSink;

/// Parley daemon: hosts and supervises out-of-process plugins.
#[derive(Parser)]
#[command(name = "parleyd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the plugin install root.
    #[arg(long)]
    plugin_root: Option<PathBuf>,

    /// Register installed plugins without starting them.
    #[arg(long)]
    no_start: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if args.verbose {
        config.log.level = "debug".into();
    }
    if let Some(root) = args.plugin_root {
        config.runtime.plugin_root = root;
    }

    if let Err(e) = parley_telemetry::setup_logging(&config.log) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let host = PluginHost::new(config.runtime, Arc::new(StdoutSink::new()))?;
    let loaded = host.load_installed();
    let started = if args.no_start { 0 } else { host.start_all().await };
    info!(
        plugin_root = %host.config().plugin_root.display(),
        loaded,
        started,
        "parleyd ready"
    );

    serve_stdin(&host).await;

    info!("Shutting down");
    host.shutdown().await;
    Ok(())
}

/// Dispatch stdin events until end of input or Ctrl+C.
async fn serve_stdin(host: &PluginHost) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            _ = &mut ctrl_c => {
                debug!("Interrupted");
                return;
            },
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("End of input");
                return;
            },
            Err(e) => {
                warn!(error = %e, "Cannot read stdin");
                return;
            },
        };

        match stdio::parse_event(&line) {
            Ok(Some(event)) => {
                let summary = host.dispatch_event(&event).await;
                if summary.delivered == 0 && summary.intents == 0 {
                    debug!(event = %event.name, "No plugin took the event");
                }
            },
            Ok(None) => {},
            Err(e) => warn!(error = %e, "Ignoring malformed event line"),
        }
    }
}
