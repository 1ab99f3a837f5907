//! Logstream Daemon
//!
//! Tails local log files (or directories of them) through a logstream
//! [`Manager`] and bridges the session stream to stdio as JSON lines.
//!
//! # Usage
//!
//! ```bash
//! # Print a file once and exit
//! logstreamd /var/log/app.log
//!
//! # Follow every *.log file in a directory, picking up new ones
//! logstreamd --follow --dir /var/log/myapp
//!
//! # Follow two files, last 100 lines each, only from "api.log" in the dir
//! logstreamd -f --tail-lines 100 --dir --enable api.log /var/log/myapp
//! ```
//!
//! Commands are read from stdin, one JSON object per line:
//!
//! ```json
//! {"session_id": "3f2c...", "command": "pause"}
//! ```
//!
//! # Environment Variables
//!
//! - `LOGSTREAM_CONFIG`: Path to the TOML config file
//! - `LOGSTREAM_OUTPUT_CAPACITY`, `LOGSTREAM_MAX_CONCURRENT_STREAMS`, ...: see
//!   [`logstream_core::config`]
//! - `RUST_LOG`: Log filter (logs go to stderr)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (closes every session)

mod server;
mod sources;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use logstream_core::{
    default_config_path, load_config_from_path, ConfigOverrides, Handler, HandlerRegistry,
    Manager, SessionOptions, ENABLED_SOURCES_PARAM,
};

use crate::server::Completion;
use crate::sources::{DirectoryResolver, FileOpener};

/// Resource key for single files
const FILE_KEY: &str = "file";
/// Resource key for directories of log files
const DIR_KEY: &str = "dir";

/// Stream local log files as JSON lines
#[derive(Debug, Parser)]
#[command(name = "logstreamd", version, about)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(long, env = "LOGSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Keep streaming as the files grow
    #[arg(short, long)]
    follow: bool,

    /// Start from the last N lines of each file
    #[arg(long, value_name = "N")]
    tail_lines: Option<u64>,

    /// Stop reading each file after N bytes
    #[arg(long, value_name = "N")]
    limit_bytes: Option<u64>,

    /// Emit the rotated `<file>.1` before the current file
    #[arg(long)]
    previous: bool,

    /// Treat each path as a directory of `*.log` files
    #[arg(long)]
    dir: bool,

    /// Only stream the file with this name inside a directory
    #[arg(long, requires = "dir")]
    target: Option<String>,

    /// Comma-separated source IDs to stream (file names with --dir)
    #[arg(long, value_delimiter = ',')]
    enable: Vec<String>,

    /// Polling interval for followed files and watched directories
    #[arg(long, value_name = "MS", default_value_t = 500)]
    poll_interval_ms: u64,

    /// Override the per-session concurrent stream limit
    #[arg(long)]
    max_concurrent_streams: Option<usize>,

    /// Override the reconnect attempt limit
    #[arg(long)]
    reconnect_attempts: Option<u32>,

    /// Files (or directories with --dir) to stream
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

impl Args {
    fn session_options(&self) -> SessionOptions {
        let mut options = SessionOptions {
            target: self.target.clone(),
            follow: self.follow,
            include_previous: self.previous,
            tail_lines: self.tail_lines,
            limit_bytes: self.limit_bytes,
            ..SessionOptions::default()
        };
        if !self.enable.is_empty() {
            options = options.with_param(ENABLED_SOURCES_PARAM, self.enable.join(","));
        }
        options
    }

    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::default();
        if let Some(max) = self.max_concurrent_streams {
            overrides = overrides.with_max_concurrent_streams(max);
        }
        if let Some(attempts) = self.reconnect_attempts {
            overrides = overrides.with_reconnect_max_attempts(attempts);
        }
        overrides
    }

    fn registry(&self) -> Result<HandlerRegistry> {
        let poll = Duration::from_millis(self.poll_interval_ms.max(1));
        HandlerRegistry::builder()
            .handler(FILE_KEY, Handler::new(FileOpener::new(poll)))
            .resolver(DIR_KEY, DirectoryResolver::new(poll), FILE_KEY)
            .build()
            .context("Failed to build handler registry")
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("Failed to start Tokio runtime")?;
    let result = runtime.block_on(run(args));

    // A pending stdin read cannot be cancelled; don't wait for it
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(args: Args) -> Result<()> {
    // Logs go to stderr; stdout carries the session stream
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("logstreamd=info".parse()?)
                .add_directive("logstream_core=info".parse()?),
        )
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting logstream daemon");

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path.clone()).with_context(|| match &config_path {
            Some(path) => format!("Failed to load config from {}", path.display()),
            None => "Failed to load config".to_string(),
        })?;
    let overrides = args.overrides();
    if !overrides.is_empty() {
        overrides.apply(&mut config);
        config.validate().context("Invalid configuration overrides")?;
    }
    info!(source = %config.source(), "Configuration loaded");

    let manager = Manager::new(args.registry()?, config);
    let commands = server::command_stream(tokio::io::stdin());
    let outputs = manager.stream(commands)?;

    let key = if args.dir { DIR_KEY } else { FILE_KEY };
    let options = args.session_options();
    let sessions: Vec<_> = args
        .paths
        .iter()
        .map(|path| {
            let session = manager.create_session(
                key,
                path.to_string_lossy(),
                serde_json::json!({ "path": path }),
                options.clone(),
            );
            info!(session_id = %session.id, path = %path.display(), "Streaming");
            session.id
        })
        .collect();

    // Without --follow the run ends once every source has been read
    let completion = (!args.follow).then(|| Completion::new(manager.clone(), sessions));

    tokio::select! {
        result = server::forward(outputs, tokio::io::stdout(), completion) => {
            if let Err(e) = result {
                error!(error = %e, "Output bridge failed");
            }
        }
        () = shutdown_signal() => {}
    }

    manager.shutdown().await;
    info!("Logstream daemon stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
