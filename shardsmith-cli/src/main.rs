//! Shardsmith CLI: inspect and maintain prepared dataset directories.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Shardsmith: versioned, sharded datasets on local disk
#[derive(Parser, Debug)]
#[command(name = "shardsmith", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only data directory to consult (overrides configured roots)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print the metadata of a prepared version directory
    Inspect {
        /// Version directory (`<root>/<name>[/<config>]/<version>`)
        path: PathBuf,
        /// Print the raw metadata as JSON
        #[arg(long)]
        json: bool,
    },
    /// Find where a dataset version lives among the configured roots
    Locate {
        /// `name[/config][:version]`; without a version, lists every version found
        spec: String,
    },
    /// Check that a version directory is complete and its shards readable
    Verify {
        /// Version directory
        path: PathBuf,
    },
    /// Remove staging directories left behind by interrupted builds
    Sweep,
    /// Print the effective settings
    Settings,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "shardsmith", "shardsmith")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "shardsmith.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let mut settings = shardsmith_core::load_settings(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
        settings.extra_data_dirs.clear();
    }

    let mut stdout = std::io::stdout().lock();
    commands::handle_command(cli.command, &settings, &mut stdout)
}
