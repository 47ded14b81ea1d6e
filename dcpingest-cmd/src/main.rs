mod archive;
mod decode;
mod render;
mod run;
mod status;

use std::io::stderr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingest daemon.
    ///
    /// Starts every input present in the configuration and writes archived messages
    /// to one JSON-lines file per day in the configured archive directory. Poll status
    /// is checkpointed to the status file, if configured, at the checkpoint interval
    /// and on exit.
    Run {
        /// Daemon configuration file (JSON).
        #[arg(short, long, value_name = "path")]
        config: PathBuf,

        /// Stop after this many seconds rather than running until killed.
        #[arg(long, value_name = "secs")]
        run_for: Option<u64>,
    },
    /// Show the poll status recorded in a status checkpoint file.
    Status {
        /// Status checkpoint file.
        #[arg(short, long, value_name = "path")]
        status_file: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: render::Format,
    },
    /// Decode captured Iridium SBD sessions.
    ///
    /// The input may contain any number of back to back sessions as received from
    /// the gateway.
    SbdDecode {
        /// Captured session file.
        input: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: render::Format,
    },
    /// Synchronize frames in a captured downlink stream and show each frame and the
    /// messages they carry.
    Sync {
        /// Captured downlink stream.
        input: PathBuf,

        /// Largest frame accepted, in bytes.
        #[arg(short, long, default_value_t = 16_000)]
        capacity: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: render::Format,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("DCPINGEST_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Run { config, run_for } => {
            if !config.exists() {
                bail!("{config:?} does not exist");
            }
            run::run(config, run_for.map(Duration::from_secs))
        }
        Commands::Status {
            status_file,
            format,
        } => status::status(status_file, format),
        Commands::SbdDecode { input, format } => decode::sbd_decode(input, format),
        Commands::Sync {
            input,
            capacity,
            format,
        } => decode::sync(input, *capacity, format),
    }
}
