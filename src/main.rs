//! undertow - command line entry point

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use undertow::{Client, Config};

/// A BitTorrent client
#[derive(Debug, Parser)]
#[command(name = "undertow")]
#[command(about = "Download a torrent from a .torrent file or magnet URI", long_about = None)]
struct CliArgs {
    /// Path to a .torrent file or a magnet URI
    #[arg(value_name = "TORRENT")]
    torrent: String,

    /// Listening port for incoming peers
    #[arg(short, long, default_value_t = Config::DEFAULT_PORT)]
    port: u16,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (warnings and errors only)
    #[arg(short, long)]
    quiet: bool,
}

impl CliArgs {
    fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::WARN
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false);
    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging(&args);

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &CliArgs) -> Result<()> {
    let mut config = Config::new().with_port(args.port);
    if let Some(dir) = &args.output_dir {
        config = config.with_output_dir(dir.clone());
    }

    let client = Client::start(&args.torrent, config).await?;

    let ctrl_c_client = client.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            ctrl_c_client.stop();
        }
    });

    client.wait().await;

    let metadata = client.metadata();
    info!(
        "Finished: {} ({}/{} pieces, {} bytes left)",
        metadata.name(),
        metadata.pieces_done(),
        metadata.piece_count(),
        metadata.left()
    );
    client.stop();
    Ok(())
}
