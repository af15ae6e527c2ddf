//! Reconstruction server binary.
//!
//! ```bash
//! # every setting at its default
//! tomostream-server
//!
//! # settings from a YAML file, chattier logs
//! tomostream-server --config server.yaml --log-level debug
//!
//! # show the effective configuration and exit
//! tomostream-server --config server.yaml --print-config
//! ```
//!
//! `RUST_LOG` takes precedence over `--log-level`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tomostream::config::{ReconstructionSettings, ServerConfig};
use tomostream::dispatch::Dispatcher;
use tomostream::logging;
use tomostream::reconstructor::{SliceReconstructor, WorkerIdentity, ZeroReconstructor};
use tomostream::server::Server;
use tracing::{debug, info, warn};

/// Live tomographic reconstruction server
#[derive(Parser, Debug)]
#[command(name = "tomostream-server")]
#[command(about = "Ingests acquisition packets and answers slice requests")]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<ServerConfig> {
        match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading configuration from {}", path.display())),
            None => Ok(ServerConfig::default()),
        }
    }
}

fn reconstructor(identity: WorkerIdentity, settings: &ReconstructionSettings) -> Box<dyn SliceReconstructor> {
    debug!(
        worker = %identity,
        preview_size = settings.preview_size,
        custom_filter = settings.custom_filter.as_ref().map(Vec::len),
        "Building reconstructor"
    );
    Box::new(ZeroReconstructor)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let config = args.load_config()?;
    if args.print_config {
        print!("{}", config.to_yaml_string()?);
        return Ok(());
    }

    let dispatcher = Dispatcher::from_config(&config.dispatch, &config.reconstruction, reconstructor)?;
    let server = Server::from_config(&config).await?.on_slice_request(dispatcher);
    info!(
        ingest = %server.ingest_addr()?,
        reply = %server.reply_addr()?,
        mode = ?config.ingest_mode,
        refresh = ?config.refresh_endpoint.as_ref().map(ToString::to_string),
        "Reconstruction server ready"
    );

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, draining"),
            Err(e) => warn!(error = %e, "Failed to listen for interrupt, shutting down"),
        }
        shutdown.shutdown();
    });

    server.serve().await?;
    Ok(())
}
