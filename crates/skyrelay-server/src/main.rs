//! Skyrelay server binary.
//!
//! # Usage
//!
//! ```bash
//! # Serve two local drivers on the default port
//! skyrelay-server indi_simulator_telescope indi_simulator_ccd
//!
//! # Chain a camera from another broker and accept control commands
//! skyrelay-server -f /tmp/skyrelay.ctl "CCD Simulator@observatory:7624"
//! ```
//!
//! The process always exits with status 1: either setup failed or the
//! broker ran out of drivers to serve.

use std::{path::PathBuf, process::ExitCode};

use clap::{ArgAction, Parser};
use skyrelay_proto::DEFAULT_PORT;
use skyrelay_server::{BrokerConfig, DEFAULT_UNIX_SOCKET, Server, ServerError, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const MIB: usize = 1024 * 1024;

/// Message broker between astronomy device drivers and clients
#[derive(Parser, Debug)]
#[command(name = "skyrelay-server")]
#[command(version)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Local socket path
    #[arg(short, long, default_value = DEFAULT_UNIX_SOCKET)]
    unix_socket: PathBuf,

    /// Client backlog in MB before the client is disconnected
    #[arg(short, long, default_value_t = 128)]
    max_queue_mb: usize,

    /// Client backlog in MB before streaming BLOB frames are dropped; 0 disables
    #[arg(short = 'd', long, default_value_t = 5)]
    max_stream_mb: usize,

    /// Times a driver is restarted before it is given up
    #[arg(short = 'r', long, default_value_t = 10)]
    max_restarts: u32,

    /// Directory for the device message log
    #[arg(short, long)]
    log_dir: Option<PathBuf>,

    /// Control channel FIFO for starting and stopping drivers
    #[arg(short, long)]
    fifo: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,

    /// Log filter (trace, debug, info, warn, error); overrides -v
    #[arg(long)]
    log_level: Option<String>,

    /// Driver executables or [device]@host[:port] remote specs
    drivers: Vec<String>,
}

impl Args {
    fn filter(&self) -> EnvFilter {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
        let level = match (&self.log_level, self.verbose) {
            (Some(level), _) => level.as_str(),
            (None, 0) => "info",
            (None, 1) => "debug",
            (None, _) => "trace",
        };
        EnvFilter::new(level)
    }

    fn into_config(self) -> ServerRuntimeConfig {
        ServerRuntimeConfig {
            bind_address: format!("0.0.0.0:{}", self.port),
            unix_socket: Some(self.unix_socket),
            fifo: self.fifo,
            log_dir: self.log_dir,
            drivers: self.drivers,
            broker: BrokerConfig {
                max_queue_bytes: self.max_queue_mb.saturating_mul(MIB),
                max_stream_bytes: self.max_stream_mb.saturating_mul(MIB),
                max_restarts: self.max_restarts,
                ..Default::default()
            },
        }
    }
}

async fn serve(config: ServerRuntimeConfig) -> Result<(), ServerError> {
    let server = Server::bind(config).await?;
    tracing::info!("Server listening on {}", server.local_addr()?);
    server.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(args.filter()).init();

    tracing::info!("skyrelay server starting");

    match serve(args.into_config()).await {
        Ok(()) => tracing::info!("Server stopped"),
        Err(e) => tracing::error!("{e}"),
    }
    ExitCode::FAILURE
}
