//! Runtime configuration.

use std::path::PathBuf;

use skyrelay_core::DriverLaunch;
use skyrelay_proto::DEFAULT_PORT;

use crate::{broker::BrokerConfig, error::ServerError};

/// Default local socket path.
pub const DEFAULT_UNIX_SOCKET: &str = "/tmp/indiserver";

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// TCP address to listen on (e.g., "0.0.0.0:7624")
    pub bind_address: String,
    /// Local socket path; abstract namespace on Linux. `None` disables it.
    pub unix_socket: Option<PathBuf>,
    /// Control channel FIFO
    pub fifo: Option<PathBuf>,
    /// Device message log directory
    pub log_dir: Option<PathBuf>,
    /// Driver executables or `[device]@host[:port]` specs, started in order
    pub drivers: Vec<String>,
    /// Routing configuration
    pub broker: BrokerConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            unix_socket: Some(PathBuf::from(DEFAULT_UNIX_SOCKET)),
            fifo: None,
            log_dir: None,
            drivers: Vec::new(),
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerRuntimeConfig {
    /// Check the configuration and parse the driver specs.
    ///
    /// Returns `(name, launch)` pairs; the name is the driver argument as given.
    pub fn validate(&self) -> Result<Vec<(String, DriverLaunch)>, ServerError> {
        if self.drivers.is_empty() && self.fifo.is_none() {
            return Err(ServerError::Config("at least one driver or a control fifo is required".to_string()));
        }
        if self.broker.write_chunk == 0 {
            return Err(ServerError::Config("write chunk must be non-zero".to_string()));
        }

        self.drivers
            .iter()
            .map(|spec| {
                let launch = DriverLaunch::parse(spec)?;
                Ok((spec.clone(), launch))
            })
            .collect()
    }
}
