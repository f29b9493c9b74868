//! Skyrelay production server.
//!
//! Routes protocol messages between client connections and driver
//! connections (local subprocesses or links to other brokers).
//!
//! # Architecture
//!
//! The [`Broker`] follows the Sans-IO pattern: it owns every session and
//! driver instance, consumes [`BrokerEvent`]s and returns [`BrokerAction`]s.
//! [`Server`] is the production glue around it: Tokio listeners, one
//! reader and one writer task per connection, driver subprocesses and the
//! control channel. Those tasks only move bytes and report back over a
//! single channel; the broker itself runs on the routing loop in
//! [`Server::run`] and is never shared.
//!
//! # Components
//!
//! - [`Broker`]: routing state machine (pure logic, no I/O)
//! - [`Server`]: production runtime that executes broker actions
//! - [`DeviceLog`]: appender for driver `message` records

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod config;
mod control;
mod device_log;
mod error;
mod process;
mod router;
mod transport;

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
};

pub use broker::{
    Broker, BrokerAction, BrokerConfig, BrokerEvent, DEFAULT_MAX_QUEUE_BYTES, DEFAULT_MAX_RESTARTS,
    DEFAULT_MAX_STREAM_BYTES, LogLevel,
};
pub use config::{DEFAULT_UNIX_SOCKET, ServerRuntimeConfig};
pub use control::MAX_CONTROL_LINE;
pub use device_log::DeviceLog;
pub use error::ServerError;
use skyrelay_core::{ConnId, DriverLaunch};
use tokio::{
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
    sync::mpsc,
    task::JoinHandle,
};
use transport::{EventSender, Link};

/// Production skyrelay server.
///
/// Wraps [`Broker`] with TCP and local socket listeners, driver processes
/// and the optional control channel.
pub struct Server {
    broker_config: BrokerConfig,
    drivers: Vec<(String, DriverLaunch)>,
    tcp: TcpListener,
    unix: Option<UnixListener>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    control: Option<JoinHandle<()>>,
    device_log: Option<DeviceLog>,
}

impl Server {
    /// Validate the configuration and bind every listener.
    ///
    /// Drivers are not started until [`Server::run`].
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let drivers = config.validate()?;

        let tcp = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| ServerError::Transport(format!("bind {}: {e}", config.bind_address)))?;

        let unix = match &config.unix_socket {
            Some(path) => Some(
                transport::bind_unix(path)
                    .map_err(|e| ServerError::Transport(format!("bind {}: {e}", path.display())))?,
            ),
            None => None,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let control = match &config.fifo {
            Some(path) => Some(
                control::spawn_control(path.clone(), events_tx.clone())
                    .map_err(|e| ServerError::Config(format!("open {}: {e}", path.display())))?,
            ),
            None => None,
        };

        let device_log = config.log_dir.clone().map(DeviceLog::new);

        let mut broker_config = config.broker;
        broker_config.control_channel = control.is_some();
        broker_config.device_log = device_log.is_some();

        Ok(Self { broker_config, drivers, tcp, unix, events_tx, events_rx, control, device_log })
    }

    /// Local TCP address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.tcp.local_addr()?)
    }

    /// Start the configured drivers and run the routing loop.
    ///
    /// Returns `Ok` when the broker has nothing left to serve and an error
    /// when a driver cannot be started or a listener fails for good.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self { broker_config, drivers, tcp, unix, events_tx, mut events_rx, control, device_log } = self;
        tracing::info!("listening on {}", tcp.local_addr()?);

        let mut runtime = Runtime { broker: Broker::new(broker_config), links: HashMap::new(), events_tx, device_log };
        let result = runtime.serve(drivers, &tcp, unix.as_ref(), &mut events_rx).await;

        runtime.shutdown();
        if let Some(control) = control {
            control.abort();
        }
        result
    }
}

/// What a failed driver spawn or remote connect does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpawnFailure {
    /// Stop the server (drivers named on the command line)
    Fatal,
    /// Treat it as a disconnect, so the restart bound applies
    Disconnect,
}

/// Routing loop state: the broker plus the I/O tasks of its connections.
struct Runtime {
    broker: Broker,
    links: HashMap<ConnId, Link>,
    events_tx: EventSender,
    device_log: Option<DeviceLog>,
}

impl Runtime {
    async fn serve(
        &mut self,
        drivers: Vec<(String, DriverLaunch)>,
        tcp: &TcpListener,
        unix: Option<&UnixListener>,
        events_rx: &mut mpsc::UnboundedReceiver<BrokerEvent>,
    ) -> Result<(), ServerError> {
        for (name, launch) in drivers {
            let actions = self.broker.start_driver(name, launch);
            if let Some(reason) = self.execute(actions, SpawnFailure::Fatal).await? {
                tracing::info!("{reason}");
                return Ok(());
            }
        }

        loop {
            let event = tokio::select! {
                accepted = tcp.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.accept_tcp(stream, peer),
                        Err(e) => tracing::warn!("accept: {e}"),
                    }
                    continue;
                },
                accepted = accept_unix(unix) => {
                    match accepted {
                        Ok(stream) => self.accept_unix(stream),
                        Err(e) => tracing::warn!("local accept: {e}"),
                    }
                    continue;
                },
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => return Err(ServerError::Transport("event channel closed".to_string())),
                },
            };

            let actions = self.broker.process_event(event);
            if let Some(reason) = self.execute(actions, SpawnFailure::Disconnect).await? {
                tracing::info!("{reason}");
                return Ok(());
            }
        }
    }

    fn accept_tcp(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay {peer}: {e}");
        }
        let conn = self.broker.register_client(peer.to_string());
        tracing::info!("{conn} new client from {peer}");
        let (reader, writer) = stream.into_split();
        self.links.insert(conn, Link::spawn(conn, reader, writer, &self.events_tx));
    }

    fn accept_unix(&mut self, stream: UnixStream) {
        let conn = self.broker.register_client("local");
        tracing::info!("{conn} new local client");
        let (reader, writer) = stream.into_split();
        self.links.insert(conn, Link::spawn(conn, reader, writer, &self.events_tx));
    }

    /// Execute broker actions, including those produced by spawning drivers.
    ///
    /// Returns the exit reason when the broker asks to stop.
    async fn execute(
        &mut self,
        actions: Vec<BrokerAction>,
        on_spawn_failure: SpawnFailure,
    ) -> Result<Option<String>, ServerError> {
        let mut work = VecDeque::from(actions);

        while let Some(action) = work.pop_front() {
            match action {
                BrokerAction::Write { conn, chunk } => match self.links.get(&conn) {
                    Some(link) => {
                        if !link.send(chunk) {
                            tracing::debug!("{conn} writer gone");
                        }
                    },
                    None => tracing::debug!("{conn} write to unknown link"),
                },

                BrokerAction::Close { conn, reason } => {
                    if let Some(link) = self.links.remove(&conn) {
                        tracing::debug!("{conn} closing link: {reason}");
                        link.close();
                    }
                },

                BrokerAction::SpawnDriver { conn, name, launch } => {
                    let spawned = match &launch {
                        DriverLaunch::Local(local) => process::spawn_driver(conn, local, &self.events_tx),
                        DriverLaunch::Remote(remote) => {
                            transport::connect_remote(conn, remote, &self.events_tx).await
                        },
                    };
                    let event = match spawned {
                        Ok(link) => {
                            self.links.insert(conn, link);
                            BrokerEvent::DriverSpawned { conn }
                        },
                        Err(e) if on_spawn_failure == SpawnFailure::Fatal => {
                            return Err(ServerError::Spawn { driver: name, reason: e.to_string() });
                        },
                        Err(e) => {
                            tracing::error!("{conn} start {name}: {e}");
                            BrokerEvent::Disconnected { conn, reason: format!("start failed: {e}") }
                        },
                    };
                    work.extend(self.broker.process_event(event));
                },

                BrokerAction::RecordDeviceMessage { device, timestamp, message } => {
                    if let Some(log) = &mut self.device_log
                        && let Err(e) = log.record(&device, timestamp.as_deref(), &message)
                    {
                        tracing::warn!("device log {}: {e}", log.dir().display());
                    }
                },

                BrokerAction::Log { level, message } => match level {
                    LogLevel::Trace => tracing::trace!("{message}"),
                    LogLevel::Debug => tracing::debug!("{message}"),
                    LogLevel::Info => tracing::info!("{message}"),
                    LogLevel::Warn => tracing::warn!("{message}"),
                    LogLevel::Error => tracing::error!("{message}"),
                },

                BrokerAction::Exit { reason } => return Ok(Some(reason)),
            }
        }

        Ok(None)
    }

    fn shutdown(&mut self) {
        for (_, link) in self.links.drain() {
            link.close();
        }
    }
}

async fn accept_unix(listener: Option<&UnixListener>) -> std::io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}
