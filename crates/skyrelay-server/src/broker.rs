//! Routing broker.
//!
//! Owns every client session and driver instance and decides, for each
//! inbound element, which queues receive a copy. The broker follows the
//! Sans-IO pattern: the runtime feeds it [`BrokerEvent`]s and executes the
//! [`BrokerAction`]s it returns. Nothing here touches sockets, pipes or
//! clocks, which is what lets the integration tests drive it directly.
//!
//! # Output
//!
//! Routing only pushes onto queues. After each event the broker walks the
//! queues it touched and hands the runtime at most one [`BrokerAction::Write`]
//! per idle queue; the runtime reports completion with
//! [`BrokerEvent::Written`], which releases the next chunk.

use std::{collections::BTreeSet, rc::Rc};

use bytes::Bytes;
use skyrelay_core::{
    Client, ConnId, ConnIdAllocator, ControlCommand, Driver, DriverLaunch, Message, Queue,
    Registry, queue::DEFAULT_WRITE_CHUNK,
};
use skyrelay_proto::{DEFAULT_MAX_ELEMENT_SIZE, Element, MessageKind, StreamParser};

/// Default client backlog ceiling (128 MiB).
pub const DEFAULT_MAX_QUEUE_BYTES: usize = 128 * 1024 * 1024;

/// Default backlog above which streaming BLOB frames are dropped (5 MiB).
pub const DEFAULT_MAX_STREAM_BYTES: usize = 5 * 1024 * 1024;

/// Default number of restarts before a driver is abandoned.
pub const DEFAULT_MAX_RESTARTS: u32 = 10;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Client backlog above which the client is disconnected
    pub max_queue_bytes: usize,
    /// Client backlog above which streaming BLOB frames are dropped; 0 disables
    pub max_stream_bytes: usize,
    /// Restarts allowed per driver before it is terminated
    pub max_restarts: u32,
    /// Largest chunk handed to a writer at once
    pub write_chunk: usize,
    /// Largest inbound element accepted from any peer
    pub max_element_size: usize,
    /// A control channel can start drivers later, so running out of drivers
    /// does not end the broker
    pub control_channel: bool,
    /// Emit [`BrokerAction::RecordDeviceMessage`] for driver messages
    pub device_log: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_queue_bytes: DEFAULT_MAX_QUEUE_BYTES,
            max_stream_bytes: DEFAULT_MAX_STREAM_BYTES,
            max_restarts: DEFAULT_MAX_RESTARTS,
            write_chunk: DEFAULT_WRITE_CHUNK,
            max_element_size: DEFAULT_MAX_ELEMENT_SIZE,
            control_channel: false,
            device_log: false,
        }
    }
}

/// Events the broker processes.
///
/// Produced by the runtime's connection, process and control tasks.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Bytes arrived from a client or driver
    Received {
        /// Source connection
        conn: ConnId,
        /// Raw bytes, any chunking
        data: Bytes,
    },

    /// The writer finished a chunk handed out by [`BrokerAction::Write`]
    Written {
        /// Connection written to
        conn: ConnId,
        /// Bytes written
        n: usize,
    },

    /// The connection hit EOF or an I/O error
    Disconnected {
        /// Connection that went away
        conn: ConnId,
        /// Human-readable cause
        reason: String,
    },

    /// A driver's process was spawned or its remote link connected
    DriverSpawned {
        /// Driver connection now attached
        conn: ConnId,
    },

    /// A control channel command
    Control(ControlCommand),
}

/// Actions the runtime executes on behalf of the broker.
#[derive(Debug, Clone)]
pub enum BrokerAction {
    /// Write one chunk to a connection, then report [`BrokerEvent::Written`]
    Write {
        /// Target connection
        conn: ConnId,
        /// Bytes to write in full
        chunk: Bytes,
    },

    /// Tear down a connection's I/O (and kill a driver's process)
    Close {
        /// Connection to close
        conn: ConnId,
        /// Reason for closure
        reason: String,
    },

    /// Launch a driver and report [`BrokerEvent::DriverSpawned`]
    SpawnDriver {
        /// Connection id reserved for the driver
        conn: ConnId,
        /// Persistent driver name
        name: String,
        /// How to launch it
        launch: DriverLaunch,
    },

    /// Append a driver's `message` text to the device log
    RecordDeviceMessage {
        /// Device that sent it
        device: String,
        /// The element's `timestamp` attribute, if any
        timestamp: Option<String>,
        /// Message text
        message: String,
    },

    /// Log a message
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
    },

    /// Nothing is left to serve; the broker process should end
    Exit {
        /// Why
        reason: String,
    },
}

/// Log levels for broker actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Per-message traffic
    Trace,
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Action-based routing broker.
#[derive(Debug)]
pub struct Broker {
    pub(crate) config: BrokerConfig,
    ids: ConnIdAllocator,
    pub(crate) clients: Registry<Client>,
    pub(crate) drivers: Registry<Driver>,
    /// Queues pushed to or acknowledged since the last flush
    pub(crate) dirty: BTreeSet<ConnId>,
    pub(crate) actions: Vec<BrokerAction>,
}

impl Broker {
    /// Create a broker with no connections.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            ids: ConnIdAllocator::default(),
            clients: Registry::new(),
            drivers: Registry::new(),
            dirty: BTreeSet::new(),
            actions: Vec::new(),
        }
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn new_queue(&self) -> Queue {
        Queue::with_parser(StreamParser::with_max_element_size(self.config.max_element_size))
    }

    /// Register a freshly accepted client. Its endpoint is live immediately.
    pub fn register_client(&mut self, label: impl Into<String>) -> ConnId {
        let id = self.ids.next_id();
        let mut queue = self.new_queue();
        queue.attach();
        self.clients.insert(id, Client::new(label, queue));
        id
    }

    /// Start a new driver instance.
    ///
    /// The probe is queued right away and goes out once the runtime reports
    /// [`BrokerEvent::DriverSpawned`].
    pub fn start_driver(&mut self, name: impl Into<String>, launch: DriverLaunch) -> Vec<BrokerAction> {
        let driver = Driver::new(name, launch, self.new_queue(), 0);
        self.spawn_instance(driver);
        self.take_actions()
    }

    fn spawn_instance(&mut self, mut driver: Driver) {
        let id = self.ids.next_id();
        let probe = Rc::new(Message::from_element(&driver.launch().probe()));
        driver.queue_mut().push(&probe);

        self.log(LogLevel::Info, format!("{id} starting driver {} ({})", driver.name(), driver.launch()));
        self.actions.push(BrokerAction::SpawnDriver {
            conn: id,
            name: driver.name().to_string(),
            launch: driver.launch().clone(),
        });
        self.drivers.insert(id, driver);
    }

    /// Process one event and return the actions to execute.
    pub fn process_event(&mut self, event: BrokerEvent) -> Vec<BrokerAction> {
        match event {
            BrokerEvent::Received { conn, data } => self.handle_received(conn, &data),
            BrokerEvent::Written { conn, n } => self.handle_written(conn, n),
            BrokerEvent::Disconnected { conn, reason } => self.close_conn(conn, &reason),
            BrokerEvent::DriverSpawned { conn } => {
                if let Some(driver) = self.drivers.get_mut(conn) {
                    driver.mark_running();
                    self.dirty.insert(conn);
                }
            },
            BrokerEvent::Control(command) => self.handle_control(command),
        }
        self.take_actions()
    }

    fn take_actions(&mut self) -> Vec<BrokerAction> {
        self.flush();
        std::mem::take(&mut self.actions)
    }

    /// Hand out the next chunk of every idle, non-empty queue touched since
    /// the last flush.
    fn flush(&mut self) {
        let max = self.config.write_chunk;
        for conn in std::mem::take(&mut self.dirty) {
            let queue = match (self.clients.get_mut(conn), self.drivers.get_mut(conn)) {
                (Some(client), _) => client.queue_mut(),
                (None, Some(driver)) => driver.queue_mut(),
                (None, None) => continue,
            };
            if !queue.is_ready() {
                continue;
            }
            if let Some(chunk) = queue.next_chunk(max) {
                self.actions.push(BrokerAction::Write { conn, chunk });
            }
        }
    }

    fn handle_received(&mut self, conn: ConnId, data: &[u8]) {
        let parsed = if let Some(client) = self.clients.get_mut(conn) {
            client.queue_mut().feed(data)
        } else if let Some(driver) = self.drivers.get_mut(conn) {
            driver.queue_mut().feed(data)
        } else {
            return;
        };

        let elements = match parsed {
            Ok(elements) => elements,
            Err(e) => {
                self.close_conn(conn, &format!("malformed input: {e}"));
                return;
            },
        };

        for element in elements {
            // A handler may close the connection that sent the element.
            if self.clients.contains(conn) {
                self.client_message(conn, element);
            } else if self.drivers.contains(conn) {
                self.driver_message(conn, element);
            } else {
                break;
            }
        }
    }

    fn handle_written(&mut self, conn: ConnId, n: usize) {
        let result = if let Some(client) = self.clients.get_mut(conn) {
            client.queue_mut().advance(n)
        } else if let Some(driver) = self.drivers.get_mut(conn) {
            driver.queue_mut().advance(n)
        } else {
            return;
        };

        match result {
            Ok(()) => {
                self.dirty.insert(conn);
            },
            Err(e) => self.close_conn(conn, &e.to_string()),
        }
    }

    fn handle_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Start { name, launch } => {
                let driver = Driver::new(name, launch, self.new_queue(), 0);
                self.spawn_instance(driver);
            },
            ControlCommand::Stop { name, device } => {
                let target = self.drivers.iter().find_map(|(id, driver)| {
                    let device_ok = device.as_deref().is_none_or(|d| driver.handles_device(d));
                    (driver.name() == name && device_ok).then_some(id)
                });
                match target {
                    Some(id) => {
                        if let Some(driver) = self.drivers.get_mut(id) {
                            driver.disable_restart();
                        }
                        self.close_driver(id, "stopped by control channel");
                    },
                    None => self.log(LogLevel::Warn, format!("stop: no running driver named {name}")),
                }
            },
        }
    }

    /// Handle one element from a client.
    fn client_message(&mut self, conn: ConnId, mut element: Element) {
        let kind = MessageKind::of(element.tag());
        let is_blob = element.is_blob();

        let Some(client) = self.clients.get_mut(conn) else { return };
        client.note_interest(kind == MessageKind::GetProperties, element.device(), element.name(), is_blob);
        if kind == MessageKind::EnableBlob {
            client.apply_enable_blob(element.device(), element.name(), element.text());
        }

        if kind == MessageKind::PingRequest {
            element.set_tag("pingReply");
            let reply = Rc::new(Message::from_element(&element));
            client.queue_mut().push(&reply);
            self.dirty.insert(conn);
            return;
        }

        self.log(
            LogLevel::Trace,
            format!("{conn} client <{} device='{}' name='{}'>", element.tag(), element.device(), element.name()),
        );

        let message = Rc::new(Message::from_element(&element));
        self.route_to_drivers(element.device(), kind, &message, None);

        if kind == MessageKind::Set {
            self.route_to_snoopers(None, &element, &message);
        }
        if kind == MessageKind::New {
            self.route_to_clients(Some(conn), &element, &message);
        }
    }

    /// Handle one element from a driver.
    fn driver_message(&mut self, conn: ConnId, mut element: Element) {
        let kind = MessageKind::of(element.tag());
        self.log(
            LogLevel::Trace,
            format!("{conn} driver <{} device='{}' name='{}'>", element.tag(), element.device(), element.name()),
        );

        let Some(driver) = self.drivers.get_mut(conn) else { return };

        match kind {
            MessageKind::GetProperties => {
                if driver.add_snoop(element.device(), element.name()) {
                    let line = format!("{conn} {} snooping on {}.{}", driver.name(), element.device(), element.name());
                    self.log(LogLevel::Debug, line);
                }
                let message = Rc::new(Message::from_element(&element));
                self.route_to_upstream(conn, &message);
                self.route_to_drivers(element.device(), kind, &message, Some(conn));
                return;
            },
            MessageKind::EnableBlob => {
                driver.set_snoop_blob(element.device(), element.name(), element.text());
                return;
            },
            _ => {},
        }

        if driver.claim_device(element.device()) {
            let line = format!("{conn} {} owns device {}", driver.name(), element.device());
            self.log(LogLevel::Debug, line);
        }

        if self.config.device_log
            && let Some(text) = element.attribute("message").filter(|m| !m.is_empty())
        {
            self.actions.push(BrokerAction::RecordDeviceMessage {
                device: element.device().to_string(),
                timestamp: element.attribute("timestamp").filter(|t| !t.is_empty()).map(str::to_string),
                message: text.to_string(),
            });
        }

        if kind == MessageKind::PingRequest {
            element.set_tag("pingReply");
            let reply = Rc::new(Message::from_element(&element));
            if let Some(driver) = self.drivers.get_mut(conn) {
                driver.queue_mut().push(&reply);
                self.dirty.insert(conn);
            }
            return;
        }

        let message = Rc::new(Message::from_element(&element));
        self.route_to_clients(None, &element, &message);
        self.route_to_snoopers(Some(conn), &element, &message);
    }

    /// Close a client or driver.
    fn close_conn(&mut self, conn: ConnId, reason: &str) {
        if self.clients.contains(conn) {
            self.close_client(conn, reason);
        } else if self.drivers.contains(conn) {
            self.close_driver(conn, reason);
        }
    }

    /// Drop a client session. Its queued messages are released.
    pub(crate) fn close_client(&mut self, conn: ConnId, reason: &str) {
        if let Some(client) = self.clients.remove(conn) {
            self.log(LogLevel::Info, format!("{conn} client {} closed: {reason}", client.label()));
            self.actions.push(BrokerAction::Close { conn, reason: reason.to_string() });
        }
    }

    /// Shut a driver instance down: announce its devices as removed, then
    /// restart it or let it go.
    fn close_driver(&mut self, conn: ConnId, reason: &str) {
        let Some(mut driver) = self.drivers.remove(conn) else { return };
        if !driver.begin_close() {
            return;
        }
        self.log(LogLevel::Info, format!("{conn} driver {} closed: {reason}", driver.name()));
        self.actions.push(BrokerAction::Close { conn, reason: reason.to_string() });

        for device in driver.devices() {
            let notice = Element::new("delProperty").with_attribute("device", device);
            let message = Rc::new(Message::from_element(&notice));
            self.route_to_clients(None, &notice, &message);
        }

        let successor = driver.successor(self.config.max_restarts, self.new_queue());
        driver.terminate();

        match successor {
            Some(next) => {
                self.log(LogLevel::Info, format!("{} restart #{}", next.name(), next.restarts()));
                self.spawn_instance(next);
            },
            None => {
                if driver.restart_enabled() {
                    let line = format!("{} terminated after #{} restarts", driver.name(), driver.restarts());
                    self.log(LogLevel::Warn, line);
                }
                if self.drivers.is_empty() && !self.config.control_channel {
                    self.actions.push(BrokerAction::Exit { reason: "no drivers left".to_string() });
                }
            },
        }
    }

    pub(crate) fn log(&mut self, level: LogLevel, message: String) {
        self.actions.push(BrokerAction::Log { level, message });
    }

    /// Live client session by id.
    pub fn client(&self, conn: ConnId) -> Option<&Client> {
        self.clients.get(conn)
    }

    /// Live driver instance by id.
    pub fn driver(&self, conn: ConnId) -> Option<&Driver> {
        self.drivers.get(conn)
    }

    /// Live drivers in start order.
    pub fn drivers(&self) -> impl Iterator<Item = (ConnId, &Driver)> {
        self.drivers.iter()
    }

    /// Number of live client sessions.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writes(actions: &[BrokerAction]) -> Vec<(ConnId, Bytes)> {
        actions
            .iter()
            .filter_map(|a| match a {
                BrokerAction::Write { conn, chunk } => Some((*conn, chunk.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn driver_probe_waits_for_spawn() {
        let mut broker = Broker::new(BrokerConfig::default());
        let launch = DriverLaunch::parse("indi_simulator_ccd").unwrap();
        let actions = broker.start_driver("indi_simulator_ccd", launch);

        let Some(BrokerAction::SpawnDriver { conn, .. }) =
            actions.iter().find(|a| matches!(a, BrokerAction::SpawnDriver { .. }))
        else {
            panic!("expected spawn");
        };
        assert!(writes(&actions).is_empty());

        let actions = broker.process_event(BrokerEvent::DriverSpawned { conn: *conn });
        let out = writes(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.as_ref(), b"<getProperties version='1.7'/>");
    }

    #[test]
    fn next_chunk_waits_for_written() {
        let mut broker = Broker::new(BrokerConfig::default());
        let client = broker.register_client("test");

        let first = broker.process_event(BrokerEvent::Received {
            conn: client,
            data: Bytes::from_static(b"<pingRequest uid='1'/><pingRequest uid='2'/>"),
        });
        let out = writes(&first);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.as_ref(), b"<pingReply uid='1'/>");

        let next = broker.process_event(BrokerEvent::Written { conn: client, n: out[0].1.len() });
        assert_eq!(writes(&next)[0].1.as_ref(), b"<pingReply uid='2'/>");
    }

    #[test]
    fn malformed_client_input_closes_client() {
        let mut broker = Broker::new(BrokerConfig::default());
        let client = broker.register_client("test");
        let actions = broker.process_event(BrokerEvent::Received {
            conn: client,
            data: Bytes::from_static(b"not xml"),
        });
        assert!(actions.iter().any(|a| matches!(a, BrokerAction::Close { conn, .. } if *conn == client)));
        assert!(broker.client(client).is_none());
    }

    #[test]
    fn events_for_unknown_connections_are_ignored() {
        let mut broker = Broker::new(BrokerConfig::default());
        let ghost = ConnId::new(42);
        assert!(broker.process_event(BrokerEvent::Written { conn: ghost, n: 3 }).is_empty());
        assert!(
            broker
                .process_event(BrokerEvent::Disconnected { conn: ghost, reason: "eof".into() })
                .is_empty()
        );
    }
}
