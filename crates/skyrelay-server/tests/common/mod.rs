//! Event-driven harness around the sans-IO broker.
//!
//! Plays the runtime's part: it records every write, acknowledges it (unless
//! the connection is stalled), and answers `SpawnDriver` with
//! `DriverSpawned` (or with `Disconnected` once spawns are set to fail), so
//! tests only deal in protocol text.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use skyrelay_core::{ConnId, ControlCommand, DriverLaunch};
use skyrelay_server::{Broker, BrokerAction, BrokerConfig, BrokerEvent};

pub struct Harness {
    pub broker: Broker,
    /// Bytes written per connection since the last `take`
    output: BTreeMap<ConnId, Vec<u8>>,
    /// Connections whose writes are never acknowledged
    stalled: BTreeSet<ConnId>,
    /// Every non-write action, in order
    pub actions: Vec<BrokerAction>,
    /// Driver instances spawned, in order
    pub spawned: Vec<(ConnId, String)>,
    /// Answer spawns as if the program could not be started
    fail_spawns: bool,
}

impl Harness {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            broker: Broker::new(config),
            output: BTreeMap::new(),
            stalled: BTreeSet::new(),
            actions: Vec::new(),
            spawned: Vec::new(),
            fail_spawns: false,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BrokerConfig::default())
    }

    pub fn client(&mut self) -> ConnId {
        self.broker.register_client("test")
    }

    /// Start a driver and discard its probe. Returns the instance id.
    pub fn driver(&mut self, spec: &str) -> ConnId {
        let launch = DriverLaunch::parse(spec).unwrap();
        let actions = self.broker.start_driver(spec, launch);
        self.apply(actions);
        let (conn, _) = self.spawned.last().cloned().unwrap();
        self.take(conn);
        conn
    }

    /// Make every following spawn fail the way a missing program does.
    pub fn fail_spawns(&mut self) {
        self.fail_spawns = true;
    }

    /// Every device log record emitted so far.
    pub fn device_records(&self) -> Vec<(String, Option<String>, String)> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                BrokerAction::RecordDeviceMessage { device, timestamp, message } => {
                    Some((device.clone(), timestamp.clone(), message.clone()))
                },
                _ => None,
            })
            .collect()
    }

    pub fn stall(&mut self, conn: ConnId) {
        self.stalled.insert(conn);
    }

    pub fn send(&mut self, conn: ConnId, xml: &str) {
        self.event(BrokerEvent::Received { conn, data: Bytes::copy_from_slice(xml.as_bytes()) });
    }

    pub fn disconnect(&mut self, conn: ConnId) {
        self.event(BrokerEvent::Disconnected { conn, reason: "EOF".to_string() });
    }

    pub fn control(&mut self, line: &str) {
        let command = ControlCommand::parse(line).unwrap();
        self.event(BrokerEvent::Control(command));
    }

    pub fn event(&mut self, event: BrokerEvent) {
        let actions = self.broker.process_event(event);
        self.apply(actions);
    }

    /// Drain everything written to `conn`.
    pub fn take(&mut self, conn: ConnId) -> String {
        let bytes = self.output.remove(&conn).unwrap_or_default();
        String::from_utf8(bytes).unwrap()
    }

    pub fn was_closed(&self, conn: ConnId) -> bool {
        self.actions.iter().any(|a| matches!(a, BrokerAction::Close { conn: c, .. } if *c == conn))
    }

    pub fn exited(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, BrokerAction::Exit { .. }))
    }

    pub fn logged(&self, needle: &str) -> bool {
        self.actions.iter().any(|a| matches!(a, BrokerAction::Log { message, .. } if message.contains(needle)))
    }

    fn apply(&mut self, actions: Vec<BrokerAction>) {
        let mut pending = VecDeque::from(actions);
        while let Some(action) = pending.pop_front() {
            let follow_up = match action {
                BrokerAction::Write { conn, chunk } => {
                    self.output.entry(conn).or_default().extend_from_slice(&chunk);
                    if self.stalled.contains(&conn) {
                        continue;
                    }
                    BrokerEvent::Written { conn, n: chunk.len() }
                },
                BrokerAction::SpawnDriver { conn, name, launch } => {
                    self.spawned.push((conn, name.clone()));
                    self.actions.push(BrokerAction::SpawnDriver { conn, name, launch });
                    if self.fail_spawns {
                        BrokerEvent::Disconnected { conn, reason: "start failed: not found".to_string() }
                    } else {
                        BrokerEvent::DriverSpawned { conn }
                    }
                },
                other => {
                    self.actions.push(other);
                    continue;
                },
            };
            pending.extend(self.broker.process_event(follow_up));
        }
    }
}
