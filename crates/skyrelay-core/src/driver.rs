//! Driver instances and their launch specs.
//!
//! A driver is either a local subprocess speaking the protocol over
//! stdin/stdout, or a TCP link to another broker (`[device]@host[:port]`).
//! Each [`Driver`] value is one *instance*: a restart creates a fresh
//! instance from the same [`DriverLaunch`] with the restart counter bumped,
//! so device ownership and snoops start over.
//!
//! # Lifecycle
//!
//! ```text
//! Starting ──spawned/connected──▶ Running ──EOF/error/stop──▶ Closing
//!                                                            │
//!                          restart allowed and under limit? ─┤
//!                                  yes: successor Starting   │
//!                                  no:  Terminated ◀─────────┘
//! ```

use std::{collections::BTreeSet, fmt, path::PathBuf};

use skyrelay_proto::{BlobHandling, DEFAULT_PORT, Element, PROTOCOL_VERSION};

use crate::{
    error::{CoreError, Result},
    queue::Queue,
    subscription::{Property, Subscriptions},
};

/// Environment variable forcing the driver's device name.
pub const ENV_DEVICE: &str = "INDIDEV";
/// Environment variable naming the driver's config file.
pub const ENV_CONFIG: &str = "INDICONFIG";
/// Environment variable naming the driver's skeleton file.
pub const ENV_SKELETON: &str = "INDISKEL";
/// Environment variable naming the installation prefix.
pub const ENV_PREFIX: &str = "INDIPREFIX";

/// How to launch a local driver subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalLaunch {
    /// Driver executable name
    pub program: String,
    /// Forced device name (`INDIDEV`)
    pub device: Option<String>,
    /// Config file (`INDICONFIG`)
    pub config: Option<String>,
    /// Skeleton file (`INDISKEL`)
    pub skeleton: Option<String>,
    /// Installation prefix (`INDIPREFIX`); the executable is `<prefix>/bin/<program>`
    pub prefix: Option<String>,
    /// Remove unset variables from the inherited environment
    pub clear_unset: bool,
}

impl LocalLaunch {
    /// Launch `program` from `PATH` with the inherited environment.
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Self::default() }
    }

    /// Path to execute.
    pub fn executable(&self) -> PathBuf {
        match &self.prefix {
            Some(prefix) => PathBuf::from(prefix).join("bin").join(&self.program),
            None => PathBuf::from(&self.program),
        }
    }

    /// Environment edits for the subprocess.
    ///
    /// `Some` values are set. `None` entries are removed, and only appear
    /// when [`LocalLaunch::clear_unset`] is on.
    pub fn environment(&self) -> Vec<(&'static str, Option<&str>)> {
        [
            (ENV_DEVICE, &self.device),
            (ENV_CONFIG, &self.config),
            (ENV_SKELETON, &self.skeleton),
            (ENV_PREFIX, &self.prefix),
        ]
        .into_iter()
        .filter_map(|(key, value)| match value.as_deref().filter(|v| !v.is_empty()) {
            Some(v) => Some((key, Some(v))),
            None if self.clear_unset => Some((key, None)),
            None => None,
        })
        .collect()
    }
}

/// How to reach a remote broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLaunch {
    /// Device to request; `None` chains every device
    pub device: Option<String>,
    /// Remote host name or address
    pub host: String,
    /// Remote TCP port
    pub port: u16,
}

impl RemoteLaunch {
    /// Parse `[device]@host[:port]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let bad = || CoreError::InvalidRemoteSpec(spec.to_string());

        let (device, address) = spec.split_once('@').ok_or_else(bad)?;
        let (host, port) = match address.split_once(':') {
            Some((host, port)) => (host, port.trim().parse::<u16>().map_err(|_| bad())?),
            None => (address, DEFAULT_PORT),
        };
        let host = host.trim();
        if host.is_empty() {
            return Err(bad());
        }

        let device = device.trim();
        Ok(Self {
            device: (!device.is_empty()).then(|| device.to_string()),
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` identity shared by every link to the same broker.
    pub fn uid(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Launch spec of a driver, kept across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverLaunch {
    /// Local subprocess
    Local(LocalLaunch),
    /// TCP link to another broker
    Remote(RemoteLaunch),
}

impl DriverLaunch {
    /// Parse a command-line driver argument: remote if it contains `@`.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.contains('@') {
            RemoteLaunch::parse(spec).map(Self::Remote)
        } else {
            Ok(Self::Local(LocalLaunch::new(spec)))
        }
    }

    /// Whether this is a remote link.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// `host:port` identity of a remote link.
    pub fn remote_uid(&self) -> Option<String> {
        match self {
            Self::Local(_) => None,
            Self::Remote(remote) => Some(remote.uid()),
        }
    }

    /// First message queued to a fresh instance.
    ///
    /// Local drivers get a plain versioned `getProperties`. Remote links name
    /// the device they want, or `*` to announce an upstream broker.
    pub fn probe(&self) -> Element {
        let probe = Element::new("getProperties");
        match self {
            Self::Local(_) => probe.with_attribute("version", PROTOCOL_VERSION),
            Self::Remote(remote) => probe
                .with_attribute("device", remote.device.as_deref().unwrap_or("*"))
                .with_attribute("version", PROTOCOL_VERSION),
        }
    }
}

impl fmt::Display for DriverLaunch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(local) => f.write_str(&local.program),
            Self::Remote(remote) => {
                write!(f, "{}@{}:{}", remote.device.as_deref().unwrap_or(""), remote.host, remote.port)
            },
        }
    }
}

/// Lifecycle state of a driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Launch requested, endpoint not yet attached
    Starting,
    /// Exchanging messages
    Running,
    /// Shutting down; device removal notices go out
    Closing,
    /// Gone for good
    Terminated,
}

/// One driver instance.
#[derive(Debug)]
pub struct Driver {
    name: String,
    launch: DriverLaunch,
    queue: Queue,
    state: DriverState,
    devices: BTreeSet<String>,
    snoops: Subscriptions,
    restarts: u32,
    restart: bool,
}

impl Driver {
    /// Create an instance in `Starting`.
    ///
    /// `name` is the persistent name used by the control channel. A remote
    /// link that names a device owns it from the start.
    pub fn new(name: impl Into<String>, launch: DriverLaunch, queue: Queue, restarts: u32) -> Self {
        let mut devices = BTreeSet::new();
        if let DriverLaunch::Remote(RemoteLaunch { device: Some(device), .. }) = &launch {
            devices.insert(device.clone());
        }
        Self {
            name: name.into(),
            launch,
            queue,
            state: DriverState::Starting,
            devices,
            snoops: Subscriptions::new(),
            restarts,
            restart: true,
        }
    }

    /// Persistent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launch spec.
    pub fn launch(&self) -> &DriverLaunch {
        &self.launch
    }

    /// `host:port` identity of a remote link.
    pub fn remote_uid(&self) -> Option<String> {
        self.launch.remote_uid()
    }

    /// Whether this is a remote link.
    pub fn is_remote(&self) -> bool {
        self.launch.is_remote()
    }

    /// Outbound queue and parser.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Mutable outbound queue and parser.
    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queue
    }

    /// Lifecycle state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Endpoint attached: `Starting` becomes `Running`.
    pub fn mark_running(&mut self) {
        if self.state == DriverState::Starting {
            self.state = DriverState::Running;
        }
        self.queue.attach();
    }

    /// Enter `Closing`. Returns false if already closing or gone.
    pub fn begin_close(&mut self) -> bool {
        if matches!(self.state, DriverState::Closing | DriverState::Terminated) {
            return false;
        }
        self.state = DriverState::Closing;
        true
    }

    /// Finish shutdown.
    pub fn terminate(&mut self) {
        self.state = DriverState::Terminated;
        self.queue.clear();
    }

    /// Whether this instance owns `device`.
    pub fn handles_device(&self, device: &str) -> bool {
        self.devices.contains(device)
    }

    /// Claim `device`. Returns true on first sight.
    pub fn claim_device(&mut self, device: &str) -> bool {
        if device.is_empty() || self.devices.contains(device) {
            return false;
        }
        self.devices.insert(device.to_string())
    }

    /// Owned devices in name order.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(String::as_str)
    }

    /// Snoop records.
    pub fn snoops(&self) -> &Subscriptions {
        &self.snoops
    }

    /// Register a snoop on `device`/`name`. Returns false if an existing
    /// snoop already covers it.
    pub fn add_snoop(&mut self, device: &str, name: &str) -> bool {
        if self.snoops.covering(device, name).is_some() {
            return false;
        }
        self.snoops.push(Property::new(device, name));
        true
    }

    /// Snoop record covering `device`/`name`.
    pub fn snoop_for(&self, device: &str, name: &str) -> Option<&Property> {
        self.snoops.covering(device, name)
    }

    /// Apply an `enableBLOB` directive to the covering snoop, if any.
    pub fn set_snoop_blob(&mut self, device: &str, name: &str, value: &str) -> bool {
        match (self.snoops.covering_mut(device, name), BlobHandling::parse(value)) {
            (Some(snoop), Some(mode)) => {
                snoop.blob = mode;
                true
            },
            _ => false,
        }
    }

    /// Restarts so far in this driver's history.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Whether a close may restart this driver.
    pub fn restart_enabled(&self) -> bool {
        self.restart
    }

    /// Prevent restart after the next close (explicit `stop`).
    pub fn disable_restart(&mut self) {
        self.restart = false;
    }

    /// Fresh instance on `queue` to start after this one closes, if restart
    /// is allowed and the counter is below `max_restarts`.
    pub fn successor(&self, max_restarts: u32, queue: Queue) -> Option<Driver> {
        if !self.restart || self.restarts >= max_restarts {
            return None;
        }
        Some(Driver::new(self.name.clone(), self.launch.clone(), queue, self.restarts + 1))
    }
}
