//! Client sessions.
//!
//! A client is a consumer connection (GUI, script, or a downstream broker
//! chained onto this one). Its interest is learned from the traffic it sends:
//! a deviceless `getProperties` asks for everything, `getProperties` with a
//! device records a subscription, and `device='*'` marks the peer as an
//! upstream chained broker.

use skyrelay_proto::BlobHandling;

use crate::{
    queue::Queue,
    subscription::{Property, Subscriptions},
};

/// Blanket subscription state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllProps {
    /// Only explicit subscriptions
    #[default]
    None,
    /// Plain client that asked for everything
    All,
    /// Chained broker that announced itself with `device='*'`
    Upstream,
}

impl AllProps {
    /// Whether the client receives traffic for every device.
    pub fn wants_everything(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// One connected client.
#[derive(Debug)]
pub struct Client {
    label: String,
    queue: Queue,
    allprops: AllProps,
    props: Subscriptions,
    blob: BlobHandling,
}

impl Client {
    /// Create a session with no subscriptions and BLOBs disabled.
    pub fn new(label: impl Into<String>, queue: Queue) -> Self {
        Self {
            label: label.into(),
            queue,
            allprops: AllProps::None,
            props: Subscriptions::new(),
            blob: BlobHandling::Never,
        }
    }

    /// Peer description for logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Outbound queue and parser.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Mutable outbound queue and parser.
    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queue
    }

    /// Blanket subscription state.
    pub fn allprops(&self) -> AllProps {
        self.allprops
    }

    /// Explicit subscriptions.
    pub fn props(&self) -> &Subscriptions {
        &self.props
    }

    /// Session-wide BLOB policy.
    pub fn blob(&self) -> BlobHandling {
        self.blob
    }

    /// Learn interest from an inbound message.
    ///
    /// A device of `*` on a session without subscriptions marks it as an
    /// upstream broker. Any other device is recorded as a subscription. A
    /// deviceless `getProperties` asks for everything, unless the session
    /// already subscribed to something specific or is an upstream broker.
    pub fn note_interest(&mut self, is_get_properties: bool, device: &str, name: &str, is_blob: bool) {
        if !device.is_empty() {
            if device.starts_with('*') && self.props.is_empty() {
                self.allprops = AllProps::Upstream;
            } else {
                self.add_device(device, name, is_blob);
            }
        } else if is_get_properties && self.props.is_empty() && self.allprops != AllProps::Upstream {
            self.allprops = AllProps::All;
        }
    }

    /// Whether the session wants traffic for `device`/`name`.
    pub fn is_interested(&self, device: &str, name: &str) -> bool {
        self.allprops.wants_everything()
            || device.is_empty()
            || self.props.covering(device, name).is_some()
    }

    /// Record a subscription on `device`/`name`.
    ///
    /// BLOB records are deduplicated on the exact pair; other records are
    /// skipped when existing interest already covers the pair.
    pub fn add_device(&mut self, device: &str, name: &str, is_blob: bool) {
        let known = if is_blob {
            self.props.exact(device, name).is_some()
        } else {
            self.is_interested(device, name)
        };
        if !known {
            self.props.push(Property::new(device, name));
        }
    }

    /// Apply an `enableBLOB` directive.
    ///
    /// With a property name the directive creates (if needed) and updates the
    /// exact per-property record. Without one it sets the session default and
    /// every existing record. Unknown values change nothing.
    pub fn apply_enable_blob(&mut self, device: &str, name: &str, value: &str) {
        if !name.is_empty() {
            self.add_device(device, name, true);
        }
        let Some(mode) = BlobHandling::parse(value) else {
            return;
        };

        if name.is_empty() {
            self.blob = mode;
            self.props.set_all_blob(mode);
        } else if let Some(record) = self.props.exact_mut(device, name) {
            record.blob = mode;
        }
    }

    /// BLOB policy for `device`/`name`: the exact per-property record if one
    /// exists, else the session default.
    pub fn effective_blob(&self, device: &str, name: &str) -> BlobHandling {
        self.props.exact(device, name).map_or(self.blob, |p| p.blob)
    }

    /// Interest and BLOB policy combined.
    pub fn accepts(&self, device: &str, name: &str, is_blob: bool) -> bool {
        self.is_interested(device, name) && self.effective_blob(device, name).admits(is_blob)
    }

    /// Whether a snoop request from a driver owning `devices` should reach
    /// this session.
    ///
    /// Upstream brokers get every snoop request; plain "everything" clients
    /// get none; other sessions get it when subscribed to a device the
    /// driver owns.
    pub fn relays_snoops_for<'a>(&self, mut devices: impl Iterator<Item = &'a str>) -> bool {
        match self.allprops {
            AllProps::Upstream => true,
            AllProps::All => false,
            AllProps::None => devices.any(|d| self.props.iter().any(|p| p.device == d)),
        }
    }
}
