//! Fan-out rules.
//!
//! Each function pushes one shared [`Message`] onto every queue that should
//! see it. Iteration always goes over an id snapshot with a liveness check
//! per step, since pushing to a client can close it (backpressure).

use std::{collections::HashSet, rc::Rc};

use skyrelay_core::{ConnId, Message};
use skyrelay_proto::{Element, MessageKind};

use crate::broker::{Broker, LogLevel};

impl Broker {
    /// Send to the drivers responsible for `device`.
    ///
    /// An empty or `*` device goes to every driver, except that a deviceless
    /// message reaches at most one remote link per `host:port`: the remote
    /// broker fans it out to its own drivers. `enableBLOB` only goes to remote
    /// links. Driver queues are not subject to backpressure.
    pub(crate) fn route_to_drivers(
        &mut self,
        device: &str,
        kind: MessageKind,
        message: &Rc<Message>,
        exclude: Option<ConnId>,
    ) {
        let mut advertised = HashSet::new();
        for id in self.drivers.ids() {
            if Some(id) == exclude {
                continue;
            }
            let Some(driver) = self.drivers.get_mut(id) else { continue };

            if !device.is_empty() && !device.starts_with('*') && !driver.handles_device(device) {
                continue;
            }

            let remote = driver.remote_uid();
            if device.is_empty()
                && let Some(uid) = &remote
                && !advertised.insert(uid.clone())
            {
                continue;
            }
            if remote.is_none() && kind == MessageKind::EnableBlob {
                continue;
            }

            driver.queue_mut().push(message);
            self.dirty.insert(id);
        }
    }

    /// Send to drivers snooping on the element's device and property.
    ///
    /// The snoop record's own BLOB mode applies. A remote snooper does not get
    /// data that came from a link to the same remote broker.
    pub(crate) fn route_to_snoopers(&mut self, origin: Option<ConnId>, element: &Element, message: &Rc<Message>) {
        let (device, name, is_blob) = (element.device(), element.name(), element.is_blob());
        let origin_uid = origin.and_then(|id| self.drivers.get(id)).and_then(|d| d.remote_uid());

        for id in self.drivers.ids() {
            let Some(driver) = self.drivers.get_mut(id) else { continue };
            let Some(snoop) = driver.snoop_for(device, name) else { continue };
            if !snoop.blob.admits(is_blob) {
                continue;
            }
            if origin_uid.is_some() && driver.remote_uid() == origin_uid {
                continue;
            }

            driver.queue_mut().push(message);
            self.dirty.insert(id);
        }
    }

    /// Send to every interested client except `exclude`.
    ///
    /// Slow clients are handled before pushing: a streaming BLOB frame is
    /// dropped for a client already past the stream ceiling, and a client
    /// past the queue ceiling is disconnected.
    pub(crate) fn route_to_clients(&mut self, exclude: Option<ConnId>, element: &Element, message: &Rc<Message>) {
        let (device, name, is_blob) = (element.device(), element.name(), element.is_blob());
        let stream = is_blob && element.has_stream_blob();
        let max_stream = self.config.max_stream_bytes;
        let max_queue = self.config.max_queue_bytes;

        for id in self.clients.ids() {
            if Some(id) == exclude {
                continue;
            }
            let Some(client) = self.clients.get_mut(id) else { continue };
            if !client.accepts(device, name, is_blob) {
                continue;
            }

            let queued = client.queue().queued_bytes();
            if stream && max_stream > 0 && queued > max_stream {
                self.log(LogLevel::Debug, format!("{id} {queued} bytes behind, dropping stream BLOB"));
                continue;
            }
            if queued > max_queue {
                self.close_client(id, &format!("{queued} bytes behind, shutting down"));
                continue;
            }

            client.queue_mut().push(message);
            self.dirty.insert(id);
        }
    }

    /// Send a driver's snoop request to chained brokers among the clients.
    ///
    /// Upstream brokers get it unconditionally; other clients only when they
    /// subscribed to a device the requesting driver owns. Plain "everything"
    /// clients never do.
    pub(crate) fn route_to_upstream(&mut self, origin: ConnId, message: &Rc<Message>) {
        let Some(driver) = self.drivers.get(origin) else { return };
        let devices: Vec<String> = driver.devices().map(str::to_string).collect();
        let max_queue = self.config.max_queue_bytes;

        for id in self.clients.ids() {
            let Some(client) = self.clients.get_mut(id) else { continue };
            if !client.relays_snoops_for(devices.iter().map(String::as_str)) {
                continue;
            }

            let queued = client.queue().queued_bytes();
            if queued > max_queue {
                self.close_client(id, &format!("{queued} bytes behind, shutting down"));
                continue;
            }

            client.queue_mut().push(message);
            self.dirty.insert(id);
        }
    }
}
