//! Property subscription records.
//!
//! Clients subscribe to device properties; drivers snoop on other drivers'
//! properties. Both are lists of [`Property`] records with the same matching
//! rule: the device must be equal, and an empty property name covers every
//! property of that device.

use skyrelay_proto::BlobHandling;

/// One `(device, property, BLOB mode)` interest record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Device name
    pub device: String,
    /// Property name; empty covers the whole device
    pub name: String,
    /// BLOB delivery policy for this record
    pub blob: BlobHandling,
}

impl Property {
    /// Create a record with BLOBs disabled.
    pub fn new(device: impl Into<String>, name: impl Into<String>) -> Self {
        Self { device: device.into(), name: name.into(), blob: BlobHandling::Never }
    }

    /// Whether this record covers `device`/`name`.
    pub fn covers(&self, device: &str, name: &str) -> bool {
        self.device == device && (self.name.is_empty() || self.name == name)
    }

    /// Whether this record is exactly `device`/`name`.
    pub fn is_exactly(&self, device: &str, name: &str) -> bool {
        self.device == device && self.name == name
    }
}

/// Ordered list of interest records.
#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    records: Vec<Property>,
}

impl Subscriptions {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record without checking for duplicates.
    pub fn push(&mut self, property: Property) {
        self.records.push(property);
    }

    /// First record covering `device`/`name`.
    pub fn covering(&self, device: &str, name: &str) -> Option<&Property> {
        self.records.iter().find(|p| p.covers(device, name))
    }

    /// Mutable first record covering `device`/`name`.
    pub fn covering_mut(&mut self, device: &str, name: &str) -> Option<&mut Property> {
        self.records.iter_mut().find(|p| p.covers(device, name))
    }

    /// Record for exactly `device`/`name`.
    pub fn exact(&self, device: &str, name: &str) -> Option<&Property> {
        self.records.iter().find(|p| p.is_exactly(device, name))
    }

    /// Mutable record for exactly `device`/`name`.
    pub fn exact_mut(&mut self, device: &str, name: &str) -> Option<&mut Property> {
        self.records.iter_mut().find(|p| p.is_exactly(device, name))
    }

    /// Set every record's BLOB mode.
    pub fn set_all_blob(&mut self, blob: BlobHandling) {
        for record in &mut self.records {
            record.blob = blob;
        }
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.records.iter()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
