//! Message classification and BLOB policy values.

use std::fmt;

/// Routing class of a top-level element, derived from its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `getProperties`: subscribe (clients) or snoop (drivers)
    GetProperties,
    /// `def*Vector`: property definition
    Define,
    /// `set*Vector`: value update
    Set,
    /// `new*Vector`: client request to change a value
    New,
    /// `enableBLOB`: BLOB policy directive
    EnableBlob,
    /// `delProperty`: property or device removal
    DelProperty,
    /// `pingRequest`: answered in place by the broker
    PingRequest,
    /// Anything else (`message`, `pingReply`, ...): forwarded as is
    Other,
}

impl MessageKind {
    /// Classify a tag.
    pub fn of(tag: &str) -> Self {
        match tag {
            "getProperties" => Self::GetProperties,
            "enableBLOB" => Self::EnableBlob,
            "delProperty" => Self::DelProperty,
            "pingRequest" => Self::PingRequest,
            t if t.starts_with("def") => Self::Define,
            t if t.starts_with("set") => Self::Set,
            t if t.starts_with("new") => Self::New,
            _ => Self::Other,
        }
    }
}

/// When BLOB traffic is delivered to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlobHandling {
    /// Never deliver BLOBs (the default)
    #[default]
    Never,
    /// Deliver BLOBs along with everything else
    Also,
    /// Deliver only BLOBs
    Only,
}

impl BlobHandling {
    /// Parse the character data of an `enableBLOB` element.
    ///
    /// Surrounding whitespace is ignored; unknown values yield `None` and
    /// leave the current policy untouched.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Never" => Some(Self::Never),
            "Also" => Some(Self::Also),
            "Only" => Some(Self::Only),
            _ => None,
        }
    }

    /// Whether a message with the given BLOB-ness passes this policy.
    pub fn admits(self, is_blob: bool) -> bool {
        match self {
            Self::Never => !is_blob,
            Self::Also => true,
            Self::Only => is_blob,
        }
    }
}

impl fmt::Display for BlobHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Never => "Never",
            Self::Also => "Also",
            Self::Only => "Only",
        })
    }
}
