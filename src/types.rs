//! Core data model shared by the three connection cores.

use std::collections::HashMap;

use bytes::Bytes;

/// Milliseconds since the Unix epoch, signed so that relative offsets can be
/// expressed with the same type.
pub type GrailTime = i64;

/// A world-model object identifier. UTF-16 on the wire, `String` in memory.
pub type Uri = String;

/// The address of one server (aggregator or world model).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// `ip:port` form accepted by `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A transmitter selector inside a subscription rule. A transmitter matches
/// when `(id & mask) == (base_id & mask)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmitter {
    pub base_id: u64,
    pub mask: u64,
}

/// One sensor selection rule: which transmitters to forward, and how often.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRule {
    pub transmitters: Vec<Transmitter>,
    /// Minimum interval between updates for one transmitter, in milliseconds.
    /// Zero requests every sample.
    pub update_interval: u64,
}

/// A sensor selection request sent to an aggregator. Rules are additive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub physical_layer: u8,
    pub rules: Vec<SubscriptionRule>,
}

/// A decoded sensor sample pushed by an aggregator.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub physical_layer: u8,
    pub tx_id: u64,
    pub rx_id: u64,
    /// Receiver timestamp for the sample.
    pub rx_timestamp: GrailTime,
    /// Received signal strength as reported by the sensor.
    pub rss: f32,
    /// Aggregators forward samples they already know are bad (checksum
    /// failures and the like) with this flag cleared; only valid samples are
    /// surfaced to user callbacks.
    pub valid: bool,
    pub sense_data: Bytes,
}

/// An attribute update pushed from a solver to the world model.
#[derive(Clone, Debug, PartialEq)]
pub struct AttrUpdate {
    /// Registered type name; updates with unregistered names are skipped.
    pub type_name: String,
    pub time: GrailTime,
    pub target: Uri,
    pub data: Bytes,
}

/// One attribute of a world-model object as seen by a client.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub creation_date: GrailTime,
    pub expiration_date: GrailTime,
    pub origin: String,
    pub data: Bytes,
}

/// Mapping from object URI to its known attributes.
pub type WorldState = HashMap<Uri, Vec<Attribute>>;

/// A client query. `object_uri` and each attribute entry are pattern
/// expressions evaluated by the world model, not literal names.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Request {
    pub object_uri: Uri,
    pub attributes: Vec<String>,
    pub start: GrailTime,
    pub stop: GrailTime,
}
