//! CTI object model: typed observables, relationships and their metadata.
//!
//! Objects are STIX-shaped but pragmatic: a content payload (a JSON object
//! whose `type` field names the object kind and whose `id` has the form
//! `<type>--<uuid>`) plus a metadata record kept separately by the store.

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Traffic Light Protocol sensitivity marking.
///
/// The ordering `white < green < amber < red` is load-bearing: TLP on a
/// stored object only ever moves up the lattice.
///
/// # Examples
///
/// ```
/// use cti_core::Tlp;
///
/// assert!(Tlp::White < Tlp::Red);
/// assert_eq!("amber".parse::<Tlp>().unwrap(), Tlp::Amber);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tlp {
    /// Unlimited disclosure.
    White,
    /// Community-wide disclosure.
    Green,
    /// Limited disclosure.
    Amber,
    /// Named recipients only.
    Red,
}

impl Tlp {
    /// String form as it appears in metadata and history lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tlp::White => "white",
            Tlp::Green => "green",
            Tlp::Amber => "amber",
            Tlp::Red => "red",
        }
    }
}

impl fmt::Display for Tlp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tlp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "white" => Ok(Tlp::White),
            "green" => Ok(Tlp::Green),
            "amber" => Ok(Tlp::Amber),
            "red" => Ok(Tlp::Red),
            other => Err(format!("invalid tlp: {other}")),
        }
    }
}

/// Metadata record the store keeps per fingerprint, separate from content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Object id the metadata currently belongs to.
    pub id: String,
    /// Content type, cached for risk aggregation.
    #[serde(rename = "type")]
    pub object_type: String,
    /// Sensitivity marking; only ever raised.
    pub tlp: Tlp,
    /// Risk score in `[0, 100]`; raised by updates, lowered only by decay.
    pub risk: u8,
    /// Who contributed the datum: an agent name, a feed name, or "server".
    pub origin: String,
    /// Append-only, timestamped event log.
    pub history: Vec<String>,
}

impl Metadata {
    pub(crate) fn new(id: String, object_type: String, origin: String, tlp: Tlp, risk: u8) -> Self {
        let line = format!(
            "{}: Created by {} [{}, {}]",
            timestamp(),
            origin,
            tlp,
            risk
        );
        Self {
            id,
            object_type,
            tlp,
            risk: risk.min(100),
            origin,
            history: vec![line],
        }
    }
}

/// A CTI object's content payload.
///
/// Thin wrapper over a JSON object. Construction goes through the typed
/// helpers below for telemetry-derived objects; feed-delivered objects are
/// wrapped as-is with [`CtiObject::from_map`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CtiObject(Map<String, Value>);

impl CtiObject {
    /// Wraps an existing JSON object, requiring `id` and `type` fields.
    pub fn from_map(map: Map<String, Value>) -> Option<Self> {
        let has_id = map.get("id").and_then(Value::as_str).is_some();
        let has_type = map.get("type").and_then(Value::as_str).is_some();
        (has_id && has_type).then_some(Self(map))
    }

    fn new(object_type: &str, mut map: Map<String, Value>) -> Self {
        map.insert("type".into(), json!(object_type));
        map.insert("id".into(), json!(new_object_id(object_type)));
        Self(map)
    }

    /// Stable identifier of form `<type>--<uuid>`.
    pub fn id(&self) -> &str {
        self.get_str("id").unwrap_or_default()
    }

    /// Content type, e.g. `ipv4-addr` or `relationship`.
    pub fn object_type(&self) -> &str {
        self.get_str("type").unwrap_or_default()
    }

    /// Borrow a string-valued content field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Borrow the underlying content map.
    pub fn content(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume into the underlying content map.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub(crate) fn insert(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    /// Directed endpoints when this object acts as a graph edge.
    ///
    /// Relationship objects connect `source_ref -> target_ref`;
    /// network-traffic objects connect `src_ref -> dst_ref`. Everything
    /// else is a node.
    pub fn edge_refs(&self) -> Option<(&str, &str)> {
        match self.object_type() {
            "relationship" => Some((self.get_str("source_ref")?, self.get_str("target_ref")?)),
            "network-traffic" => Some((self.get_str("src_ref")?, self.get_str("dst_ref")?)),
            _ => None,
        }
    }
}

/// Mints a fresh `<type>--<uuid>` identifier.
pub fn new_object_id(object_type: &str) -> String {
    format!("{}--{}", object_type, Uuid::new_v4())
}

/// Current time, RFC 3339 UTC with millisecond precision.
pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Renders UNIX epoch seconds as ISO-8601 UTC with millisecond precision
/// and a trailing `Z`, the form file timestamps take on the wire.
pub(crate) fn iso_from_epoch(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        _ => "1970-01-01T00:00:00.000Z".to_string(),
    }
}

// ------------------------------------------------------------------
// Typed constructors
// ------------------------------------------------------------------

/// An identity object; agents appear in the graph as identities.
pub fn identity(name: &str) -> CtiObject {
    let mut map = Map::new();
    map.insert("name".into(), json!(name));
    map.insert("identity_class".into(), json!("individual"));
    CtiObject::new("identity", map)
}

/// An IPv4 address observable.
pub fn ipv4_address(value: &str) -> CtiObject {
    let mut map = Map::new();
    map.insert("value".into(), json!(value));
    CtiObject::new("ipv4-addr", map)
}

/// A process observable; `path` doubles as the working directory.
pub fn process(pid: i64, path: &str, cmdline: &str) -> CtiObject {
    let mut map = Map::new();
    map.insert("pid".into(), json!(pid));
    map.insert("cwd".into(), json!(path));
    map.insert("command_line".into(), json!(cmdline));
    CtiObject::new("process", map)
}

/// A file observable with hashes and ISO-8601 timestamps.
pub fn file(
    name: &str,
    size: i64,
    ctime: &str,
    mtime: &str,
    atime: &str,
    hashes: Map<String, Value>,
) -> CtiObject {
    let mut map = Map::new();
    map.insert("name".into(), json!(name));
    map.insert("size".into(), json!(size));
    map.insert("ctime".into(), json!(ctime));
    map.insert("mtime".into(), json!(mtime));
    map.insert("atime".into(), json!(atime));
    map.insert("hashes".into(), Value::Object(hashes));
    CtiObject::new("file", map)
}

/// A software observable.
pub fn software(name: &str, version: &str, vendor: &str) -> CtiObject {
    let mut map = Map::new();
    map.insert("name".into(), json!(name));
    map.insert("version".into(), json!(version));
    map.insert("vendor".into(), json!(vendor));
    CtiObject::new("software", map)
}

/// A vulnerability record; `external_references` is carried verbatim.
pub fn vulnerability(name: &str, description: &str, external_references: Option<Value>) -> CtiObject {
    let mut map = Map::new();
    map.insert("name".into(), json!(name));
    map.insert("description".into(), json!(description));
    map.insert(
        "external_references".into(),
        external_references.unwrap_or_else(|| json!([])),
    );
    CtiObject::new("vulnerability", map)
}

/// A network-traffic tuple between two previously inserted addresses.
pub fn network_traffic(
    src_ref: &str,
    dst_ref: &str,
    src_port: i64,
    dst_port: i64,
    protocol: &str,
) -> CtiObject {
    let mut map = Map::new();
    map.insert("src_ref".into(), json!(src_ref));
    map.insert("dst_ref".into(), json!(dst_ref));
    map.insert("src_port".into(), json!(src_port));
    map.insert("dst_port".into(), json!(dst_port));
    map.insert("protocols".into(), json!([protocol]));
    CtiObject::new("network-traffic", map)
}

/// A directed, labelled relationship between two objects.
pub fn relationship(source_ref: &str, target_ref: &str, relationship_type: &str) -> CtiObject {
    let mut map = Map::new();
    map.insert("source_ref".into(), json!(source_ref));
    map.insert("target_ref".into(), json!(target_ref));
    map.insert("relationship_type".into(), json!(relationship_type));
    CtiObject::new("relationship", map)
}
