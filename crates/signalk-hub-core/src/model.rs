//! Signal K data model types.
//!
//! These types represent the pieces of the canonical model that carry data:
//! - Leaf values with their provenance (source + timestamp)
//! - Inbound delta messages, both the flat `values` form emitted by sensor
//!   decoders and the Signal K 1.x `updates` form
//! - Source descriptors, which are folded into one provenance string

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

pub const VESSELS: &str = "vessels";
pub const SELF: &str = "self";
pub const CONTEXT: &str = "context";
pub const VALUE: &str = "value";
pub const SOURCE: &str = "source";
pub const SOURCE_REF: &str = "$source";
pub const TIMESTAMP: &str = "timestamp";

/// Format a timestamp the way every outbound leaf carries it
/// (`2014-08-15T16:00:00.081Z`).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Strict ISO-8601 / RFC 3339 parse. An explicit offset is required.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw.trim()).map(|ts| ts.with_timezone(&Utc))
}

/// A scalar value plus the provenance it was written with.
///
/// The value itself may be structured (a position is a leaf whose value is
/// `{"latitude": .., "longitude": ..}`); what makes it a leaf is that it is
/// written and replaced as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub value: Value,
    pub source: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Leaf {
    /// A leaf with full provenance, as written by the delta merger.
    pub fn new(value: Value, source: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            source: Some(source.into()),
            timestamp: Some(timestamp),
        }
    }

    /// A leaf imported from a document that carried no provenance.
    pub fn bare(value: Value) -> Self {
        Self {
            value,
            source: None,
            timestamp: None,
        }
    }

    /// Parse the `{"value", "timestamp", "source"}` leaf shape.
    ///
    /// `source` may be a plain string, a source descriptor object, or given
    /// as `$source`.
    pub fn from_json(map: &Map<String, Value>) -> Result<Self, LeafError> {
        let value = map.get(VALUE).cloned().ok_or(LeafError::MissingValue)?;

        let timestamp = match map.get(TIMESTAMP) {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(parse_timestamp(raw).map_err(|e| {
                LeafError::InvalidTimestamp {
                    raw: raw.clone(),
                    reason: e.to_string(),
                }
            })?),
            Some(other) => {
                return Err(LeafError::InvalidTimestamp {
                    raw: other.to_string(),
                    reason: "timestamp must be a string".to_string(),
                })
            }
        };

        let source = match map.get(SOURCE).or_else(|| map.get(SOURCE_REF)) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(obj @ Value::Object(_)) => Some(
                serde_json::from_value::<SourceDescriptor>(obj.clone())
                    .map(|d| d.provenance())
                    .unwrap_or_else(|_| obj.to_string()),
            ),
            Some(other) => Some(other.to_string()),
        };

        Ok(Self {
            value,
            source,
            timestamp,
        })
    }

    /// Render the outbound leaf shape. Missing provenance fields are omitted.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(VALUE.to_string(), self.value.clone());
        if let Some(ts) = &self.timestamp {
            map.insert(TIMESTAMP.to_string(), Value::String(format_timestamp(ts)));
        }
        if let Some(source) = &self.source {
            map.insert(SOURCE.to_string(), Value::String(source.clone()));
        }
        Value::Object(map)
    }

    /// Timestamp in outbound form, if any.
    pub fn timestamp_str(&self) -> Option<String> {
        self.timestamp.as_ref().map(format_timestamp)
    }
}

/// Reasons a leaf-shaped JSON object could not be imported.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LeafError {
    #[error("leaf has no value member")]
    MissingValue,

    #[error("unparsable timestamp {raw:?}: {reason}")]
    InvalidTimestamp { raw: String, reason: String },
}

/// A flat inbound delta, or a Signal K 1.x delta with `updates`.
///
/// ```json
/// { "context": "vessels.motu.navigation",
///   "source": {"device": "/dev/actisense", "timestamp": "2014-08-15T16:00:00.081+00:00",
///              "src": "115", "pgn": "128267"},
///   "values": [ {"path": "courseOverGroundTrue", "value": 172.9} ] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Context path, `vessels.<id>` optionally followed by a subpath.
    pub context: String,

    /// Source descriptor of the flat form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDescriptor>,

    /// Values of the flat form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<PathValue>,

    /// Updates of the 1.x form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<Update>,
}

/// A single update within a 1.x delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Reference to a source by label (e.g., "nmea0183.GP").
    #[serde(rename = "$source", default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,

    /// Embedded source object (alternative to $source).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDescriptor>,

    /// ISO 8601 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    pub values: Vec<PathValue>,
}

/// A single path-value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    /// Path relative to the delta context (e.g., "navigation.speedOverGround").
    pub path: String,

    pub value: Value,

    /// Per-value timestamp, overriding the one of the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl PathValue {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            timestamp: None,
        }
    }
}

/// Where a message came from. Which fields are set depends on the producing
/// protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Device or bus the message was read from (e.g., "/dev/actisense").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Source label, used when no device is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Type of source (e.g., "NMEA0183", "NMEA2000", "signalk").
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    /// Timestamp shared by every value of the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// NMEA 2000 source address.
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub src: Option<String>,

    /// NMEA 2000 PGN.
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub pgn: Option<String>,

    /// NMEA 0183 talker ID (e.g., "GP", "II").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talker: Option<String>,

    /// NMEA 0183 sentence type (e.g., "RMC", "GGA").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence: Option<String>,
}

impl SourceDescriptor {
    /// Concatenate the descriptor into the provenance string stored on leaves.
    ///
    /// - NMEA 2000: `device-N2K-src-pgn`
    /// - NMEA 0183: `device-0183-talker-sentence`
    /// - anything else: `device[-src]`
    pub fn provenance(&self) -> String {
        let device = self
            .device
            .as_deref()
            .or(self.label.as_deref())
            .or(self.source_type.as_deref())
            .unwrap_or("unknown");

        let mut parts: Vec<&str> = vec![device];
        if self.pgn.is_some() {
            parts.push("N2K");
            parts.extend(self.src.as_deref());
            parts.extend(self.pgn.as_deref());
        } else if self.sentence.is_some() {
            parts.push("0183");
            parts.extend(self.talker.as_deref());
            parts.extend(self.sentence.as_deref());
        } else {
            parts.extend(self.src.as_deref());
        }
        parts.join("-")
    }
}

/// Accept `"115"` as well as `115` for numeric identifiers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
