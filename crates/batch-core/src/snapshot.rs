use crate::tags::{self, LogicalTag, TagRole};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// Marker published for tags whose read failed, so a dead link never looks like live data.
pub const ERROR_MARKER: &str = "ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl TagValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Bool(_) => None,
            TagValue::Int(v) => Some(*v as f64),
            TagValue::Float(v) => Some(*v),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TagValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(TagValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(TagValue::Int)
                .or_else(|| n.as_f64().map(TagValue::Float)),
            // Dashboards post form fields as strings.
            serde_json::Value::String(s) => {
                let s = s.trim();
                match s {
                    "true" => Some(TagValue::Bool(true)),
                    "false" => Some(TagValue::Bool(false)),
                    _ => s
                        .parse::<i64>()
                        .map(TagValue::Int)
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().map(TagValue::Float)),
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Value(TagValue),
    Error,
}

impl Reading {
    pub fn value(&self) -> Option<TagValue> {
        match self {
            Reading::Value(v) => Some(*v),
            Reading::Error => None,
        }
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reading::Value(v) => v.serialize(serializer),
            Reading::Error => serializer.serialize_str(ERROR_MARKER),
        }
    }
}

/// Keys the snapshot itself serializes next to the tag values.
pub const RESERVED_KEYS: [&str; 4] = ["running", "connected", "timestamp", "sequence"];

/// Result of one poll cycle. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlantSnapshot {
    #[serde(flatten)]
    pub values: BTreeMap<LogicalTag, Reading>,
    pub running: bool,
    pub connected: bool,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub sequence: u64,
}

impl PlantSnapshot {
    /// Snapshot from a (possibly partial) batch read. Tags the device did not return stay absent.
    pub fn from_readings(
        readings: BTreeMap<LogicalTag, TagValue>,
        timestamp: u64,
        sequence: u64,
    ) -> Self {
        let running = is_running(&readings);
        Self {
            values: readings
                .into_iter()
                .map(|(tag, value)| (tag, Reading::Value(value)))
                .collect(),
            running,
            connected: true,
            timestamp,
            sequence,
        }
    }

    /// Degraded snapshot published while the PLC is unreachable.
    pub fn faulted<'a>(
        tags: impl IntoIterator<Item = &'a LogicalTag>,
        timestamp: u64,
        sequence: u64,
    ) -> Self {
        Self {
            values: tags
                .into_iter()
                .map(|tag| (tag.clone(), Reading::Error))
                .collect(),
            running: false,
            connected: false,
            timestamp,
            sequence,
        }
    }

    pub fn get(&self, tag: &str) -> Option<&Reading> {
        self.values.get(tag)
    }
}

/// True iff any actuator tag is currently active.
pub fn is_running(readings: &BTreeMap<LogicalTag, TagValue>) -> bool {
    readings.iter().any(|(tag, value)| {
        tags::role_of(tag.as_str()) == TagRole::Actuator && value.as_bool() == Some(true)
    })
}
