//! Logical tag → physical address translation, fixed for the life of a session.

use crate::address::{AddressParseError, PhysicalAddress, Protocol};
use crate::snapshot::RESERVED_KEYS;
use crate::tags::{self, LogicalTag, TagRole};
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown tag '{0}'")]
pub struct UnknownTagError(pub String);

#[derive(Debug, Error)]
pub enum AddressMapError {
    #[error("failed to read mapping file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mapping file {path} must be a JSON object of tag -> address: {source}")]
    Format {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("tag name '{0}' is reserved for snapshot fields")]
    ReservedName(String),

    #[error("tag {tag}: {source}")]
    Address {
        tag: String,
        #[source]
        source: AddressParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMap {
    protocol: Protocol,
    entries: BTreeMap<LogicalTag, PhysicalAddress>,
}

impl AddressMap {
    /// Built-in default map for the given protocol.
    pub fn builtin(protocol: Protocol) -> Self {
        let mut entries = BTreeMap::new();
        for tag in tags::KNOWN_TAGS {
            let text = match protocol {
                Protocol::S7 => tag.s7_default,
                Protocol::Modbus => tag.modbus_default,
            };
            // Defaults are compile-time constants covered by tests.
            if let Ok(addr) = PhysicalAddress::parse(protocol, text) {
                entries.insert(LogicalTag::from(*tag), addr);
            }
        }
        Self { protocol, entries }
    }

    pub fn from_pairs<I, K, V>(protocol: Protocol, pairs: I) -> Result<Self, AddressMapError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut entries = BTreeMap::new();
        for (tag, text) in pairs {
            let tag = tag.into();
            if RESERVED_KEYS.iter().any(|k| k.eq_ignore_ascii_case(&tag)) {
                return Err(AddressMapError::ReservedName(tag));
            }
            let addr = PhysicalAddress::parse(protocol, text.as_ref())
                .map_err(|source| AddressMapError::Address {
                    tag: tag.clone(),
                    source,
                })?;
            entries.insert(LogicalTag::new(tag), addr);
        }
        Ok(Self { protocol, entries })
    }

    pub fn from_json_str(protocol: Protocol, json: &str, origin: &str) -> Result<Self, AddressMapError> {
        let raw: BTreeMap<String, String> =
            serde_json::from_str(json).map_err(|source| AddressMapError::Format {
                path: origin.to_string(),
                source,
            })?;
        Self::from_pairs(protocol, raw)
    }

    /// Load the override file when present and non-empty, otherwise the built-in map.
    pub fn load(protocol: Protocol, path: Option<&Path>) -> Result<Self, AddressMapError> {
        let Some(path) = path else {
            return Ok(Self::builtin(protocol));
        };
        let display = path.display().to_string();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("mapping file {} not found, using built-in map", display);
                return Ok(Self::builtin(protocol));
            }
            Err(source) => {
                return Err(AddressMapError::Io {
                    path: display,
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            warn!("mapping file {} is empty, using built-in map", display);
            return Ok(Self::builtin(protocol));
        }
        let map = Self::from_json_str(protocol, &text, &display)?;
        if map.is_empty() {
            warn!("mapping file {} has no entries, using built-in map", display);
            return Ok(Self::builtin(protocol));
        }
        info!("loaded {} tag addresses from {}", map.len(), display);
        Ok(map)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn resolve(&self, tag: &str) -> Result<PhysicalAddress, UnknownTagError> {
        self.entries
            .get(tag)
            .copied()
            .ok_or_else(|| UnknownTagError(tag.to_string()))
    }

    pub fn role(&self, tag: &str) -> Result<TagRole, UnknownTagError> {
        if self.entries.contains_key(tag) {
            Ok(tags::role_of(tag))
        } else {
            Err(UnknownTagError(tag.to_string()))
        }
    }

    /// Canonical tag handle for a name, if the map knows it.
    pub fn tag(&self, name: &str) -> Result<LogicalTag, UnknownTagError> {
        self.entries
            .get_key_value(name)
            .map(|(tag, _)| tag.clone())
            .ok_or_else(|| UnknownTagError(name.to_string()))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    /// Tags in sorted order.
    pub fn tags(&self) -> impl Iterator<Item = &LogicalTag> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&LogicalTag, &PhysicalAddress)> {
        self.entries.iter()
    }

    pub fn tags_with_role(&self, role: TagRole) -> Vec<LogicalTag> {
        self.entries
            .keys()
            .filter(|t| tags::role_of(t.as_str()) == role)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let object: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(tag, addr)| (tag.to_string(), serde_json::Value::String(addr.to_string())))
            .collect();
        serde_json::Value::Object(object)
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&self.to_json())?;
        std::fs::write(path, text + "\n")
    }
}
