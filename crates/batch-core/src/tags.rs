use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// What a tag does on the plant, which decides how it may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagRole {
    /// Numeric set-point (aggregate dosing channels).
    SetPoint,
    /// Boolean actuator such as a gate; any active actuator means the plant runs.
    Actuator,
    /// Read-only process value.
    Measurement,
    /// Momentary pushbutton: true, then false after the pulse duration.
    Pulse,
    /// Hold-to-write output: true while pressed.
    Hold,
}

impl TagRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagRole::SetPoint => "set_point",
            TagRole::Actuator => "actuator",
            TagRole::Measurement => "measurement",
            TagRole::Pulse => "pulse",
            TagRole::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KnownTag {
    pub name: &'static str,
    pub role: TagRole,
    pub s7_default: &'static str,
    pub modbus_default: &'static str,
}

pub const ARIDO1: KnownTag = KnownTag {
    name: "ARIDO1",
    role: TagRole::SetPoint,
    s7_default: "VW0",
    modbus_default: "HR0",
};

pub const ARIDO2: KnownTag = KnownTag {
    name: "ARIDO2",
    role: TagRole::SetPoint,
    s7_default: "VW2",
    modbus_default: "HR1",
};

pub const ARIDO3: KnownTag = KnownTag {
    name: "ARIDO3",
    role: TagRole::SetPoint,
    s7_default: "VW4",
    modbus_default: "HR2",
};

pub const PESO: KnownTag = KnownTag {
    name: "PESO",
    role: TagRole::Measurement,
    s7_default: "VW6",
    modbus_default: "HR3",
};

pub const COMP1: KnownTag = KnownTag {
    name: "COMP1",
    role: TagRole::Actuator,
    s7_default: "V8.1",
    modbus_default: "C1",
};

pub const COMP2: KnownTag = KnownTag {
    name: "COMP2",
    role: TagRole::Actuator,
    s7_default: "V8.2",
    modbus_default: "C2",
};

pub const COMP3: KnownTag = KnownTag {
    name: "COMP3",
    role: TagRole::Actuator,
    s7_default: "V8.3",
    modbus_default: "C3",
};

pub const COMP4: KnownTag = KnownTag {
    name: "COMP4",
    role: TagRole::Actuator,
    s7_default: "V8.4",
    modbus_default: "C4",
};

pub const COMP5: KnownTag = KnownTag {
    name: "COMP5",
    role: TagRole::Actuator,
    s7_default: "V8.5",
    modbus_default: "C5",
};

pub const INICIO: KnownTag = KnownTag {
    name: "INICIO",
    role: TagRole::Pulse,
    s7_default: "V9.0",
    modbus_default: "C6",
};

pub const APAGADO: KnownTag = KnownTag {
    name: "APAGADO",
    role: TagRole::Pulse,
    s7_default: "V9.1",
    modbus_default: "C7",
};

pub const RESET: KnownTag = KnownTag {
    name: "RESET",
    role: TagRole::Pulse,
    s7_default: "V9.2",
    modbus_default: "C8",
};

pub const TARA: KnownTag = KnownTag {
    name: "TARA",
    role: TagRole::Hold,
    s7_default: "V9.3",
    modbus_default: "C9",
};

pub const KNOWN_TAGS: &[KnownTag] = &[
    ARIDO1, ARIDO2, ARIDO3, PESO, COMP1, COMP2, COMP3, COMP4, COMP5, INICIO, APAGADO, RESET,
    TARA,
];

/// Role of a tag name; names outside the known set are treated as read-only measurements.
pub fn role_of(name: &str) -> TagRole {
    KNOWN_TAGS
        .iter()
        .find(|t| t.name == name)
        .map(|t| t.role)
        .unwrap_or(TagRole::Measurement)
}

/// Symbolic tag name as used by the dashboard and the mapping file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTag(String);

impl LogicalTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LogicalTag {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<KnownTag> for LogicalTag {
    fn from(tag: KnownTag) -> Self {
        Self(tag.name.to_string())
    }
}

impl Borrow<str> for LogicalTag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
