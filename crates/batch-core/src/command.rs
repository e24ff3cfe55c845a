use crate::address_map::{AddressMap, UnknownTagError};
use crate::snapshot::TagValue;
use crate::tags::{LogicalTag, TagRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct Unvalidated;

#[derive(Debug, Clone, Copy)]
pub struct Validated;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SetPoint,
    Pulse,
    Hold,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::SetPoint => "set_point",
            CommandKind::Pulse => "pulse",
            CommandKind::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandLimits {
    pub set_point_min: f64,
    pub set_point_max: f64,
}

impl Default for CommandLimits {
    fn default() -> Self {
        Self {
            set_point_min: 0.0,
            set_point_max: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{tag}: value is not numeric")]
    NonNumeric { tag: String },

    #[error("{tag}: value is not finite")]
    NonFinite { tag: String },

    #[error("{tag}: value must be a whole number")]
    NotInteger { tag: String },

    #[error("{tag}: {value} outside [{min}, {max}]")]
    OutOfRange {
        tag: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{tag}: value must be a boolean")]
    NotBoolean { tag: String },

    #[error("{tag}: tag is read-only")]
    ReadOnly { tag: String },

    #[error("{tag}: {kind} command not allowed on a {role} tag")]
    WrongKind {
        tag: String,
        kind: &'static str,
        role: &'static str,
    },

    #[error("{tag}: start requires at least one set-point above zero")]
    StartWithoutSetPoint { tag: String },
}

/// Why a command never reached the device.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error(transparent)]
    UnknownTag(#[from] UnknownTagError),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// A single write request. Only `WriteCommand<Validated>` can be handed to the session.
#[derive(Debug, Clone)]
pub struct WriteCommand<State = Unvalidated> {
    tag: LogicalTag,
    value: TagValue,
    kind: CommandKind,
    _state: PhantomData<State>,
}

impl WriteCommand<Unvalidated> {
    pub fn new(tag: impl Into<LogicalTag>, value: TagValue, kind: CommandKind) -> Self {
        Self {
            tag: tag.into(),
            value,
            kind,
            _state: PhantomData,
        }
    }

    pub fn set_point(tag: impl Into<LogicalTag>, value: TagValue) -> Self {
        Self::new(tag, value, CommandKind::SetPoint)
    }

    pub fn pulse(tag: impl Into<LogicalTag>) -> Self {
        Self::new(tag, TagValue::Bool(true), CommandKind::Pulse)
    }

    pub fn hold(tag: impl Into<LogicalTag>, pressed: bool) -> Self {
        Self::new(tag, TagValue::Bool(pressed), CommandKind::Hold)
    }

    pub fn tag(&self) -> &LogicalTag {
        &self.tag
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn validate(
        self,
        map: &AddressMap,
        limits: &CommandLimits,
    ) -> Result<WriteCommand<Validated>, Rejection> {
        let tag = map.tag(self.tag.as_str())?;
        let addr = map.resolve(tag.as_str())?;
        let role = map.role(tag.as_str())?;
        let name = tag.to_string();

        if role == TagRole::Measurement || !addr.is_writable() {
            return Err(ValidationError::ReadOnly { tag: name }.into());
        }

        let expected_role = match self.kind {
            CommandKind::SetPoint => matches!(role, TagRole::SetPoint | TagRole::Actuator),
            CommandKind::Pulse => role == TagRole::Pulse,
            CommandKind::Hold => role == TagRole::Hold,
        };
        if !expected_role {
            return Err(ValidationError::WrongKind {
                tag: name,
                kind: self.kind.as_str(),
                role: role.as_str(),
            }
            .into());
        }

        let value = if addr.is_digital() {
            coerce_bool(&name, self.value)?
        } else {
            let value = coerce_integer(&name, self.value)?;
            if role == TagRole::SetPoint {
                check_range(&name, value, limits)?;
            }
            value
        };

        Ok(WriteCommand {
            tag,
            value,
            kind: self.kind,
            _state: PhantomData,
        })
    }
}

impl WriteCommand<Validated> {
    pub fn tag(&self) -> &LogicalTag {
        &self.tag
    }

    pub fn value(&self) -> TagValue {
        self.value
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }
}

fn coerce_bool(tag: &str, value: TagValue) -> Result<TagValue, ValidationError> {
    match value {
        TagValue::Bool(_) => Ok(value),
        TagValue::Int(0) => Ok(TagValue::Bool(false)),
        TagValue::Int(1) => Ok(TagValue::Bool(true)),
        _ => Err(ValidationError::NotBoolean {
            tag: tag.to_string(),
        }),
    }
}

fn coerce_integer(tag: &str, value: TagValue) -> Result<TagValue, ValidationError> {
    match value {
        TagValue::Bool(_) => Err(ValidationError::NonNumeric {
            tag: tag.to_string(),
        }),
        TagValue::Int(_) => Ok(value),
        TagValue::Float(v) if !v.is_finite() => Err(ValidationError::NonFinite {
            tag: tag.to_string(),
        }),
        TagValue::Float(v) if v.fract() != 0.0 => Err(ValidationError::NotInteger {
            tag: tag.to_string(),
        }),
        TagValue::Float(v) => Ok(TagValue::Int(v as i64)),
    }
}

fn check_range(tag: &str, value: TagValue, limits: &CommandLimits) -> Result<(), ValidationError> {
    let numeric = value.as_f64().unwrap_or(f64::NAN);
    if !(limits.set_point_min..=limits.set_point_max).contains(&numeric) {
        return Err(ValidationError::OutOfRange {
            tag: tag.to_string(),
            value: numeric,
            min: limits.set_point_min,
            max: limits.set_point_max,
        });
    }
    Ok(())
}

/// Start is only permitted once some set-point holds material.
pub fn start_permitted(set_points: &BTreeMap<LogicalTag, TagValue>) -> bool {
    set_points
        .values()
        .any(|v| v.as_f64().map(|n| n > 0.0).unwrap_or(false))
}
