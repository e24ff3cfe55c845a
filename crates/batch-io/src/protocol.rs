//! JSON messages exchanged with dashboard subscribers.

use batch_core::PlantSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Cross-tab notification; tells other open dashboards that a batch was started or reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EchoEvent {
    Start,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldAction {
    Press,
    Release,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    SetArido {
        tag: String,
        value: serde_json::Value,
    },
    SetCompuerta {
        tag: String,
        value: serde_json::Value,
    },
    Iniciar,
    Reset,
    Tara(HoldAction),
    Echo(EchoEvent),
}

impl InboundCommand {
    pub fn name(&self) -> &'static str {
        match self {
            InboundCommand::SetArido { .. } => "set-arido",
            InboundCommand::SetCompuerta { .. } => "set-compuerta",
            InboundCommand::Iniciar => "set-iniciar",
            InboundCommand::Reset => "set-reset",
            InboundCommand::Tara(_) => "set-tara",
            InboundCommand::Echo(_) => "echo",
        }
    }

    /// Echo events are UI chatter and never touch the PLC.
    pub fn touches_plc(&self) -> bool {
        !matches!(self, InboundCommand::Echo(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub command: InboundCommand,
    pub auth_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no type")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid {msg_type} payload: {reason}")]
    InvalidPayload {
        msg_type: &'static str,
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagWrite {
    tag: Option<String>,
    #[serde(alias = "arido", alias = "compuerta")]
    index: Option<u8>,
    value: serde_json::Value,
}

impl TagWrite {
    /// `{"tag":"ARIDO2"}` or the short `{"arido":2}` form.
    fn into_parts(self, prefix: &str, msg_type: &'static str) -> Result<(String, serde_json::Value), ParseError> {
        let tag = match (self.tag, self.index) {
            (Some(tag), _) => tag.trim().to_ascii_uppercase(),
            (None, Some(index)) => format!("{prefix}{index}"),
            (None, None) => {
                return Err(ParseError::InvalidPayload {
                    msg_type,
                    reason: "missing tag".into(),
                })
            }
        };
        Ok((tag, self.value))
    }
}

#[derive(Debug, Deserialize)]
struct TaraData {
    action: Option<String>,
    value: Option<bool>,
}

fn payload<T: serde::de::DeserializeOwned>(
    msg_type: &'static str,
    data: serde_json::Value,
) -> Result<T, ParseError> {
    serde_json::from_value(data).map_err(|e| ParseError::InvalidPayload {
        msg_type,
        reason: e.to_string(),
    })
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let msg_type = envelope.msg_type.ok_or(ParseError::MissingType)?;

        let command = match msg_type.as_str() {
            "set-arido" => {
                let (tag, value) =
                    payload::<TagWrite>("set-arido", envelope.data)?.into_parts("ARIDO", "set-arido")?;
                InboundCommand::SetArido { tag, value }
            }
            "set-compuerta" => {
                let (tag, value) = payload::<TagWrite>("set-compuerta", envelope.data)?
                    .into_parts("COMP", "set-compuerta")?;
                InboundCommand::SetCompuerta { tag, value }
            }
            "set-iniciar" => InboundCommand::Iniciar,
            "set-reset" => InboundCommand::Reset,
            "set-tara" => {
                let data: TaraData = payload("set-tara", envelope.data)?;
                let action = match (data.action.as_deref(), data.value) {
                    (Some("press"), _) | (None, Some(true)) => HoldAction::Press,
                    (Some("release"), _) | (None, Some(false)) => HoldAction::Release,
                    _ => {
                        return Err(ParseError::InvalidPayload {
                            msg_type: "set-tara",
                            reason: "action must be press or release".into(),
                        })
                    }
                };
                InboundCommand::Tara(action)
            }
            "echo" => InboundCommand::Echo(payload("echo", envelope.data)?),
            _ => return Err(ParseError::UnknownType(msg_type)),
        };

        Ok(InboundMessage {
            command,
            auth_token: envelope.auth_token,
        })
    }
}

/// Reply to a single command, sent only to the subscriber that issued it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandReply {
    Ok {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        error: &'static str,
        message: String,
    },
}

impl CommandReply {
    pub fn ok() -> Self {
        CommandReply::Ok {
            ok: true,
            data: None,
        }
    }

    pub fn with_data(data: serde_json::Value) -> Self {
        CommandReply::Ok {
            ok: true,
            data: Some(data),
        }
    }

    pub fn error(kind: &'static str, message: impl Into<String>) -> Self {
        CommandReply::Error {
            error: kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum OutboundMessage {
    PlcUpdate(Arc<PlantSnapshot>),
    Echo(EchoEvent),
    CommandResult(CommandReply),
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
