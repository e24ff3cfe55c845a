//! Audit trail of operator commands and plant link changes.
//!
//! Every accepted or rejected command, subscriber arrival and departure, and
//! session state change is appended to a JSONL file.

use batch_core::{SessionState, TimeBase};
use batch_io::{ClientId, CommandEvent, CommandObserver};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    CommandAccepted,
    CommandRejected,
    SessionState,
    ClientConnected,
    ClientDisconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Wall-clock Unix timestamp in milliseconds
    pub unix_ms: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
    timebase: TimeBase,
}

impl AuditLogger {
    /// Opens `path` in append mode, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
            timebase: TimeBase::new(),
        })
    }

    pub fn log(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&AuditEntry {
            unix_ms: self.timebase.unix_ms(),
            event_type,
            details,
        })
    }

    /// Like [`log_event`](Self::log_event) for callers that cannot propagate the error.
    pub fn record(&self, event_type: AuditEventType, details: serde_json::Value) {
        if let Err(e) = self.log_event(event_type, details) {
            warn!(error = %e, "failed to write audit entry");
        }
    }

    pub fn session_state(&self, state: SessionState) {
        self.record(
            AuditEventType::SessionState,
            serde_json::json!({ "state": state.as_str() }),
        );
    }
}

impl CommandObserver for AuditLogger {
    fn on_command(&self, event: &CommandEvent) {
        let (event_type, error) = match &event.outcome {
            Ok(()) => (AuditEventType::CommandAccepted, None),
            Err(message) => (AuditEventType::CommandRejected, Some(message.as_str())),
        };
        self.record(
            event_type,
            serde_json::json!({
                "client": event.client.to_string(),
                "tag": event.tag,
                "kind": event.kind.as_str(),
                "value": event.value,
                "error": error,
            }),
        );
    }

    fn on_subscriber(&self, client: ClientId, connected: bool) {
        let event_type = if connected {
            AuditEventType::ClientConnected
        } else {
            AuditEventType::ClientDisconnected
        };
        self.record(event_type, serde_json::json!({ "client": client.to_string() }));
    }
}
