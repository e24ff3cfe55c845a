//! Device driver seam shared by the S7, Modbus and simulated backends.

use async_trait::async_trait;
use batch_core::{LogicalTag, PhysicalAddress, TagValue};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device rejected {addr}: {reason}")]
    Rejected { addr: String, reason: String },

    #[error("address {0} is not supported by this driver")]
    UnsupportedAddress(String),

    #[error("value {value:?} does not fit {addr}")]
    ValueOutOfRange { addr: String, value: TagValue },
}

impl DriverError {
    /// Whether the link is no longer trustworthy and must be re-established.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            DriverError::NotConnected
                | DriverError::Connect(_)
                | DriverError::Io(_)
                | DriverError::Protocol(_)
        )
    }
}

/// A single physical connection to a PLC.
///
/// Implementations are driven by one caller at a time; the session keeps them behind a mutex.
#[async_trait]
pub trait PlcDriver: Send {
    async fn connect(&mut self) -> Result<(), DriverError>;

    /// Read every point in one logical batch. Points the device could not serve are left out
    /// of the result instead of failing the whole batch.
    async fn read_batch(
        &mut self,
        points: &[(LogicalTag, PhysicalAddress)],
    ) -> Result<BTreeMap<LogicalTag, TagValue>, DriverError>;

    async fn write(&mut self, addr: &PhysicalAddress, value: TagValue) -> Result<(), DriverError>;

    /// Drop the connection, if any. Never fails.
    async fn disconnect(&mut self);

    /// Endpoint description for logs, e.g. `s7://10.0.0.5:102`.
    fn describe(&self) -> String;
}
