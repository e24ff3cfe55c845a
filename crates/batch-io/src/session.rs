//! The single owned PLC session.
//!
//! All device traffic goes through [`Session`]: the driver sits behind an async mutex so at most
//! one connect, read or write is in flight, and every operation is bounded by a timeout. Any
//! link failure or timeout faults the session; the poll loop reconnects on its next tick.

use crate::driver::{DriverError, PlcDriver};
use crate::metrics;
use batch_core::{
    AddressMap, LogicalTag, PhysicalAddress, SessionEvent, SessionState, TagValue,
    UnknownTagError,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2000),
            io_timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("PLC not connected")]
    NotConnected,

    #[error(transparent)]
    UnknownTag(#[from] UnknownTagError),
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Connect(_) => "connect",
            SessionError::Read(_) => "read",
            SessionError::Write(_) => "write",
            SessionError::NotConnected => "not_connected",
            SessionError::UnknownTag(_) => "unknown_tag",
        }
    }
}

enum OpFailure {
    Driver(DriverError),
    TimedOut(Duration),
}

impl OpFailure {
    fn faults_link(&self) -> bool {
        match self {
            OpFailure::Driver(e) => e.is_link_failure(),
            OpFailure::TimedOut(_) => true,
        }
    }

    fn message(&self) -> String {
        match self {
            OpFailure::Driver(e) => e.to_string(),
            OpFailure::TimedOut(after) => format!("timed out after {}ms", after.as_millis()),
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    op: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, OpFailure> {
    match tokio::time::timeout(limit, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(OpFailure::Driver(e)),
        Err(_) => Err(OpFailure::TimedOut(limit)),
    }
}

pub struct Session {
    driver: Mutex<Box<dyn PlcDriver>>,
    map: Arc<AddressMap>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    endpoint: String,
}

impl Session {
    pub fn new(driver: Box<dyn PlcDriver>, map: Arc<AddressMap>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let endpoint = driver.describe();
        metrics::SESSION_STATE.set(SessionState::Disconnected.code());
        Self {
            driver: Mutex::new(driver),
            map,
            config,
            state,
            endpoint,
        }
    }

    pub fn map(&self) -> &Arc<AddressMap> {
        &self.map
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, event: SessionEvent) {
        let mut changed = None;
        self.state.send_if_modified(|state| {
            let next = state.next(event);
            if next == *state {
                return false;
            }
            changed = Some((*state, next));
            *state = next;
            true
        });
        if let Some((from, to)) = changed {
            metrics::SESSION_STATE.set(to.code());
            debug!(from = from.as_str(), to = to.as_str(), "session state changed");
        }
    }

    /// Open a fresh connection, dropping any stale one. No internal retry.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut driver = self.driver.lock().await;
        self.transition(SessionEvent::ConnectStarted);
        driver.disconnect().await;

        match bounded(self.config.connect_timeout, driver.connect()).await {
            Ok(()) => {
                self.transition(SessionEvent::ConnectSucceeded);
                info!(endpoint = %self.endpoint, "PLC session ready");
                Ok(())
            }
            Err(failure) => {
                if matches!(failure, OpFailure::TimedOut(_)) {
                    driver.disconnect().await;
                }
                self.transition(SessionEvent::ConnectFailed);
                metrics::CONNECT_FAILURES.inc();
                Err(SessionError::Connect(failure.message()))
            }
        }
    }

    pub async fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.state().is_ready() {
            return Ok(());
        }
        self.connect().await
    }

    fn resolve_all(
        &self,
        tags: &[LogicalTag],
    ) -> Result<Vec<(LogicalTag, PhysicalAddress)>, SessionError> {
        let mut points = Vec::with_capacity(tags.len());
        for tag in tags {
            points.push((tag.clone(), self.map.resolve(tag.as_str())?));
        }
        Ok(points)
    }

    async fn fault(&self, driver: &mut Box<dyn PlcDriver>, failure: &OpFailure) {
        if failure.faults_link() {
            driver.disconnect().await;
            self.transition(SessionEvent::IoFailed);
        }
    }

    /// One batched read. Tags the device did not serve are absent from the result.
    pub async fn read_all(
        &self,
        tags: &[LogicalTag],
    ) -> Result<BTreeMap<LogicalTag, TagValue>, SessionError> {
        let points = self.resolve_all(tags)?;
        let mut driver = self.driver.lock().await;
        if !self.state().is_ready() {
            return Err(SessionError::NotConnected);
        }

        match bounded(self.config.io_timeout, driver.read_batch(&points)).await {
            Ok(values) => Ok(values),
            Err(failure) => {
                self.fault(&mut driver, &failure).await;
                metrics::READ_FAILURES.inc();
                warn!(endpoint = %self.endpoint, error = %failure.message(), "PLC read failed");
                Err(SessionError::Read(failure.message()))
            }
        }
    }

    /// Single write. Fails fast unless the session is ready.
    pub async fn write(&self, tag: &LogicalTag, value: TagValue) -> Result<(), SessionError> {
        let addr = self.map.resolve(tag.as_str())?;
        if !self.state().is_ready() {
            return Err(SessionError::NotConnected);
        }
        let mut driver = self.driver.lock().await;
        if !self.state().is_ready() {
            return Err(SessionError::NotConnected);
        }

        match bounded(self.config.io_timeout, driver.write(&addr, value)).await {
            Ok(()) => {
                debug!(tag = %tag, addr = %addr, value = ?value, "PLC write");
                Ok(())
            }
            Err(failure) => {
                self.fault(&mut driver, &failure).await;
                metrics::WRITE_FAILURES.inc();
                warn!(tag = %tag, addr = %addr, error = %failure.message(), "PLC write failed");
                Err(SessionError::Write(failure.message()))
            }
        }
    }

    pub async fn close(&self) {
        let mut driver = self.driver.lock().await;
        driver.disconnect().await;
        self.transition(SessionEvent::Closed);
        info!(endpoint = %self.endpoint, "PLC session closed");
    }
}
