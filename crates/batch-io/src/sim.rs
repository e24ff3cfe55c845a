//! In-memory PLC for bench runs without hardware.
//!
//! The [`SimHandle`] stays with the caller and exposes the memory image, the recorded
//! driver calls and fault injection, so the same driver serves `--simulate` and tests.

use crate::driver::{DriverError, PlcDriver};
use async_trait::async_trait;
use batch_core::{tags, AddressMap, LogicalTag, PhysicalAddress, TagRole, TagValue};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Recorded driver calls kept per handle; older ones are dropped first.
pub const CALL_HISTORY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    Connect,
    Read { points: usize },
    Write { addr: PhysicalAddress, value: TagValue },
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub call: SimCall,
}

/// Weigh hopper fed by the gates: every open gate adds `per_gate` to the scale on each read.
#[derive(Debug, Clone)]
struct WeighModel {
    gates: Vec<PhysicalAddress>,
    scale: PhysicalAddress,
    tare: Option<PhysicalAddress>,
    reset: Option<PhysicalAddress>,
    per_gate: i64,
}

#[derive(Debug, Default)]
struct SimState {
    memory: HashMap<PhysicalAddress, TagValue>,
    missing: HashSet<PhysicalAddress>,
    calls: VecDeque<RecordedCall>,
    connected: bool,
    fail_connect: bool,
    link_down: bool,
    latency: Duration,
    weigh: Option<WeighModel>,
}

impl SimState {
    fn value(&self, addr: &PhysicalAddress) -> TagValue {
        self.memory.get(addr).copied().unwrap_or(if addr.is_digital() {
            TagValue::Bool(false)
        } else {
            TagValue::Int(0)
        })
    }

    fn is_on(&self, addr: &PhysicalAddress) -> bool {
        self.value(addr).as_bool().unwrap_or(false)
    }

    fn step_weigh(&mut self) {
        let Some(model) = self.weigh.clone() else {
            return;
        };
        if model.reset.is_some_and(|a| self.is_on(&a)) {
            for gate in &model.gates {
                self.memory.insert(*gate, TagValue::Bool(false));
            }
        }
        if model.tare.is_some_and(|a| self.is_on(&a)) {
            self.memory.insert(model.scale, TagValue::Int(0));
            return;
        }
        let open = model.gates.iter().filter(|g| self.is_on(g)).count() as i64;
        if open > 0 {
            let weight = self.value(&model.scale).as_f64().unwrap_or(0.0) as i64;
            let next = (weight + open * model.per_gate).min(i16::MAX as i64);
            self.memory.insert(model.scale, TagValue::Int(next));
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, addr: PhysicalAddress, value: TagValue) {
        self.state().memory.insert(addr, value);
    }

    /// Set the value behind a tag of `map`.
    pub fn set_tag(&self, map: &AddressMap, tag: &str, value: TagValue) -> bool {
        match map.resolve(tag) {
            Ok(addr) => {
                self.set(addr, value);
                true
            }
            Err(_) => false,
        }
    }

    pub fn value(&self, addr: &PhysicalAddress) -> TagValue {
        self.state().value(addr)
    }

    /// Reads of `addr` come back without a value, like an S7 item with a bad return code.
    pub fn set_missing(&self, addr: PhysicalAddress) {
        self.state().missing.insert(addr);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    /// While down, every read and write fails with a connection reset.
    pub fn set_link_down(&self, down: bool) {
        self.state().link_down = down;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn enable_weigh_model(&self, map: &AddressMap, per_gate: i64) -> bool {
        let Ok(scale) = map.resolve(tags::PESO.name) else {
            return false;
        };
        let gates = map
            .tags_with_role(TagRole::Actuator)
            .iter()
            .filter_map(|t| map.resolve(t.as_str()).ok())
            .collect();
        self.state().weigh = Some(WeighModel {
            gates,
            scale,
            tare: map.resolve(tags::TARA.name).ok(),
            reset: map.resolve(tags::RESET.name).ok(),
            per_gate,
        });
        true
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// The most recent driver calls, oldest first, at most [`CALL_HISTORY`] of them.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.iter().cloned().collect()
    }

    pub fn writes(&self) -> Vec<(Instant, PhysicalAddress, TagValue)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c.call {
                SimCall::Write { addr, value } => Some((c.at, addr, value)),
                _ => None,
            })
            .collect()
    }

    pub fn read_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c.call, SimCall::Read { .. }))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Highest number of driver operations ever observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: SimCall) -> InFlight<'_> {
        let latency = {
            let mut state = self.state();
            if state.calls.len() == CALL_HISTORY {
                state.calls.pop_front();
            }
            state.calls.push_back(RecordedCall {
                at: Instant::now(),
                call,
            });
            state.latency
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn link_reset() -> DriverError {
    DriverError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "simulated link drop",
    ))
}

pub struct SimulatedPlc {
    handle: SimHandle,
}

impl SimulatedPlc {
    pub fn new() -> Self {
        Self::with_handle(SimHandle::default())
    }

    pub fn with_handle(handle: SimHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }
}

impl Default for SimulatedPlc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlcDriver for SimulatedPlc {
    async fn connect(&mut self) -> Result<(), DriverError> {
        let _guard = self.handle.enter(SimCall::Connect).await;
        let mut state = self.handle.state();
        if state.fail_connect {
            state.connected = false;
            return Err(DriverError::Connect("simulated connect failure".into()));
        }
        state.connected = true;
        state.link_down = false;
        Ok(())
    }

    async fn read_batch(
        &mut self,
        points: &[(LogicalTag, PhysicalAddress)],
    ) -> Result<BTreeMap<LogicalTag, TagValue>, DriverError> {
        let _guard = self
            .handle
            .enter(SimCall::Read {
                points: points.len(),
            })
            .await;
        let mut state = self.handle.state();
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        if state.link_down {
            state.connected = false;
            return Err(link_reset());
        }
        state.step_weigh();
        Ok(points
            .iter()
            .filter(|(_, addr)| !state.missing.contains(addr))
            .map(|(tag, addr)| (tag.clone(), state.value(addr)))
            .collect())
    }

    async fn write(&mut self, addr: &PhysicalAddress, value: TagValue) -> Result<(), DriverError> {
        let _guard = self
            .handle
            .enter(SimCall::Write { addr: *addr, value })
            .await;
        let mut state = self.handle.state();
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        if state.link_down {
            state.connected = false;
            return Err(link_reset());
        }
        if !addr.is_writable() {
            return Err(DriverError::Rejected {
                addr: addr.to_string(),
                reason: "read-only area".into(),
            });
        }
        state.memory.insert(*addr, value);
        Ok(())
    }

    async fn disconnect(&mut self) {
        let _guard = self.handle.enter(SimCall::Disconnect).await;
        self.handle.state().connected = false;
    }

    fn describe(&self) -> String {
        "sim://memory".to_string()
    }
}
