//! Command path: validation, start interlock, pulsed and held outputs.

use crate::fanout::{ClientId, FanoutHub};
use crate::metrics;
use crate::protocol::EchoEvent;
use crate::session::{Session, SessionError};
use batch_core::{
    start_permitted, tags, CommandKind, CommandLimits, LogicalTag, Rejection, TagRole, TagValue,
    ValidationError, WriteCommand,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub limits: CommandLimits,
    pub pulse_duration: Duration,
    pub hold_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            limits: CommandLimits::default(),
            pulse_duration: Duration::from_millis(100),
            hold_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<ValidationError> for CommandError {
    fn from(err: ValidationError) -> Self {
        CommandError::Rejected(Rejection::Invalid(err))
    }
}

impl CommandError {
    /// Stable error kind reported to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Rejected(Rejection::UnknownTag(_)) => "unknown_tag",
            CommandError::Rejected(Rejection::Invalid(_)) => "validation",
            CommandError::Session(e) => e.kind(),
        }
    }
}

/// One command outcome, as seen by the audit trail.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub client: ClientId,
    pub tag: String,
    pub kind: CommandKind,
    pub value: Option<TagValue>,
    pub outcome: Result<(), String>,
}

/// Hook for recording command outcomes and subscriber lifecycle outside this crate.
pub trait CommandObserver: Send + Sync {
    fn on_command(&self, event: &CommandEvent);

    fn on_subscriber(&self, _client: ClientId, _connected: bool) {}
}

#[derive(Debug, Clone, Copy)]
struct Hold {
    owner: ClientId,
    generation: u64,
}

/// Outputs the gateway has switched on and still has to switch off.
#[derive(Debug, Default)]
struct OutputTable {
    holds: HashMap<LogicalTag, Hold>,
    /// Generation of the newest pulse per tag; only that pulse may end the output.
    pulses: HashMap<LogicalTag, u64>,
    /// Outputs whose `false` write failed. Retried until one succeeds.
    pending_off: BTreeSet<LogicalTag>,
}

type Outputs = Arc<Mutex<OutputTable>>;

fn outputs_of(table: &Outputs) -> MutexGuard<'_, OutputTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write `false` to `tag`, remembering it for a retry when the write does not land.
async fn switch_off(
    session: &Session,
    outputs: &Outputs,
    tag: &LogicalTag,
) -> Result<(), SessionError> {
    let result = session.write(tag, TagValue::Bool(false)).await;
    let mut table = outputs_of(outputs);
    match &result {
        Ok(()) => {
            table.pending_off.remove(tag);
        }
        Err(_) => {
            table.pending_off.insert(tag.clone());
        }
    }
    result
}

pub struct CommandGateway {
    session: Arc<Session>,
    hub: FanoutHub,
    config: GatewayConfig,
    outputs: Outputs,
    generation: AtomicU64,
    observer: Option<Arc<dyn CommandObserver>>,
}

impl CommandGateway {
    pub fn new(session: Arc<Session>, hub: FanoutHub, config: GatewayConfig) -> Self {
        Self {
            session,
            hub,
            config,
            outputs: Arc::default(),
            generation: AtomicU64::new(0),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommandObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn observer(&self) -> Option<&Arc<dyn CommandObserver>> {
        self.observer.as_ref()
    }

    fn record(
        &self,
        client: ClientId,
        tag: &str,
        kind: CommandKind,
        value: Option<TagValue>,
        result: &Result<(), CommandError>,
    ) {
        match result {
            Ok(()) => {
                metrics::COMMANDS_ACCEPTED
                    .with_label_values(&[kind.as_str()])
                    .inc();
                info!(client = %client, tag, kind = kind.as_str(), value = ?value, "command accepted");
            }
            Err(e) => {
                metrics::COMMANDS_REJECTED.with_label_values(&[e.kind()]).inc();
                warn!(client = %client, tag, kind = kind.as_str(), error = %e, "command rejected");
            }
        }
        if let Some(observer) = &self.observer {
            observer.on_command(&CommandEvent {
                client,
                tag: tag.to_string(),
                kind,
                value,
                outcome: result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
            });
        }
    }

    fn require_ready(&self) -> Result<(), CommandError> {
        if self.session.state().is_ready() {
            Ok(())
        } else {
            Err(SessionError::NotConnected.into())
        }
    }

    /// Numeric set-point or gate write.
    pub async fn set_point(
        &self,
        client: ClientId,
        tag: &str,
        value: TagValue,
    ) -> Result<(), CommandError> {
        let result = self.write_set_point(tag, value).await;
        self.record(client, tag, CommandKind::SetPoint, Some(value), &result);
        result
    }

    /// Like [`set_point`](Self::set_point) for raw JSON values from the wire.
    pub async fn set_point_json(
        &self,
        client: ClientId,
        tag: &str,
        value: &serde_json::Value,
    ) -> Result<(), CommandError> {
        match TagValue::from_json(value) {
            Some(value) => self.set_point(client, tag, value).await,
            None => {
                let result = Err(ValidationError::NonNumeric {
                    tag: tag.to_string(),
                }
                .into());
                self.record(client, tag, CommandKind::SetPoint, None, &result);
                result
            }
        }
    }

    /// Like [`set_point_json`](Self::set_point_json), limited to tags of `role`.
    pub async fn set_role_json(
        &self,
        client: ClientId,
        tag: &str,
        role: TagRole,
        value: &serde_json::Value,
    ) -> Result<(), CommandError> {
        if let Ok(actual) = self.session.map().role(tag) {
            if actual != role {
                let result = Err(ValidationError::WrongKind {
                    tag: tag.to_string(),
                    kind: role.as_str(),
                    role: actual.as_str(),
                }
                .into());
                self.record(client, tag, CommandKind::SetPoint, TagValue::from_json(value), &result);
                return result;
            }
        }
        self.set_point_json(client, tag, value).await
    }

    async fn write_set_point(&self, tag: &str, value: TagValue) -> Result<(), CommandError> {
        let cmd = WriteCommand::set_point(tag, value)
            .validate(self.session.map(), &self.config.limits)?;
        self.session.write(cmd.tag(), cmd.value()).await?;
        Ok(())
    }

    /// Momentary output: `true` now, `false` after the pulse duration in a detached task.
    pub async fn pulse(&self, client: ClientId, tag: &str) -> Result<(), CommandError> {
        let result = self.fire_pulse(tag).await;
        self.record(client, tag, CommandKind::Pulse, Some(TagValue::Bool(true)), &result);
        if result.is_ok() {
            if tag == tags::INICIO.name {
                self.hub.publish_echo(EchoEvent::Start);
            } else if tag == tags::RESET.name {
                self.hub.publish_echo(EchoEvent::Reset);
            }
        }
        result
    }

    async fn fire_pulse(&self, tag: &str) -> Result<(), CommandError> {
        let cmd = WriteCommand::pulse(tag).validate(self.session.map(), &self.config.limits)?;
        self.require_ready()?;
        if cmd.tag().as_str() == tags::INICIO.name {
            self.check_start_interlock().await?;
        }
        // A newer pulse on the same tag takes over the release, so the output stays on for a full pulse.
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut table = outputs_of(&self.outputs);
            table.pulses.insert(cmd.tag().clone(), generation);
            table.pending_off.remove(cmd.tag());
        }
        if let Err(e) = self.session.write(cmd.tag(), TagValue::Bool(true)).await {
            let mut table = outputs_of(&self.outputs);
            if table.pulses.get(cmd.tag()) == Some(&generation) {
                table.pulses.remove(cmd.tag());
                table.pending_off.insert(cmd.tag().clone());
            }
            return Err(e.into());
        }

        let session = self.session.clone();
        let outputs = self.outputs.clone();
        let tag = cmd.tag().clone();
        let delay = self.config.pulse_duration;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut table = outputs_of(&outputs);
                match table.pulses.get(&tag) {
                    Some(g) if *g == generation => table.pulses.remove(&tag).is_some(),
                    _ => false,
                }
            };
            if !current {
                debug!(tag = %tag, "pulse superseded; newer pulse ends the output");
                return;
            }
            if let Err(e) = switch_off(&session, &outputs, &tag).await {
                metrics::PULSE_RELEASE_FAILURES.inc();
                error!(tag = %tag, error = %e, "pulse release write failed; retrying after reconnect");
            }
        });
        Ok(())
    }

    /// Start needs material: some set-point must read above zero right now.
    async fn check_start_interlock(&self) -> Result<(), CommandError> {
        let set_points = self.session.map().tags_with_role(TagRole::SetPoint);
        let readings = self.session.read_all(&set_points).await?;
        if start_permitted(&readings) {
            Ok(())
        } else {
            Err(ValidationError::StartWithoutSetPoint {
                tag: tags::INICIO.name.to_string(),
            }
            .into())
        }
    }

    /// Hold output on. Ownership goes to `client`; the watchdog forces it off after the hold timeout.
    pub async fn press(&self, client: ClientId, tag: &str) -> Result<(), CommandError> {
        let result = self.press_hold(client, tag).await;
        self.record(client, tag, CommandKind::Hold, Some(TagValue::Bool(true)), &result);
        result
    }

    async fn press_hold(&self, client: ClientId, tag: &str) -> Result<(), CommandError> {
        let cmd =
            WriteCommand::hold(tag, true).validate(self.session.map(), &self.config.limits)?;
        self.require_ready()?;

        // Registered before the write so a half-applied press is still released.
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut table = outputs_of(&self.outputs);
            table.holds.insert(
                cmd.tag().clone(),
                Hold {
                    owner: client,
                    generation,
                },
            );
            table.pending_off.remove(cmd.tag());
        }
        self.spawn_watchdog(cmd.tag().clone(), generation);
        self.session.write(cmd.tag(), TagValue::Bool(true)).await?;
        Ok(())
    }

    fn spawn_watchdog(&self, tag: LogicalTag, generation: u64) {
        let session = self.session.clone();
        let outputs = self.outputs.clone();
        let timeout = self.config.hold_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut table = outputs_of(&outputs);
                match table.holds.get(&tag) {
                    Some(hold) if hold.generation == generation => table.holds.remove(&tag).is_some(),
                    _ => false,
                }
            };
            if !expired {
                return;
            }
            metrics::HOLD_WATCHDOG_RELEASES.inc();
            warn!(tag = %tag, timeout_ms = timeout.as_millis() as u64, "hold watchdog released output");
            if let Err(e) = switch_off(&session, &outputs, &tag).await {
                error!(tag = %tag, error = %e, "hold watchdog release failed; retrying after reconnect");
            }
        });
    }

    /// Hold output off, whoever pressed it.
    pub async fn release(&self, client: ClientId, tag: &str) -> Result<(), CommandError> {
        let result = self.release_hold(tag).await;
        self.record(client, tag, CommandKind::Hold, Some(TagValue::Bool(false)), &result);
        result
    }

    async fn release_hold(&self, tag: &str) -> Result<(), CommandError> {
        let cmd =
            WriteCommand::hold(tag, false).validate(self.session.map(), &self.config.limits)?;
        outputs_of(&self.outputs).holds.remove(cmd.tag());
        switch_off(&self.session, &self.outputs, cmd.tag()).await?;
        Ok(())
    }

    /// Release every hold owned by `client`; used when a subscriber goes away.
    pub async fn abandon(&self, client: ClientId) -> usize {
        let owned: Vec<LogicalTag> = {
            let mut table = outputs_of(&self.outputs);
            let owned: Vec<LogicalTag> = table
                .holds
                .iter()
                .filter(|(_, hold)| hold.owner == client)
                .map(|(tag, _)| tag.clone())
                .collect();
            for tag in &owned {
                table.holds.remove(tag);
            }
            owned
        };

        for tag in &owned {
            let result = switch_off(&self.session, &self.outputs, tag)
                .await
                .map_err(CommandError::from);
            self.record(client, tag.as_str(), CommandKind::Hold, Some(TagValue::Bool(false)), &result);
        }
        if !owned.is_empty() {
            info!(client = %client, released = owned.len(), "released holds of departed client");
        }
        owned.len()
    }

    /// Release every hold regardless of owner; used at shutdown.
    pub async fn release_all(&self) -> usize {
        let owners: BTreeSet<ClientId> = outputs_of(&self.outputs)
            .holds
            .values()
            .map(|h| h.owner)
            .collect();
        let mut released = 0;
        for owner in owners {
            released += self.abandon(owner).await;
        }
        released
    }

    /// Generic tag write, routed by the tag's role.
    pub async fn write_tag(
        &self,
        client: ClientId,
        tag: &str,
        value: &serde_json::Value,
    ) -> Result<(), CommandError> {
        let role = match self.session.map().role(tag) {
            Ok(role) => role,
            Err(e) => {
                let result = Err(CommandError::from(Rejection::from(e)));
                self.record(client, tag, CommandKind::SetPoint, None, &result);
                return result;
            }
        };
        match role {
            TagRole::SetPoint | TagRole::Actuator | TagRole::Measurement => {
                self.set_point_json(client, tag, value).await
            }
            TagRole::Pulse | TagRole::Hold => {
                let on = match TagValue::from_json(value) {
                    Some(TagValue::Bool(b)) => b,
                    Some(TagValue::Int(1)) => true,
                    Some(TagValue::Int(0)) => false,
                    _ => {
                        let result = Err(ValidationError::NotBoolean {
                            tag: tag.to_string(),
                        }
                        .into());
                        let kind = if role == TagRole::Pulse {
                            CommandKind::Pulse
                        } else {
                            CommandKind::Hold
                        };
                        self.record(client, tag, kind, None, &result);
                        return result;
                    }
                };
                match (role, on) {
                    (TagRole::Pulse, true) => self.pulse(client, tag).await,
                    // Explicit `false` on a pulse tag clears a stuck output.
                    (TagRole::Pulse, false) => {
                        let result = self.clear_pulse(tag).await;
                        self.record(client, tag, CommandKind::Pulse, Some(TagValue::Bool(false)), &result);
                        result
                    }
                    (_, true) => self.press(client, tag).await,
                    (_, false) => self.release(client, tag).await,
                }
            }
        }
    }

    async fn clear_pulse(&self, tag: &str) -> Result<(), CommandError> {
        let cmd = WriteCommand::new(tag, TagValue::Bool(false), CommandKind::Pulse)
            .validate(self.session.map(), &self.config.limits)?;
        outputs_of(&self.outputs).pulses.remove(cmd.tag());
        switch_off(&self.session, &self.outputs, cmd.tag()).await?;
        Ok(())
    }

    /// Write `false` to every output whose release never reached the PLC. Outputs that are
    /// held or pulsing again are left to their current owner. Returns how many were cleared.
    pub async fn retry_pending_releases(&self) -> usize {
        let due: Vec<LogicalTag> = {
            let table = outputs_of(&self.outputs);
            table
                .pending_off
                .iter()
                .filter(|tag| !table.holds.contains_key(*tag) && !table.pulses.contains_key(*tag))
                .cloned()
                .collect()
        };
        let mut cleared = 0;
        for tag in due {
            match switch_off(&self.session, &self.outputs, &tag).await {
                Ok(()) => {
                    cleared += 1;
                    info!(tag = %tag, "delayed release applied");
                }
                Err(e) => {
                    debug!(tag = %tag, error = %e, "delayed release still failing");
                    break;
                }
            }
        }
        cleared
    }

    /// Number of outputs currently held on.
    pub fn active_holds(&self) -> usize {
        outputs_of(&self.outputs).holds.len()
    }

    /// Number of outputs waiting for a `false` write to land.
    pub fn pending_releases(&self) -> usize {
        outputs_of(&self.outputs).pending_off.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::sim::{SimHandle, SimulatedPlc};
    use batch_core::{AddressMap, PhysicalAddress, Protocol};

    struct Rig {
        gateway: CommandGateway,
        plc: SimHandle,
        map: Arc<AddressMap>,
    }

    async fn rig(config: GatewayConfig) -> Rig {
        let plc = SimHandle::default();
        let map = Arc::new(AddressMap::builtin(Protocol::S7));
        let session = Arc::new(Session::new(
            Box::new(SimulatedPlc::with_handle(plc.clone())),
            map.clone(),
            SessionConfig::default(),
        ));
        session.connect().await.unwrap();
        plc.clear_calls();
        Rig {
            gateway: CommandGateway::new(session, FanoutHub::default(), config),
            plc,
            map,
        }
    }

    fn addr(map: &AddressMap, tag: &str) -> PhysicalAddress {
        map.resolve(tag).unwrap()
    }

    #[tokio::test]
    async fn out_of_range_set_point_makes_no_device_call() {
        let rig = rig(GatewayConfig::default()).await;
        let err = rig
            .gateway
            .set_point(ClientId(1), "ARIDO1", TagValue::Int(150))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(rig.plc.calls().is_empty());
    }

    #[tokio::test]
    async fn set_point_json_rejects_text() {
        let rig = rig(GatewayConfig::default()).await;
        let err = rig
            .gateway
            .set_point_json(ClientId(1), "ARIDO1", &serde_json::json!("lots"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::Rejected(Rejection::Invalid(ValidationError::NonNumeric { .. }))
        ));
        rig.gateway
            .set_point_json(ClientId(1), "ARIDO1", &serde_json::json!("12"))
            .await
            .unwrap();
        assert_eq!(rig.plc.value(&addr(&rig.map, "ARIDO1")), TagValue::Int(12));
    }

    #[tokio::test]
    async fn pulse_on_faulted_session_fails_fast() {
        let rig = rig(GatewayConfig::default()).await;
        rig.gateway.session().close().await;
        rig.plc.clear_calls();
        let err = rig.gateway.pulse(ClientId(1), "RESET").await.unwrap_err();
        assert_eq!(err.kind(), "not_connected");
        assert!(rig.plc.calls().is_empty());
    }

    #[tokio::test]
    async fn start_interlock_reads_fresh_values() {
        let rig = rig(GatewayConfig::default()).await;
        let err = rig.gateway.pulse(ClientId(1), "INICIO").await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Rejected(Rejection::Invalid(ValidationError::StartWithoutSetPoint { .. }))
        ));
        assert!(rig.plc.writes().is_empty());

        rig.plc.set(addr(&rig.map, "ARIDO2"), TagValue::Int(8));
        rig.gateway.pulse(ClientId(1), "INICIO").await.unwrap();
        assert_eq!(rig.plc.writes()[0].2, TagValue::Bool(true));
    }

    #[tokio::test]
    async fn pulse_echoes_start_and_reset() {
        let rig = rig(GatewayConfig::default()).await;
        let mut sub = rig.gateway.hub.subscribe();
        rig.gateway.pulse(ClientId(1), "RESET").await.unwrap();
        match sub.recv().await.unwrap() {
            crate::protocol::OutboundMessage::Echo(event) => assert_eq!(event, EchoEvent::Reset),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn hold_watchdog_forces_release() {
        let rig = rig(GatewayConfig {
            hold_timeout: Duration::from_millis(50),
            ..GatewayConfig::default()
        })
        .await;
        rig.gateway.press(ClientId(3), "TARA").await.unwrap();
        assert_eq!(rig.gateway.active_holds(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rig.gateway.active_holds(), 0);
        let writes = rig.plc.writes();
        assert_eq!(writes.last().map(|w| w.2), Some(TagValue::Bool(false)));
    }

    #[tokio::test]
    async fn release_disarms_watchdog() {
        let rig = rig(GatewayConfig {
            hold_timeout: Duration::from_millis(50),
            ..GatewayConfig::default()
        })
        .await;
        rig.gateway.press(ClientId(3), "TARA").await.unwrap();
        rig.gateway.release(ClientId(3), "TARA").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rig.plc.writes().len(), 2);
    }

    #[tokio::test]
    async fn abandon_only_touches_own_holds() {
        let rig = rig(GatewayConfig::default()).await;
        rig.gateway.press(ClientId(3), "TARA").await.unwrap();
        assert_eq!(rig.gateway.abandon(ClientId(4)).await, 0);
        assert_eq!(rig.gateway.abandon(ClientId(3)).await, 1);
        assert_eq!(
            rig.plc.value(&addr(&rig.map, "TARA")),
            TagValue::Bool(false)
        );
    }

    #[tokio::test]
    async fn release_all_clears_every_owner() {
        let rig = rig(GatewayConfig::default()).await;
        rig.gateway.press(ClientId(3), "TARA").await.unwrap();
        rig.gateway.press(ClientId(5), "TARA").await.unwrap();
        assert_eq!(rig.gateway.release_all().await, 1);
        assert_eq!(rig.gateway.active_holds(), 0);
        assert_eq!(
            rig.plc.value(&addr(&rig.map, "TARA")),
            TagValue::Bool(false)
        );
    }

    #[tokio::test]
    async fn set_role_json_keeps_set_points_and_gates_apart() {
        let rig = rig(GatewayConfig::default()).await;
        let err = rig
            .gateway
            .set_role_json(ClientId(1), "COMP1", TagRole::SetPoint, &serde_json::json!(true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::Rejected(Rejection::Invalid(ValidationError::WrongKind { .. }))
        ));
        let err = rig
            .gateway
            .set_role_json(ClientId(1), "ARIDO1", TagRole::Actuator, &serde_json::json!(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(rig.plc.calls().is_empty());

        rig.gateway
            .set_role_json(ClientId(1), "COMP1", TagRole::Actuator, &serde_json::json!(true))
            .await
            .unwrap();
        assert_eq!(rig.plc.value(&addr(&rig.map, "COMP1")), TagValue::Bool(true));
        assert_eq!(
            rig.gateway
                .set_role_json(ClientId(1), "NOPE", TagRole::SetPoint, &serde_json::json!(1))
                .await
                .unwrap_err()
                .kind(),
            "unknown_tag"
        );
    }

    #[tokio::test]
    async fn overlapping_pulses_keep_output_on_for_the_latest() {
        let rig = rig(GatewayConfig {
            pulse_duration: Duration::from_millis(100),
            ..GatewayConfig::default()
        })
        .await;
        let reset = addr(&rig.map, "RESET");
        rig.gateway.pulse(ClientId(1), "RESET").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.gateway.pulse(ClientId(2), "RESET").await.unwrap();

        // First pulse's release time has passed; the second pulse is still running.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(rig.plc.value(&reset), TagValue::Bool(true));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.plc.value(&reset), TagValue::Bool(false));
        let offs = rig
            .plc
            .writes()
            .iter()
            .filter(|w| w.1 == reset && w.2 == TagValue::Bool(false))
            .count();
        assert_eq!(offs, 1);
    }

    #[tokio::test]
    async fn failed_release_is_kept_for_retry() {
        let rig = rig(GatewayConfig::default()).await;
        rig.gateway.press(ClientId(3), "TARA").await.unwrap();
        rig.gateway.session().close().await;

        assert_eq!(
            rig.gateway.release(ClientId(3), "TARA").await.unwrap_err().kind(),
            "not_connected"
        );
        assert_eq!(rig.gateway.pending_releases(), 1);
        assert_eq!(rig.gateway.retry_pending_releases().await, 0);

        rig.gateway.session().connect().await.unwrap();
        assert_eq!(rig.gateway.retry_pending_releases().await, 1);
        assert_eq!(rig.gateway.pending_releases(), 0);
        assert_eq!(
            rig.plc.value(&addr(&rig.map, "TARA")),
            TagValue::Bool(false)
        );
    }

    #[tokio::test]
    async fn new_press_cancels_pending_release() {
        let rig = rig(GatewayConfig::default()).await;
        rig.gateway.press(ClientId(3), "TARA").await.unwrap();
        rig.gateway.session().close().await;
        let _ = rig.gateway.release(ClientId(3), "TARA").await;
        rig.gateway.session().connect().await.unwrap();

        rig.gateway.press(ClientId(4), "TARA").await.unwrap();
        assert_eq!(rig.gateway.pending_releases(), 0);
        assert_eq!(rig.gateway.retry_pending_releases().await, 0);
        assert_eq!(
            rig.plc.value(&addr(&rig.map, "TARA")),
            TagValue::Bool(true)
        );
    }

    #[tokio::test]
    async fn write_tag_routes_by_role() {
        let rig = rig(GatewayConfig::default()).await;
        let gw = &rig.gateway;
        gw.write_tag(ClientId::HTTP, "COMP2", &serde_json::json!(true))
            .await
            .unwrap();
        assert_eq!(rig.plc.value(&addr(&rig.map, "COMP2")), TagValue::Bool(true));

        gw.write_tag(ClientId::HTTP, "TARA", &serde_json::json!(1))
            .await
            .unwrap();
        assert_eq!(gw.active_holds(), 1);
        gw.write_tag(ClientId::HTTP, "TARA", &serde_json::json!(false))
            .await
            .unwrap();
        assert_eq!(gw.active_holds(), 0);

        assert_eq!(
            gw.write_tag(ClientId::HTTP, "PESO", &serde_json::json!(3))
                .await
                .unwrap_err()
                .kind(),
            "validation"
        );
        assert_eq!(
            gw.write_tag(ClientId::HTTP, "NOPE", &serde_json::json!(3))
                .await
                .unwrap_err()
                .kind(),
            "unknown_tag"
        );
        assert_eq!(
            gw.write_tag(ClientId::HTTP, "RESET", &serde_json::json!("maybe"))
                .await
                .unwrap_err()
                .kind(),
            "validation"
        );
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<CommandEvent>>);

    impl CommandObserver for Recorder {
        fn on_command(&self, event: &CommandEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn observer_sees_accepted_and_rejected() {
        let recorder = Arc::new(Recorder::default());
        let mut rig = rig(GatewayConfig::default()).await;
        rig.gateway = rig.gateway.with_observer(recorder.clone());

        rig.gateway
            .set_point(ClientId(1), "ARIDO1", TagValue::Int(20))
            .await
            .unwrap();
        let _ = rig
            .gateway
            .set_point(ClientId(1), "ARIDO1", TagValue::Int(200))
            .await;

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].outcome.is_ok());
        assert!(events[1].outcome.is_err());
    }
}
