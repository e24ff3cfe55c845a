use crate::fanout::FanoutHub;
use crate::gateway::CommandGateway;
use crate::metrics;
use crate::session::Session;
use batch_core::{LogicalTag, PlantSnapshot, TimeBase};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Repeated failures are logged at warn level on the first and then every Nth tick.
const FAILURE_LOG_EVERY: u64 = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollStats {
    pub ticks: u64,
    pub failures: u64,
    pub partial: u64,
    pub skipped: u64,
}

/// Fixed-period poll loop. Ticks run one after another in a single task; a tick that overruns
/// the interval causes the missed timer ticks to be skipped, never queued.
pub struct Poller {
    session: Arc<Session>,
    hub: FanoutHub,
    gateway: Option<Arc<CommandGateway>>,
    tags: Vec<LogicalTag>,
    interval: Duration,
    timebase: TimeBase,
    sequence: u64,
    consecutive_failures: u64,
    stats: PollStats,
}

impl Poller {
    pub fn new(session: Arc<Session>, hub: FanoutHub, interval: Duration) -> Self {
        let tags = session.map().tags().cloned().collect();
        Self {
            session,
            hub,
            gateway: None,
            tags,
            interval,
            timebase: TimeBase::new(),
            sequence: 0,
            consecutive_failures: 0,
            stats: PollStats::default(),
        }
    }

    /// Outputs whose release failed on `gateway` are switched off again once the link is up.
    pub fn with_gateway(mut self, gateway: Arc<CommandGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> PollStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            tags = self.tags.len(),
            "poll loop started"
        );

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let started = Instant::now();
            self.tick().await;
            self.count_skipped(started.elapsed());
        }

        info!(
            ticks = self.stats.ticks,
            failures = self.stats.failures,
            skipped = self.stats.skipped,
            "poll loop stopped"
        );
        self.stats
    }

    fn count_skipped(&mut self, elapsed: Duration) {
        if self.interval.is_zero() || elapsed <= self.interval {
            return;
        }
        let skipped = (elapsed.as_nanos() / self.interval.as_nanos()) as u64;
        self.stats.skipped += skipped;
        metrics::POLL_TICKS_SKIPPED.inc_by(skipped);
        debug!(
            elapsed_ms = elapsed.as_millis() as u64,
            skipped, "poll tick overran interval"
        );
    }

    /// One poll cycle: ensure connected, finish outstanding releases, batch read, publish.
    pub async fn tick(&mut self) -> Arc<PlantSnapshot> {
        let started = Instant::now();
        self.sequence += 1;
        self.stats.ticks += 1;
        metrics::POLL_TICKS.inc();

        let outcome = match self.session.ensure_connected().await {
            Ok(()) => {
                if let Some(gateway) = &self.gateway {
                    gateway.retry_pending_releases().await;
                }
                self.session.read_all(&self.tags).await
            }
            Err(e) => Err(e),
        };

        let snapshot = match outcome {
            Ok(readings) => {
                if self.consecutive_failures > 0 {
                    info!(after = self.consecutive_failures, "PLC reads recovered");
                }
                self.consecutive_failures = 0;
                if readings.len() < self.tags.len() {
                    self.stats.partial += 1;
                    metrics::PARTIAL_READS.inc();
                    let missing: Vec<&str> = self
                        .tags
                        .iter()
                        .filter(|t| !readings.contains_key(*t))
                        .map(|t| t.as_str())
                        .collect();
                    debug!(missing = ?missing, "partial read");
                }
                PlantSnapshot::from_readings(readings, self.timebase.unix_ms(), self.sequence)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.stats.failures += 1;
                metrics::POLL_FAILURES.inc();
                if self.consecutive_failures == 1
                    || self.consecutive_failures % FAILURE_LOG_EVERY == 0
                {
                    warn!(
                        error = %e,
                        consecutive = self.consecutive_failures,
                        "poll failed; publishing ERROR snapshot"
                    );
                } else {
                    debug!(error = %e, consecutive = self.consecutive_failures, "poll failed");
                }
                PlantSnapshot::faulted(&self.tags, self.timebase.unix_ms(), self.sequence)
            }
        };

        let snapshot = Arc::new(snapshot);
        self.hub.publish_snapshot(snapshot.clone());
        metrics::POLL_DURATION_MS.observe(started.elapsed().as_secs_f64() * 1000.0);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::sim::{SimHandle, SimulatedPlc};
    use batch_core::{AddressMap, Protocol, Reading, TagValue};

    fn poller(plc: &SimHandle, interval: Duration) -> Poller {
        let map = Arc::new(AddressMap::builtin(Protocol::S7));
        let session = Arc::new(Session::new(
            Box::new(SimulatedPlc::with_handle(plc.clone())),
            map,
            SessionConfig::default(),
        ));
        Poller::new(session, FanoutHub::default(), interval)
    }

    #[tokio::test]
    async fn tick_connects_and_publishes() {
        let plc = SimHandle::default();
        let mut poller = poller(&plc, Duration::from_millis(10));
        let snapshot = poller.tick().await;
        assert!(snapshot.connected);
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.values.len(), 13);
        assert_eq!(poller.hub.latest().unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn failed_connect_publishes_error_marker_for_every_tag() {
        let plc = SimHandle::default();
        plc.fail_connect(true);
        let mut poller = poller(&plc, Duration::from_millis(10));
        let snapshot = poller.tick().await;
        assert!(!snapshot.connected);
        assert!(!snapshot.running);
        assert!(snapshot.values.values().all(|r| *r == Reading::Error));
        assert_eq!(poller.stats().failures, 1);

        plc.fail_connect(false);
        let snapshot = poller.tick().await;
        assert!(snapshot.connected);
        assert_eq!(snapshot.get("PESO"), Some(&Reading::Value(TagValue::Int(0))));
    }

    #[tokio::test]
    async fn run_stops_on_signal() {
        let plc = SimHandle::default();
        let poller = poller(&plc, Duration::from_millis(5));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poller.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(40)).await;
        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap();
        assert!(stats.ticks >= 2);
    }

    #[tokio::test]
    async fn reconnect_finishes_release_lost_during_link_fault() {
        use crate::fanout::ClientId;
        use crate::gateway::{CommandGateway, GatewayConfig};

        let plc = SimHandle::default();
        let map = Arc::new(AddressMap::builtin(Protocol::S7));
        let tara = map.resolve("TARA").unwrap();
        let session = Arc::new(Session::new(
            Box::new(SimulatedPlc::with_handle(plc.clone())),
            map,
            SessionConfig::default(),
        ));
        let gateway = Arc::new(CommandGateway::new(
            session.clone(),
            FanoutHub::default(),
            GatewayConfig {
                hold_timeout: Duration::from_millis(50),
                ..GatewayConfig::default()
            },
        ));
        let mut poller = Poller::new(session.clone(), FanoutHub::default(), Duration::from_millis(10))
            .with_gateway(gateway.clone());

        poller.tick().await;
        gateway.press(ClientId(7), "TARA").await.unwrap();
        assert_eq!(plc.value(&tara), TagValue::Bool(true));

        plc.set_link_down(true);
        assert!(!poller.tick().await.connected);
        assert!(gateway.release(ClientId(7), "TARA").await.is_err());
        assert_eq!(gateway.abandon(ClientId(7)).await, 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gateway.pending_releases(), 1);
        assert_eq!(plc.value(&tara), TagValue::Bool(true));

        plc.set_link_down(false);
        assert!(poller.tick().await.connected);
        assert_eq!(plc.value(&tara), TagValue::Bool(false));
        assert_eq!(gateway.pending_releases(), 0);
    }

    #[tokio::test]
    async fn watchdog_release_lost_during_fault_lands_after_reconnect() {
        use crate::fanout::ClientId;
        use crate::gateway::{CommandGateway, GatewayConfig};

        let plc = SimHandle::default();
        let map = Arc::new(AddressMap::builtin(Protocol::S7));
        let tara = map.resolve("TARA").unwrap();
        let session = Arc::new(Session::new(
            Box::new(SimulatedPlc::with_handle(plc.clone())),
            map,
            SessionConfig::default(),
        ));
        let gateway = Arc::new(CommandGateway::new(
            session.clone(),
            FanoutHub::default(),
            GatewayConfig {
                hold_timeout: Duration::from_millis(30),
                ..GatewayConfig::default()
            },
        ));
        let mut poller = Poller::new(session, FanoutHub::default(), Duration::from_millis(10))
            .with_gateway(gateway.clone());

        poller.tick().await;
        gateway.press(ClientId(2), "TARA").await.unwrap();
        plc.set_link_down(true);
        poller.tick().await;
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(gateway.active_holds(), 0);
        assert_eq!(plc.value(&tara), TagValue::Bool(true));

        plc.set_link_down(false);
        poller.tick().await;
        assert_eq!(plc.value(&tara), TagValue::Bool(false));
    }

    #[test]
    fn overruns_count_skipped_ticks() {
        let plc = SimHandle::default();
        let mut poller = poller(&plc, Duration::from_millis(100));
        poller.count_skipped(Duration::from_millis(90));
        assert_eq!(poller.stats().skipped, 0);
        poller.count_skipped(Duration::from_millis(350));
        assert_eq!(poller.stats().skipped, 3);
    }
}
