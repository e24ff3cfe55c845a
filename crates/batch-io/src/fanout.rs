use crate::metrics;
use crate::protocol::{EchoEvent, OutboundMessage};
use batch_core::PlantSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub const DEFAULT_CAPACITY: usize = 64;

/// Identifies one realtime subscriber (or the HTTP surface) for hold ownership and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Commands arriving over plain HTTP share one identity.
    pub const HTTP: ClientId = ClientId(0);
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == ClientId::HTTP {
            write!(f, "http")
        } else {
            write!(f, "ws-{}", self.0)
        }
    }
}

/// Publishes snapshots and echo events to every subscriber and keeps the latest snapshot.
#[derive(Clone)]
pub struct FanoutHub {
    tx: broadcast::Sender<OutboundMessage>,
    latest: Arc<watch::Sender<Option<Arc<PlantSnapshot>>>>,
    next_client: Arc<AtomicU64>,
}

impl FanoutHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (latest, _) = watch::channel(None);
        Self {
            tx,
            latest: Arc::new(latest),
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Returns the number of subscribers reached.
    pub fn publish_snapshot(&self, snapshot: Arc<PlantSnapshot>) -> usize {
        self.latest.send_replace(Some(snapshot.clone()));
        self.tx.send(OutboundMessage::PlcUpdate(snapshot)).unwrap_or(0)
    }

    pub fn publish_echo(&self, event: EchoEvent) -> usize {
        self.tx.send(OutboundMessage::Echo(event)).unwrap_or(0)
    }

    pub fn latest(&self) -> Option<Arc<PlantSnapshot>> {
        self.latest.borrow().clone()
    }

    pub fn watch_latest(&self) -> watch::Receiver<Option<Arc<PlantSnapshot>>> {
        self.latest.subscribe()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        metrics::SUBSCRIBERS.inc();
        Subscription {
            id,
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A live subscription; dropping it unsubscribes.
pub struct Subscription {
    id: ClientId,
    rx: broadcast::Receiver<OutboundMessage>,
}

impl Subscription {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn recv(&mut self) -> Result<OutboundMessage, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        metrics::SUBSCRIBERS.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(sequence: u64) -> Arc<PlantSnapshot> {
        Arc::new(PlantSnapshot::from_readings(BTreeMap::new(), 0, sequence))
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_snapshot() {
        let hub = FanoutHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_ne!(a.id(), b.id());
        assert_eq!(hub.publish_snapshot(snapshot(1)), 2);

        for sub in [&mut a, &mut b] {
            match sub.recv().await.unwrap() {
                OutboundMessage::PlcUpdate(s) => assert_eq!(s.sequence, 1),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(hub.latest().unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_excluded() {
        let hub = FanoutHub::new(8);
        let a = hub.subscribe();
        let _b = hub.subscribe();
        drop(a);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.publish_echo(EchoEvent::Start), 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_keeps_latest() {
        let hub = FanoutHub::default();
        assert_eq!(hub.publish_snapshot(snapshot(4)), 0);
        assert_eq!(hub.latest().unwrap().sequence, 4);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_frames() {
        let hub = FanoutHub::new(2);
        let mut slow = hub.subscribe();
        for seq in 0..5 {
            hub.publish_snapshot(snapshot(seq));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        match slow.recv().await.unwrap() {
            OutboundMessage::PlcUpdate(s) => assert_eq!(s.sequence, 3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
