//! Relay Pool
//!
//! Fans out to every configured relay and merges what comes back. Inbound
//! events are verified before they reach the dedup cache, so a forged event
//! cannot claim the id of a genuine one.

use nostr_sdk::prelude::{Event, Filter};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{RelayConnection, RelayHandle, RelayNotification, RelaySettings, RelayStatus};
use super::dedup::DedupCache;
use crate::error::{BridgeError, Result};

const NOTIFICATION_CAPACITY: usize = 256;

/// Entry point for events read off any relay
#[derive(Clone)]
pub struct InboundSink {
    dedup: Arc<DedupCache>,
    tx: mpsc::Sender<Event>,
}

impl InboundSink {
    pub fn new(dedup: Arc<DedupCache>, tx: mpsc::Sender<Event>) -> Self {
        Self { dedup, tx }
    }

    /// Verify, deduplicate and forward `event`. Returns true if it was
    /// handed to the worker queue.
    pub async fn push(&self, relay: &str, event: Event) -> bool {
        if let Err(e) = event.verify() {
            debug!(relay = %relay, event_id = %event.id, error = %e, "Dropping invalid event");
            return false;
        }
        if !self.dedup.insert_if_absent(event.id) {
            debug!(relay = %relay, event_id = %event.id, "Duplicate event");
            return false;
        }
        if self.tx.send(event).await.is_err() {
            debug!(relay = %relay, "Inbound queue closed");
            return false;
        }
        true
    }
}

pub struct RelayPool {
    relays: Vec<RelayHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    notifications: broadcast::Sender<RelayNotification>,
}

impl RelayPool {
    /// Spawn one connection task per URL
    pub fn spawn(urls: &[String], settings: RelaySettings, inbound: InboundSink) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let mut relays = Vec::with_capacity(urls.len());
        let mut tasks = Vec::with_capacity(urls.len());
        for url in urls {
            let (handle, task) = RelayConnection::spawn(
                url.clone(),
                settings.clone(),
                inbound.clone(),
                notifications.clone(),
                shutdown_rx.clone(),
            );
            relays.push(handle);
            tasks.push(task);
        }
        info!(relays = relays.len(), "Relay pool started");

        Self {
            relays,
            tasks: Mutex::new(tasks),
            shutdown,
            notifications,
        }
    }

    /// Set the subscription on every relay
    pub fn subscribe(&self, filter: Filter) {
        for relay in &self.relays {
            relay.subscribe(filter.clone());
        }
    }

    /// Send to every connected relay, once each. Returns how many relays
    /// accepted the event into their queue.
    pub fn publish(&self, event: &Event) -> Result<usize> {
        let mut sent = 0usize;
        for relay in &self.relays {
            if relay.status() != RelayStatus::Connected {
                continue;
            }
            match relay.publish(event.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(relay = %relay.url(), event_id = %event.id, error = %e, "Publish failed"),
            }
        }
        if sent == 0 {
            return Err(BridgeError::Transport(format!(
                "no connected relay took event {}",
                event.id
            )));
        }
        Ok(sent)
    }

    /// Queue on every relay whatever its state; sent on (re)connect
    pub fn announce(&self, event: &Event) -> usize {
        self.relays
            .iter()
            .filter(|relay| match relay.publish(event.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(relay = %relay.url(), error = %e, "Announce failed");
                    false
                }
            })
            .count()
    }

    pub fn notifications(&self) -> broadcast::Receiver<RelayNotification> {
        self.notifications.subscribe()
    }

    pub fn statuses(&self) -> Vec<(String, RelayStatus)> {
        self.relays
            .iter()
            .map(|r| (r.url().to_string(), r.status()))
            .collect()
    }

    pub fn connected(&self) -> usize {
        self.relays
            .iter()
            .filter(|r| r.status() == RelayStatus::Connected)
            .count()
    }

    /// Signal every relay task to close and wait for them
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Relay task ended abnormally");
            }
        }
        info!("Relay pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use nostr_sdk::prelude::{EventBuilder, Keys, Kind};
    use std::time::Duration;

    fn sink(capacity: usize) -> (InboundSink, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        let dedup = Arc::new(DedupCache::new(100, Duration::from_secs(60)));
        (InboundSink::new(dedup, tx), rx)
    }

    fn signed(content: &str) -> Event {
        EventBuilder::new(Kind::from(23194u16), content)
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    #[tokio::test]
    async fn test_sink_drops_duplicates() {
        let (sink, mut rx) = sink(8);
        let event = signed("once");

        assert!(sink.push("wss://a", event.clone()).await);
        assert!(!sink.push("wss://b", event.clone()).await);
        assert_eq!(rx.recv().await.unwrap().id, event.id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forged_event_does_not_poison_dedup() {
        let (sink, mut rx) = sink(8);
        let genuine = signed("genuine");

        let mut forged = genuine.clone();
        forged.content = "tampered".to_string();
        assert!(!sink.push("wss://evil", forged).await);

        assert!(sink.push("wss://good", genuine.clone()).await);
        assert_eq!(rx.recv().await.unwrap().content, "genuine");
    }

    fn settings() -> RelaySettings {
        RelaySettings {
            connect_timeout: Duration::from_millis(200),
            backoff: BackoffConfig {
                initial_ms: 50,
                max_ms: 100,
                factor: 2.0,
                jitter: 0.0,
            },
            outbound_queue: 4,
        }
    }

    #[tokio::test]
    async fn test_publish_without_connected_relay_is_transport_error() {
        let (sink, _rx) = sink(8);
        let pool = RelayPool::spawn(&["ws://127.0.0.1:1".to_string()], settings(), sink);

        let err = pool.publish(&signed("hello")).unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(pool.connected(), 0);

        assert_eq!(pool.announce(&signed("info")), 1);

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .unwrap();
        assert_eq!(pool.statuses()[0].1, RelayStatus::Disconnected);
    }
}
