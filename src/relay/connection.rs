//! Relay Connection
//!
//! One task per relay. The task owns the socket and cycles through
//! `Connecting -> Connected -> Disconnected`, sleeping in `BackingOff`
//! between attempts. Everything else talks to it through channels held by
//! `RelayHandle`.

use futures_util::{SinkExt, StreamExt};
use nostr_sdk::prelude::{Event, EventId, Filter, Timestamp};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::message::{ClientMessage, RelayMessage};
use super::pool::InboundSink;
use crate::config::BackoffConfig;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
    BackingOff,
}

/// Asynchronous outcome reports, since publishing never waits on the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotification {
    /// Relay answered `OK false`
    Rejected {
        relay: String,
        event_id: String,
        message: String,
    },
    SendFailed {
        relay: String,
        event_id: EventId,
        error: String,
    },
    Notice {
        relay: String,
        message: String,
    },
    SubscriptionClosed {
        relay: String,
        message: String,
    },
}

/// Per-relay tuning
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
    pub outbound_queue: usize,
}

/// Resume point for the subscription on one relay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayCursor {
    pub last_event_id: Option<EventId>,
    pub newest: Option<Timestamp>,
}

impl RelayCursor {
    /// Record an accepted event. `created_at` is sender-chosen, so it is
    /// capped at `now`.
    pub fn observe(&mut self, event_id: EventId, created_at: Timestamp, now: Timestamp) {
        self.last_event_id = Some(event_id);
        let seen = created_at.min(now);
        if self.newest.map_or(true, |t| seen > t) {
            self.newest = Some(seen);
        }
    }
}

/// The filter to send on (re)subscription: `since` is the later of the
/// configured floor and the newest event already seen here.
pub fn resubscribe_filter(filter: &Filter, cursor: &RelayCursor) -> Filter {
    let mut filter = filter.clone();
    if let Some(seen) = cursor.newest {
        filter.since = Some(match filter.since {
            Some(floor) if floor > seen => floor,
            _ => seen,
        });
    }
    filter
}

/// Handle to a running relay task
#[derive(Debug, Clone)]
pub struct RelayHandle {
    url: String,
    outbound: mpsc::Sender<Event>,
    filter: watch::Sender<Option<Filter>>,
    status: watch::Receiver<RelayStatus>,
}

impl RelayHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    /// Replace the subscription filter; sent now if connected, else on the
    /// next connect
    pub fn subscribe(&self, filter: Filter) {
        self.filter.send_replace(Some(filter));
    }

    /// Queue `event` for sending. Never waits for the relay.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.outbound.try_send(event).map_err(|e| {
            BridgeError::Transport(format!("{}: outbound queue unavailable: {}", self.url, e))
        })
    }
}

pub struct RelayConnection;

impl RelayConnection {
    /// Start the connection task for `url`
    pub fn spawn(
        url: impl Into<String>,
        settings: RelaySettings,
        inbound: InboundSink,
        notifications: broadcast::Sender<RelayNotification>,
        shutdown: watch::Receiver<bool>,
    ) -> (RelayHandle, JoinHandle<()>) {
        let url = url.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue.max(1));
        let (filter_tx, filter_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(RelayStatus::Disconnected);

        let worker = Worker {
            url: url.clone(),
            subscription_id: format!("nwc-{:08x}", rand::random::<u32>()),
            settings,
            inbound,
            notifications,
            status: status_tx,
            cursor: RelayCursor::default(),
        };
        let task = tokio::spawn(worker.run(outbound_rx, filter_rx, shutdown));

        let handle = RelayHandle {
            url,
            outbound: outbound_tx,
            filter: filter_tx,
            status: status_rx,
        };
        (handle, task)
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

struct Worker {
    url: String,
    subscription_id: String,
    settings: RelaySettings,
    inbound: InboundSink,
    notifications: broadcast::Sender<RelayNotification>,
    status: watch::Sender<RelayStatus>,
    cursor: RelayCursor,
}

impl Worker {
    async fn run(
        mut self,
        mut outbound: mpsc::Receiver<Event>,
        mut filter: watch::Receiver<Option<Filter>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = Backoff::new(self.settings.backoff.clone());

        while !*shutdown.borrow() {
            self.status.send_replace(RelayStatus::Connecting);
            debug!(relay = %self.url, attempt = backoff.failures() + 1, "Connecting");

            let attempt = tokio::time::timeout(
                self.settings.connect_timeout,
                connect_async(self.url.as_str()),
            );
            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = attempt => result,
            };

            match result {
                Ok(Ok((socket, _))) => {
                    backoff.reset();
                    self.status.send_replace(RelayStatus::Connected);
                    info!(relay = %self.url, "Connected to relay");

                    let end = self
                        .session(socket, &mut outbound, &mut filter, &mut shutdown)
                        .await;
                    self.status.send_replace(RelayStatus::Disconnected);
                    if matches!(end, SessionEnd::Shutdown) {
                        break;
                    }
                    warn!(relay = %self.url, "Relay connection lost");
                }
                Ok(Err(e)) => warn!(relay = %self.url, error = %e, "Connect failed"),
                Err(_) => warn!(relay = %self.url, "Connect timed out"),
            }

            let delay = backoff.next_delay();
            self.status.send_replace(RelayStatus::BackingOff);
            debug!(relay = %self.url, delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status.send_replace(RelayStatus::Disconnected);
        debug!(relay = %self.url, "Relay task stopped");
    }

    async fn session<S>(
        &mut self,
        socket: S,
        outbound: &mut mpsc::Receiver<Event>,
        filter: &mut watch::Receiver<Option<Filter>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd
    where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        let current = filter.borrow_and_update().clone();
        if let Some(f) = current {
            if self.send_req(&mut sink, &f).await.is_err() {
                return SessionEnd::Disconnected;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.close(&mut sink).await;
                    return SessionEnd::Shutdown;
                }
                changed = filter.changed() => {
                    if changed.is_err() {
                        self.close(&mut sink).await;
                        return SessionEnd::Shutdown;
                    }
                    let current = filter.borrow_and_update().clone();
                    if let Some(f) = current {
                        if self.send_req(&mut sink, &f).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                }
                queued = outbound.recv() => {
                    let Some(event) = queued else {
                        self.close(&mut sink).await;
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = self.send_event(&mut sink, event).await {
                        debug!(relay = %self.url, error = %e, "Send failed, reconnecting");
                        return SessionEnd::Disconnected;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Disconnected,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(relay = %self.url, error = %e, "WebSocket error");
                        return SessionEnd::Disconnected;
                    }
                },
            }
        }
    }

    async fn send_req<K>(&self, sink: &mut K, filter: &Filter) -> std::result::Result<(), ()>
    where
        K: futures_util::Sink<Message> + Unpin,
    {
        let filter = resubscribe_filter(filter, &self.cursor);
        let frame = ClientMessage::Req {
            subscription_id: self.subscription_id.clone(),
            filters: vec![filter],
        };
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(relay = %self.url, error = %e, "Cannot encode subscription");
                return Ok(());
            }
        };
        debug!(relay = %self.url, subscription = %self.subscription_id, "Subscribing");
        sink.send(Message::text(text)).await.map_err(|_| {
            warn!(relay = %self.url, "Failed to send subscription");
        })
    }

    async fn send_event<K>(&self, sink: &mut K, event: Event) -> std::result::Result<(), String>
    where
        K: futures_util::Sink<Message> + Unpin,
        K::Error: std::fmt::Display,
    {
        let event_id = event.id;
        let text = ClientMessage::Event(Box::new(event))
            .to_json()
            .map_err(|e| e.to_string())?;
        if let Err(e) = sink.send(Message::text(text)).await {
            let error = e.to_string();
            self.notify(RelayNotification::SendFailed {
                relay: self.url.clone(),
                event_id,
                error: error.clone(),
            });
            return Err(error);
        }
        debug!(relay = %self.url, event_id = %event_id, "Event sent");
        Ok(())
    }

    async fn close<K>(&self, sink: &mut K)
    where
        K: futures_util::Sink<Message> + Unpin,
    {
        if let Ok(text) = ClientMessage::Close(self.subscription_id.clone()).to_json() {
            let _ = sink.send(Message::text(text)).await;
        }
        let _ = sink.close().await;
        info!(relay = %self.url, "Disconnected from relay");
    }

    async fn handle_text(&mut self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(relay = %self.url, error = %e, "Ignoring relay frame");
                return;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if subscription_id != self.subscription_id {
                    return;
                }
                let (event_id, created_at) = (event.id, event.created_at);
                if self.inbound.push(&self.url, *event).await {
                    self.cursor.observe(event_id, created_at, Timestamp::now());
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if accepted {
                    debug!(relay = %self.url, event_id = %event_id, "Event accepted");
                } else {
                    warn!(relay = %self.url, event_id = %event_id, reason = %message, "Event rejected");
                    self.notify(RelayNotification::Rejected {
                        relay: self.url.clone(),
                        event_id,
                        message,
                    });
                }
            }
            RelayMessage::EndOfStoredEvents(_) => {
                debug!(relay = %self.url, "End of stored events");
            }
            RelayMessage::Notice(message) => {
                warn!(relay = %self.url, notice = %message, "Relay notice");
                self.notify(RelayNotification::Notice {
                    relay: self.url.clone(),
                    message,
                });
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                if subscription_id != self.subscription_id {
                    return;
                }
                warn!(relay = %self.url, reason = %message, "Subscription closed by relay");
                self.notify(RelayNotification::SubscriptionClosed {
                    relay: self.url.clone(),
                    message,
                });
            }
            RelayMessage::Auth(_) => {
                debug!(relay = %self.url, "Relay requested AUTH; not supported");
            }
        }
    }

    fn notify(&self, notification: RelayNotification) {
        // No receivers is fine
        let _ = self.notifications.send(notification);
    }
}
