//! Bridge session lifecycle
//!
//! `NwcPlugin` is what the host wallet holds. `start` wires identity,
//! registry, dispatcher and relays into a running `BridgeSession`; `stop`
//! tears it down. Nothing about in-flight requests survives a stop.

use nostr_sdk::prelude::{Event, EventBuilder, Filter, Kind, PublicKey, Tag, TagKind, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::connection::Connection;
use crate::crypto::ServerIdentity;
use crate::dispatcher::CommandDispatcher;
use crate::error::{BridgeError, Result};
use crate::pairing::{self, Pairing, PairingRequest};
use crate::processor::{EventPublisher, RequestOutcome, RequestProcessor};
use crate::protocol::{Method, ENCRYPTION_SCHEME, INFO_KIND, REQUEST_KIND};
use crate::registry::ConnectionRegistry;
use crate::relay::{DedupCache, InboundSink, RelayNotification, RelayPool, RelaySettings, RelayStatus};
use crate::storage::Storage;
use crate::wallet::WalletCommands;

/// What the host provides at start
#[derive(Clone)]
pub struct PluginContext {
    pub wallet: Arc<dyn WalletCommands>,
    pub store: Arc<dyn Storage>,
}

/// A running bridge
pub struct BridgeSession {
    identity: Arc<ServerIdentity>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    pool: Arc<RelayPool>,
    stop: watch::Sender<bool>,
    workers: JoinHandle<()>,
}

impl BridgeSession {
    pub fn server_pubkey(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn supported_methods(&self) -> Vec<Method> {
        self.dispatcher.supported_methods()
    }
}

pub struct NwcPlugin {
    config: BridgeConfig,
    session: Mutex<Option<BridgeSession>>,
}

impl NwcPlugin {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Bring the bridge online. A second call while running does nothing.
    pub async fn start(&self, context: PluginContext) -> Result<()> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            warn!("Bridge already running");
            return Ok(());
        }
        self.config.validate()?;

        let now = Timestamp::now().as_u64();
        let identity = Arc::new(ServerIdentity::load_or_generate(context.store.as_ref())?);
        let registry = Arc::new(ConnectionRegistry::load(Arc::clone(&context.store), now)?);
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&context.wallet),
            &self.config.methods,
        )?);

        // Everything fallible happens before any relay task exists
        let info_event = build_info_event(&identity, &dispatcher.supported_methods())?;

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue);
        let dedup = Arc::new(DedupCache::new(
            self.config.dedup_capacity,
            self.config.dedup_ttl(),
        ));
        let settings = RelaySettings {
            connect_timeout: self.config.connect_timeout(),
            backoff: self.config.backoff.clone(),
            outbound_queue: self.config.outbound_queue,
        };
        let pool = Arc::new(RelayPool::spawn(
            &self.config.relays,
            settings,
            InboundSink::new(dedup, inbound_tx),
        ));

        pool.subscribe(
            Filter::new()
                .kind(Kind::from(REQUEST_KIND))
                .pubkey(identity.public_key())
                .since(Timestamp::from(now)),
        );
        let queued = pool.announce(&info_event);
        debug!(relays = queued, "Info event queued");

        let publisher: Arc<dyn EventPublisher> = pool.clone();
        let processor = Arc::new(RequestProcessor::new(
            Arc::clone(&identity),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            publisher,
        ));

        let (stop, stop_rx) = watch::channel(false);
        let workers = tokio::spawn(run_workers(
            inbound_rx,
            processor,
            self.config.max_concurrent_requests,
            stop_rx,
            self.config.shutdown_grace(),
        ));

        info!(
            pubkey = %identity.public_key(),
            relays = self.config.relays.len(),
            connections = registry.len(),
            methods = ?dispatcher.supported_methods(),
            "NWC bridge started"
        );

        *slot = Some(BridgeSession {
            identity,
            registry,
            dispatcher,
            pool,
            stop,
            workers,
        });
        Ok(())
    }

    /// Stop accepting requests, give in-flight ones `shutdown_grace` to
    /// finish, then close every relay
    pub async fn stop(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            debug!("Bridge not running");
            return Ok(());
        };

        session.stop.send_replace(true);
        if let Err(e) = session.workers.await {
            warn!(error = %e, "Worker loop ended abnormally");
        }
        session.pool.shutdown().await;
        info!("NWC bridge stopped");
        Ok(())
    }

    /// Register a connection and return its URI
    pub async fn create_pairing(&self, request: PairingRequest) -> Result<Pairing> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(not_running)?;

        let enabled = &self.config.methods;
        if let Some(m) = request.permissions.iter().find(|m| !enabled.contains(*m)) {
            return Err(BridgeError::Configuration(format!(
                "{} is not enabled on this bridge",
                m
            )));
        }

        pairing::create_pairing(
            &session.registry,
            session.server_pubkey(),
            request,
            &self.config.relays,
            self.config.lud16.as_deref(),
            Timestamp::now().as_u64(),
        )
        .await
    }

    pub async fn revoke(&self, client_pubkey: &PublicKey) -> Result<bool> {
        let registry = self.registry().await?;
        registry.revoke(client_pubkey).await
    }

    pub async fn connections(&self) -> Result<Vec<Connection>> {
        let registry = self.registry().await?;
        Ok(registry.list().await)
    }

    pub async fn server_pubkey(&self) -> Option<PublicKey> {
        self.session.lock().await.as_ref().map(|s| s.server_pubkey())
    }

    pub async fn relay_statuses(&self) -> Vec<(String, RelayStatus)> {
        match self.session.lock().await.as_ref() {
            Some(session) => session.pool.statuses(),
            None => Vec::new(),
        }
    }

    pub async fn notifications(&self) -> Result<broadcast::Receiver<RelayNotification>> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(not_running)?;
        Ok(session.pool.notifications())
    }

    async fn registry(&self) -> Result<Arc<ConnectionRegistry>> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(not_running)?;
        Ok(Arc::clone(&session.registry))
    }
}

fn not_running() -> BridgeError {
    BridgeError::Configuration("bridge is not running".to_string())
}

/// Replaceable event listing the methods this bridge serves
pub fn build_info_event(identity: &ServerIdentity, methods: &[Method]) -> Result<Event> {
    let content = methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    EventBuilder::new(Kind::from(INFO_KIND), content)
        .tags([Tag::custom(
            TagKind::custom("encryption"),
            [ENCRYPTION_SCHEME],
        )])
        .sign_with_keys(identity.keys())
        .map_err(|e| BridgeError::Serialization(format!("signing info event: {}", e)))
}

/// Pull events off the inbound queue and process each in its own task,
/// at most `max_concurrent` at a time
async fn run_workers(
    mut inbound: mpsc::Receiver<Event>,
    processor: Arc<RequestProcessor>,
    max_concurrent: usize,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            received = inbound.recv() => {
                let Some(event) = received else { break };
                let permit = tokio::select! {
                    _ = stop.changed() => break,
                    permit = Arc::clone(&permits).acquire_owned() => permit,
                };
                let Ok(permit) = permit else { break };

                let processor = Arc::clone(&processor);
                tasks.spawn(async move {
                    let _permit = permit;
                    let outcome = processor.process(&event).await;
                    match &outcome {
                        RequestOutcome::Dropped(reason) => {
                            debug!(event_id = %event.id, reason = ?reason, "Request dropped");
                        }
                        RequestOutcome::Responded { method, error, published } => {
                            info!(
                                event_id = %event.id,
                                method = %method,
                                error = ?error,
                                published,
                                "Request handled"
                            );
                        }
                    }
                });
            }
        }
    }

    inbound.close();
    drop(inbound);

    if tasks.is_empty() {
        return;
    }
    info!(in_flight = tasks.len(), "Waiting for in-flight requests");
    let drained = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "Aborting in-flight requests");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}
