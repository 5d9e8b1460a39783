//! Connection Registry
//!
//! Maps client public keys to connection records, persisted through the
//! `Storage` interface. Each record sits behind its own async mutex: an
//! `Authorization` keeps that mutex locked from the budget check until the
//! spend is recorded, so two payments on one connection can never both pass
//! against the same pre-spend balance. Different connections never contend.

use nostr_sdk::prelude::{Keys, PublicKey};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::connection::{Budget, BudgetPeriod, Connection, Denial, PermissionGrant};
use crate::error::{BridgeError, Result};
use crate::protocol::Method;
use crate::storage::Storage;

/// Storage key prefix for connection records
pub const CONNECTION_KEY_PREFIX: &str = "connection:";

pub fn connection_key(client_pubkey: &PublicKey) -> String {
    format!("{}{}", CONNECTION_KEY_PREFIX, client_pubkey.to_hex())
}

struct Entry {
    connection: Connection,
    revoked: bool,
}

type Slot = Arc<Mutex<Entry>>;

pub struct ConnectionRegistry {
    store: Arc<dyn Storage>,
    connections: RwLock<HashMap<PublicKey, Slot>>,
}

impl ConnectionRegistry {
    /// Empty registry backed by `store`
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted connection. A malformed record is skipped and
    /// logged; it never prevents the others from loading. Expired records
    /// are pruned.
    pub fn load(store: Arc<dyn Storage>, now: u64) -> Result<Self> {
        let registry = Self::new(store);
        let mut loaded = 0usize;

        for key in registry.store.keys()? {
            if !key.starts_with(CONNECTION_KEY_PREFIX) {
                continue;
            }
            let connection = match registry.read_record(&key) {
                Ok(c) => c,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping malformed connection record");
                    continue;
                }
            };
            if connection.is_expired(now) {
                info!(client = %connection.client_pubkey, "Pruning expired connection");
                if let Err(e) = registry.store.remove(&key) {
                    warn!(key = %key, error = %e, "Failed to remove expired connection");
                }
                continue;
            }
            registry.insert(connection);
            loaded += 1;
        }

        info!(count = loaded, "Loaded connections");
        Ok(registry)
    }

    fn read_record(&self, key: &str) -> Result<Connection> {
        let bytes = self
            .store
            .read(key)?
            .ok_or_else(|| BridgeError::Configuration(format!("record vanished: {}", key)))?;
        let connection: Connection = serde_json::from_slice(&bytes)
            .map_err(|e| BridgeError::Configuration(format!("{}: {}", key, e)))?;
        if connection_key(&connection.client_pubkey) != key {
            return Err(BridgeError::Configuration(format!(
                "{}: key does not match client pubkey",
                key
            )));
        }
        Ok(connection)
    }

    fn insert(&self, connection: Connection) {
        let pubkey = connection.client_pubkey;
        let entry = Entry {
            connection,
            revoked: false,
        };
        self.connections
            .write()
            .insert(pubkey, Arc::new(Mutex::new(entry)));
    }

    fn slot(&self, client_pubkey: &PublicKey) -> Option<Slot> {
        self.connections.read().get(client_pubkey).cloned()
    }

    /// Register a new connection with a fresh client keypair. The record is
    /// persisted before this returns, so its permissions are fixed before
    /// the secret ever leaves the process.
    pub async fn create_connection(
        &self,
        label: impl Into<String>,
        permissions: BTreeSet<Method>,
        budget: Option<(u64, BudgetPeriod)>,
        expires_at: Option<u64>,
        now: u64,
    ) -> Result<(Keys, Connection)> {
        if permissions.is_empty() {
            return Err(BridgeError::Configuration(
                "a connection needs at least one permitted method".to_string(),
            ));
        }

        let client_keys = Keys::generate();
        let connection = Connection {
            client_pubkey: client_keys.public_key(),
            label: label.into(),
            permissions,
            budget: budget.map(|(limit, period)| Budget::new(limit, period, now)),
            created_at: now,
            expires_at,
        };

        persist(self.store.as_ref(), &connection)?;
        self.insert(connection.clone());
        info!(
            client = %connection.client_pubkey,
            label = %connection.label,
            "Created connection"
        );
        Ok((client_keys, connection))
    }

    /// Snapshot of one connection
    pub async fn lookup(&self, client_pubkey: &PublicKey, now: u64) -> Result<Connection> {
        let slot = self.slot(client_pubkey).ok_or(Denial::UnknownConnection)?;
        let entry = slot.lock().await;
        if entry.revoked || entry.connection.is_expired(now) {
            return Err(Denial::UnknownConnection.into());
        }
        Ok(entry.connection.clone())
    }

    /// Check a request against the sender's connection.
    ///
    /// On success the returned `Authorization` holds the connection's lock.
    /// Callers of payment-class methods keep it until `record_spend`;
    /// everyone else should drop it (or call `into_grant`) right away.
    pub async fn authorize(
        &self,
        client_pubkey: &PublicKey,
        method: Method,
        amount_msat: u64,
        now: u64,
    ) -> std::result::Result<Authorization, Denial> {
        let slot = self.slot(client_pubkey).ok_or(Denial::UnknownConnection)?;
        let mut guard = slot.lock_owned().await;
        if guard.revoked {
            return Err(Denial::UnknownConnection);
        }

        let grant = guard.connection.authorize(method, amount_msat, now)?;
        debug!(
            client = %client_pubkey,
            method = %method,
            amount_msat,
            remaining = ?grant.remaining_budget,
            "Authorized"
        );

        Ok(Authorization {
            guard,
            store: Arc::clone(&self.store),
            grant,
        })
    }

    /// Record a spend outside of an `Authorization`
    pub async fn record_spend(
        &self,
        client_pubkey: &PublicKey,
        amount_msat: u64,
        now: u64,
    ) -> Result<()> {
        let slot = self.slot(client_pubkey).ok_or(Denial::UnknownConnection)?;
        let mut entry = slot.lock().await;
        if entry.revoked {
            return Err(Denial::UnknownConnection.into());
        }
        entry.connection.record_spend(amount_msat, now);
        persist(self.store.as_ref(), &entry.connection)
    }

    /// Remove a connection. Waits for any in-flight payment on it to finish.
    /// Returns false if there was nothing to revoke.
    pub async fn revoke(&self, client_pubkey: &PublicKey) -> Result<bool> {
        let Some(slot) = self.slot(client_pubkey) else {
            return Ok(false);
        };
        let mut entry = slot.lock().await;
        entry.revoked = true;
        self.connections.write().remove(client_pubkey);
        self.store.remove(&connection_key(client_pubkey))?;
        info!(client = %client_pubkey, "Revoked connection");
        Ok(true)
    }

    /// Snapshot of all connections, ordered by creation time
    pub async fn list(&self) -> Vec<Connection> {
        let slots: Vec<Slot> = self.connections.read().values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let entry = slot.lock().await;
            if !entry.revoked {
                out.push(entry.connection.clone());
            }
        }
        out.sort_by_key(|c| c.created_at);
        out
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn persist(store: &dyn Storage, connection: &Connection) -> Result<()> {
    let data = serde_json::to_vec_pretty(connection)?;
    store.write(&connection_key(&connection.client_pubkey), &data)
}

/// A successful authorization holding the connection's lock
pub struct Authorization {
    guard: OwnedMutexGuard<Entry>,
    store: Arc<dyn Storage>,
    grant: PermissionGrant,
}

impl Authorization {
    pub fn grant(&self) -> &PermissionGrant {
        &self.grant
    }

    /// Commit a completed spend and persist the record. The in-memory spend
    /// is counted even if persisting fails.
    pub fn record_spend(&mut self, amount_msat: u64, now: u64) -> Result<()> {
        self.guard.connection.record_spend(amount_msat, now);
        if self.guard.revoked {
            return Ok(());
        }
        persist(self.store.as_ref(), &self.guard.connection).map_err(|e| {
            error!(
                client = %self.guard.connection.client_pubkey,
                error = %e,
                "Failed to persist spend"
            );
            e
        })
    }

    /// Release the lock, keeping the evaluated grant
    pub fn into_grant(self) -> PermissionGrant {
        self.grant
    }
}
