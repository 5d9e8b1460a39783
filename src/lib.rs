//! Nostr Wallet Connect (NIP-47) bridge
//!
//! Lets a remote application drive a wallet over Nostr relays: requests
//! arrive NIP-44 encrypted, are checked against per-connection permissions
//! and budgets, run through the wallet's command interface, and are answered
//! with encrypted responses.
//!
//! The host wallet supplies a `WalletCommands` implementation and a
//! `Storage`, then drives the bridge through `NwcPlugin::start` / `stop`.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod pairing;
pub mod plugin;
pub mod processor;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod storage;
pub mod wallet;

pub use config::{BackoffConfig, BridgeConfig};
pub use connection::{Budget, BudgetPeriod, Connection, Denial, PermissionGrant};
pub use error::{BridgeError, Result};
pub use pairing::{ConnectionUri, Pairing, PairingRequest};
pub use plugin::{BridgeSession, NwcPlugin, PluginContext};
pub use processor::{DropReason, EventPublisher, RequestOutcome, RequestProcessor};
pub use registry::{Authorization, ConnectionRegistry};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use wallet::{WalletCommands, WalletError};
