//! Relay transport
//!
//! - `message`: NIP-01 frames
//! - `connection`: one reconnecting task per relay
//! - `pool`: fan-out publishing, verified and deduplicated inbound events

pub mod backoff;
pub mod connection;
pub mod dedup;
pub mod message;
pub mod pool;

pub use backoff::Backoff;
pub use connection::{
    resubscribe_filter, RelayConnection, RelayCursor, RelayHandle, RelayNotification,
    RelaySettings, RelayStatus,
};
pub use dedup::DedupCache;
pub use message::{ClientMessage, RelayMessage};
pub use pool::{InboundSink, RelayPool};
