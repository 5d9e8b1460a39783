//! Cryptographic Primitives
//!
//! - **nip44**: NIP-44 v2 conversation keys and authenticated payload encryption
//! - **identity**: the bridge's own keypair and key byte conversions

pub mod identity;
pub mod nip44;

pub use identity::{public_key_bytes, secret_key_bytes, ServerIdentity, IDENTITY_KEY};
pub use nip44::{decrypt, derive_shared_secret, encrypt, SharedSecret};
