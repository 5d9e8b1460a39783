//! Server identity: the keypair the bridge signs and decrypts with

use nostr_sdk::prelude::{Keys, PublicKey, SecretKey};
use std::fmt;
use tracing::info;
use zeroize::Zeroizing;

use super::nip44::{derive_shared_secret, SharedSecret};
use crate::error::{BridgeError, Result};
use crate::storage::Storage;

/// Storage key holding the hex-encoded server secret
pub const IDENTITY_KEY: &str = "server_identity";

#[derive(Clone)]
pub struct ServerIdentity {
    keys: Keys,
}

impl ServerIdentity {
    pub fn generate() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let secret = SecretKey::from_hex(secret_hex.trim())
            .map_err(|e| BridgeError::Configuration(format!("invalid server secret: {}", e)))?;
        Ok(Self {
            keys: Keys::new(secret),
        })
    }

    /// Load the persisted identity, creating and saving one on first use.
    /// A stored identity that fails to parse is an error, never replaced.
    pub fn load_or_generate(store: &dyn Storage) -> Result<Self> {
        if let Some(bytes) = store.read(IDENTITY_KEY)? {
            let secret_hex = Zeroizing::new(String::from_utf8(bytes).map_err(|_| {
                BridgeError::Configuration("server identity is not UTF-8".to_string())
            })?);
            return Self::from_secret_hex(&secret_hex);
        }

        let identity = Self::generate();
        let secret_hex = Zeroizing::new(identity.keys.secret_key().to_secret_hex());
        store.write(IDENTITY_KEY, secret_hex.as_bytes())?;
        info!(pubkey = %identity.public_key(), "Generated new server identity");
        Ok(identity)
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Conversation key with a remote party
    pub fn shared_secret_with(&self, remote: &PublicKey) -> Result<SharedSecret> {
        let secret = secret_key_bytes(self.keys.secret_key())?;
        derive_shared_secret(&secret, &public_key_bytes(remote)?)
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("public_key", &self.public_key().to_hex())
            .finish()
    }
}

/// Raw x-only bytes of a Nostr public key
pub fn public_key_bytes(public_key: &PublicKey) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(public_key.to_hex(), &mut out)
        .map_err(|e| BridgeError::Decrypt(format!("invalid public key: {}", e)))?;
    Ok(out)
}

/// Raw scalar bytes of a Nostr secret key
pub fn secret_key_bytes(secret_key: &SecretKey) -> Result<Zeroizing<[u8; 32]>> {
    let secret_hex = Zeroizing::new(secret_key.to_secret_hex());
    let mut out = Zeroizing::new([0u8; 32]);
    hex::decode_to_slice(secret_hex.as_str(), &mut out[..])
        .map_err(|e| BridgeError::Configuration(format!("invalid secret key: {}", e)))?;
    Ok(out)
}
