//! NIP-44 v2 Encryption
//!
//! Authenticated encryption of request and response payloads.
//! Uses secp256k1 ECDH, HKDF-SHA256, ChaCha20 and HMAC-SHA256.
//!
//! References:
//! - https://github.com/nostr-protocol/nips/blob/master/44.md

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256kfun::prelude::*;
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BridgeError, Result};

/// NIP-44 v2 version byte
const NIP44_VERSION: u8 = 2;

/// Salt for HKDF key derivation (NIP-44 v2)
const HKDF_SALT: &[u8] = b"nip44-v2";

const MIN_PLAINTEXT_LEN: usize = 1;
const MAX_PLAINTEXT_LEN: usize = 65535;

// Base64 and raw payload bounds: version(1) + nonce(32) + padded(34..) + mac(32)
const MIN_PAYLOAD_B64_LEN: usize = 132;
const MAX_PAYLOAD_B64_LEN: usize = 87472;
const MIN_PAYLOAD_LEN: usize = 99;
const MAX_PAYLOAD_LEN: usize = 65603;

type HmacSha256 = Hmac<Sha256>;

/// NIP-44 conversation key shared by two parties
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Derives the raw ECDH x-coordinate
/// Takes a secret scalar and a public key (x-only 32 bytes)
pub fn ecdh_shared_x(secret: &[u8; 32], pubkey: &[u8; 32]) -> Result<[u8; 32]> {
    use secp256kfun::marker::NonZero;

    let secret_scalar: Scalar<Secret, NonZero> = Scalar::from_bytes(*secret)
        .ok_or_else(|| BridgeError::Configuration("invalid secret scalar".to_string()))?;

    // Remote keys come off the wire, so a bad one is a decrypt failure
    let pubkey_point = Point::<EvenY>::from_xonly_bytes(*pubkey)
        .ok_or_else(|| BridgeError::Decrypt("invalid x-only public key".to_string()))?;

    let shared_point = g!(secret_scalar * pubkey_point);
    Ok(shared_point.normalize().to_xonly_bytes())
}

/// Derives the conversation key between `local_secret` and `remote_public`.
/// Symmetric: both sides arrive at the same key.
pub fn derive_shared_secret(local_secret: &[u8; 32], remote_public: &[u8; 32]) -> Result<SharedSecret> {
    let mut shared_x = ecdh_shared_x(local_secret, remote_public)?;
    let (prk, _) = Hkdf::<Sha256>::extract(Some(HKDF_SALT), &shared_x);
    shared_x.zeroize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    Ok(SharedSecret(key))
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl Drop for MessageKeys {
    fn drop(&mut self) {
        self.chacha_key.zeroize();
        self.chacha_nonce.zeroize();
        self.hmac_key.zeroize();
    }
}

/// Derives the per-message keys from conversation key and nonce
fn derive_message_keys(conversation_key: &SharedSecret, nonce: &[u8; 32]) -> Result<MessageKeys> {
    let hk = Hkdf::<Sha256>::from_prk(conversation_key.as_bytes())
        .map_err(|e| BridgeError::Encrypt(format!("invalid conversation key: {}", e)))?;

    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|e| BridgeError::Encrypt(format!("HKDF expand failed: {}", e)))?;

    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..]);
    okm.zeroize();
    Ok(keys)
}

/// Calculate padding length per NIP-44
fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

/// Pads plaintext per NIP-44
fn pad_plaintext(plaintext: &[u8]) -> Vec<u8> {
    let len = plaintext.len();
    let padded_len = calc_padded_len(len);

    // 2-byte big-endian length prefix
    let mut result = Vec::with_capacity(2 + padded_len);
    result.extend_from_slice(&(len as u16).to_be_bytes());
    result.extend_from_slice(plaintext);
    result.resize(2 + padded_len, 0);
    result
}

/// Unpads plaintext per NIP-44
fn unpad_plaintext(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 2 {
        return Err(BridgeError::Decrypt("padded plaintext too short".to_string()));
    }

    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_LEN
        || 2 + len > padded.len()
        || padded.len() != 2 + calc_padded_len(len)
    {
        return Err(BridgeError::Decrypt("invalid padding".to_string()));
    }

    Ok(padded[2..2 + len].to_vec())
}

fn compute_mac(hmac_key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(hmac_key)
        .map_err(|e| BridgeError::Encrypt(format!("invalid HMAC key: {}", e)))?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

/// Encrypts a message using NIP-44 v2 with a fresh random nonce.
/// Returns base64-encoded payload.
pub fn encrypt(conversation_key: &SharedSecret, plaintext: &str) -> Result<String> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);

    encrypt_with_nonce(conversation_key, plaintext, &nonce)
}

/// Encrypts a message using NIP-44 v2 with specified nonce (for testing)
pub fn encrypt_with_nonce(
    conversation_key: &SharedSecret,
    plaintext: &str,
    nonce: &[u8; 32],
) -> Result<String> {
    let bytes = plaintext.as_bytes();
    if bytes.len() < MIN_PLAINTEXT_LEN || bytes.len() > MAX_PLAINTEXT_LEN {
        return Err(BridgeError::Encrypt(format!(
            "plaintext length {} out of range",
            bytes.len()
        )));
    }

    let keys = derive_message_keys(conversation_key, nonce)?;

    let mut buffer = pad_plaintext(bytes);
    let mut cipher = ChaCha20::new(
        Key::from_slice(&keys.chacha_key),
        Nonce::from_slice(&keys.chacha_nonce),
    );
    cipher.apply_keystream(&mut buffer);

    let mac = compute_mac(&keys.hmac_key, nonce, &buffer)?.finalize().into_bytes();

    // version + nonce + ciphertext + mac
    let mut payload = Vec::with_capacity(1 + 32 + buffer.len() + 32);
    payload.push(NIP44_VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buffer);
    payload.extend_from_slice(&mac);

    Ok(BASE64.encode(&payload))
}

/// Decrypts a NIP-44 v2 payload.
///
/// Any malformed, foreign-keyed or tampered payload yields
/// `BridgeError::Decrypt`; this never panics on untrusted input.
pub fn decrypt(conversation_key: &SharedSecret, payload: &str) -> Result<String> {
    if payload.is_empty() || payload.starts_with('#') {
        return Err(BridgeError::Decrypt("unknown encryption version".to_string()));
    }
    if payload.len() < MIN_PAYLOAD_B64_LEN || payload.len() > MAX_PAYLOAD_B64_LEN {
        return Err(BridgeError::Decrypt("invalid payload size".to_string()));
    }

    let data = BASE64
        .decode(payload)
        .map_err(|e| BridgeError::Decrypt(format!("invalid base64: {}", e)))?;

    if data.len() < MIN_PAYLOAD_LEN || data.len() > MAX_PAYLOAD_LEN {
        return Err(BridgeError::Decrypt("invalid data size".to_string()));
    }
    if data[0] != NIP44_VERSION {
        return Err(BridgeError::Decrypt(format!(
            "unsupported NIP-44 version: {}",
            data[0]
        )));
    }

    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&data[1..33]);
    let ciphertext = &data[33..data.len() - 32];
    let expected_mac = &data[data.len() - 32..];

    let keys = derive_message_keys(conversation_key, &nonce)?;

    compute_mac(&keys.hmac_key, &nonce, ciphertext)?
        .verify_slice(expected_mac)
        .map_err(|_| BridgeError::Decrypt("HMAC verification failed".to_string()))?;

    let mut buffer = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(
        Key::from_slice(&keys.chacha_key),
        Nonce::from_slice(&keys.chacha_nonce),
    );
    cipher.apply_keystream(&mut buffer);

    let plaintext = unpad_plaintext(&buffer)?;
    String::from_utf8(plaintext).map_err(|_| BridgeError::Decrypt("invalid UTF-8".to_string()))
}

/// Encrypts a message for a recipient given sender's secret and recipient's pubkey
pub fn encrypt_for_recipient(
    plaintext: &str,
    sender_secret: &[u8; 32],
    recipient_pubkey: &[u8; 32],
) -> Result<String> {
    let conversation_key = derive_shared_secret(sender_secret, recipient_pubkey)?;
    encrypt(&conversation_key, plaintext)
}

/// Decrypts a message from a sender given recipient's secret and sender's pubkey
pub fn decrypt_from_sender(
    payload: &str,
    recipient_secret: &[u8; 32],
    sender_pubkey: &[u8; 32],
) -> Result<String> {
    let conversation_key = derive_shared_secret(recipient_secret, sender_pubkey)?;
    decrypt(&conversation_key, payload)
}
