//! Pairing: connection URIs handed to remote applications
//!
//! `nostr+walletconnect://<server pubkey>?relay=<url>&secret=<client secret>`
//!
//! The connection is registered before the URI exists, so whatever holds
//! the URI is already bound to the permissions chosen at creation.

use nostr_sdk::prelude::{Keys, PublicKey, SecretKey};
use qrcode::QrCode;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::config::validate_relay_url;
use crate::connection::{BudgetPeriod, Connection};
use crate::error::{BridgeError, Result};
use crate::protocol::Method;
use crate::registry::ConnectionRegistry;

pub const URI_SCHEME: &str = "nostr+walletconnect";

/// A parsed or generated connection URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUri {
    pub wallet_pubkey: PublicKey,
    pub relays: Vec<String>,
    pub secret: SecretKey,
    pub lud16: Option<String>,
}

impl ConnectionUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri.trim())
            .map_err(|e| BridgeError::Parse(format!("invalid connection uri: {}", e)))?;
        if url.scheme() != URI_SCHEME {
            return Err(BridgeError::Parse(format!(
                "expected {}:// uri, got {}",
                URI_SCHEME,
                url.scheme()
            )));
        }

        // Both `scheme://<pk>` and `scheme:<pk>` are seen in the wild
        let pubkey_str = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => url.path().trim_start_matches('/').to_string(),
        };
        let wallet_pubkey = PublicKey::from_hex(&pubkey_str)
            .map_err(|e| BridgeError::Parse(format!("invalid wallet pubkey: {}", e)))?;

        let mut relays = Vec::new();
        let mut secret = None;
        let mut lud16 = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "relay" => relays.push(value.into_owned()),
                "secret" => {
                    secret = Some(
                        SecretKey::from_hex(value.as_ref())
                            .map_err(|e| BridgeError::Parse(format!("invalid secret: {}", e)))?,
                    )
                }
                "lud16" => lud16 = Some(value.into_owned()),
                _ => {}
            }
        }

        if relays.is_empty() {
            return Err(BridgeError::Parse("connection uri has no relay".to_string()));
        }
        let secret = secret
            .ok_or_else(|| BridgeError::Parse("connection uri has no secret".to_string()))?;

        Ok(Self {
            wallet_pubkey,
            relays,
            secret,
            lud16,
        })
    }

    /// Public key the remote application signs requests with
    pub fn client_pubkey(&self) -> PublicKey {
        Keys::new(self.secret.clone()).public_key()
    }
}

impl fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = format!("{}://{}", URI_SCHEME, self.wallet_pubkey.to_hex());
        let mut url = Url::parse(&base).map_err(|_| fmt::Error)?;
        {
            let mut query = url.query_pairs_mut();
            for relay in &self.relays {
                query.append_pair("relay", relay);
            }
            query.append_pair("secret", &self.secret.to_secret_hex());
            if let Some(lud16) = &self.lud16 {
                query.append_pair("lud16", lud16);
            }
        }
        f.write_str(url.as_str())
    }
}

impl FromStr for ConnectionUri {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Terms of a new connection
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub label: String,
    pub permissions: BTreeSet<Method>,
    pub budget: Option<(u64, BudgetPeriod)>,
    pub expires_at: Option<u64>,
}

impl PairingRequest {
    pub fn new(label: impl Into<String>, permissions: impl IntoIterator<Item = Method>) -> Self {
        Self {
            label: label.into(),
            permissions: permissions.into_iter().collect(),
            budget: None,
            expires_at: None,
        }
    }

    pub fn with_budget(mut self, limit_msat: u64, period: BudgetPeriod) -> Self {
        self.budget = Some((limit_msat, period));
        self
    }

    pub fn with_expiry(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// A registered connection and the URI that grants it
#[derive(Debug, Clone)]
pub struct Pairing {
    pub uri: ConnectionUri,
    pub connection: Connection,
}

/// Register a new connection and build its URI
pub async fn create_pairing(
    registry: &ConnectionRegistry,
    server_pubkey: PublicKey,
    request: PairingRequest,
    relay_urls: &[String],
    lud16: Option<&str>,
    now: u64,
) -> Result<Pairing> {
    if relay_urls.is_empty() {
        return Err(BridgeError::Configuration(
            "a pairing needs at least one relay".to_string(),
        ));
    }
    for relay in relay_urls {
        validate_relay_url(relay)?;
    }

    let (client_keys, connection) = registry
        .create_connection(
            request.label,
            request.permissions,
            request.budget,
            request.expires_at,
            now,
        )
        .await?;

    let uri = ConnectionUri {
        wallet_pubkey: server_pubkey,
        relays: relay_urls.to_vec(),
        secret: client_keys.secret_key().clone(),
        lud16: lud16.map(str::to_string),
    };
    Ok(Pairing { uri, connection })
}

/// Terminal QR code, two modules per character row
pub fn render_qr(data: &str) -> Result<String> {
    let code = QrCode::new(data.as_bytes())
        .map_err(|e| BridgeError::Configuration(format!("cannot encode QR: {}", e)))?;
    let width = code.width();
    let dark = |x: usize, y: usize| y < width && code[(x, y)] == qrcode::Color::Dark;

    let mut out = String::new();
    for y in (0..width).step_by(2) {
        for x in 0..width {
            let ch = match (dark(x, y), dark(x, y + 1)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            };
            out.push(ch);
        }
        out.push('\n');
    }
    Ok(out)
}
