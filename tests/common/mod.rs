//! Shared fixtures: a scripted wallet, a recording publisher and helpers
//! for building client requests.

#![allow(dead_code)]

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use nwc_bridge::crypto::{decrypt, derive_shared_secret, encrypt, public_key_bytes, secret_key_bytes};
use nwc_bridge::protocol::{
    ErrorCode, GetBalanceResult, GetInfoResult, ListTransactionsParams, ListTransactionsResult,
    LookupInvoiceParams, MakeInvoiceParams, PayInvoiceParams, PayInvoiceResult, Response,
    Transaction, TransactionType, REQUEST_KIND,
};
use nwc_bridge::wallet::{WalletCommands, WalletError, WalletResult};
use nwc_bridge::{EventPublisher, Result as BridgeResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Wallet with a balance and a call log. Invoices are `lnbc<amount msat>`;
/// `lnbc0` has no amount.
pub struct MockWallet {
    pub balance_msat: AtomicU64,
    pub payments: Mutex<Vec<(String, String)>>,
    pub calls: AtomicUsize,
    pub pay_delay: Duration,
    /// Number of settled payments `list_transactions` reports
    pub history: usize,
}

impl MockWallet {
    pub fn new(balance_msat: u64) -> Self {
        Self {
            balance_msat: AtomicU64::new(balance_msat),
            payments: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            pay_delay: Duration::ZERO,
            history: 0,
        }
    }

    pub fn with_history(mut self, count: usize) -> Self {
        self.history = count;
        self
    }

    pub fn with_pay_delay(mut self, delay: Duration) -> Self {
        self.pay_delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payment_count(&self) -> usize {
        self.payments.lock().len()
    }
}

fn parse_invoice(invoice: &str) -> WalletResult<u64> {
    invoice
        .strip_prefix("lnbc")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| WalletError::new(ErrorCode::Other, "not an invoice"))
}

#[async_trait]
impl WalletCommands for MockWallet {
    async fn pay_invoice(
        &self,
        params: &PayInvoiceParams,
        idempotency_key: &str,
    ) -> WalletResult<PayInvoiceResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.pay_delay.is_zero() {
            tokio::time::sleep(self.pay_delay).await;
        }
        let amount = match params.amount {
            Some(a) => a,
            None => parse_invoice(&params.invoice)?,
        };
        let debited = self
            .balance_msat
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(amount));
        if debited.is_err() {
            return Err(WalletError::insufficient_balance("not enough funds"));
        }
        self.payments
            .lock()
            .push((idempotency_key.to_string(), params.invoice.clone()));
        Ok(PayInvoiceResult {
            preimage: "ab".repeat(32),
            fees_paid: Some(0),
        })
    }

    async fn make_invoice(&self, params: &MakeInvoiceParams) -> WalletResult<Transaction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Transaction {
            transaction_type: TransactionType::Incoming,
            invoice: Some(format!("lnbc{}", params.amount)),
            description: params.description.clone(),
            description_hash: None,
            preimage: None,
            payment_hash: "cd".repeat(32),
            amount: params.amount,
            fees_paid: 0,
            created_at: 1_700_000_000,
            expires_at: params.expiry.map(|e| 1_700_000_000 + e),
            settled_at: None,
            metadata: None,
        })
    }

    async fn lookup_invoice(&self, _params: &LookupInvoiceParams) -> WalletResult<Transaction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(WalletError::not_found("invoice not found"))
    }

    async fn get_balance(&self) -> WalletResult<GetBalanceResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GetBalanceResult {
            balance: self.balance_msat.load(Ordering::SeqCst),
        })
    }

    async fn get_info(&self) -> WalletResult<GetInfoResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GetInfoResult {
            alias: Some("mock".to_string()),
            color: None,
            pubkey: None,
            network: Some("regtest".to_string()),
            block_height: Some(100),
            block_hash: None,
            methods: vec!["everything".to_string()],
            notifications: vec![],
        })
    }

    async fn list_transactions(
        &self,
        _params: &ListTransactionsParams,
    ) -> WalletResult<ListTransactionsResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let transactions = (0..self.history)
            .map(|i| Transaction {
                transaction_type: TransactionType::Outgoing,
                invoice: Some(format!("lnbc{}", 1_000 + i)),
                description: Some("x".repeat(400)),
                description_hash: None,
                preimage: Some("ab".repeat(32)),
                payment_hash: format!("{:064x}", i),
                amount: 1_000 + i as u64,
                fees_paid: 0,
                created_at: 1_700_000_000 + i as u64,
                expires_at: None,
                settled_at: Some(1_700_000_000 + i as u64),
                metadata: None,
            })
            .collect();
        Ok(ListTransactionsResult { transactions })
    }

    fn invoice_amount_msat(&self, invoice: &str) -> WalletResult<Option<u64>> {
        let amount = parse_invoice(invoice)?;
        Ok((amount > 0).then_some(amount))
    }
}

/// Captures published events instead of sending them anywhere
#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: &Event) -> BridgeResult<usize> {
        self.events.lock().push(event.clone());
        Ok(1)
    }
}

/// A NIP-47 request from `client` to `server`
pub fn request_event(client: &Keys, server: &PublicKey, body: &str) -> Event {
    request_event_with_tags(client, server, body, vec![Tag::public_key(*server)])
}

pub fn request_event_with_tags(
    client: &Keys,
    server: &PublicKey,
    body: &str,
    tags: Vec<Tag>,
) -> Event {
    let secret = secret_key_bytes(client.secret_key()).unwrap();
    let shared = derive_shared_secret(&secret, &public_key_bytes(server).unwrap()).unwrap();
    let content = encrypt(&shared, body).unwrap();
    EventBuilder::new(Kind::from(REQUEST_KIND), content)
        .tags(tags)
        .sign_with_keys(client)
        .unwrap()
}

/// Decrypt a response event as the client would
pub fn open_response(client: &Keys, server: &PublicKey, event: &Event) -> Response {
    let secret = secret_key_bytes(client.secret_key()).unwrap();
    let shared = derive_shared_secret(&secret, &public_key_bytes(server).unwrap()).unwrap();
    let plaintext = decrypt(&shared, &event.content).unwrap();
    serde_json::from_str(&plaintext).unwrap()
}

/// Value of the first tag named `name`
pub fn tag_value(event: &Event, name: &str) -> Option<String> {
    event.tags.iter().find_map(|tag| match tag.as_slice() {
        [n, v, ..] if n == name => Some(v.clone()),
        _ => None,
    })
}
