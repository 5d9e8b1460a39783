//! Request handling end to end, minus the relays

mod common;

use common::{open_response, request_event, request_event_with_tags, tag_value, MockWallet, RecordingPublisher};
use nostr_sdk::prelude::*;
use nwc_bridge::crypto::ServerIdentity;
use nwc_bridge::dispatcher::CommandDispatcher;
use nwc_bridge::protocol::{ErrorCode, Method, RESPONSE_KIND};
use nwc_bridge::relay::{DedupCache, InboundSink};
use nwc_bridge::{
    BudgetPeriod, ConnectionRegistry, DropReason, MemoryStorage, RequestOutcome,
    RequestProcessor, Storage,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const T0: u64 = 1_700_000_000;
const DAY: u64 = 86_400;

struct Harness {
    server: Arc<ServerIdentity>,
    registry: Arc<ConnectionRegistry>,
    wallet: Arc<MockWallet>,
    publisher: Arc<RecordingPublisher>,
    clock: Arc<AtomicU64>,
    processor: RequestProcessor,
}

impl Harness {
    fn new(wallet: MockWallet) -> Self {
        let store: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let server = Arc::new(ServerIdentity::generate());
        let registry = Arc::new(ConnectionRegistry::new(store));
        let wallet = Arc::new(wallet);
        let methods: BTreeSet<Method> = Method::ALL.into_iter().collect();
        let dispatcher = Arc::new(CommandDispatcher::new(wallet.clone(), &methods).unwrap());
        let publisher = Arc::new(RecordingPublisher::default());
        let clock = Arc::new(AtomicU64::new(T0));

        let processor_clock = Arc::clone(&clock);
        let processor = RequestProcessor::new(
            Arc::clone(&server),
            Arc::clone(&registry),
            dispatcher,
            publisher.clone(),
        )
        .with_clock(move || processor_clock.load(Ordering::SeqCst));

        Self {
            server,
            registry,
            wallet,
            publisher,
            clock,
            processor,
        }
    }

    async fn connect(&self, methods: &[Method], budget: Option<(u64, BudgetPeriod)>) -> Keys {
        let (keys, _) = self
            .registry
            .create_connection(
                "test app",
                methods.iter().copied().collect(),
                budget,
                None,
                self.clock.load(Ordering::SeqCst),
            )
            .await
            .unwrap();
        keys
    }

    fn request(&self, client: &Keys, body: &str) -> Event {
        request_event(client, &self.server.public_key(), body)
    }

    fn advance(&self, secs: u64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }

    fn last_response(&self, client: &Keys) -> nwc_bridge::protocol::Response {
        let events = self.publisher.published();
        let event = events.last().expect("no response published");
        open_response(client, &self.server.public_key(), event)
    }
}

fn pay(invoice: &str) -> String {
    format!(r#"{{"method":"pay_invoice","params":{{"invoice":"{}"}}}}"#, invoice)
}

#[tokio::test]
async fn test_unknown_sender_is_unauthorized_and_never_dispatched() {
    let h = Harness::new(MockWallet::new(1_000_000));
    let stranger = Keys::generate();

    for body in [r#"{"method":"get_info"}"#, &pay("lnbc1000")] {
        let outcome = h.processor.process(&h.request(&stranger, body)).await;
        assert_eq!(outcome.error_code(), Some(ErrorCode::Unauthorized));
    }
    assert_eq!(h.wallet.calls(), 0);

    let response = h.last_response(&stranger);
    assert_eq!(response.result_type, "pay_invoice");
    assert_eq!(response.error.unwrap().code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn test_response_event_shape() {
    let h = Harness::new(MockWallet::new(42_000));
    let client = h.connect(&[Method::GetBalance], None).await;

    let request = h.request(&client, r#"{"method":"get_balance","params":{}}"#);
    let outcome = h.processor.process(&request).await;
    assert_eq!(
        outcome,
        RequestOutcome::Responded {
            method: "get_balance".to_string(),
            error: None,
            published: true,
        }
    );

    let events = h.publisher.published();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.kind, Kind::from(RESPONSE_KIND));
    assert_eq!(event.pubkey, h.server.public_key());
    assert!(event.verify().is_ok());
    assert_eq!(tag_value(event, "e"), Some(request.id.to_hex()));
    assert_eq!(tag_value(event, "p"), Some(client.public_key().to_hex()));

    let response = h.last_response(&client);
    assert!(response.error.is_none());
    assert_eq!(response.result.unwrap()["balance"], 42_000);
}

#[tokio::test]
async fn test_daily_budget_scenario() {
    let h = Harness::new(MockWallet::new(1_000_000));
    let client = h
        .connect(
            &[Method::PayInvoice, Method::GetBalance],
            Some((10_000, BudgetPeriod::Daily)),
        )
        .await;

    let first = h.processor.process(&h.request(&client, &pay("lnbc3000"))).await;
    assert_eq!(first.error_code(), None);

    h.advance(60);
    let second = h.processor.process(&h.request(&client, &pay("lnbc8000"))).await;
    assert_eq!(second.error_code(), Some(ErrorCode::QuotaExceeded));
    assert_eq!(h.wallet.payment_count(), 1);

    h.advance(DAY);
    let third = h.processor.process(&h.request(&client, &pay("lnbc8000"))).await;
    assert_eq!(third.error_code(), None);
    assert_eq!(h.wallet.payment_count(), 2);

    let conn = h.registry.lookup(&client.public_key(), T0 + DAY + 60).await.unwrap();
    assert_eq!(conn.budget.unwrap().spent_msat, 8_000);
}

#[tokio::test]
async fn test_invoice_amount_is_what_gets_budgeted() {
    let h = Harness::new(MockWallet::new(1_000_000));
    let client = h
        .connect(&[Method::PayInvoice], Some((5_000, BudgetPeriod::Daily)))
        .await;

    // A small explicit amount cannot smuggle a large invoice under the budget
    let body = r#"{"method":"pay_invoice","params":{"invoice":"lnbc90000","amount":1}}"#;
    let outcome = h.processor.process(&h.request(&client, body)).await;
    assert_eq!(outcome.error_code(), Some(ErrorCode::Other));
    assert_eq!(h.wallet.payment_count(), 0);

    let body = r#"{"method":"pay_invoice","params":{"invoice":"lnbc90000","amount":90000}}"#;
    let outcome = h.processor.process(&h.request(&client, body)).await;
    assert_eq!(outcome.error_code(), Some(ErrorCode::QuotaExceeded));
    assert_eq!(h.wallet.payment_count(), 0);

    // Amountless invoices take the explicit amount
    let body = r#"{"method":"pay_invoice","params":{"invoice":"lnbc0","amount":4000}}"#;
    assert_eq!(h.processor.process(&h.request(&client, body)).await.error_code(), None);

    let outcome = h.processor.process(&h.request(&client, &pay("lnbc0"))).await;
    assert_eq!(outcome.error_code(), Some(ErrorCode::Other));
    assert_eq!(h.wallet.payment_count(), 1);

    let conn = h.registry.lookup(&client.public_key(), T0).await.unwrap();
    assert_eq!(conn.budget.unwrap().spent_msat, 4_000);
}

#[tokio::test]
async fn test_method_not_permitted_is_restricted() {
    let h = Harness::new(MockWallet::new(1_000));
    let client = h.connect(&[Method::GetBalance], None).await;

    let outcome = h.processor.process(&h.request(&client, &pay("lnbc10"))).await;
    assert_eq!(outcome.error_code(), Some(ErrorCode::Restricted));
    assert_eq!(h.wallet.calls(), 0);
}

#[tokio::test]
async fn test_parse_errors() {
    let h = Harness::new(MockWallet::new(1_000));
    let client = h.connect(&Method::ALL, None).await;

    let cases = [
        ("not json at all", ErrorCode::Other, ""),
        (r#"{"params":{}}"#, ErrorCode::Other, ""),
        (r#"{"method":"multi_pay_invoice","params":{}}"#, ErrorCode::NotImplemented, "multi_pay_invoice"),
        (r#"{"method":"pay_invoice","params":{"amount":1}}"#, ErrorCode::Other, "pay_invoice"),
        (r#"{"method":"make_invoice","params":{"amount":0}}"#, ErrorCode::Other, "make_invoice"),
    ];
    for (body, code, result_type) in cases {
        let outcome = h.processor.process(&h.request(&client, body)).await;
        assert_eq!(outcome.error_code(), Some(code), "body {}", body);
        let response = h.last_response(&client);
        assert_eq!(response.result_type, result_type, "body {}", body);
    }
    assert_eq!(h.wallet.calls(), 0);
}

#[tokio::test]
async fn test_wallet_failure_is_reported_and_not_spent() {
    let h = Harness::new(MockWallet::new(500));
    let client = h
        .connect(&[Method::PayInvoice], Some((10_000, BudgetPeriod::Daily)))
        .await;

    let outcome = h.processor.process(&h.request(&client, &pay("lnbc1000"))).await;
    assert_eq!(outcome.error_code(), Some(ErrorCode::InsufficientBalance));

    let conn = h.registry.lookup(&client.public_key(), T0).await.unwrap();
    assert_eq!(conn.budget.unwrap().spent_msat, 0);
}

#[tokio::test]
async fn test_oversized_result_answered_with_internal_error() {
    let h = Harness::new(MockWallet::new(0).with_history(200));
    let client = h.connect(&[Method::ListTransactions], None).await;

    let outcome = h
        .processor
        .process(&h.request(&client, r#"{"method":"list_transactions","params":{}}"#))
        .await;
    assert_eq!(
        outcome,
        RequestOutcome::Responded {
            method: "list_transactions".to_string(),
            error: Some(ErrorCode::Internal),
            published: true,
        }
    );

    assert_eq!(h.publisher.published().len(), 1);
    let response = h.last_response(&client);
    assert_eq!(response.result_type, "list_transactions");
    assert!(response.result.is_none());
    assert_eq!(response.error.unwrap().code, ErrorCode::Internal);
}

#[tokio::test]
async fn test_small_history_is_returned() {
    let h = Harness::new(MockWallet::new(0).with_history(3));
    let client = h.connect(&[Method::ListTransactions], None).await;

    let outcome = h
        .processor
        .process(&h.request(&client, r#"{"method":"list_transactions"}"#))
        .await;
    assert_eq!(outcome.error_code(), None);
    let result = h.last_response(&client).result.unwrap();
    assert_eq!(result["transactions"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_get_info_methods_narrowed_to_connection() {
    let h = Harness::new(MockWallet::new(0));
    let client = h.connect(&[Method::GetInfo, Method::GetBalance], None).await;

    h.processor
        .process(&h.request(&client, r#"{"method":"get_info"}"#))
        .await;
    let result = h.last_response(&client).result.unwrap();
    assert_eq!(result["methods"], serde_json::json!(["get_balance", "get_info"]));
    assert_eq!(result["alias"], "mock");
}

#[tokio::test]
async fn test_events_not_for_us_are_dropped_silently() {
    let h = Harness::new(MockWallet::new(0));
    let client = h.connect(&Method::ALL, None).await;
    let server = h.server.public_key();
    let body = r#"{"method":"get_balance"}"#;

    // Encrypted for another server but tagged to us
    let other = Keys::generate().public_key();
    let mut misdirected = request_event_with_tags(&client, &other, body, vec![Tag::public_key(server)]);
    assert_eq!(
        h.processor.process(&misdirected).await,
        RequestOutcome::Dropped(DropReason::Undecryptable)
    );

    misdirected = request_event_with_tags(&client, &server, body, vec![Tag::public_key(other)]);
    assert_eq!(
        h.processor.process(&misdirected).await,
        RequestOutcome::Dropped(DropReason::NotAddressedToUs)
    );

    let note = EventBuilder::new(Kind::TextNote, "hi")
        .tags([Tag::public_key(server)])
        .sign_with_keys(&client)
        .unwrap();
    assert_eq!(
        h.processor.process(&note).await,
        RequestOutcome::Dropped(DropReason::WrongKind)
    );

    let expired = request_event_with_tags(
        &client,
        &server,
        body,
        vec![Tag::public_key(server), Tag::expiration(Timestamp::from(T0 - 1))],
    );
    assert_eq!(
        h.processor.process(&expired).await,
        RequestOutcome::Dropped(DropReason::Expired)
    );

    assert!(h.publisher.published().is_empty());
    assert_eq!(h.wallet.calls(), 0);
}

#[tokio::test]
async fn test_revoked_connection_is_unauthorized() {
    let h = Harness::new(MockWallet::new(0));
    let client = h.connect(&[Method::GetBalance], None).await;
    assert!(h.registry.revoke(&client.public_key()).await.unwrap());

    let outcome = h
        .processor
        .process(&h.request(&client, r#"{"method":"get_balance"}"#))
        .await;
    assert_eq!(outcome.error_code(), Some(ErrorCode::Unauthorized));
}

#[tokio::test]
async fn test_duplicate_delivery_dispatches_once() {
    let h = Harness::new(MockWallet::new(100_000));
    let client = h.connect(&[Method::PayInvoice], None).await;
    let request = h.request(&client, &pay("lnbc1000"));

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let sink = InboundSink::new(Arc::new(DedupCache::new(100, Duration::from_secs(600))), tx);
    for relay in ["wss://a", "wss://b", "wss://c"] {
        sink.push(relay, request.clone()).await;
    }
    drop(sink);

    while let Some(event) = rx.recv().await {
        h.processor.process(&event).await;
    }
    assert_eq!(h.wallet.payment_count(), 1);
    assert_eq!(h.publisher.published().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_payments_never_exceed_budget() {
    let h = Arc::new(Harness::new(
        MockWallet::new(1_000_000).with_pay_delay(Duration::from_millis(5)),
    ));
    let client = h
        .connect(&[Method::PayInvoice], Some((5_000, BudgetPeriod::Daily)))
        .await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..20 {
        let h = Arc::clone(&h);
        let event = h.request(&client, &pay("lnbc1000"));
        tasks.spawn(async move { h.processor.process(&event).await });
    }

    let mut ok = 0;
    let mut quota = 0;
    while let Some(outcome) = tasks.join_next().await {
        match outcome.unwrap().error_code() {
            None => ok += 1,
            Some(ErrorCode::QuotaExceeded) => quota += 1,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(quota, 15);
    assert_eq!(h.wallet.payment_count(), 5);

    let conn = h.registry.lookup(&client.public_key(), T0).await.unwrap();
    assert_eq!(conn.budget.unwrap().spent_msat, 5_000);
}
