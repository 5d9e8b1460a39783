//! Request Processor
//!
//! Takes one verified, deduplicated request event through
//! decrypt -> parse -> authorize -> dispatch -> respond. Events that are not
//! meant for the bridge, or cannot be decrypted, are dropped without a reply.
//! Everything past decryption gets exactly one response.

use nostr_sdk::prelude::{Event, EventBuilder, Kind, PublicKey, Tag, Timestamp};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::crypto::{decrypt, encrypt, ServerIdentity};
use crate::dispatcher::CommandDispatcher;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    ErrorCode, InboundRequest, Method, NwcError, RawRequest, RequestParams, Response,
    ResponseResult, REQUEST_KIND, RESPONSE_KIND,
};
use crate::registry::ConnectionRegistry;

/// Where responses go
pub trait EventPublisher: Send + Sync {
    /// Returns the number of relays that took the event
    fn publish(&self, event: &Event) -> Result<usize>;
}

impl EventPublisher for crate::relay::RelayPool {
    fn publish(&self, event: &Event) -> Result<usize> {
        crate::relay::RelayPool::publish(self, event)
    }
}

/// Why an event got no response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    WrongKind,
    Expired,
    NotAddressedToUs,
    Undecryptable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Dropped(DropReason),
    Responded {
        /// `result_type` of the response
        method: String,
        error: Option<ErrorCode>,
        published: bool,
    },
}

impl RequestOutcome {
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            RequestOutcome::Responded { error, .. } => *error,
            RequestOutcome::Dropped(_) => None,
        }
    }
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub struct RequestProcessor {
    identity: Arc<ServerIdentity>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    publisher: Arc<dyn EventPublisher>,
    clock: Clock,
}

impl RequestProcessor {
    pub fn new(
        identity: Arc<ServerIdentity>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            identity,
            registry,
            dispatcher,
            publisher,
            clock: Arc::new(|| Timestamp::now().as_u64()),
        }
    }

    /// Replace the unix-seconds clock used for budgets and expiry
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn process(&self, event: &Event) -> RequestOutcome {
        let now = (self.clock)();

        if let Some(reason) = self.screen(event, now) {
            debug!(event_id = %event.id, reason = ?reason, "Dropping event");
            return RequestOutcome::Dropped(reason);
        }

        let shared = match self.identity.shared_secret_with(&event.pubkey) {
            Ok(shared) => shared,
            Err(e) => {
                debug!(event_id = %event.id, error = %e, "No conversation key");
                return RequestOutcome::Dropped(DropReason::Undecryptable);
            }
        };
        let plaintext = match decrypt(&shared, &event.content) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(event_id = %event.id, error = %e, "Dropping undecryptable request");
                return RequestOutcome::Dropped(DropReason::Undecryptable);
            }
        };

        let response = self.handle(event, &plaintext, now).await;
        let (response, published) = self.respond(event, &shared, response);

        RequestOutcome::Responded {
            method: response.result_type,
            error: response.error.map(|e| e.code),
            published,
        }
    }

    fn screen(&self, event: &Event, now: u64) -> Option<DropReason> {
        if event.kind != Kind::from(REQUEST_KIND) {
            return Some(DropReason::WrongKind);
        }

        let server_hex = self.identity.public_key().to_hex();
        let mut addressed = false;
        for tag in event.tags.iter() {
            match tag.as_slice() {
                [name, value, ..] if name == "p" && *value == server_hex => addressed = true,
                [name, value, ..] if name == "expiration" => {
                    if matches!(value.parse::<u64>(), Ok(at) if at <= now) {
                        return Some(DropReason::Expired);
                    }
                }
                _ => {}
            }
        }
        if !addressed {
            return Some(DropReason::NotAddressedToUs);
        }
        None
    }

    /// Decrypted request to response payload
    async fn handle(&self, event: &Event, plaintext: &str, now: u64) -> Response {
        let raw: RawRequest = match serde_json::from_str(plaintext) {
            Ok(raw) => raw,
            Err(e) => {
                let method = serde_json::from_str::<serde_json::Value>(plaintext)
                    .ok()
                    .and_then(|v| v.get("method").and_then(|m| m.as_str()).map(str::to_string))
                    .unwrap_or_default();
                return reject(method, &BridgeError::Parse(e.to_string()));
            }
        };

        let method: Method = match raw.method.parse() {
            Ok(method) => method,
            Err(e) => return reject(raw.method, &e),
        };
        let params = match RequestParams::parse(method, raw.params) {
            Ok(params) => params,
            Err(e) => return reject(raw.method, &e),
        };
        let request = InboundRequest {
            event_id: event.id,
            requester: event.pubkey,
            method,
            params,
            created_at: event.created_at,
        };

        self.authorize_and_dispatch(&request, now).await
    }

    async fn authorize_and_dispatch(&self, request: &InboundRequest, now: u64) -> Response {
        let method = request.method;
        let requester = &request.requester;

        let amount = if method.is_payment() {
            if let Err(e) = self.registry.lookup(requester, now).await {
                return reject(method.as_str(), &e);
            }
            match self.dispatcher.payment_amount(&request.params) {
                Ok(amount) => amount,
                Err(e) => return Response::error(method.as_str(), e),
            }
        } else {
            0
        };

        let authorization = match self.registry.authorize(requester, method, amount, now).await
        {
            Ok(authorization) => authorization,
            Err(denial) => {
                info!(client = %requester, method = %method, denial = ?denial, "Request denied");
                return reject(method.as_str(), &BridgeError::from(denial));
            }
        };
        // Only payments keep the connection locked through the wallet call
        let (grant, held) = if method.is_payment() {
            (authorization.grant().clone(), Some(authorization))
        } else {
            (authorization.into_grant(), None)
        };

        let idempotency_key = request.event_id.to_hex();
        let result = match self.dispatcher.execute(request, &idempotency_key).await {
            Ok(result) => result,
            Err(e) => return Response::error(method.as_str(), e),
        };

        if let Some(mut authorization) = held {
            if let Err(e) = authorization.record_spend(amount, now) {
                error!(client = %requester, amount_msat = amount, error = %e, "Spend not persisted");
            }
        }

        let result = match result {
            ResponseResult::GetInfo(mut info) => {
                info.methods = grant
                    .methods
                    .iter()
                    .filter(|m| self.dispatcher.supports(**m))
                    .map(|m| m.as_str().to_string())
                    .collect();
                ResponseResult::GetInfo(info)
            }
            other => other,
        };

        match Response::success(&result) {
            Ok(response) => response,
            Err(e) => {
                error!(method = %method, error = %e, "Cannot encode result");
                Response::error(method.as_str(), NwcError::new(ErrorCode::Internal, "result encoding failed"))
            }
        }
    }

    /// Encrypt, sign and publish. A response that cannot be sealed is
    /// replaced by an `INTERNAL` error. Returns what was sent and whether
    /// any relay took it.
    fn respond(
        &self,
        request: &Event,
        shared: &crate::crypto::SharedSecret,
        response: Response,
    ) -> (Response, bool) {
        let sealed = self.build_response(request.id, &request.pubkey, shared, &response);
        let (event, response) = match sealed {
            Ok(event) => (event, response),
            Err(e) => {
                warn!(event_id = %request.id, error = %e, "Response cannot be sealed, sending error");
                let message = match e {
                    BridgeError::Encrypt(_) => "response too large",
                    _ => "response encoding failed",
                };
                let fallback = Response::error(
                    response.result_type,
                    NwcError::new(ErrorCode::Internal, message),
                );
                match self.build_response(request.id, &request.pubkey, shared, &fallback) {
                    Ok(event) => (event, fallback),
                    Err(e) => {
                        error!(event_id = %request.id, error = %e, "Cannot build response");
                        return (fallback, false);
                    }
                }
            }
        };

        match self.publisher.publish(&event) {
            Ok(relays) => {
                debug!(
                    event_id = %request.id,
                    response_id = %event.id,
                    relays,
                    result_type = %response.result_type,
                    "Response published"
                );
                (response, true)
            }
            Err(e) => {
                warn!(event_id = %request.id, error = %e, "Response not published");
                (response, false)
            }
        }
    }

    fn build_response(
        &self,
        request_id: nostr_sdk::prelude::EventId,
        requester: &PublicKey,
        shared: &crate::crypto::SharedSecret,
        response: &Response,
    ) -> Result<Event> {
        let plaintext = serde_json::to_string(response)?;
        let content = encrypt(shared, &plaintext)?;
        EventBuilder::new(Kind::from(RESPONSE_KIND), content)
            .tags([Tag::event(request_id), Tag::public_key(*requester)])
            .sign_with_keys(self.identity.keys())
            .map_err(|e| BridgeError::Serialization(format!("signing response: {}", e)))
    }
}

fn reject(result_type: impl Into<String>, error: &BridgeError) -> Response {
    Response::error(
        result_type,
        NwcError::new(error.to_error_code(), error.to_string()),
    )
}
