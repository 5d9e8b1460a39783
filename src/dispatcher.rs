//! Command Dispatcher
//!
//! Routes a parsed request to the wallet through a `Method -> handler`
//! table. The table is built and checked once, when the session starts: a
//! configured method the wallet cannot serve is a configuration error, not a
//! surprise at request time.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::protocol::{
    ErrorCode, InboundRequest, Method, NwcError, RequestParams, ResponseResult,
};
use crate::wallet::{WalletCommands, WalletError, WalletResult};

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = WalletResult<ResponseResult>> + Send + 'a>>;

/// Typed handler: unpacks the params variant for its method and calls the
/// matching wallet operation.
type Handler =
    for<'a> fn(&'a dyn WalletCommands, &'a RequestParams, &'a str) -> HandlerFuture<'a>;

fn mismatched(method: Method) -> WalletError {
    WalletError::new(
        ErrorCode::Internal,
        format!("params do not match {}", method),
    )
}

fn pay_invoice<'a>(
    wallet: &'a dyn WalletCommands,
    params: &'a RequestParams,
    key: &'a str,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let RequestParams::PayInvoice(p) = params else {
            return Err(mismatched(Method::PayInvoice));
        };
        wallet.pay_invoice(p, key).await.map(ResponseResult::PayInvoice)
    })
}

fn make_invoice<'a>(
    wallet: &'a dyn WalletCommands,
    params: &'a RequestParams,
    _key: &'a str,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let RequestParams::MakeInvoice(p) = params else {
            return Err(mismatched(Method::MakeInvoice));
        };
        wallet.make_invoice(p).await.map(ResponseResult::MakeInvoice)
    })
}

fn lookup_invoice<'a>(
    wallet: &'a dyn WalletCommands,
    params: &'a RequestParams,
    _key: &'a str,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let RequestParams::LookupInvoice(p) = params else {
            return Err(mismatched(Method::LookupInvoice));
        };
        wallet.lookup_invoice(p).await.map(ResponseResult::LookupInvoice)
    })
}

fn get_balance<'a>(
    wallet: &'a dyn WalletCommands,
    _params: &'a RequestParams,
    _key: &'a str,
) -> HandlerFuture<'a> {
    Box::pin(async move { wallet.get_balance().await.map(ResponseResult::GetBalance) })
}

fn get_info<'a>(
    wallet: &'a dyn WalletCommands,
    _params: &'a RequestParams,
    _key: &'a str,
) -> HandlerFuture<'a> {
    Box::pin(async move { wallet.get_info().await.map(ResponseResult::GetInfo) })
}

fn list_transactions<'a>(
    wallet: &'a dyn WalletCommands,
    params: &'a RequestParams,
    _key: &'a str,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let RequestParams::ListTransactions(p) = params else {
            return Err(mismatched(Method::ListTransactions));
        };
        wallet
            .list_transactions(p)
            .await
            .map(ResponseResult::ListTransactions)
    })
}

fn handler_for(method: Method) -> Handler {
    match method {
        Method::PayInvoice => pay_invoice,
        Method::MakeInvoice => make_invoice,
        Method::LookupInvoice => lookup_invoice,
        Method::GetBalance => get_balance,
        Method::GetInfo => get_info,
        Method::ListTransactions => list_transactions,
    }
}

pub struct CommandDispatcher {
    wallet: Arc<dyn WalletCommands>,
    handlers: BTreeMap<Method, Handler>,
}

impl CommandDispatcher {
    /// Build the handler table for `methods`.
    ///
    /// Fails with `Configuration` if `methods` is empty or names a method
    /// the wallet does not support.
    pub fn new(wallet: Arc<dyn WalletCommands>, methods: &BTreeSet<Method>) -> Result<Self> {
        if methods.is_empty() {
            return Err(BridgeError::Configuration(
                "no methods enabled".to_string(),
            ));
        }

        let available = wallet.supported_methods();
        let missing: Vec<&str> = methods
            .iter()
            .filter(|m| !available.contains(m))
            .map(|m| m.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(BridgeError::Configuration(format!(
                "wallet has no handler for: {}",
                missing.join(", ")
            )));
        }

        let handlers = methods.iter().map(|&m| (m, handler_for(m))).collect();
        Ok(Self { wallet, handlers })
    }

    /// Methods advertised in the info event
    pub fn supported_methods(&self) -> Vec<Method> {
        self.handlers.keys().copied().collect()
    }

    pub fn supports(&self, method: Method) -> bool {
        self.handlers.contains_key(&method)
    }

    /// Run `request` against the wallet. Wallet failures come back as
    /// protocol errors ready for the response payload.
    pub async fn execute(
        &self,
        request: &InboundRequest,
        idempotency_key: &str,
    ) -> std::result::Result<ResponseResult, NwcError> {
        let Some(handler) = self.handlers.get(&request.method) else {
            return Err(NwcError::new(
                ErrorCode::NotImplemented,
                format!("{} is not enabled", request.method),
            ));
        };

        debug!(method = %request.method, event_id = %request.event_id, "Dispatching");
        let result = handler(self.wallet.as_ref(), &request.params, idempotency_key).await;
        if let Err(e) = &result {
            warn!(method = %request.method, code = %e.code, error = %e.message, "Wallet command failed");
        }
        result.map_err(NwcError::from)
    }

    /// Amount a `pay_invoice` would spend. The invoice's own amount wins;
    /// an explicit `amount` is only accepted for amountless invoices, or
    /// when it matches.
    pub fn payment_amount(&self, params: &RequestParams) -> std::result::Result<u64, NwcError> {
        let RequestParams::PayInvoice(p) = params else {
            return Ok(0);
        };
        let encoded = self.wallet.invoice_amount_msat(&p.invoice).map_err(|e| {
            NwcError::new(
                ErrorCode::Other,
                format!("cannot decode invoice: {}", e.message),
            )
        })?;
        match (encoded, p.amount) {
            (Some(encoded), Some(explicit)) if encoded != explicit => Err(NwcError::new(
                ErrorCode::Other,
                format!(
                    "amount {} does not match invoice amount {}",
                    explicit, encoded
                ),
            )),
            (Some(encoded), _) => Ok(encoded),
            (None, Some(explicit)) => Ok(explicit),
            (None, None) => Err(NwcError::new(
                ErrorCode::Other,
                "invoice has no amount and none was given",
            )),
        }
    }
}
