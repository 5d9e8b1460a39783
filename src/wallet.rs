//! Wallet command interface
//!
//! The bridge never touches wallet keys or transaction logic. Everything it
//! can ask of the wallet goes through `WalletCommands`; the host wallet
//! provides the implementation.

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::error::BridgeError;
use crate::protocol::{
    ErrorCode, GetBalanceResult, GetInfoResult, ListTransactionsParams, ListTransactionsResult,
    LookupInvoiceParams, MakeInvoiceParams, Method, NwcError, PayInvoiceParams, PayInvoiceResult,
    Transaction,
};

/// Domain failure reported by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct WalletError {
    pub code: ErrorCode,
    pub message: String,
}

impl WalletError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn insufficient_balance(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InsufficientBalance, message)
    }

    pub fn payment_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PaymentFailed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl From<WalletError> for NwcError {
    fn from(e: WalletError) -> Self {
        NwcError::new(e.code, e.message)
    }
}

impl From<WalletError> for BridgeError {
    fn from(e: WalletError) -> Self {
        BridgeError::Dispatch {
            code: e.code,
            message: e.message,
        }
    }
}

pub type WalletResult<T> = std::result::Result<T, WalletError>;

/// Operations the host wallet exposes to remote applications
///
/// Amounts are in millisatoshis throughout.
#[async_trait]
pub trait WalletCommands: Send + Sync {
    /// Pay a BOLT-11 invoice
    ///
    /// # Arguments
    /// * `params` - Invoice and optional amount for zero-amount invoices
    /// * `idempotency_key` - Request event id (hex). A repeated key must not
    ///   pay twice.
    async fn pay_invoice(
        &self,
        params: &PayInvoiceParams,
        idempotency_key: &str,
    ) -> WalletResult<PayInvoiceResult>;

    async fn make_invoice(&self, params: &MakeInvoiceParams) -> WalletResult<Transaction>;

    async fn lookup_invoice(&self, params: &LookupInvoiceParams) -> WalletResult<Transaction>;

    async fn get_balance(&self) -> WalletResult<GetBalanceResult>;

    /// Node details. `methods` is filled in by the bridge.
    async fn get_info(&self) -> WalletResult<GetInfoResult>;

    async fn list_transactions(
        &self,
        params: &ListTransactionsParams,
    ) -> WalletResult<ListTransactionsResult>;

    /// Decode the amount encoded in an invoice. `Ok(None)` for
    /// zero-amount invoices.
    fn invoice_amount_msat(&self, invoice: &str) -> WalletResult<Option<u64>>;

    /// Methods this wallet can serve
    fn supported_methods(&self) -> BTreeSet<Method> {
        Method::ALL.into_iter().collect()
    }
}
