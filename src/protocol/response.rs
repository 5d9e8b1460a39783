//! Response payloads (plaintext of kind 23195 events)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::Method;
use crate::error::Result;

/// NIP-47 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    NotImplemented,
    InsufficientBalance,
    QuotaExceeded,
    Restricted,
    Unauthorized,
    Internal,
    PaymentFailed,
    NotFound,
    Other,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::Restricted => "RESTRICTED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::PaymentFailed => "PAYMENT_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Other => "OTHER",
        };
        f.write_str(s)
    }
}

/// Structured error carried in a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NwcError {
    pub code: ErrorCode,
    pub message: String,
}

impl NwcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for NwcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Incoming,
    Outgoing,
}

/// Wallet transaction as reported by make_invoice, lookup_invoice and
/// list_transactions. Amounts in msat, timestamps in unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    pub payment_hash: String,
    pub amount: u64,
    #[serde(default)]
    pub fees_paid: u64,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayInvoiceResult {
    pub preimage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees_paid: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBalanceResult {
    /// Balance in msat
    pub balance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetInfoResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    pub methods: Vec<String>,
    #[serde(default)]
    pub notifications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListTransactionsResult {
    pub transactions: Vec<Transaction>,
}

/// Typed successful result, one variant per method
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseResult {
    PayInvoice(PayInvoiceResult),
    MakeInvoice(Transaction),
    LookupInvoice(Transaction),
    GetBalance(GetBalanceResult),
    GetInfo(GetInfoResult),
    ListTransactions(ListTransactionsResult),
}

impl ResponseResult {
    pub fn method(&self) -> Method {
        match self {
            ResponseResult::PayInvoice(_) => Method::PayInvoice,
            ResponseResult::MakeInvoice(_) => Method::MakeInvoice,
            ResponseResult::LookupInvoice(_) => Method::LookupInvoice,
            ResponseResult::GetBalance(_) => Method::GetBalance,
            ResponseResult::GetInfo(_) => Method::GetInfo,
            ResponseResult::ListTransactions(_) => Method::ListTransactions,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            ResponseResult::PayInvoice(r) => serde_json::to_value(r)?,
            ResponseResult::MakeInvoice(r) | ResponseResult::LookupInvoice(r) => {
                serde_json::to_value(r)?
            }
            ResponseResult::GetBalance(r) => serde_json::to_value(r)?,
            ResponseResult::GetInfo(r) => serde_json::to_value(r)?,
            ResponseResult::ListTransactions(r) => serde_json::to_value(r)?,
        };
        Ok(value)
    }
}

/// Response envelope. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub result_type: String,
    pub error: Option<NwcError>,
    pub result: Option<Value>,
}

impl Response {
    pub fn success(result: &ResponseResult) -> Result<Self> {
        Ok(Self {
            result_type: result.method().as_str().to_string(),
            error: None,
            result: Some(result.to_value()?),
        })
    }

    /// Error response. `result_type` echoes the request method name, even
    /// when that name is not one the bridge understands.
    pub fn error(result_type: impl Into<String>, error: NwcError) -> Self {
        Self {
            result_type: result_type.into(),
            error: Some(error),
            result: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
