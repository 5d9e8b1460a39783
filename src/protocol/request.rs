//! Request payloads (decrypted content of kind 23194 events)

use nostr_sdk::prelude::{EventId, PublicKey, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Method, TransactionType};
use crate::error::{BridgeError, Result};

/// Untyped request as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayInvoiceParams {
    pub invoice: String,
    /// Amount in msat, for amountless invoices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeInvoiceParams {
    /// Amount in msat
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_hash: Option<String>,
    /// Seconds until the invoice expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupInvoiceParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTransactionsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpaid: Option<bool>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<TransactionType>,
}

/// Typed params, one variant per method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestParams {
    PayInvoice(PayInvoiceParams),
    MakeInvoice(MakeInvoiceParams),
    LookupInvoice(LookupInvoiceParams),
    GetBalance,
    GetInfo,
    ListTransactions(ListTransactionsParams),
}

impl RequestParams {
    /// Interpret the untyped `params` object for `method`
    pub fn parse(method: Method, params: Value) -> Result<Self> {
        // Clients send `{}` or omit params entirely for parameterless methods
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };

        let invalid = |e: serde_json::Error| {
            BridgeError::Parse(format!("invalid params for {}: {}", method, e))
        };

        let parsed = match method {
            Method::PayInvoice => {
                let p: PayInvoiceParams = serde_json::from_value(params).map_err(invalid)?;
                if p.invoice.trim().is_empty() {
                    return Err(BridgeError::Parse("empty invoice".to_string()));
                }
                RequestParams::PayInvoice(p)
            }
            Method::MakeInvoice => {
                let p: MakeInvoiceParams = serde_json::from_value(params).map_err(invalid)?;
                if p.amount == 0 {
                    return Err(BridgeError::Parse("amount must be positive".to_string()));
                }
                RequestParams::MakeInvoice(p)
            }
            Method::LookupInvoice => {
                let p: LookupInvoiceParams = serde_json::from_value(params).map_err(invalid)?;
                if p.payment_hash.is_none() && p.invoice.is_none() {
                    return Err(BridgeError::Parse(
                        "lookup_invoice needs payment_hash or invoice".to_string(),
                    ));
                }
                RequestParams::LookupInvoice(p)
            }
            Method::GetBalance => RequestParams::GetBalance,
            Method::GetInfo => RequestParams::GetInfo,
            Method::ListTransactions => {
                RequestParams::ListTransactions(serde_json::from_value(params).map_err(invalid)?)
            }
        };

        Ok(parsed)
    }

    pub fn method(&self) -> Method {
        match self {
            RequestParams::PayInvoice(_) => Method::PayInvoice,
            RequestParams::MakeInvoice(_) => Method::MakeInvoice,
            RequestParams::LookupInvoice(_) => Method::LookupInvoice,
            RequestParams::GetBalance => Method::GetBalance,
            RequestParams::GetInfo => Method::GetInfo,
            RequestParams::ListTransactions(_) => Method::ListTransactions,
        }
    }
}

/// A decrypted, parsed request. Lives for one processing run only.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub event_id: EventId,
    pub requester: PublicKey,
    pub method: Method,
    pub params: RequestParams,
    pub created_at: Timestamp,
}
