//! NIP-47 (Nostr Wallet Connect) wire types
//!
//! Provides:
//! - Event kinds used by the bridge
//! - The enumerated method set
//! - Request params and response results, one struct per method
//!
//! References:
//! - https://github.com/nostr-protocol/nips/blob/master/47.md

pub mod method;
pub mod request;
pub mod response;

pub use method::Method;
pub use request::{
    InboundRequest, ListTransactionsParams, LookupInvoiceParams, MakeInvoiceParams,
    PayInvoiceParams, RawRequest, RequestParams,
};
pub use response::{
    ErrorCode, GetBalanceResult, GetInfoResult, ListTransactionsResult, NwcError,
    PayInvoiceResult, Response, ResponseResult, Transaction, TransactionType,
};

/// Replaceable info event advertising supported methods
pub const INFO_KIND: u16 = 13194;

/// Encrypted request from a client application
pub const REQUEST_KIND: u16 = 23194;

/// Encrypted response from the bridge
pub const RESPONSE_KIND: u16 = 23195;

/// Encryption scheme advertised in the info event `encryption` tag
pub const ENCRYPTION_SCHEME: &str = "nip44_v2";
