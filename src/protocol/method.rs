//! The enumerated NWC command set

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Wallet methods the bridge understands
///
/// Ordering is the declaration order, so a `BTreeSet<Method>` lists
/// permissions stably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    PayInvoice,
    MakeInvoice,
    LookupInvoice,
    GetBalance,
    GetInfo,
    ListTransactions,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::PayInvoice,
        Method::MakeInvoice,
        Method::LookupInvoice,
        Method::GetBalance,
        Method::GetInfo,
        Method::ListTransactions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::PayInvoice => "pay_invoice",
            Method::MakeInvoice => "make_invoice",
            Method::LookupInvoice => "lookup_invoice",
            Method::GetBalance => "get_balance",
            Method::GetInfo => "get_info",
            Method::ListTransactions => "list_transactions",
        }
    }

    /// Methods that move funds out of the wallet and count against a budget
    pub fn is_payment(&self) -> bool {
        matches!(self, Method::PayInvoice)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .find(|m| m.as_str() == s)
            .copied()
            .ok_or_else(|| BridgeError::NotImplemented(s.to_string()))
    }
}
