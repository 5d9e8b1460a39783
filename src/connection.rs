//! Connection records: permissions and spending budgets
//!
//! A `Connection` is one authorized remote application. Its budget rolls
//! over in whole periods counted from `period_start`, so renewal times never
//! drift with request timing.

use nostr_sdk::prelude::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;
use crate::protocol::Method;

/// Budget renewal period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    /// Lifetime cap, never renewed
    Never,
}

impl BudgetPeriod {
    /// Period length in seconds
    pub fn as_secs(&self) -> Option<u64> {
        match self {
            BudgetPeriod::Daily => Some(86_400),
            BudgetPeriod::Weekly => Some(7 * 86_400),
            BudgetPeriod::Monthly => Some(30 * 86_400),
            BudgetPeriod::Yearly => Some(365 * 86_400),
            BudgetPeriod::Never => None,
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BudgetPeriod::Daily => "daily",
            BudgetPeriod::Weekly => "weekly",
            BudgetPeriod::Monthly => "monthly",
            BudgetPeriod::Yearly => "yearly",
            BudgetPeriod::Never => "never",
        };
        f.write_str(s)
    }
}

impl FromStr for BudgetPeriod {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(BudgetPeriod::Daily),
            "weekly" => Ok(BudgetPeriod::Weekly),
            "monthly" => Ok(BudgetPeriod::Monthly),
            "yearly" => Ok(BudgetPeriod::Yearly),
            "never" => Ok(BudgetPeriod::Never),
            other => Err(BridgeError::Configuration(format!(
                "unknown budget period: {}",
                other
            ))),
        }
    }
}

/// Spending budget, amounts in msat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub limit_msat: u64,
    pub period: BudgetPeriod,
    pub spent_msat: u64,
    /// Unix seconds at which the current period began
    pub period_start: u64,
}

impl Budget {
    pub fn new(limit_msat: u64, period: BudgetPeriod, now: u64) -> Self {
        Self {
            limit_msat,
            period,
            spent_msat: 0,
            period_start: now,
        }
    }

    /// Advance `period_start` by the whole number of elapsed periods,
    /// resetting the spend. No-op within the current period.
    pub fn roll_over(&mut self, now: u64) {
        let Some(period) = self.period.as_secs() else {
            return;
        };
        if now < self.period_start.saturating_add(period) {
            return;
        }
        let elapsed_periods = (now - self.period_start) / period;
        self.period_start += elapsed_periods * period;
        self.spent_msat = 0;
    }

    pub fn remaining(&self) -> u64 {
        self.limit_msat.saturating_sub(self.spent_msat)
    }

    /// When the current period ends, if it renews at all
    pub fn renews_at(&self) -> Option<u64> {
        self.period
            .as_secs()
            .map(|p| self.period_start.saturating_add(p))
    }
}

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    UnknownConnection,
    MethodNotPermitted(Method),
    BudgetExceeded { requested: u64, remaining: u64 },
}

impl From<Denial> for BridgeError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::UnknownConnection => {
                BridgeError::Unauthorized("no connection for this public key".to_string())
            }
            Denial::MethodNotPermitted(method) => {
                BridgeError::PermissionDenied(format!("{} is not permitted", method))
            }
            Denial::BudgetExceeded {
                requested,
                remaining,
            } => BridgeError::BudgetExceeded {
                requested,
                remaining,
            },
        }
    }
}

/// Read-only view of what a connection may do right now. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    pub methods: BTreeSet<Method>,
    /// `None` when the connection has no budget
    pub remaining_budget: Option<u64>,
}

/// One authorized remote application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub client_pubkey: PublicKey,
    pub label: String,
    pub permissions: BTreeSet<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<Budget>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Connection {
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    /// Check `method` (and `amount_msat` for payments) against this
    /// connection, rolling the budget period forward first.
    pub fn authorize(
        &mut self,
        method: Method,
        amount_msat: u64,
        now: u64,
    ) -> Result<PermissionGrant, Denial> {
        if self.is_expired(now) {
            return Err(Denial::UnknownConnection);
        }
        if !self.permissions.contains(&method) {
            return Err(Denial::MethodNotPermitted(method));
        }

        if let Some(budget) = self.budget.as_mut() {
            budget.roll_over(now);
            if method.is_payment() {
                let remaining = budget.remaining();
                if amount_msat > remaining {
                    return Err(Denial::BudgetExceeded {
                        requested: amount_msat,
                        remaining,
                    });
                }
            }
        }

        Ok(self.grant(now))
    }

    /// Add a completed spend to the current period
    pub fn record_spend(&mut self, amount_msat: u64, now: u64) {
        if let Some(budget) = self.budget.as_mut() {
            budget.roll_over(now);
            budget.spent_msat = budget.spent_msat.saturating_add(amount_msat);
        }
    }

    pub fn grant(&self, now: u64) -> PermissionGrant {
        let remaining_budget = self.budget.as_ref().map(|b| {
            let mut current = b.clone();
            current.roll_over(now);
            current.remaining()
        });
        PermissionGrant {
            methods: self.permissions.clone(),
            remaining_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::Keys;

    const DAY: u64 = 86_400;
    const T0: u64 = 1_700_000_000;

    fn connection(methods: &[Method], budget: Option<Budget>) -> Connection {
        Connection {
            client_pubkey: Keys::generate().public_key(),
            label: "test".to_string(),
            permissions: methods.iter().copied().collect(),
            budget,
            created_at: T0,
            expires_at: None,
        }
    }

    #[test]
    fn test_method_not_permitted() {
        let mut conn = connection(&[Method::GetBalance], None);
        assert!(conn.authorize(Method::GetBalance, 0, T0).is_ok());
        assert_eq!(
            conn.authorize(Method::PayInvoice, 1, T0),
            Err(Denial::MethodNotPermitted(Method::PayInvoice))
        );
    }

    #[test]
    fn test_budget_scenario() {
        let mut conn = connection(
            &[Method::GetBalance, Method::PayInvoice],
            Some(Budget::new(10_000, BudgetPeriod::Daily, T0)),
        );

        let grant = conn.authorize(Method::PayInvoice, 3_000, T0 + 10).unwrap();
        assert_eq!(grant.remaining_budget, Some(10_000));
        conn.record_spend(3_000, T0 + 10);
        assert_eq!(conn.grant(T0 + 10).remaining_budget, Some(7_000));

        assert_eq!(
            conn.authorize(Method::PayInvoice, 8_000, T0 + 20),
            Err(Denial::BudgetExceeded {
                requested: 8_000,
                remaining: 7_000
            })
        );
        assert_eq!(conn.grant(T0 + 20).remaining_budget, Some(7_000));
    }

    #[test]
    fn test_rollover_advances_whole_periods() {
        let mut budget = Budget::new(10_000, BudgetPeriod::Daily, T0);
        budget.spent_msat = 9_000;

        budget.roll_over(T0 + DAY - 1);
        assert_eq!(budget.spent_msat, 9_000);
        assert_eq!(budget.period_start, T0);

        // 2.5 days later: start advances by exactly two periods
        budget.roll_over(T0 + 2 * DAY + DAY / 2);
        assert_eq!(budget.spent_msat, 0);
        assert_eq!(budget.period_start, T0 + 2 * DAY);
        assert_eq!(budget.renews_at(), Some(T0 + 3 * DAY));
    }

    #[test]
    fn test_lifetime_budget_never_renews() {
        let mut budget = Budget::new(500, BudgetPeriod::Never, T0);
        budget.spent_msat = 500;
        budget.roll_over(T0 + 1000 * DAY);
        assert_eq!(budget.remaining(), 0);
        assert_eq!(budget.renews_at(), None);
    }

    #[test]
    fn test_non_payment_ignores_exhausted_budget() {
        let mut budget = Budget::new(100, BudgetPeriod::Daily, T0);
        budget.spent_msat = 100;
        let mut conn = connection(&[Method::GetBalance, Method::PayInvoice], Some(budget));
        assert!(conn.authorize(Method::GetBalance, 0, T0 + 1).is_ok());
        assert!(conn.authorize(Method::PayInvoice, 1, T0 + 1).is_err());
        // next day the budget is back
        assert!(conn.authorize(Method::PayInvoice, 100, T0 + DAY).is_ok());
    }

    #[test]
    fn test_expired_connection_is_unknown() {
        let mut conn = connection(&[Method::GetInfo], None);
        conn.expires_at = Some(T0 + 60);
        assert!(conn.authorize(Method::GetInfo, 0, T0 + 59).is_ok());
        assert_eq!(
            conn.authorize(Method::GetInfo, 0, T0 + 60),
            Err(Denial::UnknownConnection)
        );
    }

    #[test]
    fn test_denial_maps_to_distinct_errors() {
        use crate::protocol::ErrorCode;
        let codes: Vec<ErrorCode> = [
            Denial::UnknownConnection,
            Denial::MethodNotPermitted(Method::PayInvoice),
            Denial::BudgetExceeded {
                requested: 2,
                remaining: 1,
            },
        ]
        .into_iter()
        .map(|d| BridgeError::from(d).to_error_code())
        .collect();
        assert_eq!(
            codes,
            vec![
                ErrorCode::Unauthorized,
                ErrorCode::Restricted,
                ErrorCode::QuotaExceeded
            ]
        );
    }

    #[test]
    fn test_record_serialization() {
        let conn = connection(
            &[Method::PayInvoice, Method::GetInfo],
            Some(Budget::new(1_000, BudgetPeriod::Weekly, T0)),
        );
        let json = serde_json::to_string(&conn).unwrap();
        assert!(json.contains("\"weekly\""));
        assert!(json.contains("\"pay_invoice\""));
        let back: Connection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conn);
    }
}
