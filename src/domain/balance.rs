//! Append-only balance transaction log (spec.md §3.1, §4.1).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceTxKind {
    Deposit,
    OrderPayment,
    Refund,
    RefillCredit,
    Adjustment,
}

impl BalanceTxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceTxKind::Deposit => "DEPOSIT",
            BalanceTxKind::OrderPayment => "ORDER_PAYMENT",
            BalanceTxKind::Refund => "REFUND",
            BalanceTxKind::RefillCredit => "REFILL_CREDIT",
            BalanceTxKind::Adjustment => "ADJUSTMENT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "DEPOSIT" => BalanceTxKind::Deposit,
            "ORDER_PAYMENT" => BalanceTxKind::OrderPayment,
            "REFUND" => BalanceTxKind::Refund,
            "REFILL_CREDIT" => BalanceTxKind::RefillCredit,
            "ADJUSTMENT" => BalanceTxKind::Adjustment,
            _ => return None,
        })
    }

    /// Whether this kind debits (negative) or credits (positive) the balance.
    pub fn is_debit(&self) -> bool {
        matches!(self, BalanceTxKind::OrderPayment)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceTransaction {
    pub id: i64,
    pub user_id: i64,
    pub order_id: Option<i64>,
    pub deposit_id: Option<i64>,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub kind: BalanceTxKind,
    pub reference_id: String,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}
