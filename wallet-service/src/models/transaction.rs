//! Ledger transaction model (append-only audit trail).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of balance-affecting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Recharge,
    Debit,
    PromotionalCredit,
}

impl TransactionType {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recharge => "recharge",
            Self::Debit => "debit",
            Self::PromotionalCredit => "promotional_credit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recharge" => Some(Self::Recharge),
            "debit" => Some(Self::Debit),
            "promotional_credit" => Some(Self::PromotionalCredit),
            _ => None,
        }
    }

    /// Whether the transaction moves money into the wallet.
    pub fn is_credit(&self) -> bool {
        !matches!(self, Self::Debit)
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable ledger row.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub transaction_id: Uuid,
    pub sequence_no: i64,
    pub wallet_id: Uuid,
    pub account_id: Uuid,
    pub transaction_type: String,
    /// Magnitude of paid-currency movement; direction comes from the type.
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub free_allowance_before: Decimal,
    pub free_allowance_after: Decimal,
    pub description: String,
    pub external_payment_reference: Option<String>,
    pub gateway_order_id: Option<String>,
    pub consumption_request_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl LedgerTransaction {
    /// Get parsed transaction type.
    pub fn parsed_type(&self) -> Option<TransactionType> {
        TransactionType::parse(&self.transaction_type)
    }

    /// Signed balance delta (negative for debits).
    pub fn signed_amount(&self) -> Decimal {
        match self.parsed_type() {
            Some(TransactionType::Debit) => -self.amount,
            Some(_) => self.amount,
            None => Decimal::ZERO,
        }
    }
}

/// A ledger row that has been computed but not yet written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerTransaction {
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub free_allowance_before: Decimal,
    pub free_allowance_after: Decimal,
    pub description: String,
    pub external_payment_reference: Option<String>,
    pub gateway_order_id: Option<String>,
    pub consumption_request_id: Option<Uuid>,
}

impl NewLedgerTransaction {
    /// Materialize the row for a wallet. `sequence_no` is assigned by the store.
    pub fn into_transaction(self, wallet_id: Uuid, account_id: Uuid, sequence_no: i64) -> LedgerTransaction {
        LedgerTransaction {
            transaction_id: Uuid::new_v4(),
            sequence_no,
            wallet_id,
            account_id,
            transaction_type: self.transaction_type.as_str().to_string(),
            amount: self.amount,
            balance_before: self.balance_before,
            balance_after: self.balance_after,
            free_allowance_before: self.free_allowance_before,
            free_allowance_after: self.free_allowance_after,
            description: self.description,
            external_payment_reference: self.external_payment_reference,
            gateway_order_id: self.gateway_order_id,
            consumption_request_id: self.consumption_request_id,
            created_utc: Utc::now(),
        }
    }
}

/// Filter parameters for listing ledger transactions.
#[derive(Debug, Clone, Default)]
pub struct ListTransactionsFilter {
    pub transaction_type: Option<TransactionType>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub page_size: i32,
    /// Return rows with `sequence_no` below this cursor.
    pub page_token: Option<i64>,
}

impl ListTransactionsFilter {
    pub fn limit(&self) -> i64 {
        self.page_size.clamp(1, 100) as i64
    }

    pub fn matches(&self, transaction: &LedgerTransaction) -> bool {
        if let Some(kind) = self.transaction_type {
            if transaction.transaction_type != kind.as_str() {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if transaction.created_utc < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if transaction.created_utc > to {
                return false;
            }
        }
        if let Some(cursor) = self.page_token {
            if transaction.sequence_no >= cursor {
                return false;
            }
        }
        true
    }
}
