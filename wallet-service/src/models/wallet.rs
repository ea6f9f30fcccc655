//! Wallet model: one per account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Prepaid wallet.
///
/// `balance` holds paid funds, `free_allowance_remaining` holds free usage units
/// granted once at creation. Both accumulators only grow, and only inside the
/// same locked posting that moves the balance or the allowance.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: Uuid,
    pub account_id: Uuid,
    pub balance: Decimal,
    pub free_allowance_remaining: Decimal,
    pub lifetime_spent: Decimal,
    pub lifetime_units_consumed: Decimal,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Wallet {
    /// A fresh wallet with zero balance and the configured free allowance.
    pub fn open(account_id: Uuid, free_allowance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            wallet_id: Uuid::new_v4(),
            account_id,
            balance: Decimal::ZERO,
            free_allowance_remaining: free_allowance.max(Decimal::ZERO),
            lifetime_spent: Decimal::ZERO,
            lifetime_units_consumed: Decimal::ZERO,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn statistics(&self) -> UsageStatistics {
        UsageStatistics {
            lifetime_units_consumed: self.lifetime_units_consumed,
            lifetime_spent: self.lifetime_spent,
            balance: self.balance,
            free_allowance_remaining: self.free_allowance_remaining,
        }
    }
}

/// Usage statistics for an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStatistics {
    pub lifetime_units_consumed: Decimal,
    pub lifetime_spent: Decimal,
    pub balance: Decimal,
    pub free_allowance_remaining: Decimal,
}

/// Result of replaying a wallet's ledger from zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAudit {
    pub account_id: Uuid,
    pub transaction_count: usize,
    pub replayed_balance: Decimal,
    pub wallet_balance: Decimal,
    /// `balance_after` of each row equals `balance_before` of the next.
    pub chain_intact: bool,
    pub consistent: bool,
}
