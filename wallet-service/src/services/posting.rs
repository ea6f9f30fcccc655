//! Wallet postings: the arithmetic performed while the wallet row is locked.
//!
//! A [`WalletMutation`] is applied to a locked snapshot of the wallet and
//! yields the updated wallet together with the single ledger row that
//! documents it. Stores persist both in one atomic unit.

use crate::models::{NewLedgerTransaction, TransactionType, Wallet};
use crate::services::cost::CostModel;
use crate::services::error::BillingError;
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

/// A balance-affecting operation on one wallet.
#[derive(Debug, Clone, PartialEq)]
pub enum WalletMutation {
    Debit {
        requested_units: Decimal,
        consumption_request_id: Option<Uuid>,
    },
    Recharge {
        amount: Decimal,
        payment_reference: String,
        gateway_order_id: Option<String>,
    },
    PromotionalCredit {
        amount: Decimal,
        description: String,
    },
}

/// Key under which a mutation must be applied at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdempotencyKey {
    PaymentReference(String),
    ConsumptionRequest(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub wallet: Wallet,
    pub transaction: NewLedgerTransaction,
}

impl WalletMutation {
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            Self::Debit { .. } => TransactionType::Debit,
            Self::Recharge { .. } => TransactionType::Recharge,
            Self::PromotionalCredit { .. } => TransactionType::PromotionalCredit,
        }
    }

    pub fn idempotency_key(&self) -> Option<IdempotencyKey> {
        match self {
            Self::Debit {
                consumption_request_id: Some(id),
                ..
            } => Some(IdempotencyKey::ConsumptionRequest(*id)),
            Self::Recharge {
                payment_reference, ..
            } => Some(IdempotencyKey::PaymentReference(payment_reference.clone())),
            _ => None,
        }
    }

    /// Compute the post-mutation wallet and its ledger row.
    ///
    /// Never produces a negative balance or allowance: an unaffordable debit is
    /// `InsufficientFunds`, any other negative outcome is a consistency violation.
    pub fn apply(&self, wallet: &Wallet, cost_model: &CostModel) -> Result<Posting, BillingError> {
        let mut next = wallet.clone();
        let balance_before = wallet.balance;
        let free_before = wallet.free_allowance_remaining;

        let transaction = match self {
            Self::Debit {
                requested_units,
                consumption_request_id,
            } => {
                if *requested_units <= Decimal::ZERO {
                    return Err(BillingError::InvalidRequest(
                        "Debit units must be greater than zero".to_string(),
                    ));
                }

                // Recomputed against the allowance held under the lock.
                let quote = cost_model.quote(*requested_units, free_before);
                if quote.cost > balance_before {
                    return Err(BillingError::InsufficientFunds {
                        required: quote.cost,
                        available: balance_before,
                    });
                }

                next.free_allowance_remaining = free_before - quote.free_units_used;
                next.balance = balance_before - quote.cost;
                next.lifetime_spent += quote.cost;
                next.lifetime_units_consumed += quote.billed_units;

                NewLedgerTransaction {
                    transaction_type: TransactionType::Debit,
                    amount: quote.cost,
                    balance_before,
                    balance_after: next.balance,
                    free_allowance_before: free_before,
                    free_allowance_after: next.free_allowance_remaining,
                    description: format!(
                        "Transcription: {} min billed ({} free, {} paid). Free minutes {} -> {}",
                        quote.billed_units.normalize(),
                        quote.free_units_used.normalize(),
                        quote.billable_units.normalize(),
                        free_before,
                        next.free_allowance_remaining
                    ),
                    external_payment_reference: None,
                    gateway_order_id: None,
                    consumption_request_id: *consumption_request_id,
                }
            }
            Self::Recharge {
                amount,
                payment_reference,
                gateway_order_id,
            } => {
                if *amount <= Decimal::ZERO {
                    return Err(BillingError::InvalidRequest(
                        "Recharge amount must be greater than zero".to_string(),
                    ));
                }
                if payment_reference.trim().is_empty() {
                    return Err(BillingError::InvalidRequest(
                        "Payment reference is required".to_string(),
                    ));
                }

                next.balance = balance_before + amount;

                NewLedgerTransaction {
                    transaction_type: TransactionType::Recharge,
                    amount: *amount,
                    balance_before,
                    balance_after: next.balance,
                    free_allowance_before: free_before,
                    free_allowance_after: free_before,
                    description: format!("Wallet recharge via payment {}", payment_reference),
                    external_payment_reference: Some(payment_reference.clone()),
                    gateway_order_id: gateway_order_id.clone(),
                    consumption_request_id: None,
                }
            }
            Self::PromotionalCredit {
                amount,
                description,
            } => {
                if *amount < Decimal::ZERO {
                    return Err(BillingError::InvalidRequest(
                        "Promotional credit cannot be negative".to_string(),
                    ));
                }

                next.balance = balance_before + amount;

                NewLedgerTransaction {
                    transaction_type: TransactionType::PromotionalCredit,
                    amount: *amount,
                    balance_before,
                    balance_after: next.balance,
                    free_allowance_before: free_before,
                    free_allowance_after: free_before,
                    description: description.clone(),
                    external_payment_reference: None,
                    gateway_order_id: None,
                    consumption_request_id: None,
                }
            }
        };

        if next.balance < Decimal::ZERO || next.free_allowance_remaining < Decimal::ZERO {
            return Err(BillingError::ConsistencyViolation(format!(
                "posting would leave wallet {} with balance {} and free allowance {}",
                wallet.wallet_id, next.balance, next.free_allowance_remaining
            )));
        }

        next.updated_utc = Utc::now();

        Ok(Posting {
            wallet: next,
            transaction,
        })
    }
}

/// Ledger row written when a wallet is opened: records the free-allowance grant.
pub fn opening_transaction(wallet: &Wallet) -> NewLedgerTransaction {
    NewLedgerTransaction {
        transaction_type: TransactionType::PromotionalCredit,
        amount: Decimal::ZERO,
        balance_before: Decimal::ZERO,
        balance_after: wallet.balance,
        free_allowance_before: Decimal::ZERO,
        free_allowance_after: wallet.free_allowance_remaining,
        description: format!(
            "Welcome grant: {} free minutes. Free minutes 0 -> {}",
            wallet.free_allowance_remaining.normalize(),
            wallet.free_allowance_remaining
        ),
        external_payment_reference: None,
        gateway_order_id: None,
        consumption_request_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn wallet(balance: &str, free: &str) -> Wallet {
        let mut w = Wallet::open(Uuid::new_v4(), d(free));
        w.balance = d(balance);
        w
    }

    fn debit(units: &str) -> WalletMutation {
        WalletMutation::Debit {
            requested_units: d(units),
            consumption_request_id: None,
        }
    }

    #[test]
    fn test_debit_splits_free_allowance_then_balance() {
        let model = CostModel::new(d("1.00"));
        let posting = debit("15.0").apply(&wallet("100.00", "10.00"), &model).unwrap();

        assert_eq!(posting.wallet.balance, d("95.00"));
        assert_eq!(posting.wallet.free_allowance_remaining, d("0.00"));
        assert_eq!(posting.wallet.lifetime_spent, d("5.00"));
        assert_eq!(posting.wallet.lifetime_units_consumed, d("15"));

        let tx = posting.transaction;
        assert_eq!(tx.transaction_type, TransactionType::Debit);
        assert_eq!(tx.amount, d("5.00"));
        assert_eq!(tx.balance_before, d("100.00"));
        assert_eq!(tx.balance_after, d("95.00"));
        assert_eq!(tx.free_allowance_before, d("10.00"));
        assert_eq!(tx.free_allowance_after, d("0"));
        assert!(tx.description.contains("10 free"));
        assert!(tx.description.contains("5 paid"));
    }

    #[test]
    fn test_fully_covered_debit_has_zero_amount() {
        let model = CostModel::new(d("1.00"));
        let posting = debit("2.4").apply(&wallet("0", "10.00"), &model).unwrap();
        assert_eq!(posting.transaction.amount, Decimal::ZERO);
        assert_eq!(posting.wallet.free_allowance_remaining, d("7.00"));
        assert_eq!(posting.wallet.lifetime_units_consumed, d("3"));
        assert_eq!(posting.wallet.balance, Decimal::ZERO);
    }

    #[test]
    fn test_unaffordable_debit_is_rejected() {
        let model = CostModel::new(d("1.00"));
        let err = debit("150").apply(&wallet("100.00", "10.00"), &model).unwrap_err();
        match err {
            BillingError::InsufficientFunds {
                required,
                available,
            } => {
                assert_eq!(required, d("140.00"));
                assert_eq!(available, d("100.00"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_recharge_increases_balance_only() {
        let model = CostModel::new(d("1.00"));
        let mutation = WalletMutation::Recharge {
            amount: d("50.00"),
            payment_reference: "pay_X".to_string(),
            gateway_order_id: Some("order_1".to_string()),
        };
        let posting = mutation.apply(&wallet("95.00", "0"), &model).unwrap();
        assert_eq!(posting.wallet.balance, d("145.00"));
        assert_eq!(posting.wallet.lifetime_spent, Decimal::ZERO);
        assert_eq!(
            posting.transaction.external_payment_reference.as_deref(),
            Some("pay_X")
        );
        assert_eq!(
            mutation.idempotency_key(),
            Some(IdempotencyKey::PaymentReference("pay_X".to_string()))
        );
    }

    #[test]
    fn test_invalid_amounts_are_rejected() {
        let model = CostModel::new(d("1.00"));
        let w = wallet("10.00", "0");
        let zero_recharge = WalletMutation::Recharge {
            amount: Decimal::ZERO,
            payment_reference: "pay_0".to_string(),
            gateway_order_id: None,
        };
        assert!(matches!(
            zero_recharge.apply(&w, &model),
            Err(BillingError::InvalidRequest(_))
        ));
        assert!(matches!(
            debit("0").apply(&w, &model),
            Err(BillingError::InvalidRequest(_))
        ));
        let negative_promo = WalletMutation::PromotionalCredit {
            amount: d("-1"),
            description: "oops".to_string(),
        };
        assert!(negative_promo.apply(&w, &model).is_err());
    }

    #[test]
    fn test_opening_transaction_records_grant() {
        let w = Wallet::open(Uuid::new_v4(), d("10.00"));
        let tx = opening_transaction(&w);
        assert_eq!(tx.transaction_type, TransactionType::PromotionalCredit);
        assert_eq!(tx.amount, Decimal::ZERO);
        assert_eq!(tx.free_allowance_before, Decimal::ZERO);
        assert_eq!(tx.free_allowance_after, d("10.00"));
    }
}
