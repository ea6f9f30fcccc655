//! Billing engine: admission checks, debits, credits and ledger audits.

use crate::models::{
    LedgerAudit, LedgerTransaction, ListTransactionsFilter, UsageStatistics, Wallet,
};
use crate::services::cost::{CostModel, CostQuote};
use crate::services::error::BillingError;
use crate::services::metrics::{LEDGER_POSTINGS_TOTAL, LEDGER_RETRIES_TOTAL};
use crate::services::policy::UsagePolicy;
use crate::services::posting::{opening_transaction, WalletMutation};
use crate::services::store::{LedgerStore, PostOutcome};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Read-only admission answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Affordability {
    pub allowed: bool,
    pub estimated_cost: Decimal,
    #[serde(flatten)]
    pub quote: CostQuote,
    pub balance: Decimal,
    pub free_allowance_remaining: Decimal,
}

/// Committed debit.
#[derive(Debug, Clone)]
pub struct DebitReceipt {
    pub transaction: LedgerTransaction,
    pub actual_cost: Decimal,
    pub wallet: Wallet,
    /// An earlier debit for the same consumption request was returned.
    pub replayed: bool,
}

pub struct BillingEngine {
    store: Arc<dyn LedgerStore>,
    cost_model: CostModel,
    policy: UsagePolicy,
    retry: RetryConfig,
}

impl BillingEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cost_model: CostModel,
        policy: UsagePolicy,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            cost_model,
            policy,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    pub fn policy(&self) -> &UsagePolicy {
        &self.policy
    }

    /// Open the account's wallet with the configured free allowance.
    /// Returns the existing wallet when one is already open.
    #[instrument(skip(self))]
    pub async fn open_wallet(&self, account_id: Uuid) -> Result<Wallet, BillingError> {
        let wallet = Wallet::open(account_id, self.policy.free_allowance_grant);
        let opening = opening_transaction(&wallet);
        let (wallet, created) = self.store.create_wallet(wallet, opening).await?;
        if created {
            info!(
                wallet_id = %wallet.wallet_id,
                free_allowance = %wallet.free_allowance_remaining,
                "Wallet opened"
            );
        }
        Ok(wallet)
    }

    pub async fn get_wallet(&self, account_id: Uuid) -> Result<Wallet, BillingError> {
        self.store
            .get_wallet(account_id)
            .await?
            .ok_or(BillingError::WalletNotFound(account_id))
    }

    /// Whether the account can currently pay for `requested_units`. No side effects.
    #[instrument(skip(self))]
    pub async fn check_affordability(
        &self,
        account_id: Uuid,
        requested_units: Decimal,
    ) -> Result<Affordability, BillingError> {
        self.policy.validate_units(requested_units)?;
        let wallet = self.get_wallet(account_id).await?;
        let quote = self
            .cost_model
            .quote(requested_units, wallet.free_allowance_remaining);

        Ok(Affordability {
            allowed: quote.cost <= wallet.balance,
            estimated_cost: quote.cost,
            quote,
            balance: wallet.balance,
            free_allowance_remaining: wallet.free_allowance_remaining,
        })
    }

    /// Atomically charge `requested_units`, free allowance first.
    ///
    /// With a `consumption_request_id` the debit is applied at most once for
    /// that request; a repeat returns the committed row.
    #[instrument(skip(self))]
    pub async fn debit(
        &self,
        account_id: Uuid,
        requested_units: Decimal,
        consumption_request_id: Option<Uuid>,
    ) -> Result<DebitReceipt, BillingError> {
        let mutation = WalletMutation::Debit {
            requested_units,
            consumption_request_id,
        };
        let outcome = self.post(account_id, mutation, "debit").await?;

        if !outcome.replayed {
            info!(
                transaction_id = %outcome.transaction.transaction_id,
                amount = %outcome.transaction.amount,
                balance_after = %outcome.transaction.balance_after,
                free_allowance_after = %outcome.transaction.free_allowance_after,
                "Wallet debited"
            );
        }

        Ok(DebitReceipt {
            actual_cost: outcome.transaction.amount,
            transaction: outcome.transaction,
            wallet: outcome.wallet,
            replayed: outcome.replayed,
        })
    }

    /// Credit a verified payment. Idempotent by `payment_reference`.
    #[instrument(skip(self))]
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        payment_reference: &str,
        gateway_order_id: Option<&str>,
    ) -> Result<LedgerTransaction, BillingError> {
        let mutation = WalletMutation::Recharge {
            amount,
            payment_reference: payment_reference.to_string(),
            gateway_order_id: gateway_order_id.map(str::to_string),
        };
        let outcome = self.post(account_id, mutation, "credit").await?;

        if outcome.replayed {
            info!(
                transaction_id = %outcome.transaction.transaction_id,
                "Payment already applied, returning existing transaction"
            );
        } else {
            info!(
                transaction_id = %outcome.transaction.transaction_id,
                amount = %amount,
                balance_after = %outcome.transaction.balance_after,
                "Wallet recharged"
            );
        }

        Ok(outcome.transaction)
    }

    #[instrument(skip(self, description))]
    pub async fn grant_promotional_credit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
    ) -> Result<LedgerTransaction, BillingError> {
        let mutation = WalletMutation::PromotionalCredit {
            amount,
            description: description.to_string(),
        };
        let outcome = self.post(account_id, mutation, "promotional_credit").await?;
        info!(
            transaction_id = %outcome.transaction.transaction_id,
            amount = %amount,
            "Promotional credit granted"
        );
        Ok(outcome.transaction)
    }

    pub async fn usage_statistics(&self, account_id: Uuid) -> Result<UsageStatistics, BillingError> {
        Ok(self.get_wallet(account_id).await?.statistics())
    }

    pub async fn list_transactions(
        &self,
        account_id: Uuid,
        filter: &ListTransactionsFilter,
    ) -> Result<Vec<LedgerTransaction>, BillingError> {
        self.store.list_transactions(account_id, filter).await
    }

    /// Replay the ledger from zero and compare with the stored balance.
    #[instrument(skip(self))]
    pub async fn audit(&self, account_id: Uuid) -> Result<LedgerAudit, BillingError> {
        let wallet = self.get_wallet(account_id).await?;
        let transactions = self.store.all_transactions(account_id).await?;

        let mut replayed_balance = Decimal::ZERO;
        let mut chain_intact = true;
        for transaction in &transactions {
            if transaction.balance_before != replayed_balance
                || transaction.balance_after != transaction.balance_before + transaction.signed_amount()
            {
                chain_intact = false;
            }
            replayed_balance += transaction.signed_amount();
        }

        let consistent = chain_intact && replayed_balance == wallet.balance;
        if !consistent {
            error!(
                target: "wallet::consistency",
                account_id = %account_id,
                replayed_balance = %replayed_balance,
                wallet_balance = %wallet.balance,
                chain_intact,
                "Ledger replay does not match wallet balance"
            );
        }

        Ok(LedgerAudit {
            account_id,
            transaction_count: transactions.len(),
            replayed_balance,
            wallet_balance: wallet.balance,
            chain_intact,
            consistent,
        })
    }

    /// Run one posting under the lock-contention retry policy.
    async fn post(
        &self,
        account_id: Uuid,
        mutation: WalletMutation,
        operation: &'static str,
    ) -> Result<PostOutcome, BillingError> {
        let transaction_type = mutation.transaction_type().as_str();
        let (store, mutation, cost_model) = (&self.store, &mutation, &self.cost_model);
        let result = retry_with_backoff(&self.retry, operation, || async move {
            let attempt = store.post(account_id, mutation, cost_model).await;
            if matches!(attempt, Err(BillingError::Contention(_))) {
                LEDGER_RETRIES_TOTAL.with_label_values(&[operation]).inc();
            }
            attempt
        })
        .await;

        match &result {
            Ok(outcome) => {
                let label = if outcome.replayed { "replayed" } else { "ok" };
                LEDGER_POSTINGS_TOTAL
                    .with_label_values(&[transaction_type, label])
                    .inc();
            }
            Err(err) => {
                LEDGER_POSTINGS_TOTAL
                    .with_label_values(&[transaction_type, err.kind()])
                    .inc();
                if let BillingError::ConsistencyViolation(detail) = err {
                    error!(
                        target: "wallet::consistency",
                        account_id = %account_id,
                        detail = %detail,
                        "Posting aborted on consistency violation"
                    );
                } else if let BillingError::Contention(detail) = err {
                    warn!(account_id = %account_id, detail = %detail, "Posting gave up after retries");
                }
            }
        }

        result
    }
}
