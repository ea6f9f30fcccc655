//! Ledger store contract.
//!
//! Every mutating wallet operation goes through [`LedgerStore::post`], which
//! must hold an exclusive per-wallet lock for the whole read-modify-write and
//! persist the wallet together with exactly one ledger row, or nothing.

use crate::models::{
    ConsumptionCompletion, ConsumptionRequest, LedgerTransaction, ListConsumptionFilter,
    ListTransactionsFilter, NewLedgerTransaction, RechargeOrder, Wallet,
};
use crate::services::cost::CostModel;
use crate::services::error::BillingError;
use crate::services::posting::WalletMutation;
use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Result of a posting.
#[derive(Debug, Clone)]
pub struct PostOutcome {
    pub wallet: Wallet,
    pub transaction: LedgerTransaction,
    /// The idempotency key matched an existing row; nothing was written.
    pub replayed: bool,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn health_check(&self) -> Result<(), BillingError>;

    /// Insert the wallet and its opening row. Returns the existing wallet and
    /// `false` when the account already has one.
    async fn create_wallet(
        &self,
        wallet: Wallet,
        opening: NewLedgerTransaction,
    ) -> Result<(Wallet, bool), BillingError>;

    async fn get_wallet(&self, account_id: Uuid) -> Result<Option<Wallet>, BillingError>;

    /// Lock the wallet, apply the mutation and append its ledger row atomically.
    async fn post(
        &self,
        account_id: Uuid,
        mutation: &WalletMutation,
        cost_model: &CostModel,
    ) -> Result<PostOutcome, BillingError>;

    /// Newest first, filtered and paginated.
    async fn list_transactions(
        &self,
        account_id: Uuid,
        filter: &ListTransactionsFilter,
    ) -> Result<Vec<LedgerTransaction>, BillingError>;

    /// Full history in commit order.
    async fn all_transactions(&self, account_id: Uuid)
        -> Result<Vec<LedgerTransaction>, BillingError>;

    async fn insert_consumption_request(
        &self,
        request: &ConsumptionRequest,
    ) -> Result<(), BillingError>;

    async fn get_consumption_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ConsumptionRequest>, BillingError>;

    /// Compare-and-set `pending -> in_progress`.
    async fn mark_in_progress(&self, request_id: Uuid) -> Result<ConsumptionRequest, BillingError>;

    /// Compare-and-set `in_progress -> completed | failed`.
    async fn complete_consumption_request(
        &self,
        request_id: Uuid,
        completion: &ConsumptionCompletion,
    ) -> Result<ConsumptionRequest, BillingError>;

    async fn list_consumption_requests(
        &self,
        account_id: Uuid,
        filter: &ListConsumptionFilter,
    ) -> Result<Vec<ConsumptionRequest>, BillingError>;

    /// Completed requests without a committed debit. Requests never swept come
    /// first, then the least recently attempted, so a request that keeps
    /// failing cannot starve the rest.
    async fn list_unsettled(&self, limit: i64) -> Result<Vec<ConsumptionRequest>, BillingError>;

    /// Count a failed settlement and move the request to the back of the sweep.
    async fn record_settlement_failure(&self, request_id: Uuid) -> Result<(), BillingError>;

    async fn mark_settled(
        &self,
        request_id: Uuid,
        ledger_transaction_id: Uuid,
        actual_cost: Decimal,
    ) -> Result<ConsumptionRequest, BillingError>;

    async fn insert_recharge_order(&self, order: &RechargeOrder) -> Result<(), BillingError>;

    async fn get_recharge_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<RechargeOrder>, BillingError>;

    /// Idempotent: marking an already-paid order again is a no-op.
    async fn mark_recharge_order_paid(
        &self,
        gateway_order_id: &str,
        payment_id: &str,
    ) -> Result<(), BillingError>;
}
