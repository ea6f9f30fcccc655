//! In-memory ledger store.
//!
//! Same locking contract as the Postgres store: one `tokio::sync::Mutex` per
//! wallet serializes postings on that wallet, different wallets never contend.

use crate::models::{
    ConsumptionCompletion, ConsumptionRequest, ConsumptionStatus, LedgerTransaction,
    ListConsumptionFilter, ListTransactionsFilter, NewLedgerTransaction, RechargeOrder,
    RechargeOrderStatus, Wallet,
};
use crate::services::cost::CostModel;
use crate::services::error::BillingError;
use crate::services::posting::{IdempotencyKey, WalletMutation};
use crate::services::store::{LedgerStore, PostOutcome};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

struct WalletSlot {
    wallet: Wallet,
    transactions: Vec<LedgerTransaction>,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    wallets: DashMap<Uuid, Arc<Mutex<WalletSlot>>>,
    /// payment reference -> (account_id, transaction_id)
    payment_refs: DashMap<String, (Uuid, Uuid)>,
    requests: DashMap<Uuid, ConsumptionRequest>,
    orders: DashMap<String, RechargeOrder>,
    sequence: AtomicI64,
    injected_contention: AtomicU32,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `failures` postings fail with `Contention`, as a
    /// deadlocked database transaction would.
    pub fn inject_contention(&self, failures: u32) {
        self.injected_contention.store(failures, Ordering::SeqCst);
    }

    fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn slot(&self, account_id: Uuid) -> Result<Arc<Mutex<WalletSlot>>, BillingError> {
        self.wallets
            .get(&account_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(BillingError::WalletNotFound(account_id))
    }

    fn take_injected_contention(&self) -> bool {
        self.injected_contention
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn transition(
        &self,
        request_id: Uuid,
        expected: ConsumptionStatus,
        next: ConsumptionStatus,
        update: impl FnOnce(&mut ConsumptionRequest),
    ) -> Result<ConsumptionRequest, BillingError> {
        let mut request = self
            .requests
            .get_mut(&request_id)
            .ok_or(BillingError::RequestNotFound(request_id))?;
        if request.status != expected.as_str() {
            return Err(BillingError::InvalidTransition {
                from: request.status.clone(),
                to: next,
            });
        }
        update(request.value_mut());
        Ok(request.clone())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn health_check(&self) -> Result<(), BillingError> {
        Ok(())
    }

    async fn create_wallet(
        &self,
        wallet: Wallet,
        opening: NewLedgerTransaction,
    ) -> Result<(Wallet, bool), BillingError> {
        let existing = match self.wallets.entry(wallet.account_id) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let transaction = opening.into_transaction(
                    wallet.wallet_id,
                    wallet.account_id,
                    self.next_sequence(),
                );
                entry.insert(Arc::new(Mutex::new(WalletSlot {
                    wallet: wallet.clone(),
                    transactions: vec![transaction],
                })));
                return Ok((wallet, true));
            }
        };

        let slot = existing.lock().await;
        Ok((slot.wallet.clone(), false))
    }

    async fn get_wallet(&self, account_id: Uuid) -> Result<Option<Wallet>, BillingError> {
        let Ok(slot) = self.slot(account_id) else {
            return Ok(None);
        };
        let slot = slot.lock().await;
        Ok(Some(slot.wallet.clone()))
    }

    async fn post(
        &self,
        account_id: Uuid,
        mutation: &WalletMutation,
        cost_model: &CostModel,
    ) -> Result<PostOutcome, BillingError> {
        let slot = self.slot(account_id)?;
        let mut slot = slot.lock().await;

        if self.take_injected_contention() {
            return Err(BillingError::Contention(
                "injected lock contention".to_string(),
            ));
        }

        let key = mutation.idempotency_key();
        let existing = match &key {
            Some(IdempotencyKey::PaymentReference(reference)) => {
                match self.payment_refs.get(reference).map(|e| *e.value()) {
                    Some((owner, _)) if owner != account_id => {
                        return Err(BillingError::DuplicatePaymentReference(reference.clone()));
                    }
                    Some((_, transaction_id)) => slot
                        .transactions
                        .iter()
                        .find(|t| t.transaction_id == transaction_id)
                        .cloned(),
                    None => None,
                }
            }
            Some(IdempotencyKey::ConsumptionRequest(request_id)) => slot
                .transactions
                .iter()
                .find(|t| t.consumption_request_id == Some(*request_id))
                .cloned(),
            None => None,
        };

        if let Some(transaction) = existing {
            return Ok(PostOutcome {
                wallet: slot.wallet.clone(),
                transaction,
                replayed: true,
            });
        }

        let posting = mutation.apply(&slot.wallet, cost_model)?;
        let transaction = posting.transaction.into_transaction(
            slot.wallet.wallet_id,
            account_id,
            self.next_sequence(),
        );

        if let Some(IdempotencyKey::PaymentReference(reference)) = key {
            match self.payment_refs.entry(reference.clone()) {
                Entry::Occupied(_) => {
                    return Err(BillingError::DuplicatePaymentReference(reference));
                }
                Entry::Vacant(entry) => {
                    entry.insert((account_id, transaction.transaction_id));
                }
            }
        }

        slot.wallet = posting.wallet;
        slot.transactions.push(transaction.clone());

        Ok(PostOutcome {
            wallet: slot.wallet.clone(),
            transaction,
            replayed: false,
        })
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        filter: &ListTransactionsFilter,
    ) -> Result<Vec<LedgerTransaction>, BillingError> {
        let slot = self.slot(account_id)?;
        let slot = slot.lock().await;
        Ok(slot
            .transactions
            .iter()
            .rev()
            .filter(|t| filter.matches(t))
            .take(filter.limit() as usize)
            .cloned()
            .collect())
    }

    async fn all_transactions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<LedgerTransaction>, BillingError> {
        let slot = self.slot(account_id)?;
        let slot = slot.lock().await;
        Ok(slot.transactions.clone())
    }

    async fn insert_consumption_request(
        &self,
        request: &ConsumptionRequest,
    ) -> Result<(), BillingError> {
        if !self.wallets.contains_key(&request.account_id) {
            return Err(BillingError::WalletNotFound(request.account_id));
        }
        match self.requests.entry(request.request_id) {
            Entry::Occupied(_) => Err(BillingError::InvalidRequest(
                "Consumption request already exists".to_string(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(request.clone());
                Ok(())
            }
        }
    }

    async fn get_consumption_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ConsumptionRequest>, BillingError> {
        Ok(self.requests.get(&request_id).map(|r| r.value().clone()))
    }

    async fn mark_in_progress(&self, request_id: Uuid) -> Result<ConsumptionRequest, BillingError> {
        self.transition(
            request_id,
            ConsumptionStatus::Pending,
            ConsumptionStatus::InProgress,
            |request| {
                request.status = ConsumptionStatus::InProgress.as_str().to_string();
                request.started_utc = Some(Utc::now());
            },
        )
    }

    async fn complete_consumption_request(
        &self,
        request_id: Uuid,
        completion: &ConsumptionCompletion,
    ) -> Result<ConsumptionRequest, BillingError> {
        self.transition(
            request_id,
            ConsumptionStatus::InProgress,
            completion.status(),
            |request| completion.apply_to(request, Utc::now()),
        )
    }

    async fn list_consumption_requests(
        &self,
        account_id: Uuid,
        filter: &ListConsumptionFilter,
    ) -> Result<Vec<ConsumptionRequest>, BillingError> {
        let mut requests: Vec<ConsumptionRequest> = self
            .requests
            .iter()
            .filter(|r| r.account_id == account_id && filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        requests.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        requests.truncate(filter.limit() as usize);
        Ok(requests)
    }

    async fn list_unsettled(&self, limit: i64) -> Result<Vec<ConsumptionRequest>, BillingError> {
        let mut requests: Vec<ConsumptionRequest> = self
            .requests
            .iter()
            .filter(|r| r.status == ConsumptionStatus::Completed.as_str() && !r.settled)
            .map(|r| r.value().clone())
            .collect();
        // Never-attempted rows first, then the least recently attempted.
        requests.sort_by_key(|r| (r.last_settlement_attempt_utc, r.completed_utc));
        requests.truncate(limit.max(0) as usize);
        Ok(requests)
    }

    async fn record_settlement_failure(&self, request_id: Uuid) -> Result<(), BillingError> {
        let mut request = self
            .requests
            .get_mut(&request_id)
            .ok_or(BillingError::RequestNotFound(request_id))?;
        if request.status == ConsumptionStatus::Completed.as_str() && !request.settled {
            request.settlement_attempts += 1;
            request.last_settlement_attempt_utc = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_settled(
        &self,
        request_id: Uuid,
        ledger_transaction_id: Uuid,
        actual_cost: Decimal,
    ) -> Result<ConsumptionRequest, BillingError> {
        let mut request = self
            .requests
            .get_mut(&request_id)
            .ok_or(BillingError::RequestNotFound(request_id))?;
        if request.status != ConsumptionStatus::Completed.as_str() {
            return Err(BillingError::InvalidRequest(
                "Only completed requests can be settled".to_string(),
            ));
        }
        request.ledger_transaction_id = Some(ledger_transaction_id);
        request.actual_cost = Some(actual_cost);
        request.settled = true;
        Ok(request.clone())
    }

    async fn insert_recharge_order(&self, order: &RechargeOrder) -> Result<(), BillingError> {
        match self.orders.entry(order.gateway_order_id.clone()) {
            Entry::Occupied(_) => Err(BillingError::InvalidRequest(
                "Recharge order already exists".to_string(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(order.clone());
                Ok(())
            }
        }
    }

    async fn get_recharge_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<RechargeOrder>, BillingError> {
        Ok(self.orders.get(gateway_order_id).map(|o| o.value().clone()))
    }

    async fn mark_recharge_order_paid(
        &self,
        gateway_order_id: &str,
        payment_id: &str,
    ) -> Result<(), BillingError> {
        if let Some(mut order) = self.orders.get_mut(gateway_order_id) {
            if !order.is_paid() {
                order.status = RechargeOrderStatus::Paid.as_str().to_string();
                order.payment_id = Some(payment_id.to_string());
                order.paid_utc = Some(Utc::now());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::posting::opening_transaction;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    async fn store_with_wallet(balance: &str) -> (MemoryLedgerStore, Uuid) {
        let store = MemoryLedgerStore::new();
        let account_id = Uuid::new_v4();
        let wallet = Wallet::open(account_id, Decimal::ZERO);
        let opening = opening_transaction(&wallet);
        store.create_wallet(wallet, opening).await.unwrap();
        if balance != "0" {
            store
                .post(
                    account_id,
                    &WalletMutation::PromotionalCredit {
                        amount: d(balance),
                        description: "seed".to_string(),
                    },
                    &CostModel::new(d("1.00")),
                )
                .await
                .unwrap();
        }
        (store, account_id)
    }

    #[tokio::test]
    async fn test_create_wallet_is_idempotent() {
        let store = MemoryLedgerStore::new();
        let account_id = Uuid::new_v4();
        let first = Wallet::open(account_id, d("10"));
        let (created, is_new) = store
            .create_wallet(first.clone(), opening_transaction(&first))
            .await
            .unwrap();
        assert!(is_new);

        let second = Wallet::open(account_id, d("10"));
        let (existing, is_new) = store
            .create_wallet(second.clone(), opening_transaction(&second))
            .await
            .unwrap();
        assert!(!is_new);
        assert_eq!(existing.wallet_id, created.wallet_id);
        assert_eq!(store.all_transactions(account_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_payment_reference_is_global() {
        let (store, a) = store_with_wallet("0").await;
        let b = Uuid::new_v4();
        let wallet_b = Wallet::open(b, Decimal::ZERO);
        store
            .create_wallet(wallet_b.clone(), opening_transaction(&wallet_b))
            .await
            .unwrap();

        let recharge = WalletMutation::Recharge {
            amount: d("10"),
            payment_reference: "pay_shared".to_string(),
            gateway_order_id: None,
        };
        let model = CostModel::new(d("1.00"));
        store.post(a, &recharge, &model).await.unwrap();
        let err = store.post(b, &recharge, &model).await.unwrap_err();
        assert!(matches!(err, BillingError::DuplicatePaymentReference(_)));
    }

    #[tokio::test]
    async fn test_injected_contention_fails_once_per_unit() {
        let (store, account_id) = store_with_wallet("10").await;
        store.inject_contention(1);
        let debit = WalletMutation::Debit {
            requested_units: d("1"),
            consumption_request_id: None,
        };
        let model = CostModel::new(d("1.00"));
        assert!(matches!(
            store.post(account_id, &debit, &model).await,
            Err(BillingError::Contention(_))
        ));
        assert!(store.post(account_id, &debit, &model).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_transactions_newest_first_with_cursor() {
        let (store, account_id) = store_with_wallet("10").await;
        let filter = ListTransactionsFilter {
            page_size: 10,
            ..Default::default()
        };
        let rows = store.list_transactions(account_id, &filter).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].sequence_no > rows[1].sequence_no);

        let next_page = ListTransactionsFilter {
            page_size: 10,
            page_token: Some(rows[0].sequence_no),
            ..Default::default()
        };
        let rows = store.list_transactions(account_id, &next_page).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
