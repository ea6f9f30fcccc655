//! Billing engine integration tests: debits, credits, admission and audit.

mod common;

use common::{d, TestHarness};
use std::sync::Arc;
use uuid::Uuid;
use wallet_service::models::{ListTransactionsFilter, TransactionType};
use wallet_service::services::BillingError;

#[tokio::test]
async fn debit_uses_free_allowance_before_balance() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("100.00").await;

    let receipt = harness
        .billing
        .debit(account, d("15.0"), None)
        .await
        .expect("debit should succeed");

    assert_eq!(receipt.actual_cost, d("5.00"));
    assert_eq!(receipt.transaction.amount, d("5.00"));
    assert_eq!(receipt.transaction.balance_before, d("100.00"));
    assert_eq!(receipt.transaction.balance_after, d("95.00"));
    assert_eq!(receipt.transaction.free_allowance_before, d("10"));
    assert_eq!(receipt.transaction.free_allowance_after, d("0"));
    assert_eq!(receipt.transaction.parsed_type(), Some(TransactionType::Debit));

    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("95.00"));
    assert_eq!(wallet.free_allowance_remaining, d("0.00"));
    assert_eq!(wallet.lifetime_spent, d("5.00"));
    assert_eq!(wallet.lifetime_units_consumed, d("15"));
}

#[tokio::test]
async fn unaffordable_request_is_refused_without_mutation() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("100.00").await;

    let affordability = harness
        .billing
        .check_affordability(account, d("150.0"))
        .await
        .unwrap();
    assert!(!affordability.allowed);
    assert_eq!(affordability.estimated_cost, d("140.00"));

    let err = harness
        .billing
        .debit(account, d("150.0"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InsufficientFunds { .. }));

    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("100.00"));
    assert_eq!(wallet.free_allowance_remaining, d("10"));
}

#[tokio::test]
async fn affordability_within_free_allowance_costs_nothing() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;

    let affordability = harness
        .billing
        .check_affordability(account, d("10"))
        .await
        .unwrap();
    assert!(affordability.allowed);
    assert_eq!(affordability.estimated_cost, d("0"));

    let over = harness
        .billing
        .check_affordability(account, d("10.5"))
        .await
        .unwrap();
    assert!(!over.allowed);
    assert_eq!(over.estimated_cost, d("1.00"));
}

#[tokio::test]
async fn recharge_is_idempotent_by_payment_reference() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("100.00").await;
    harness.billing.debit(account, d("15"), None).await.unwrap();

    let first = harness
        .billing
        .credit(account, d("50.00"), "pay_X", None)
        .await
        .unwrap();
    assert_eq!(first.balance_after, d("145.00"));
    assert_eq!(first.external_payment_reference.as_deref(), Some("pay_X"));

    let second = harness
        .billing
        .credit(account, d("50.00"), "pay_X", None)
        .await
        .unwrap();
    assert_eq!(second.transaction_id, first.transaction_id);

    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("145.00"));

    let recharges = harness
        .billing
        .list_transactions(
            account,
            &ListTransactionsFilter {
                transaction_type: Some(TransactionType::Recharge),
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(recharges.len(), 1);
}

#[tokio::test]
async fn payment_reference_cannot_credit_two_accounts() {
    let harness = TestHarness::new();
    let first = harness.funded_wallet("0").await;
    let second = harness.funded_wallet("0").await;

    harness
        .billing
        .credit(first, d("20"), "pay_shared", None)
        .await
        .unwrap();
    let err = harness
        .billing
        .credit(second, d("20"), "pay_shared", None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::DuplicatePaymentReference(_)));

    let wallet = harness.billing.get_wallet(second).await.unwrap();
    assert_eq!(wallet.balance, d("0"));
}

#[tokio::test]
async fn fractional_units_bill_a_whole_unit() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("5.00").await;
    // Spend the free allowance first.
    harness.billing.debit(account, d("10"), None).await.unwrap();

    let receipt = harness.billing.debit(account, d("0.3"), None).await.unwrap();
    assert_eq!(receipt.actual_cost, d("1.00"));
    assert_eq!(receipt.wallet.balance, d("4.00"));
    assert_eq!(receipt.wallet.lifetime_units_consumed, d("11"));
}

#[tokio::test]
async fn free_allowance_is_never_exceeded() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;

    // 9.5 rounds up to 10 and consumes the whole allowance.
    let receipt = harness.billing.debit(account, d("9.5"), None).await.unwrap();
    assert_eq!(receipt.actual_cost, d("0"));
    assert_eq!(receipt.wallet.free_allowance_remaining, d("0"));

    let err = harness
        .billing
        .debit(account, d("1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InsufficientFunds { .. }));
}

#[tokio::test]
async fn concurrent_debits_never_overdraw() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("10.00").await;
    let billing = Arc::clone(&harness.billing);

    let mut handles = Vec::new();
    for _ in 0..30 {
        let billing = Arc::clone(&billing);
        handles.push(tokio::spawn(async move {
            billing.debit(account, d("1"), None).await
        }));
    }

    let mut succeeded = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(BillingError::InsufficientFunds { .. }) => refused += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    // 10 free units then 10 paid units.
    assert_eq!(succeeded, 20);
    assert_eq!(refused, 10);

    let wallet = billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("0"));
    assert_eq!(wallet.free_allowance_remaining, d("0"));

    let audit = billing.audit(account).await.unwrap();
    assert!(audit.consistent);
    assert!(audit.chain_intact);
}

#[tokio::test]
async fn contention_is_retried_transparently() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("100.00").await;

    harness.store.inject_contention(2);
    let receipt = harness.billing.debit(account, d("15"), None).await.unwrap();
    assert_eq!(receipt.wallet.balance, d("95.00"));

    harness.store.inject_contention(3);
    let err = harness
        .billing
        .debit(account, d("1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Contention(_)));

    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("95.00"));
}

#[tokio::test]
async fn audit_replays_every_posting() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("100.00").await;
    harness.billing.debit(account, d("15"), None).await.unwrap();
    harness
        .billing
        .credit(account, d("50"), "pay_audit", Some("order_audit"))
        .await
        .unwrap();

    let audit = harness.billing.audit(account).await.unwrap();
    // Opening grant, funding, debit, recharge.
    assert_eq!(audit.transaction_count, 4);
    assert_eq!(audit.replayed_balance, d("145.00"));
    assert_eq!(audit.wallet_balance, d("145.00"));
    assert!(audit.consistent);
}

#[tokio::test]
async fn opening_a_wallet_twice_returns_the_same_wallet() {
    let harness = TestHarness::new();
    let account = Uuid::new_v4();

    let first = harness.billing.open_wallet(account).await.unwrap();
    let second = harness.billing.open_wallet(account).await.unwrap();
    assert_eq!(first.wallet_id, second.wallet_id);
    assert_eq!(second.free_allowance_remaining, d("10"));

    let transactions = harness.store.as_ref();
    let all = wallet_service::services::LedgerStore::all_transactions(transactions, account)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn unknown_wallet_is_reported() {
    let harness = TestHarness::new();
    let err = harness
        .billing
        .debit(Uuid::new_v4(), d("1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::WalletNotFound(_)));
}
