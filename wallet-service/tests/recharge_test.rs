//! Recharge flow integration tests: gateway orders, checkout verification
//! and webhook delivery.

mod common;

use common::{d, sign_payment, sign_webhook, TestHarness, KEY_ID};
use serde_json::json;
use uuid::Uuid;
use wallet_service::services::{BillingError, PaymentConfirmation, WebhookOutcome};

fn confirmation(order_id: &str, payment_id: &str) -> PaymentConfirmation {
    PaymentConfirmation {
        order_id: order_id.to_string(),
        payment_id: payment_id.to_string(),
        signature: sign_payment(order_id, payment_id),
    }
}

fn captured_webhook(order_id: &str, payment_id: &str, amount_minor: u64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "entity": "event",
        "event": "payment.captured",
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "amount": amount_minor,
                    "currency": "INR",
                    "status": "captured",
                    "order_id": order_id
                }
            }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn recharge_intent_creates_gateway_order() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;

    let intent = harness
        .recharge
        .create_recharge_intent(account, d("50.00"))
        .await
        .unwrap();

    assert_eq!(intent.amount_minor, 5000);
    assert_eq!(intent.currency, "INR");
    assert_eq!(intent.key_id, KEY_ID);

    // No ledger effect until payment.
    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("0"));
}

#[tokio::test]
async fn recharge_intent_rejects_non_positive_amounts() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;

    for amount in ["0", "-5", "10.005"] {
        let err = harness
            .recharge
            .create_recharge_intent(account, d(amount))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidRequest(_)), "amount {}", amount);
    }
}

#[tokio::test]
async fn verified_payment_credits_once() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;
    let intent = harness
        .recharge
        .create_recharge_intent(account, d("50.00"))
        .await
        .unwrap();

    let payment = confirmation(&intent.order_id, "pay_001");
    let first = harness
        .recharge
        .apply_recharge(account, &payment, d("50.00"))
        .await
        .unwrap();
    assert_eq!(first.balance_after, d("50.00"));
    assert_eq!(first.gateway_order_id.as_deref(), Some(intent.order_id.as_str()));

    let replay = harness
        .recharge
        .apply_recharge(account, &payment, d("50.00"))
        .await
        .unwrap();
    assert_eq!(replay.transaction_id, first.transaction_id);

    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("50.00"));
}

#[tokio::test]
async fn forged_signature_never_reaches_the_ledger() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;
    let intent = harness
        .recharge
        .create_recharge_intent(account, d("50.00"))
        .await
        .unwrap();

    let forged = PaymentConfirmation {
        order_id: intent.order_id.clone(),
        payment_id: "pay_forged".to_string(),
        signature: sign_payment(&intent.order_id, "pay_other"),
    };
    let err = harness
        .recharge
        .apply_recharge(account, &forged, d("50.00"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Verification(_)));

    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("0"));
}

#[tokio::test]
async fn confirmation_must_match_order_owner_and_amount() {
    let harness = TestHarness::new();
    let owner = harness.funded_wallet("0").await;
    let intruder = harness.funded_wallet("0").await;
    let intent = harness
        .recharge
        .create_recharge_intent(owner, d("50.00"))
        .await
        .unwrap();
    let payment = confirmation(&intent.order_id, "pay_002");

    let err = harness
        .recharge
        .apply_recharge(intruder, &payment, d("50.00"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Verification(_)));

    let err = harness
        .recharge
        .apply_recharge(owner, &payment, d("500.00"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Verification(_)));

    let unknown = confirmation("order_missing", "pay_003");
    let err = harness
        .recharge
        .apply_recharge(owner, &unknown, d("50.00"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Verification(_)));

    for account in [owner, intruder] {
        let wallet = harness.billing.get_wallet(account).await.unwrap();
        assert_eq!(wallet.balance, d("0"));
    }
}

#[tokio::test]
async fn paid_order_rejects_a_second_payment() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;
    let intent = harness
        .recharge
        .create_recharge_intent(account, d("50.00"))
        .await
        .unwrap();

    harness
        .recharge
        .apply_recharge(account, &confirmation(&intent.order_id, "pay_010"), d("50.00"))
        .await
        .unwrap();

    let err = harness
        .recharge
        .apply_recharge(account, &confirmation(&intent.order_id, "pay_011"), d("50.00"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Verification(_)));

    let body = captured_webhook(&intent.order_id, "pay_012", 5000);
    let err = harness
        .recharge
        .apply_webhook(&body, &sign_webhook(&body))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Verification(_)));

    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("50.00"));
}

#[tokio::test]
async fn webhook_and_checkout_credit_once_between_them() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;
    let intent = harness
        .recharge
        .create_recharge_intent(account, d("75.00"))
        .await
        .unwrap();

    let body = captured_webhook(&intent.order_id, "pay_004", 7500);
    let outcome = harness
        .recharge
        .apply_webhook(&body, &sign_webhook(&body))
        .await
        .unwrap();
    let WebhookOutcome::Applied(webhook_tx) = outcome else {
        panic!("expected the webhook to apply a payment");
    };

    let checkout = harness
        .recharge
        .apply_recharge(account, &confirmation(&intent.order_id, "pay_004"), d("75.00"))
        .await
        .unwrap();
    assert_eq!(checkout.transaction_id, webhook_tx);

    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("75.00"));
}

#[tokio::test]
async fn webhook_requires_valid_signature() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;
    let intent = harness
        .recharge
        .create_recharge_intent(account, d("20.00"))
        .await
        .unwrap();

    let body = captured_webhook(&intent.order_id, "pay_005", 2000);
    let err = harness
        .recharge
        .apply_webhook(&body, "deadbeef")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Verification(_)));

    let wallet = harness.billing.get_wallet(account).await.unwrap();
    assert_eq!(wallet.balance, d("0"));
}

#[tokio::test]
async fn webhook_amount_must_match_order() {
    let harness = TestHarness::new();
    let account = harness.funded_wallet("0").await;
    let intent = harness
        .recharge
        .create_recharge_intent(account, d("20.00"))
        .await
        .unwrap();

    let body = captured_webhook(&intent.order_id, "pay_006", 200000);
    let err = harness
        .recharge
        .apply_webhook(&body, &sign_webhook(&body))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Verification(_)));
}

#[tokio::test]
async fn unrelated_webhook_events_are_ignored() {
    let harness = TestHarness::new();
    let body = serde_json::to_vec(&json!({
        "event": "refund.created",
        "payload": {}
    }))
    .unwrap();

    let outcome = harness
        .recharge
        .apply_webhook(&body, &sign_webhook(&body))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Ignored);
}

#[tokio::test]
async fn malformed_webhook_is_a_bad_request() {
    let harness = TestHarness::new();
    let body = b"{not json".to_vec();

    let err = harness
        .recharge
        .apply_webhook(&body, &sign_webhook(&body))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidRequest(_)));
}

#[tokio::test]
async fn recharge_requires_an_open_wallet() {
    let harness = TestHarness::new();
    let err = harness
        .recharge
        .create_recharge_intent(Uuid::new_v4(), d("10"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::WalletNotFound(_)));
}
