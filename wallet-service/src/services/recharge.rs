//! Wallet recharge flow: gateway order creation, checkout confirmation and
//! webhook delivery. Only verified payments reach the ledger.

use crate::models::{LedgerTransaction, RechargeIntent, RechargeOrder};
use crate::services::billing::BillingEngine;
use crate::services::error::BillingError;
use crate::services::razorpay::{PaymentConfirmation, PaymentGateway, PaymentVerifier, WebhookEvent};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of a webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Applied(Uuid),
    /// Event type carries no payment to apply.
    Ignored,
}

pub struct RechargeService {
    billing: Arc<BillingEngine>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: PaymentVerifier,
}

impl RechargeService {
    pub fn new(
        billing: Arc<BillingEngine>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: PaymentVerifier,
    ) -> Self {
        Self {
            billing,
            gateway,
            verifier,
        }
    }

    /// Create a gateway order for `amount` and remember it against the account.
    #[instrument(skip(self))]
    pub async fn create_recharge_intent(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> Result<RechargeIntent, BillingError> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidRequest(
                "Recharge amount must be positive".to_string(),
            ));
        }
        if amount.round_dp(2) != amount {
            return Err(BillingError::InvalidRequest(
                "Recharge amount has more than two decimal places".to_string(),
            ));
        }
        // The wallet must exist before money can be taken for it.
        self.billing.get_wallet(account_id).await?;

        let amount_minor = to_minor_units(amount)?;
        let currency = self.billing.policy().currency.clone();
        let receipt = format!("wallet_{}", account_id.simple());
        let notes = serde_json::json!({ "account_id": account_id.to_string() });

        let order = self
            .gateway
            .create_order(amount_minor, &currency, &receipt, notes)
            .await?;

        if order.amount != amount_minor {
            return Err(BillingError::Gateway(format!(
                "Order {} amount {} does not match requested {}",
                order.id, order.amount, amount_minor
            )));
        }

        let record = RechargeOrder::new(order.id.clone(), account_id, amount, currency.clone());
        self.billing.store().insert_recharge_order(&record).await?;

        info!(order_id = %order.id, amount = %amount, "Recharge order created");

        Ok(RechargeIntent {
            order_id: order.id,
            amount,
            amount_minor: amount_minor as i64,
            currency,
            key_id: self.gateway.key_id().to_string(),
        })
    }

    /// Apply a checkout confirmation. The signature is checked before anything
    /// else; a replayed confirmation returns the original transaction.
    #[instrument(skip(self, confirmation), fields(order_id = %confirmation.order_id))]
    pub async fn apply_recharge(
        &self,
        account_id: Uuid,
        confirmation: &PaymentConfirmation,
        amount: Decimal,
    ) -> Result<LedgerTransaction, BillingError> {
        if !self.verifier.verify_payment(confirmation) {
            return Err(BillingError::Verification(format!(
                "Signature mismatch for order {}",
                confirmation.order_id
            )));
        }

        let order = self.load_order(&confirmation.order_id).await?;
        if order.account_id != account_id {
            warn!(
                target: "wallet::security",
                order_id = %order.gateway_order_id,
                account_id = %account_id,
                "Confirmation for an order owned by another account"
            );
            return Err(BillingError::Verification(
                "Order does not belong to this account".to_string(),
            ));
        }
        if order.amount != amount {
            warn!(
                target: "wallet::security",
                order_id = %order.gateway_order_id,
                claimed = %amount,
                expected = %order.amount,
                "Confirmed amount does not match order"
            );
            return Err(BillingError::Verification(
                "Amount does not match order".to_string(),
            ));
        }

        self.settle(&order, &confirmation.payment_id).await
    }

    /// Apply a signed webhook delivery. Unknown events are acknowledged and ignored.
    #[instrument(skip(self, body, signature))]
    pub async fn apply_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, BillingError> {
        if !self.verifier.verify_webhook(body, signature) {
            return Err(BillingError::Verification(
                "Webhook signature mismatch".to_string(),
            ));
        }

        let event = WebhookEvent::parse(body)?;
        let Some((order_id, payment_id)) = event.captured_payment() else {
            info!(event = %event.event, "Ignoring webhook event");
            return Ok(WebhookOutcome::Ignored);
        };

        let order = self.load_order(&order_id).await?;
        if let Some(payment) = event.payload.payment.as_ref() {
            let expected = to_minor_units(order.amount)?;
            if payment.entity.amount != expected {
                warn!(
                    target: "wallet::security",
                    order_id = %order_id,
                    paid = payment.entity.amount,
                    expected,
                    "Webhook amount does not match order"
                );
                return Err(BillingError::Verification(
                    "Amount does not match order".to_string(),
                ));
            }
        }

        let transaction = self.settle(&order, &payment_id).await?;
        Ok(WebhookOutcome::Applied(transaction.transaction_id))
    }

    async fn load_order(&self, order_id: &str) -> Result<RechargeOrder, BillingError> {
        self.billing
            .store()
            .get_recharge_order(order_id)
            .await?
            .ok_or_else(|| {
                warn!(target: "wallet::security", order_id = %order_id, "Payment for unknown order");
                BillingError::Verification(format!("Unknown order {}", order_id))
            })
    }

    async fn settle(
        &self,
        order: &RechargeOrder,
        payment_id: &str,
    ) -> Result<LedgerTransaction, BillingError> {
        if let Some(paid_with) = order.payment_id.as_deref() {
            if order.is_paid() && paid_with != payment_id {
                warn!(
                    target: "wallet::security",
                    order_id = %order.gateway_order_id,
                    paid_with = %paid_with,
                    payment_id = %payment_id,
                    "Second payment presented for an already paid order"
                );
                return Err(BillingError::Verification(
                    "Order is already paid".to_string(),
                ));
            }
        }

        let transaction = self
            .billing
            .credit(
                order.account_id,
                order.amount,
                payment_id,
                Some(&order.gateway_order_id),
            )
            .await?;
        self.billing
            .store()
            .mark_recharge_order_paid(&order.gateway_order_id, payment_id)
            .await?;
        Ok(transaction)
    }
}

/// Major units to the gateway's smallest unit (paise for INR).
pub fn to_minor_units(amount: Decimal) -> Result<u64, BillingError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp(0)
        .to_u64()
        .ok_or_else(|| BillingError::InvalidRequest(format!("Amount {} out of range", amount)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_minor_units() {
        let d = |s: &str| Decimal::from_str(s).unwrap();
        assert_eq!(to_minor_units(d("50")).unwrap(), 5000);
        assert_eq!(to_minor_units(d("12.34")).unwrap(), 1234);
        assert!(to_minor_units(d("-1")).is_err());
    }
}
