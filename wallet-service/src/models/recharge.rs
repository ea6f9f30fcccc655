//! Recharge order model: a gateway order awaiting payment.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RechargeOrderStatus {
    Created,
    Paid,
}

impl RechargeOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Paid => "paid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct RechargeOrder {
    pub gateway_order_id: String,
    pub account_id: Uuid,
    /// Major currency units.
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_id: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub paid_utc: Option<DateTime<Utc>>,
}

impl RechargeOrder {
    pub fn new(gateway_order_id: String, account_id: Uuid, amount: Decimal, currency: String) -> Self {
        Self {
            gateway_order_id,
            account_id,
            amount,
            currency,
            status: RechargeOrderStatus::Created.as_str().to_string(),
            payment_id: None,
            created_utc: Utc::now(),
            paid_utc: None,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.status == RechargeOrderStatus::Paid.as_str()
    }
}

/// Checkout details returned to the client after order creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechargeIntent {
    pub order_id: String,
    pub amount: Decimal,
    /// Amount in minor units as sent to the gateway.
    pub amount_minor: i64,
    pub currency: String,
    pub key_id: String,
}
