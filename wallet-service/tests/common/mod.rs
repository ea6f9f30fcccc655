//! Common test utilities for wallet-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::retry::RetryConfig;
use service_core::utils::signature::hmac_sha256_hex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use uuid::Uuid;
use wallet_service::config::WorkerConfig;
use wallet_service::models::{Language, NewConsumptionRequest};
use wallet_service::services::providers::mock::MockTranscriptionProvider;
use wallet_service::services::providers::TranscriptionOutcome;
use wallet_service::services::razorpay::GatewayOrder;
use wallet_service::services::{
    BillingEngine, BillingError, ConsumptionOrchestrator, ConsumptionWorkerPool, CostModel,
    MemoryLedgerStore, PaymentGateway, PaymentVerifier, RechargeService, UsagePolicy,
};
use wallet_service::startup::AppState;

pub const KEY_SECRET: &str = "test_key_secret";
pub const WEBHOOK_SECRET: &str = "test_webhook_secret";
pub const KEY_ID: &str = "rzp_test_key";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,wallet_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn d(s: &str) -> Decimal {
    s.parse().expect("valid decimal literal")
}

/// Gateway stand-in that mints sequential order ids.
#[derive(Default)]
pub struct MockGateway {
    orders: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
        _notes: serde_json::Value,
    ) -> Result<GatewayOrder, BillingError> {
        let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayOrder {
            id: format!("order_test_{}", n),
            amount: amount_minor,
            currency: currency.to_string(),
            receipt: Some(receipt.to_string()),
            status: "created".to_string(),
        })
    }

    fn key_id(&self) -> &str {
        KEY_ID
    }
}

pub fn sign_payment(order_id: &str, payment_id: &str) -> String {
    hmac_sha256_hex(
        KEY_SECRET.as_bytes(),
        format!("{}|{}", order_id, payment_id).as_bytes(),
    )
    .expect("hmac accepts any key")
}

pub fn sign_webhook(body: &[u8]) -> String {
    hmac_sha256_hex(WEBHOOK_SECRET.as_bytes(), body).expect("hmac accepts any key")
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..RetryConfig::lock_contention()
    }
}

/// In-process wiring over the memory store: price 1.00 per minute and a
/// 10 minute welcome grant.
pub struct TestHarness {
    pub store: Arc<MemoryLedgerStore>,
    pub billing: Arc<BillingEngine>,
    pub provider: Arc<MockTranscriptionProvider>,
    pub recharge: Arc<RechargeService>,
    pub orchestrator: Arc<ConsumptionOrchestrator>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_provider(MockTranscriptionProvider::succeeding())
    }

    pub fn with_provider(provider: MockTranscriptionProvider) -> Self {
        init_tracing();

        let store = Arc::new(MemoryLedgerStore::new());
        let billing = Arc::new(BillingEngine::new(
            store.clone(),
            CostModel::new(d("1.00")),
            UsagePolicy::default(),
            fast_retry(),
        ));
        let recharge = Arc::new(RechargeService::new(
            billing.clone(),
            Arc::new(MockGateway::default()),
            PaymentVerifier::new(
                Secret::new(KEY_SECRET.to_string()),
                Secret::new(WEBHOOK_SECRET.to_string()),
            ),
        ));
        let provider = Arc::new(provider);
        let orchestrator = Arc::new(ConsumptionOrchestrator::new(
            billing.clone(),
            provider.clone(),
            Duration::from_millis(500),
        ));

        Self {
            store,
            billing,
            provider,
            recharge,
            orchestrator,
        }
    }

    /// Open a wallet and credit `balance` as promotional credit.
    pub async fn funded_wallet(&self, balance: &str) -> Uuid {
        let account_id = Uuid::new_v4();
        self.billing
            .open_wallet(account_id)
            .await
            .expect("Failed to open wallet");
        if d(balance) > Decimal::ZERO {
            self.billing
                .grant_promotional_credit(account_id, d(balance), "Test funding")
                .await
                .expect("Failed to fund wallet");
        }
        account_id
    }

    /// A small worker pool whose settlement loop effectively never fires.
    pub fn worker_pool(&self) -> Arc<ConsumptionWorkerPool> {
        Arc::new(ConsumptionWorkerPool::start(
            self.orchestrator.clone(),
            &WorkerConfig {
                count: 2,
                queue_size: 16,
                reconcile_interval_secs: 3600,
                reconcile_batch: 10,
                drain_timeout_secs: 5,
            },
        ))
    }

    /// State for the HTTP router, with a small worker pool.
    pub fn app_state(&self) -> AppState {
        AppState {
            billing: self.billing.clone(),
            recharge: self.recharge.clone(),
            orchestrator: self.orchestrator.clone(),
            workers: self.worker_pool(),
        }
    }
}

pub fn transcription(units: &str) -> NewConsumptionRequest {
    NewConsumptionRequest {
        source_handle: "uploads/interview.mp3".to_string(),
        source_format: "mp3".to_string(),
        requested_units: d(units),
        language: Language::English,
    }
}

pub fn failing_provider(outcome: TranscriptionOutcome) -> MockTranscriptionProvider {
    MockTranscriptionProvider::failing(outcome)
}
