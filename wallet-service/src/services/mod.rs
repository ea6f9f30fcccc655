//! Services module for wallet-service.

pub mod billing;
pub mod cost;
pub mod database;
pub mod error;
pub mod history;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod posting;
pub mod providers;
pub mod razorpay;
pub mod recharge;
pub mod store;
pub mod worker;

pub use billing::{Affordability, BillingEngine, DebitReceipt};
pub use cost::{CostModel, CostQuote};
pub use database::PgLedgerStore;
pub use error::BillingError;
pub use memory::MemoryLedgerStore;
pub use metrics::{get_metrics, init_metrics};
pub use orchestrator::{ConsumptionOrchestrator, SettlementReport, TranscriptDocument};
pub use policy::UsagePolicy;
pub use razorpay::{PaymentConfirmation, PaymentGateway, PaymentVerifier, RazorpayClient};
pub use recharge::{RechargeService, WebhookOutcome};
pub use store::LedgerStore;
pub use worker::ConsumptionWorkerPool;
