//! Domain models for wallet-service.

mod consumption;
mod recharge;
mod transaction;
mod wallet;

pub use consumption::{
    ConsumptionCompletion, ConsumptionRequest, ConsumptionStatus, Language, ListConsumptionFilter,
    NewConsumptionRequest,
};
pub use recharge::{RechargeIntent, RechargeOrder, RechargeOrderStatus};
pub use transaction::{
    LedgerTransaction, ListTransactionsFilter, NewLedgerTransaction, TransactionType,
};
pub use wallet::{LedgerAudit, UsageStatistics, Wallet};
