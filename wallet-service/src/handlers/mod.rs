//! HTTP handlers for wallet-service.

pub mod history;
pub mod payments;
pub mod transcriptions;
pub mod wallet;
