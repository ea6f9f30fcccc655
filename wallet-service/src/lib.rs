//! Wallet Service - prepaid wallet ledger with priority-tiered billing for
//! metered transcription.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
