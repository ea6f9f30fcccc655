//! Wallet handlers: opening, balance, admission and the transaction ledger.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

use crate::{
    middleware::AccountContext,
    models::{
        LedgerAudit, LedgerTransaction, ListTransactionsFilter, TransactionType, UsageStatistics,
        Wallet,
    },
    services::Affordability,
    startup::AppState,
};

const DEFAULT_PAGE_SIZE: i32 = 20;

#[derive(Debug, Serialize)]
pub struct WalletResponse {
    pub wallet: Wallet,
    pub statistics: UsageStatistics,
}

/// Open the caller's wallet. Idempotent.
pub async fn open_wallet(
    State(state): State<AppState>,
    account: AccountContext,
) -> Result<(StatusCode, Json<WalletResponse>), AppError> {
    let wallet = state.billing.open_wallet(account.account_id).await?;
    let statistics = wallet.statistics();
    Ok((StatusCode::CREATED, Json(WalletResponse { wallet, statistics })))
}

pub async fn get_wallet(
    State(state): State<AppState>,
    account: AccountContext,
) -> Result<Json<WalletResponse>, AppError> {
    let wallet = state.billing.get_wallet(account.account_id).await?;
    let statistics = wallet.statistics();
    Ok(Json(WalletResponse { wallet, statistics }))
}

pub async fn audit_wallet(
    State(state): State<AppState>,
    account: AccountContext,
) -> Result<Json<LedgerAudit>, AppError> {
    Ok(Json(state.billing.audit(account.account_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AdmissionRequest {
    pub units: Decimal,
}

/// Advisory affordability check for a prospective request.
pub async fn check_admission(
    State(state): State<AppState>,
    account: AccountContext,
    Json(payload): Json<AdmissionRequest>,
) -> Result<Json<Affordability>, AppError> {
    let affordability = state
        .orchestrator
        .admit(account.account_id, payload.units)
        .await?;
    Ok(Json(affordability))
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub page_size: Option<i32>,
    pub page_token: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<LedgerTransaction>,
    /// Pass as `page_token` to fetch the next (older) page.
    pub next_page_token: Option<i64>,
}

pub async fn list_transactions(
    State(state): State<AppState>,
    account: AccountContext,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionsResponse>, AppError> {
    let filter = ListTransactionsFilter {
        transaction_type: query.transaction_type,
        date_from: query.date_from,
        date_to: query.date_to,
        page_size: query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        page_token: query.page_token,
    };

    let transactions = state
        .billing
        .list_transactions(account.account_id, &filter)
        .await?;

    let next_page_token = if transactions.len() as i64 == filter.limit() {
        transactions.last().map(|t| t.sequence_no)
    } else {
        None
    };

    Ok(Json(TransactionsResponse {
        transactions,
        next_page_token,
    }))
}
