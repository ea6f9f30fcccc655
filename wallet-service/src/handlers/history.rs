//! Merged account history.

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use service_core::error::AppError;

use crate::{
    middleware::AccountContext,
    models::{ConsumptionStatus, Language, TransactionType},
    services::history::{account_history, HistoryEntry, HistoryFilter, HistoryKind},
    startup::AppState,
};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub kind: Option<String>,
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    pub status: Option<ConsumptionStatus>,
    pub language: Option<Language>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn get_history(
    State(state): State<AppState>,
    account: AccountContext,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    let kind = match query.kind.as_deref() {
        None | Some("") | Some("all") => None,
        Some(raw) => Some(HistoryKind::parse(raw).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Unknown history kind '{}'", raw))
        })?),
    };

    let filter = HistoryFilter {
        kind,
        transaction_type: query.transaction_type,
        status: query.status,
        language: query.language,
        date_from: query.date_from,
        date_to: query.date_to,
        limit: query.limit.unwrap_or_default(),
    };

    let store = state.billing.store().as_ref();
    let entries = account_history(store, account.account_id, &filter).await?;
    Ok(Json(entries))
}
