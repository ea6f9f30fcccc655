//! Transcription request handlers.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    middleware::AccountContext,
    models::{
        ConsumptionRequest, ConsumptionStatus, Language, ListConsumptionFilter,
        NewConsumptionRequest,
    },
    services::BillingError,
    startup::AppState,
};

#[derive(Debug, Serialize)]
pub struct CreateTranscriptionResponse {
    pub request: ConsumptionRequest,
    /// False when the work queue was full; call the run endpoint to retry.
    pub queued: bool,
}

/// Admit and record a transcription request, then queue it for processing.
pub async fn create_transcription(
    State(state): State<AppState>,
    account: AccountContext,
    Json(payload): Json<NewConsumptionRequest>,
) -> Result<(StatusCode, Json<CreateTranscriptionResponse>), AppError> {
    let request = state
        .orchestrator
        .create_consumption_request(account.account_id, &payload)
        .await?;

    let queued = match state.workers.enqueue(request.request_id) {
        Ok(()) => true,
        Err(BillingError::QueueFull) => false,
        Err(e) => return Err(e.into()),
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateTranscriptionResponse { request, queued }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListTranscriptionsQuery {
    pub status: Option<ConsumptionStatus>,
    pub language: Option<Language>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_transcriptions(
    State(state): State<AppState>,
    account: AccountContext,
    Query(query): Query<ListTranscriptionsQuery>,
) -> Result<Json<Vec<ConsumptionRequest>>, AppError> {
    let filter = ListConsumptionFilter {
        status: query.status,
        language: query.language,
        date_from: query.date_from,
        date_to: query.date_to,
        limit: query.limit.unwrap_or(50),
    };
    let requests = state.orchestrator.list(account.account_id, &filter).await?;
    Ok(Json(requests))
}

pub async fn get_transcription(
    State(state): State<AppState>,
    account: AccountContext,
    Path(request_id): Path<Uuid>,
) -> Result<Json<ConsumptionRequest>, AppError> {
    Ok(Json(
        state.orchestrator.get(account.account_id, request_id).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    /// Run in the request instead of queueing.
    #[serde(default)]
    pub wait: bool,
}

/// Start processing a pending request.
pub async fn run_transcription(
    State(state): State<AppState>,
    account: AccountContext,
    Path(request_id): Path<Uuid>,
    Query(query): Query<RunQuery>,
) -> Result<(StatusCode, Json<ConsumptionRequest>), AppError> {
    let request = state.orchestrator.get(account.account_id, request_id).await?;
    if request.parsed_status() != Some(ConsumptionStatus::Pending) {
        return Err(BillingError::InvalidTransition {
            from: request.status,
            to: ConsumptionStatus::InProgress,
        }
        .into());
    }

    if query.wait {
        let finished = state.orchestrator.run(request_id).await?;
        return Ok((StatusCode::OK, Json(finished)));
    }

    state.workers.enqueue(request_id)?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

/// Download a completed transcript as a text file.
pub async fn download_transcription(
    State(state): State<AppState>,
    account: AccountContext,
    Path(request_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let document = state
        .orchestrator
        .download(account.account_id, request_id)
        .await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", document.file_name),
            ),
        ],
        document.content,
    ))
}
