//! Consumption orchestration: admission, the provider call, and settlement.
//!
//! A request is charged only after the provider returns a transcript. The
//! wallet lock is never held across the provider call.

use crate::models::{
    ConsumptionCompletion, ConsumptionRequest, ConsumptionStatus, ListConsumptionFilter,
    NewConsumptionRequest,
};
use crate::services::billing::{Affordability, BillingEngine};
use crate::services::error::BillingError;
use crate::services::metrics::{
    CONSUMPTION_OUTCOMES_TOTAL, SETTLEMENTS_TOTAL, UNSETTLED_COMPLETIONS_TOTAL,
};
use crate::services::providers::{TranscriptionJob, TranscriptionOutcome, TranscriptionProvider};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Counts from one settlement sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettlementReport {
    pub attempted: usize,
    pub settled: usize,
    pub failed: usize,
}

/// Rendered transcript for download.
#[derive(Debug, Clone)]
pub struct TranscriptDocument {
    pub file_name: String,
    pub content: String,
}

pub struct ConsumptionOrchestrator {
    billing: Arc<BillingEngine>,
    provider: Arc<dyn TranscriptionProvider>,
    provider_timeout: Duration,
}

impl ConsumptionOrchestrator {
    pub fn new(
        billing: Arc<BillingEngine>,
        provider: Arc<dyn TranscriptionProvider>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            billing,
            provider,
            provider_timeout,
        }
    }

    pub fn billing(&self) -> &Arc<BillingEngine> {
        &self.billing
    }

    /// Advisory admission check. Not a reservation.
    pub async fn admit(
        &self,
        account_id: Uuid,
        requested_units: Decimal,
    ) -> Result<Affordability, BillingError> {
        self.billing
            .check_affordability(account_id, requested_units)
            .await
    }

    /// Validate the source, check affordability and record a pending request.
    #[instrument(skip(self, input), fields(handle = %input.source_handle))]
    pub async fn create_consumption_request(
        &self,
        account_id: Uuid,
        input: &NewConsumptionRequest,
    ) -> Result<ConsumptionRequest, BillingError> {
        self.billing.policy().validate(input)?;

        let affordability = self.admit(account_id, input.requested_units).await?;
        if !affordability.allowed {
            CONSUMPTION_OUTCOMES_TOTAL
                .with_label_values(&["rejected"])
                .inc();
            return Err(BillingError::InsufficientFunds {
                required: affordability.estimated_cost,
                available: affordability.balance,
            });
        }

        let request = ConsumptionRequest::new(account_id, input, affordability.estimated_cost);
        self.billing
            .store()
            .insert_consumption_request(&request)
            .await?;

        info!(
            request_id = %request.request_id,
            requested_units = %request.requested_units,
            estimated_cost = %request.estimated_cost,
            "Consumption request created"
        );
        Ok(request)
    }

    /// Run the provider for a pending request and finalize it.
    ///
    /// Only one caller wins the `pending -> in_progress` transition; others
    /// get `InvalidTransition`.
    #[instrument(skip(self))]
    pub async fn run(&self, request_id: Uuid) -> Result<ConsumptionRequest, BillingError> {
        let request = self.billing.store().mark_in_progress(request_id).await?;

        let job = TranscriptionJob {
            source_handle: request.source_handle.clone(),
            source_format: request.source_format.clone(),
            language: request.parsed_language(),
        };

        let transcription = self.provider.transcribe(&job);
        let outcome = match tokio::time::timeout(self.provider_timeout, transcription).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    provider = self.provider.name(),
                    timeout_secs = self.provider_timeout.as_secs(),
                    "Transcription timed out"
                );
                TranscriptionOutcome::TransientError
            }
        };

        let completion = match outcome {
            TranscriptionOutcome::Success(text) => self.charge(&request, text).await,
            failure => {
                let message = failure
                    .sanitized_message()
                    .unwrap_or("Transcription failed due to an unexpected error.");
                warn!(outcome = failure.label(), "Transcription failed, no charge");
                CONSUMPTION_OUTCOMES_TOTAL
                    .with_label_values(&[failure.label()])
                    .inc();
                ConsumptionCompletion::Failed {
                    error_message: message.to_string(),
                }
            }
        };

        match self
            .billing
            .store()
            .complete_consumption_request(request_id, &completion)
            .await
        {
            Ok(finished) => {
                info!(status = %finished.status, settled = finished.settled, "Consumption request finished");
                Ok(finished)
            }
            Err(err) => {
                if let ConsumptionCompletion::Completed {
                    ledger_transaction_id: Some(transaction_id),
                    ..
                } = &completion
                {
                    error!(
                        target: "wallet::reconciliation",
                        request_id = %request_id,
                        transaction_id = %transaction_id,
                        error = %err,
                        "Debit committed but request could not be finalized"
                    );
                }
                Err(err)
            }
        }
    }

    /// Debit after a successful provider call. A failed debit still completes
    /// the request, unsettled, for later settlement.
    async fn charge(&self, request: &ConsumptionRequest, result_text: String) -> ConsumptionCompletion {
        match self
            .billing
            .debit(
                request.account_id,
                request.requested_units,
                Some(request.request_id),
            )
            .await
        {
            Ok(receipt) => {
                CONSUMPTION_OUTCOMES_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                ConsumptionCompletion::Completed {
                    result_text,
                    actual_cost: receipt.actual_cost,
                    ledger_transaction_id: Some(receipt.transaction.transaction_id),
                    settled: true,
                }
            }
            Err(err) => {
                let quoted = self.quote_now(request).await;
                error!(
                    target: "wallet::reconciliation",
                    request_id = %request.request_id,
                    account_id = %request.account_id,
                    requested_units = %request.requested_units,
                    quoted_cost = %quoted,
                    error = %err,
                    "Provider succeeded but debit failed; completing unsettled"
                );
                UNSETTLED_COMPLETIONS_TOTAL.inc();
                CONSUMPTION_OUTCOMES_TOTAL
                    .with_label_values(&["unsettled"])
                    .inc();
                ConsumptionCompletion::Completed {
                    result_text,
                    actual_cost: quoted,
                    ledger_transaction_id: None,
                    settled: false,
                }
            }
        }
    }

    async fn quote_now(&self, request: &ConsumptionRequest) -> Decimal {
        match self.billing.get_wallet(request.account_id).await {
            Ok(wallet) => self
                .billing
                .cost_model()
                .cost(request.requested_units, wallet.free_allowance_remaining),
            Err(_) => request.estimated_cost,
        }
    }

    /// Re-attempt the keyed debit for completed, unsettled requests.
    #[instrument(skip(self))]
    pub async fn settle_unsettled(&self, limit: i64) -> Result<SettlementReport, BillingError> {
        let pending = self.billing.store().list_unsettled(limit).await?;
        let mut report = SettlementReport::default();

        for request in pending {
            report.attempted += 1;
            let settled = async {
                let receipt = self
                    .billing
                    .debit(
                        request.account_id,
                        request.requested_units,
                        Some(request.request_id),
                    )
                    .await?;
                self.billing
                    .store()
                    .mark_settled(
                        request.request_id,
                        receipt.transaction.transaction_id,
                        receipt.actual_cost,
                    )
                    .await
            }
            .await;

            match settled {
                Ok(updated) => {
                    report.settled += 1;
                    SETTLEMENTS_TOTAL.with_label_values(&["ok"]).inc();
                    info!(
                        target: "wallet::reconciliation",
                        request_id = %updated.request_id,
                        actual_cost = ?updated.actual_cost,
                        "Unsettled completion settled"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    SETTLEMENTS_TOTAL.with_label_values(&[err.kind()]).inc();
                    warn!(
                        target: "wallet::reconciliation",
                        request_id = %request.request_id,
                        attempts = request.settlement_attempts + 1,
                        error = %err,
                        "Settlement attempt failed"
                    );
                    if let Err(e) = self
                        .billing
                        .store()
                        .record_settlement_failure(request.request_id)
                        .await
                    {
                        error!(
                            target: "wallet::reconciliation",
                            request_id = %request.request_id,
                            error = %e,
                            "Could not record settlement failure"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    /// Fetch a request owned by the account.
    pub async fn get(
        &self,
        account_id: Uuid,
        request_id: Uuid,
    ) -> Result<ConsumptionRequest, BillingError> {
        self.billing
            .store()
            .get_consumption_request(request_id)
            .await?
            .filter(|request| request.account_id == account_id)
            .ok_or(BillingError::RequestNotFound(request_id))
    }

    pub async fn list(
        &self,
        account_id: Uuid,
        filter: &ListConsumptionFilter,
    ) -> Result<Vec<ConsumptionRequest>, BillingError> {
        self.billing
            .store()
            .list_consumption_requests(account_id, filter)
            .await
    }

    /// Render a completed transcript as a plain text document.
    pub async fn download(
        &self,
        account_id: Uuid,
        request_id: Uuid,
    ) -> Result<TranscriptDocument, BillingError> {
        let request = self.get(account_id, request_id).await?;
        if request.parsed_status() != Some(ConsumptionStatus::Completed) {
            return Err(BillingError::InvalidRequest(
                "Transcription is not completed".to_string(),
            ));
        }
        Ok(render_transcript(&request))
    }
}

fn render_transcript(request: &ConsumptionRequest) -> TranscriptDocument {
    let completed = request
        .completed_utc
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_default();
    let content = format!(
        "Transcription\n\
         Source: {}\n\
         Language: {}\n\
         Minutes: {}\n\
         Completed: {}\n\
         \n\
         {}\n",
        request.source_handle,
        request.parsed_language().display_name(),
        request.requested_units,
        completed,
        request.result_text.as_deref().unwrap_or_default(),
    );
    TranscriptDocument {
        file_name: format!("transcription_{}.txt", request.request_id.simple()),
        content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Language;
    use chrono::{TimeZone, Utc};
    use std::str::FromStr;

    #[test]
    fn test_render_transcript() {
        let input = NewConsumptionRequest {
            source_handle: "meeting.mp3".to_string(),
            source_format: "mp3".to_string(),
            requested_units: Decimal::from_str("2.5").unwrap(),
            language: Language::Hindi,
        };
        let mut request = ConsumptionRequest::new(Uuid::new_v4(), &input, Decimal::ZERO);
        ConsumptionCompletion::Completed {
            result_text: "namaste".to_string(),
            actual_cost: Decimal::ZERO,
            ledger_transaction_id: None,
            settled: true,
        }
        .apply_to(&mut request, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());

        let doc = render_transcript(&request);
        assert!(doc.file_name.ends_with(".txt"));
        assert!(doc.content.contains("Source: meeting.mp3"));
        assert!(doc.content.contains("Language: Hindi"));
        assert!(doc.content.contains("Completed: 2026-01-02 03:04:05 UTC"));
        assert!(doc.content.ends_with("namaste\n"));
    }
}
