//! Consumption request model (a metered transcription job).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of a consumption request.
///
/// `pending -> in_progress -> {completed, failed}`; terminal states have no
/// outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ConsumptionStatus {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: ConsumptionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }
}

impl std::fmt::Display for ConsumptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Spoken language of the source audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Auto,
    English,
    Hindi,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::English => "english",
            Self::Hindi => "hindi",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "english" => Some(Self::English),
            "hindi" => Some(Self::Hindi),
            _ => None,
        }
    }

    /// ISO-639-1 hint passed to the provider; `None` lets it auto-detect.
    pub fn provider_hint(&self) -> Option<&'static str> {
        match self {
            Self::Auto => None,
            Self::English => Some("en"),
            Self::Hindi => Some("hi"),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Auto => "Auto-detect",
            Self::English => "English",
            Self::Hindi => "Hindi",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A billable unit of work.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ConsumptionRequest {
    pub request_id: Uuid,
    pub account_id: Uuid,
    pub source_handle: String,
    pub source_format: String,
    pub language: String,
    pub requested_units: Decimal,
    /// Advisory cost quoted at admission.
    pub estimated_cost: Decimal,
    /// Set if and only if the request is completed.
    pub actual_cost: Option<Decimal>,
    pub status: String,
    pub result_text: Option<String>,
    pub error_message: Option<String>,
    pub ledger_transaction_id: Option<Uuid>,
    /// Whether the completion has a committed ledger debit.
    pub settled: bool,
    /// Failed settlement sweeps for an unsettled completion.
    pub settlement_attempts: i32,
    pub last_settlement_attempt_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub started_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl ConsumptionRequest {
    pub fn new(account_id: Uuid, input: &NewConsumptionRequest, estimated_cost: Decimal) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            account_id,
            source_handle: input.source_handle.clone(),
            source_format: input.source_format.to_ascii_lowercase(),
            language: input.language.as_str().to_string(),
            requested_units: input.requested_units,
            estimated_cost,
            actual_cost: None,
            status: ConsumptionStatus::Pending.as_str().to_string(),
            result_text: None,
            error_message: None,
            ledger_transaction_id: None,
            settled: false,
            settlement_attempts: 0,
            last_settlement_attempt_utc: None,
            created_utc: Utc::now(),
            started_utc: None,
            completed_utc: None,
        }
    }

    /// Get parsed status.
    pub fn parsed_status(&self) -> Option<ConsumptionStatus> {
        ConsumptionStatus::parse(&self.status)
    }

    pub fn parsed_language(&self) -> Language {
        Language::parse(&self.language).unwrap_or_default()
    }
}

/// Source descriptor supplied by the file-storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConsumptionRequest {
    pub source_handle: String,
    pub source_format: String,
    pub requested_units: Decimal,
    #[serde(default)]
    pub language: Language,
}

/// Terminal outcome written with the `in_progress -> {completed, failed}` transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumptionCompletion {
    Completed {
        result_text: String,
        actual_cost: Decimal,
        ledger_transaction_id: Option<Uuid>,
        settled: bool,
    },
    Failed {
        error_message: String,
    },
}

impl ConsumptionCompletion {
    pub fn status(&self) -> ConsumptionStatus {
        match self {
            Self::Completed { .. } => ConsumptionStatus::Completed,
            Self::Failed { .. } => ConsumptionStatus::Failed,
        }
    }

    /// Apply to an in-memory copy of the request.
    pub fn apply_to(&self, request: &mut ConsumptionRequest, at: DateTime<Utc>) {
        request.status = self.status().as_str().to_string();
        request.completed_utc = Some(at);
        match self {
            Self::Completed {
                result_text,
                actual_cost,
                ledger_transaction_id,
                settled,
            } => {
                request.result_text = Some(result_text.clone());
                request.actual_cost = Some(*actual_cost);
                request.ledger_transaction_id = *ledger_transaction_id;
                request.settled = *settled;
                request.error_message = None;
            }
            Self::Failed { error_message } => {
                request.error_message = Some(error_message.clone());
                request.actual_cost = None;
            }
        }
    }
}

/// Filter parameters for listing consumption requests.
#[derive(Debug, Clone, Default)]
pub struct ListConsumptionFilter {
    pub status: Option<ConsumptionStatus>,
    pub language: Option<Language>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl ListConsumptionFilter {
    pub fn limit(&self) -> i64 {
        self.limit.clamp(1, 100)
    }

    pub fn matches(&self, request: &ConsumptionRequest) -> bool {
        if let Some(status) = self.status {
            if request.status != status.as_str() {
                return false;
            }
        }
        if let Some(language) = self.language {
            if request.language != language.as_str() {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if request.created_utc < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if request.created_utc > to {
                return false;
            }
        }
        true
    }
}
