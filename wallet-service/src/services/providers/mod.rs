//! Transcription provider abstraction.
//!
//! The provider boundary is a closed outcome type so the orchestrator maps
//! every provider result explicitly to a request state.

pub mod mock;
pub mod openai;

use crate::models::Language;
use async_trait::async_trait;

/// What the provider is asked to transcribe.
#[derive(Debug, Clone)]
pub struct TranscriptionJob {
    /// Opaque handle of the stored audio file.
    pub source_handle: String,
    pub source_format: String,
    pub language: Language,
}

/// Result of a provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionOutcome {
    Success(String),
    RateLimited,
    NotFound,
    TransientError,
    UnknownError,
}

impl TranscriptionOutcome {
    /// User-safe message for a failed outcome.
    pub fn sanitized_message(&self) -> Option<&'static str> {
        match self {
            Self::Success(_) => None,
            Self::RateLimited => Some("Transcription service is busy. Please try again later."),
            Self::NotFound => Some("Audio file could not be found."),
            Self::TransientError => {
                Some("Transcription service is temporarily unavailable. Please try again.")
            }
            Self::UnknownError => Some("Transcription failed due to an unexpected error."),
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::TransientError => "transient_error",
            Self::UnknownError => "unknown_error",
        }
    }
}

/// Speech-recognition backend.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Never fails outright; every failure is a [`TranscriptionOutcome`] variant.
    async fn transcribe(&self, job: &TranscriptionJob) -> TranscriptionOutcome;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_success_has_no_message() {
        assert_eq!(
            TranscriptionOutcome::Success("hi".into()).sanitized_message(),
            None
        );
        assert_eq!(
            TranscriptionOutcome::NotFound.sanitized_message(),
            Some("Audio file could not be found.")
        );
        assert_eq!(
            TranscriptionOutcome::RateLimited.sanitized_message(),
            Some("Transcription service is busy. Please try again later.")
        );
    }
}
