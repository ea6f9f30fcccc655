//! Mock provider for testing and local runs.

use super::{TranscriptionJob, TranscriptionOutcome, TranscriptionProvider};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Returns scripted outcomes in order, then the default outcome.
pub struct MockTranscriptionProvider {
    default: TranscriptionOutcome,
    scripted: Mutex<VecDeque<TranscriptionOutcome>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockTranscriptionProvider {
    pub fn new(default: TranscriptionOutcome) -> Self {
        Self {
            default,
            scripted: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Echoes the source handle back as the transcript.
    pub fn succeeding() -> Self {
        Self::new(TranscriptionOutcome::Success(String::new()))
    }

    pub fn failing(outcome: TranscriptionOutcome) -> Self {
        Self::new(outcome)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_outcome(&self, outcome: TranscriptionOutcome) {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.push_back(outcome);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionProvider for MockTranscriptionProvider {
    async fn transcribe(&self, job: &TranscriptionJob) -> TranscriptionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self
            .scripted
            .lock()
            .ok()
            .and_then(|mut scripted| scripted.pop_front());

        match next.unwrap_or_else(|| self.default.clone()) {
            TranscriptionOutcome::Success(text) if text.is_empty() => TranscriptionOutcome::Success(
                format!("Mock transcript of {} ({})", job.source_handle, job.language.display_name()),
            ),
            outcome => outcome,
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Language;

    fn job() -> TranscriptionJob {
        TranscriptionJob {
            source_handle: "call.mp3".to_string(),
            source_format: "mp3".to_string(),
            language: Language::English,
        }
    }

    #[tokio::test]
    async fn test_scripted_then_default() {
        let provider = MockTranscriptionProvider::succeeding();
        provider.push_outcome(TranscriptionOutcome::RateLimited);

        assert_eq!(provider.transcribe(&job()).await, TranscriptionOutcome::RateLimited);
        match provider.transcribe(&job()).await {
            TranscriptionOutcome::Success(text) => assert!(text.contains("call.mp3")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(provider.calls(), 2);
    }
}
