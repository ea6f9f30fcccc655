//! OpenAI speech-to-text provider.
//!
//! Reads the audio file from the media root and posts it to the
//! `/audio/transcriptions` endpoint as multipart form data.

use super::{TranscriptionJob, TranscriptionOutcome, TranscriptionProvider};
use crate::config::TranscriptionConfig;
use crate::services::error::BillingError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub struct OpenAiTranscriptionProvider {
    client: Client,
    api_key: Secret<String>,
    base_url: String,
    model: String,
    media_root: PathBuf,
}

impl OpenAiTranscriptionProvider {
    pub fn new(config: &TranscriptionConfig) -> Result<Self, BillingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BillingError::Store(anyhow::anyhow!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            media_root: config.media_root.clone(),
        })
    }

    /// Resolve a handle inside the media root. Absolute paths and parent
    /// components are refused.
    fn resolve(&self, handle: &str) -> Option<PathBuf> {
        let relative = Path::new(handle);
        if handle.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.media_root.join(relative))
    }
}

fn mime_for(format: &str) -> &'static str {
    match format {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

/// Map a non-success HTTP status to an outcome.
fn classify_status(status: StatusCode) -> TranscriptionOutcome {
    if status == StatusCode::TOO_MANY_REQUESTS {
        TranscriptionOutcome::RateLimited
    } else if status.is_server_error() {
        TranscriptionOutcome::TransientError
    } else {
        TranscriptionOutcome::UnknownError
    }
}

#[async_trait]
impl TranscriptionProvider for OpenAiTranscriptionProvider {
    async fn transcribe(&self, job: &TranscriptionJob) -> TranscriptionOutcome {
        let Some(path) = self.resolve(&job.source_handle) else {
            tracing::warn!(handle = %job.source_handle, "Rejected audio handle");
            return TranscriptionOutcome::NotFound;
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Audio file missing");
                return TranscriptionOutcome::NotFound;
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to read audio file");
                return TranscriptionOutcome::UnknownError;
            }
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("audio.{}", job.source_format));

        let part = match Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(&job.source_format))
        {
            Ok(part) => part,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build multipart body");
                return TranscriptionOutcome::UnknownError;
            }
        };

        let mut form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "text");
        if let Some(hint) = job.language.provider_hint() {
            form = form.text("language", hint);
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        tracing::debug!(model = %self.model, handle = %job.source_handle, "Sending audio to OpenAI");

        let response = match self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Transcription request failed");
                return TranscriptionOutcome::TransientError;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "OpenAI transcription error");
            return classify_status(status);
        }

        match response.text().await {
            Ok(text) => TranscriptionOutcome::Success(text.trim().to_string()),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read transcription body");
                TranscriptionOutcome::TransientError
            }
        }
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::models::Language;

    fn provider(media_root: PathBuf) -> OpenAiTranscriptionProvider {
        OpenAiTranscriptionProvider::new(&TranscriptionConfig {
            provider: ProviderKind::OpenAi,
            api_key: Secret::new("sk-test".to_string()),
            base_url: "http://127.0.0.1:9/v1/".to_string(),
            model: "whisper-1".to_string(),
            media_root,
            timeout_secs: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_resolve_refuses_escapes() {
        let p = provider(PathBuf::from("/srv/media"));
        assert_eq!(p.resolve("a/b.mp3"), Some(PathBuf::from("/srv/media/a/b.mp3")));
        assert_eq!(p.resolve("../etc/passwd"), None);
        assert_eq!(p.resolve("/etc/passwd"), None);
        assert_eq!(p.resolve(""), None);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            TranscriptionOutcome::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            TranscriptionOutcome::TransientError
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            TranscriptionOutcome::UnknownError
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let p = provider(std::env::temp_dir().join("wallet-service-missing-media"));
        let outcome = p
            .transcribe(&TranscriptionJob {
                source_handle: "nothing-here.mp3".to_string(),
                source_format: "mp3".to_string(),
                language: Language::Hindi,
            })
            .await;
        assert_eq!(outcome, TranscriptionOutcome::NotFound);
    }
}
