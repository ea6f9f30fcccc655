//! Configuration module for wallet-service.

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::services::policy::UsagePolicy;

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub billing: BillingConfig,
    pub retry: RetrySettings,
    pub razorpay: RazorpayConfig,
    pub transcription: TranscriptionConfig,
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub price_per_unit: Decimal,
    pub currency: String,
    pub free_allowance_grant: Decimal,
    pub max_units_per_request: Decimal,
    pub allowed_formats: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Mock,
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub provider: ProviderKind,
    pub api_key: Secret<String>,
    pub base_url: String,
    pub model: String,
    pub media_root: PathBuf,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub count: usize,
    pub queue_size: usize,
    pub reconcile_interval_secs: u64,
    pub reconcile_batch: i64,
    /// How long shutdown waits for jobs already running.
    pub drain_timeout_secs: u64,
}

impl TranscriptionConfig {
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.provider == ProviderKind::OpenAi && self.api_key.expose_secret().is_empty() {
            warnings.push(
                "OPENAI_API_KEY is empty; transcriptions will fail until it is set".to_string(),
            );
        }
        warnings
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: &str) -> Result<Decimal, AppError> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    Decimal::from_str(raw.trim()).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} is not a decimal ({}): {}", key, raw, e))
    })
}

impl WalletConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown STORE_BACKEND '{}'",
                    other
                )))
            }
        };

        let database_url = match (backend, env::var("DATABASE_URL")) {
            (_, Ok(url)) => url,
            (StoreBackend::Memory, Err(_)) => String::new(),
            (StoreBackend::Postgres, Err(_)) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_URL is required"
                )))
            }
        };

        let provider = match env::var("TRANSCRIPTION_PROVIDER")
            .unwrap_or_else(|_| "openai".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "openai" => ProviderKind::OpenAi,
            "mock" => ProviderKind::Mock,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown TRANSCRIPTION_PROVIDER '{}'",
                    other
                )))
            }
        };

        let allowed_formats = env::var("ALLOWED_SOURCE_FORMATS")
            .unwrap_or_else(|_| "mp3,wav,m4a,ogg,flac,webm".to_string())
            .split(',')
            .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .collect();

        let config = Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "wallet-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| common.log_level.clone()),
            otlp_endpoint: env::var("OTLP_ENDPOINT")
                .ok()
                .or_else(|| common.otlp_endpoint.clone()),
            database: DatabaseConfig {
                backend,
                url: Secret::new(database_url),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
                lock_timeout_ms: env_or("DATABASE_LOCK_TIMEOUT_MS", 5_000),
            },
            billing: BillingConfig {
                price_per_unit: env_decimal("PRICE_PER_MINUTE", "1.00")?,
                currency: env::var("BILLING_CURRENCY").unwrap_or_else(|_| "INR".to_string()),
                free_allowance_grant: env_decimal("FREE_MINUTES_GRANT", "10.00")?,
                max_units_per_request: env_decimal("MAX_MINUTES_PER_REQUEST", "180")?,
                allowed_formats,
            },
            retry: RetrySettings {
                max_retries: env_or("LEDGER_MAX_RETRIES", 2),
                initial_backoff_ms: env_or("LEDGER_INITIAL_BACKOFF_MS", 100),
                max_backoff_ms: env_or("LEDGER_MAX_BACKOFF_MS", 1_000),
            },
            razorpay: RazorpayConfig {
                key_id: env::var("RAZORPAY_KEY_ID").unwrap_or_default(),
                key_secret: Secret::new(env::var("RAZORPAY_KEY_SECRET").unwrap_or_default()),
                webhook_secret: Secret::new(
                    env::var("RAZORPAY_WEBHOOK_SECRET").unwrap_or_default(),
                ),
                api_base_url: env::var("RAZORPAY_API_BASE_URL")
                    .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string()),
                timeout_secs: env_or("RAZORPAY_TIMEOUT_SECS", 30),
            },
            transcription: TranscriptionConfig {
                provider,
                api_key: Secret::new(env::var("OPENAI_API_KEY").unwrap_or_default()),
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                model: env::var("TRANSCRIPTION_MODEL").unwrap_or_else(|_| "whisper-1".to_string()),
                media_root: PathBuf::from(
                    env::var("MEDIA_ROOT").unwrap_or_else(|_| "./media".to_string()),
                ),
                timeout_secs: env_or("TRANSCRIPTION_TIMEOUT_SECS", 300),
            },
            workers: WorkerConfig {
                count: env_or("WORKER_COUNT", 4),
                queue_size: env_or("WORKER_QUEUE_SIZE", 256),
                reconcile_interval_secs: env_or("RECONCILE_INTERVAL_SECS", 60),
                reconcile_batch: env_or("RECONCILE_BATCH", 50),
                drain_timeout_secs: env_or("WORKER_DRAIN_TIMEOUT_SECS", 330),
            },
            common,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.billing.price_per_unit < Decimal::ZERO {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PRICE_PER_MINUTE cannot be negative"
            )));
        }
        if self.billing.free_allowance_grant < Decimal::ZERO {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "FREE_MINUTES_GRANT cannot be negative"
            )));
        }
        if self.billing.max_units_per_request <= Decimal::ZERO {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MAX_MINUTES_PER_REQUEST must be positive"
            )));
        }
        if self.billing.free_allowance_grant.round_dp(2) != self.billing.free_allowance_grant
            || self.billing.max_units_per_request.round_dp(2) != self.billing.max_units_per_request
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "FREE_MINUTES_GRANT and MAX_MINUTES_PER_REQUEST allow at most two decimal places"
            )));
        }
        if self.billing.allowed_formats.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ALLOWED_SOURCE_FORMATS cannot be empty"
            )));
        }
        if self.workers.count == 0 || self.workers.queue_size == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "WORKER_COUNT and WORKER_QUEUE_SIZE must be positive"
            )));
        }
        Ok(())
    }

    /// Settings that load but will misbehave at runtime. Logged once tracing
    /// is up.
    pub fn warnings(&self) -> Vec<String> {
        self.transcription.warnings()
    }

    pub fn usage_policy(&self) -> UsagePolicy {
        UsagePolicy {
            free_allowance_grant: self.billing.free_allowance_grant,
            max_units_per_request: self.billing.max_units_per_request,
            allowed_formats: self.billing.allowed_formats.clone(),
            currency: self.billing.currency.clone(),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            ..RetryConfig::lock_contention()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcription(provider: ProviderKind, api_key: &str) -> TranscriptionConfig {
        TranscriptionConfig {
            provider,
            api_key: Secret::new(api_key.to_string()),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "whisper-1".to_string(),
            media_root: PathBuf::from("./media"),
            timeout_secs: 300,
        }
    }

    #[test]
    fn test_missing_openai_key_is_reported() {
        let warnings = transcription(ProviderKind::OpenAi, "").warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_no_warnings_when_key_set_or_mocked() {
        assert!(transcription(ProviderKind::OpenAi, "sk-test").warnings().is_empty());
        assert!(transcription(ProviderKind::Mock, "").warnings().is_empty());
    }
}
