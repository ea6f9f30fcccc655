//! Application startup and lifecycle management.

use crate::config::{ProviderKind, StoreBackend, WalletConfig};
use crate::handlers;
use crate::middleware::metrics_middleware;
use crate::services::providers::mock::MockTranscriptionProvider;
use crate::services::providers::openai::OpenAiTranscriptionProvider;
use crate::services::providers::TranscriptionProvider;
use crate::services::{
    get_metrics, init_metrics, BillingEngine, ConsumptionOrchestrator, ConsumptionWorkerPool,
    CostModel, LedgerStore, MemoryLedgerStore, PaymentVerifier, PgLedgerStore, RazorpayClient,
    RechargeService,
};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingEngine>,
    pub recharge: Arc<RechargeService>,
    pub orchestrator: Arc<ConsumptionOrchestrator>,
    pub workers: Arc<ConsumptionWorkerPool>,
}

/// Liveness probe.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "wallet-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness probe: the ledger store must answer.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.billing.store().health_check().await {
        Ok(_) => {
            tracing::debug!("Readiness check passed");
            (StatusCode::OK, Json(json!({ "status": "ready" })))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed - ledger store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Build the HTTP router over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        // Wallet
        .route(
            "/wallet",
            post(handlers::wallet::open_wallet).get(handlers::wallet::get_wallet),
        )
        .route("/wallet/audit", get(handlers::wallet::audit_wallet))
        .route(
            "/wallet/transactions",
            get(handlers::wallet::list_transactions),
        )
        .route("/wallet/admission", post(handlers::wallet::check_admission))
        // Recharge
        .route("/wallet/orders", post(handlers::payments::create_order))
        .route(
            "/wallet/payments/verify",
            post(handlers::payments::verify_payment),
        )
        .route("/webhooks/razorpay", post(handlers::payments::webhook))
        // Transcriptions
        .route(
            "/transcriptions",
            post(handlers::transcriptions::create_transcription)
                .get(handlers::transcriptions::list_transcriptions),
        )
        .route(
            "/transcriptions/:id",
            get(handlers::transcriptions::get_transcription),
        )
        .route(
            "/transcriptions/:id/run",
            post(handlers::transcriptions::run_transcription),
        )
        .route(
            "/transcriptions/:id/download",
            get(handlers::transcriptions::download_transcription),
        )
        .route("/history", get(handlers::history::get_history))
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: WalletConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn LedgerStore> = match config.database.backend {
            StoreBackend::Postgres => {
                let db = PgLedgerStore::new(
                    config.database.url.expose_secret(),
                    config.database.max_connections,
                    config.database.min_connections,
                    Duration::from_millis(config.database.lock_timeout_ms),
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    AppError::from(e)
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    AppError::from(e)
                })?;
                Arc::new(db)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory ledger store; balances are lost on restart");
                Arc::new(MemoryLedgerStore::new())
            }
        };

        let billing = Arc::new(BillingEngine::new(
            store,
            CostModel::new(config.billing.price_per_unit),
            config.usage_policy(),
            config.retry_config(),
        ));

        let razorpay = RazorpayClient::new(&config.razorpay).map_err(AppError::from)?;
        if razorpay.is_configured() {
            tracing::info!("Razorpay client initialized");
        } else {
            tracing::warn!("Razorpay credentials not configured - recharges will fail");
        }
        let recharge = Arc::new(RechargeService::new(
            Arc::clone(&billing),
            Arc::new(razorpay),
            PaymentVerifier::from_config(&config.razorpay),
        ));

        let provider: Arc<dyn TranscriptionProvider> = match config.transcription.provider {
            ProviderKind::OpenAi => Arc::new(
                OpenAiTranscriptionProvider::new(&config.transcription).map_err(AppError::from)?,
            ),
            ProviderKind::Mock => {
                tracing::warn!("Using mock transcription provider");
                Arc::new(MockTranscriptionProvider::succeeding())
            }
        };

        let orchestrator = Arc::new(ConsumptionOrchestrator::new(
            Arc::clone(&billing),
            provider,
            Duration::from_secs(config.transcription.timeout_secs),
        ));
        let workers = Arc::new(ConsumptionWorkerPool::start(
            Arc::clone(&orchestrator),
            &config.workers,
        ));

        let state = AppState {
            billing,
            recharge,
            orchestrator,
            workers,
        };

        let addr = config.common.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Wallet service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `shutdown` resolves, then drain the worker pool.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let workers = Arc::clone(&self.state.workers);
        let app = router(self.state);

        tracing::info!(
            service = "wallet-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        workers.shutdown().await;

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
