//! Account context extracted from request headers.
//!
//! The authenticating front end resolves the session and forwards the
//! account identifier in `X-User-ID`. Every wallet route is scoped to it.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const ACCOUNT_HEADER: &str = "X-User-ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountContext {
    pub account_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for AccountContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACCOUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing X-User-ID header"))
            })?;

        let account_id = Uuid::parse_str(raw.trim()).map_err(|_| {
            AppError::Unauthorized(anyhow::anyhow!("Invalid X-User-ID header"))
        })?;

        Ok(Self { account_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<AccountContext, AppError> {
        let mut builder = Request::builder().uri("/wallet");
        if let Some(value) = header {
            builder = builder.header(ACCOUNT_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AccountContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_valid_header() {
        let id = Uuid::new_v4();
        let ctx = extract(Some(&id.to_string())).await.unwrap();
        assert_eq!(ctx.account_id, id);
    }

    #[tokio::test]
    async fn test_missing_or_malformed_header() {
        assert!(matches!(extract(None).await, Err(AppError::Unauthorized(_))));
        assert!(matches!(
            extract(Some("not-a-uuid")).await,
            Err(AppError::Unauthorized(_))
        ));
    }
}
