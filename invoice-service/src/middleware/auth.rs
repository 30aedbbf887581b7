//! Caller identity extraction.
//!
//! The authentication collaborator in front of this service resolves the
//! caller's credentials and forwards the resolved user id in the
//! `X-User-Id` header. Handlers receive it as an explicit `AuthContext`
//! parameter; there is no ambient current-user state.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated owner making the request.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: i64,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing X-User-Id header"))
            })?;

        let user_id: i64 = raw.parse().map_err(|_| {
            AppError::Unauthorized(anyhow::anyhow!("Invalid X-User-Id header"))
        })?;

        tracing::Span::current().record("user_id", user_id);

        Ok(AuthContext { user_id })
    }
}
