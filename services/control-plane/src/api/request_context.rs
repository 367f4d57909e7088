//! Request-scoped context extracted from HTTP requests: a correlation ID on
//! every request, and one of two bearer-token auth schemes depending on
//! which surface is being called.
//!
//! - Agent-facing routes (`/api/agent/*`) authenticate with a node API key
//!   minted during enrollment (see [`crate::enrollment`]).
//! - Admin routes (`/api/admin/*`) authenticate with the single shared
//!   `GLUON_ADMIN_TOKEN` operator secret.

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::Utc;

use gluon_id::NodeId;

use crate::api::error::ApiError;
use crate::enrollment::{credential_hash_index, verify_credential};
use crate::state::AppState;

/// `last_used_at` is only bumped if it's stale by at least this much, so a
/// busy agent heartbeating every few seconds doesn't turn every request into
/// a write.
const LAST_USED_AT_THROTTLE: chrono::Duration = chrono::Duration::seconds(30);

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "authorization")?
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
}

/// A request-correlation ID, read from `x-request-id` if the caller set one
/// (e.g. a retry carrying the same ID), otherwise freshly generated.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header_string(&parts.headers, "x-request-id")
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        Ok(RequestId(id))
    }
}

/// Identifies the node making an agent-surface request.
#[derive(Debug, Clone, Copy)]
pub struct NodeAuth {
    pub node_id: NodeId,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for NodeAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let State(state) = State::<AppState>::from_request_parts(parts, state)
            .await
            .expect("AppState extraction is infallible");

        let token = bearer_token(&parts.headers).ok_or_else(|| {
            ApiError::unauthorized("unauthorized", "missing bearer node API key")
        })?;

        let hash_index = credential_hash_index(&token);
        let row: Option<(i64, i64, String, Option<chrono::DateTime<Utc>>, Option<chrono::DateTime<Utc>>)> = sqlx::query_as(
            r#"SELECT id, node_id, key_hash, expires_at, last_used_at FROM api_keys
               WHERE key_hash_index = $1 AND revoked_at IS NULL"#,
        )
        .bind(&hash_index)
        .fetch_optional(state.db().pool())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to look up node API key");
            ApiError::internal("internal_error", "internal error")
        })?;

        let Some((key_id, node_id, key_hash, expires_at, last_used_at)) = row else {
            return Err(ApiError::unauthorized("unauthorized", "invalid node API key"));
        };

        if !verify_credential(&token, &key_hash) {
            return Err(ApiError::unauthorized("unauthorized", "invalid node API key"));
        }

        let now = Utc::now();
        if expires_at.is_some_and(|exp| exp <= now) {
            return Err(ApiError::unauthorized("unauthorized", "node API key has expired"));
        }

        if last_used_at.is_none_or(|last| now - last >= LAST_USED_AT_THROTTLE) {
            if let Err(e) = sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
                .bind(key_id)
                .bind(now)
                .execute(state.db().pool())
                .await
            {
                tracing::warn!(error = %e, "failed to update api key last_used_at");
            }
        }

        Ok(NodeAuth {
            node_id: NodeId::new(node_id),
        })
    }
}

/// Marks a request as authenticated on the admin surface.
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let State(state) = State::<AppState>::from_request_parts(parts, state)
            .await
            .expect("AppState extraction is infallible");

        let token = bearer_token(&parts.headers).ok_or_else(|| {
            ApiError::unauthorized("unauthorized", "missing bearer admin token")
        })?;

        if token != state.admin_token() {
            return Err(ApiError::forbidden("forbidden", "invalid admin token"));
        }

        Ok(AdminAuth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn bearer_token_absent_without_header() {
        let headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
    }
}
