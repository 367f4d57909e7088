//! Two-phase enrollment: a node submits a request, an operator approves it
//! out of band via the admin surface, then the node polls with its
//! enrollment secret until the approval (and its one-time API key) appears.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::enrollment::{self, credential_hash_index, verify_credential};
use crate::events::{self, ACTOR_SYSTEM};
use crate::models::{EnrollmentRequestRow, EnrollmentStatus, NodeRole};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub hostname: String,
    pub provider: String,
    pub os: String,
    pub desired_role: NodeRole,
}

#[derive(Debug, Serialize)]
pub struct EnrollResponse {
    pub request_id: i64,
    pub enrollment_secret: String,
    pub status: EnrollmentStatus,
}

pub async fn enroll(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<EnrollRequest>,
) -> Result<Json<EnrollResponse>, ApiError> {
    if body.hostname.trim().is_empty() || body.provider.trim().is_empty() || body.os.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_request", "hostname, provider, and os are required"));
    }

    let pool = state.db().pool();
    let caller_ip = addr.ip().to_string();

    let already_enrolled: Option<i64> = sqlx::query_scalar(
        r#"SELECT id FROM nodes WHERE hostname = $1 AND status != 'decommissioned'"#,
    )
    .bind(&body.hostname)
    .fetch_optional(pool)
    .await?;
    if already_enrolled.is_some() {
        return Err(ApiError::conflict("duplicate_enrollment", "a node with this hostname is already enrolled"));
    }

    let duplicate_ip: Option<i64> = sqlx::query_scalar(
        r#"SELECT id FROM nodes WHERE public_address = $1 AND status != 'decommissioned'"#,
    )
    .bind(&caller_ip)
    .fetch_optional(pool)
    .await?;
    if duplicate_ip.is_some() {
        return Err(ApiError::conflict("duplicate_enrollment", "a node from this address is already enrolled"));
    }

    let pending_from_ip: Option<i64> = sqlx::query_scalar(
        r#"SELECT id FROM enrollment_requests WHERE public_address = $1 AND status = 'pending'"#,
    )
    .bind(&caller_ip)
    .fetch_optional(pool)
    .await?;
    if pending_from_ip.is_some() {
        return Err(ApiError::conflict("duplicate_enrollment", "a pending request from this address already exists"));
    }

    let secret = enrollment::generate_enrollment_secret()
        .map_err(|e| ApiError::internal("internal_error", e.to_string()))?;

    let row = sqlx::query_as::<_, EnrollmentRequestRow>(
        r#"
        INSERT INTO enrollment_requests
            (hostname, provider, os, desired_role, secret_hash, secret_hash_index, status, public_address)
        VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
        RETURNING id, hostname, provider, os, desired_role, secret_hash, secret_hash_index, status,
                  node_id, api_key_delivered, public_address, created_at, updated_at
        "#,
    )
    .bind(&body.hostname)
    .bind(&body.provider)
    .bind(&body.os)
    .bind(body.desired_role)
    .bind(&secret.hash)
    .bind(&secret.hash_index)
    .bind(&caller_ip)
    .fetch_one(pool)
    .await?;

    events::record_event(
        pool,
        ACTOR_SYSTEM,
        "enrollment.submitted",
        serde_json::json!({
            "request_id": row.id,
            "hostname": row.hostname,
            "public_address": caller_ip,
        }),
    )
    .await;

    Ok(Json(EnrollResponse {
        request_id: row.id,
        enrollment_secret: secret.plaintext,
        status: row.status,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EnrollStatusRequest {
    pub request_id: i64,
    pub enrollment_secret: String,
}

#[derive(Debug, Serialize)]
pub struct EnrollStatusResponse {
    pub status: EnrollmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

pub async fn enroll_status(
    State(state): State<AppState>,
    Json(body): Json<EnrollStatusRequest>,
) -> Result<Json<EnrollStatusResponse>, ApiError> {
    if !enrollment::is_well_formed_enrollment_secret(&body.enrollment_secret) {
        return Err(ApiError::unauthorized("unauthorized", "invalid enrollment secret"));
    }

    let pool = state.db().pool();
    let unauthorized = || ApiError::unauthorized("unauthorized", "invalid enrollment secret");

    let row = sqlx::query_as::<_, EnrollmentRequestRow>(
        r#"SELECT id, hostname, provider, os, desired_role, secret_hash, secret_hash_index, status,
                  node_id, api_key_delivered, public_address, created_at, updated_at
           FROM enrollment_requests WHERE id = $1"#,
    )
    .bind(body.request_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(unauthorized)?;

    // Defense in depth: the index narrows the search, but a differing index
    // for the id we looked up by primary key already means a wrong secret.
    if credential_hash_index(&body.enrollment_secret) != row.secret_hash_index
        || !verify_credential(&body.enrollment_secret, &row.secret_hash)
    {
        return Err(unauthorized());
    }

    match row.status {
        EnrollmentStatus::Pending => Ok(Json(EnrollStatusResponse {
            status: EnrollmentStatus::Pending,
            node_id: None,
            api_key: None,
        })),
        EnrollmentStatus::Rejected => Ok(Json(EnrollStatusResponse {
            status: EnrollmentStatus::Rejected,
            node_id: None,
            api_key: None,
        })),
        EnrollmentStatus::Approved => {
            let node_id = row.node_id.expect("approved enrollment always has a node_id");

            let claimed = sqlx::query(
                r#"UPDATE enrollment_requests SET api_key_delivered = true, updated_at = now()
                   WHERE id = $1 AND api_key_delivered = false"#,
            )
            .bind(row.id)
            .execute(pool)
            .await?;

            if claimed.rows_affected() == 0 {
                // Already handed out once; never re-issue the key.
                return Ok(Json(EnrollStatusResponse {
                    status: EnrollmentStatus::Approved,
                    node_id: Some(node_id),
                    api_key: None,
                }));
            }

            let issued = enrollment::generate_api_key()
                .map_err(|e| ApiError::internal("internal_error", e.to_string()))?;
            sqlx::query(
                r#"INSERT INTO api_keys (node_id, key_hash, key_hash_index) VALUES ($1, $2, $3)"#,
            )
            .bind(node_id)
            .bind(&issued.hash)
            .bind(&issued.hash_index)
            .execute(pool)
            .await?;

            Ok(Json(EnrollStatusResponse {
                status: EnrollmentStatus::Approved,
                node_id: Some(node_id),
                api_key: Some(issued.plaintext),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enroll_response_serializes_request_id_as_number() {
        let response = EnrollResponse {
            request_id: 42,
            enrollment_secret: "es_abc".into(),
            status: EnrollmentStatus::Pending,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["request_id"], serde_json::json!(42));
    }

    #[test]
    fn status_response_omits_api_key_when_absent() {
        let response = EnrollStatusResponse {
            status: EnrollmentStatus::Approved,
            node_id: Some(7),
            api_key: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(!json.as_object().unwrap().contains_key("api_key"));
    }
}
