//! Enrollment request review: list pending requests, approve (creating the
//! node row) or reject.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use gluon_id::NodeId;

use crate::api::error::ApiError;
use crate::api::request_context::AdminAuth;
use crate::events::{self, ACTOR_ADMIN};
use crate::ipam;
use crate::models::{EnrollmentRequestRow, EnrollmentStatus, NodeRow};
use crate::state::AppState;

pub async fn list_requests(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Vec<EnrollmentRequestRow>>, ApiError> {
    let rows = sqlx::query_as::<_, EnrollmentRequestRow>(
        r#"SELECT id, hostname, provider, os, desired_role, secret_hash, secret_hash_index, status,
                  node_id, api_key_delivered, public_address, created_at, updated_at
           FROM enrollment_requests ORDER BY id"#,
    )
    .fetch_all(state.db().pool())
    .await?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub node_id: i64,
}

/// Approving a request creates its [`NodeRow`] and assigns a hub number if
/// the desired role needs one; `/enroll/status` depends on `node_id` being
/// set the instant the request turns `approved` (reported to the agent over
/// the wire as `accepted`, see [`EnrollmentStatus`]).
pub async fn approve(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<i64>,
) -> Result<Json<ApproveResponse>, ApiError> {
    let pool = state.db().pool();
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, EnrollmentRequestRow>(
        r#"SELECT id, hostname, provider, os, desired_role, secret_hash, secret_hash_index, status,
                  node_id, api_key_delivered, public_address, created_at, updated_at
           FROM enrollment_requests WHERE id = $1 FOR UPDATE"#,
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::not_found("not_found", "enrollment request not found"))?;

    if row.status != EnrollmentStatus::Pending {
        return Err(ApiError::conflict(
            "already_decided",
            "enrollment request has already been approved or rejected",
        ));
    }

    let node = sqlx::query_as::<_, NodeRow>(
        r#"
        INSERT INTO nodes (hostname, provider, os, role, status, public_address)
        VALUES ($1, $2, $3, $4, 'pending', $5)
        RETURNING id, hostname, provider, os, role, status, hub_number, wireguard_keys,
                  public_address, reported_desired_role, kubernetes_joined_role,
                  last_heartbeat_at, last_heartbeat_snapshot, created_at, updated_at
        "#,
    )
    .bind(&row.hostname)
    .bind(&row.provider)
    .bind(&row.os)
    .bind(row.desired_role)
    .bind(&row.public_address)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"UPDATE enrollment_requests SET status = 'approved', node_id = $2, updated_at = now()
           WHERE id = $1"#,
    )
    .bind(row.id)
    .bind(node.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    if ipam::role_requires_hub_number(row.desired_role) {
        ipam::ensure_hub_number(pool, NodeId::new(node.id)).await?;
    }

    events::record_audit(
        pool,
        ACTOR_ADMIN,
        "enrollment.approved",
        serde_json::json!({"request_id": row.id, "node_id": node.id, "hostname": row.hostname}),
    )
    .await;

    Ok(Json(ApproveResponse { node_id: node.id }))
}

#[derive(Debug, Serialize)]
pub struct RejectResponse {
    pub rejected: bool,
}

pub async fn reject(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<i64>,
) -> Result<Json<RejectResponse>, ApiError> {
    let outcome = sqlx::query(
        r#"UPDATE enrollment_requests SET status = 'rejected', updated_at = now()
           WHERE id = $1 AND status = 'pending'"#,
    )
    .bind(id)
    .execute(state.db().pool())
    .await?;

    if outcome.rows_affected() == 0 {
        return Err(ApiError::conflict(
            "already_decided",
            "enrollment request has already been approved or rejected",
        ));
    }

    events::record_audit(
        state.db().pool(),
        ACTOR_ADMIN,
        "enrollment.rejected",
        serde_json::json!({"request_id": id}),
    )
    .await;

    Ok(Json(RejectResponse { rejected: true }))
}
