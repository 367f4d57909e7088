//! Node listing, inspection, light patching, and decommissioning.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::AdminAuth;
use crate::models::{NodeRole, NodeRow, NodeStatus};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct NodeSummary {
    pub id: i64,
    pub hostname: String,
    pub provider: String,
    pub os: String,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub hub_number: Option<i32>,
    pub public_address: Option<String>,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<NodeRow> for NodeSummary {
    fn from(row: NodeRow) -> Self {
        Self {
            id: row.id,
            hostname: row.hostname,
            provider: row.provider,
            os: row.os,
            role: row.role,
            status: row.status,
            hub_number: row.hub_number,
            public_address: row.public_address,
            last_heartbeat_at: row.last_heartbeat_at,
        }
    }
}

pub async fn list_nodes(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Vec<NodeSummary>>, ApiError> {
    let rows: Vec<NodeRow> = sqlx::query_as(
        r#"SELECT id, hostname, provider, os, role, status, hub_number, wireguard_keys,
                  public_address, reported_desired_role, kubernetes_joined_role,
                  last_heartbeat_at, last_heartbeat_snapshot, created_at, updated_at
           FROM nodes ORDER BY id"#,
    )
    .fetch_all(state.db().pool())
    .await?;

    Ok(Json(rows.into_iter().map(NodeSummary::from).collect()))
}

pub async fn get_node(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<i64>,
) -> Result<Json<NodeRow>, ApiError> {
    let row = crate::topology::load_node(state.db().pool(), id)
        .await?
        .ok_or_else(|| ApiError::not_found("not_found", "node not found"))?;
    Ok(Json(row))
}

/// Fields an operator may change directly. Role, hub number, and
/// enrollment-derived fields are not patchable here; they're owned by the
/// enrollment and IPAM flows.
#[derive(Debug, Deserialize)]
pub struct PatchNodeRequest {
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub public_address: Option<String>,
}

pub async fn patch_node(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<i64>,
    Json(body): Json<PatchNodeRequest>,
) -> Result<Json<NodeRow>, ApiError> {
    let pool = state.db().pool();

    let row = sqlx::query_as::<_, NodeRow>(
        r#"
        UPDATE nodes
        SET status = COALESCE($2, status),
            public_address = COALESCE($3, public_address),
            updated_at = now()
        WHERE id = $1
        RETURNING id, hostname, provider, os, role, status, hub_number, wireguard_keys,
                  public_address, reported_desired_role, kubernetes_joined_role,
                  last_heartbeat_at, last_heartbeat_snapshot, created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(body.status)
    .bind(&body.public_address)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("not_found", "node not found"))?;

    Ok(Json(row))
}

#[derive(Debug, Serialize)]
pub struct DecommissionResponse {
    pub decommissioned: bool,
}

pub async fn decommission_node(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<i64>,
) -> Result<Json<DecommissionResponse>, ApiError> {
    let outcome = sqlx::query(
        r#"UPDATE nodes SET status = 'decommissioned', updated_at = now()
           WHERE id = $1 AND status != 'decommissioned'"#,
    )
    .bind(id)
    .execute(state.db().pool())
    .await?;

    Ok(Json(DecommissionResponse {
        decommissioned: outcome.rows_affected() > 0,
    }))
}
