//! Heartbeat ingestion: records the node's liveness and telemetry snapshot,
//! and hands back any commands queued for it.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::NodeAuth;
use crate::models::NodeCommandKind;
use crate::state::AppState;

/// Commands delivered in a single heartbeat response, id order.
const MAX_COMMANDS_PER_HEARTBEAT: i64 = 10;

#[derive(Debug, Serialize)]
pub struct QueuedCommand {
    pub id: i64,
    pub kind: NodeCommandKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub commands: Vec<QueuedCommand>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    NodeAuth { node_id }: NodeAuth,
    Json(snapshot): Json<serde_json::Value>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let pool = state.db().pool();

    sqlx::query(
        r#"UPDATE nodes SET last_heartbeat_at = now(), last_heartbeat_snapshot = $2,
                  status = CASE WHEN status = 'offline' THEN 'online' ELSE status END,
                  updated_at = now()
           WHERE id = $1"#,
    )
    .bind(node_id.value())
    .bind(&snapshot)
    .execute(pool)
    .await?;

    let delivered: Vec<(i64, NodeCommandKind, serde_json::Value)> = sqlx::query_as(
        r#"
        WITH due AS (
            SELECT id FROM node_commands
            WHERE node_id = $1 AND status = 'pending'
            ORDER BY id
            LIMIT $2
            FOR UPDATE
        )
        UPDATE node_commands
        SET status = 'running', started_at = now()
        WHERE id IN (SELECT id FROM due)
        RETURNING id, kind, payload
        "#,
    )
    .bind(node_id.value())
    .bind(MAX_COMMANDS_PER_HEARTBEAT)
    .fetch_all(pool)
    .await?;

    Ok(Json(HeartbeatResponse {
        commands: delivered
            .into_iter()
            .map(|(id, kind, payload)| QueuedCommand { id, kind, payload })
            .collect(),
    }))
}
