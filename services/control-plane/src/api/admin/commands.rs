//! Queueing commands for an agent to pick up on its next heartbeat.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::request_context::AdminAuth;
use crate::models::{NodeCommandKind, NodeCommandRow};
use crate::state::AppState;

pub async fn list_for_node(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(node_id): Path<i64>,
) -> Result<Json<Vec<NodeCommandRow>>, ApiError> {
    let rows = sqlx::query_as::<_, NodeCommandRow>(
        r#"SELECT id, node_id, kind, payload, status, output, error, created_at, started_at, completed_at
           FROM node_commands WHERE node_id = $1 ORDER BY id DESC"#,
    )
    .bind(node_id)
    .fetch_all(state.db().pool())
    .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateCommandRequest {
    pub kind: NodeCommandKind,
    #[serde(default = "serde_json::Value::default")]
    pub payload: serde_json::Value,
}

/// `systemctl` unit names: alphanumerics, `-_.@`, with a mandatory
/// `.service`/`.timer`/etc suffix. We only need to reject shell metacharacters
/// before the agent hands this to `systemctl restart <unit>`.
fn is_valid_unit_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 256 {
        return false;
    }
    name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':' | '\\'))
}

fn validate_payload(kind: NodeCommandKind, payload: &serde_json::Value) -> Result<(), ApiError> {
    match kind {
        NodeCommandKind::RestartService => {
            let name = payload
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ApiError::bad_request("invalid_payload", "restart_service requires a string \"name\""))?;
            if !is_valid_unit_name(name) {
                return Err(ApiError::bad_request("invalid_unit_name", "not a valid systemd unit name"));
            }
            Ok(())
        }
        NodeCommandKind::RebootAgent
        | NodeCommandKind::RestartKubernetes
        | NodeCommandKind::ForceRejoin
        | NodeCommandKind::ResyncConfig => Ok(()),
    }
}

pub async fn create(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(node_id): Path<i64>,
    Json(body): Json<CreateCommandRequest>,
) -> Result<Json<NodeCommandRow>, ApiError> {
    validate_payload(body.kind, &body.payload)?;

    let pool = state.db().pool();
    let node_exists: Option<i64> = sqlx::query_scalar("SELECT id FROM nodes WHERE id = $1")
        .bind(node_id)
        .fetch_optional(pool)
        .await?;
    if node_exists.is_none() {
        return Err(ApiError::not_found("not_found", "node not found"));
    }

    let row = sqlx::query_as::<_, NodeCommandRow>(
        r#"INSERT INTO node_commands (node_id, kind, payload, status)
           VALUES ($1, $2, $3, 'pending')
           RETURNING id, node_id, kind, payload, status, output, error, created_at, started_at, completed_at"#,
    )
    .bind(node_id)
    .bind(body.kind)
    .bind(&body.payload)
    .fetch_one(pool)
    .await?;

    Ok(Json(row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_unit_name() {
        assert!(is_valid_unit_name("gluon-agent.service"));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(!is_valid_unit_name("gluon; rm -rf /"));
        assert!(!is_valid_unit_name("gluon && reboot"));
    }

    #[test]
    fn restart_service_requires_name_field() {
        let err = validate_payload(NodeCommandKind::RestartService, &serde_json::json!({}));
        assert!(err.is_err());
    }

    #[test]
    fn other_kinds_ignore_payload() {
        assert!(validate_payload(NodeCommandKind::ResyncConfig, &serde_json::Value::Null).is_ok());
    }
}
