//! Completion reports for commands an agent previously pulled off a
//! heartbeat.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::NodeAuth;
use crate::models::NodeCommandStatus;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CommandResult {
    pub id: i64,
    pub status: NodeCommandStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub results: Vec<CommandResult>,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub updated: usize,
}

pub async fn report(
    State(state): State<AppState>,
    NodeAuth { node_id }: NodeAuth,
    Json(body): Json<ReportRequest>,
) -> Result<Json<ReportResponse>, ApiError> {
    let pool = state.db().pool();
    let mut updated = 0usize;

    for result in &body.results {
        if !matches!(result.status, NodeCommandStatus::Succeeded | NodeCommandStatus::Failed) {
            return Err(ApiError::bad_request(
                "invalid_status",
                "command report status must be succeeded or failed",
            ));
        }

        let outcome = sqlx::query(
            r#"UPDATE node_commands
               SET status = $3, output = $4, error = $5, completed_at = now()
               WHERE id = $1 AND node_id = $2 AND status = 'running'"#,
        )
        .bind(result.id)
        .bind(node_id.value())
        .bind(result.status)
        .bind(&result.output)
        .bind(&result.error)
        .execute(pool)
        .await?;

        if outcome.rows_affected() > 0 {
            updated += 1;
        }
    }

    Ok(Json(ReportResponse { updated }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_request_deserializes_minimal_result() {
        let body: ReportRequest = serde_json::from_str(
            r#"{"results":[{"id":1,"status":"succeeded"}]}"#,
        )
        .unwrap();
        assert_eq!(body.results.len(), 1);
        assert_eq!(body.results[0].output, None);
        assert_eq!(body.results[0].error, None);
    }

    #[test]
    fn report_request_carries_error_for_failed_result() {
        let body: ReportRequest = serde_json::from_str(
            r#"{"results":[{"id":1,"status":"failed","error":"unit not found"}]}"#,
        )
        .unwrap();
        assert_eq!(body.results[0].error.as_deref(), Some("unit not found"));
    }
}
