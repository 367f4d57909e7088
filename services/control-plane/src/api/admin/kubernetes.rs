//! Cluster status inspection and a manual trigger to force the bootstrap
//! hub through the join-command refresh path on its next poll.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::AdminAuth;
use crate::models::KubernetesClusterRow;
use crate::state::AppState;

pub async fn get_cluster(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<KubernetesClusterRow>, ApiError> {
    let row = sqlx::query_as::<_, KubernetesClusterRow>(
        r#"SELECT id, initialized, control_plane_node_id, advertise_address, pod_cidr,
                  service_cidr, kubernetes_version, worker_join_command, control_plane_join_command,
                  join_command_expires_at, updated_at
           FROM kubernetes_cluster WHERE id = 1"#,
    )
    .fetch_one(state.db().pool())
    .await?;
    Ok(Json(row))
}

#[derive(Debug, Serialize)]
pub struct RefreshJoinResponse {
    pub refreshed: bool,
}

/// Back-dates the join commands' expiry the same way a detected
/// `kubeadm-certs` secret expiry does, so the bootstrap hub's next poll
/// takes the `init`-refresh branch instead of handing out stale commands.
pub async fn refresh_join(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<RefreshJoinResponse>, ApiError> {
    let outcome = sqlx::query(
        r#"
        UPDATE kubernetes_cluster
        SET worker_join_command = NULL,
            control_plane_join_command = NULL,
            join_command_expires_at = now() - interval '1 hour',
            updated_at = now()
        WHERE id = 1 AND initialized = true
        "#,
    )
    .execute(state.db().pool())
    .await?;

    Ok(Json(RefreshJoinResponse {
        refreshed: outcome.rows_affected() > 0,
    }))
}
