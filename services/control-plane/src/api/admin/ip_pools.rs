//! Read-only inspection of IPAM pools and their allocations. Pools
//! themselves are only created as a side effect of `ensure_default_pools`
//! (on startup) or a deployment-settings rebuild; there's no freeform pool
//! creation endpoint.

use axum::extract::{Path, State};
use axum::Json;

use crate::api::error::ApiError;
use crate::api::request_context::AdminAuth;
use crate::models::{IpAllocationRow, IpPoolRow};
use crate::state::AppState;

pub async fn list_pools(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<Vec<IpPoolRow>>, ApiError> {
    let rows = sqlx::query_as::<_, IpPoolRow>(
        r#"SELECT id, purpose, hub_number, cidr, created_at FROM ip_pools ORDER BY id"#,
    )
    .fetch_all(state.db().pool())
    .await?;
    Ok(Json(rows))
}

pub async fn list_allocations(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(pool_id): Path<i64>,
) -> Result<Json<Vec<IpAllocationRow>>, ApiError> {
    let rows = sqlx::query_as::<_, IpAllocationRow>(
        r#"SELECT id, pool_id, node_id, address, created_at
           FROM ip_allocations WHERE pool_id = $1 ORDER BY id"#,
    )
    .bind(pool_id)
    .fetch_all(state.db().pool())
    .await?;
    Ok(Json(rows))
}
