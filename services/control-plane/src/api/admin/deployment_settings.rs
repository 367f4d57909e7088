//! Deployment-wide CIDR and port/cost settings, and the network rebuild
//! this triggers when a CIDR changes.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::request_context::AdminAuth;
use crate::events::{self, ACTOR_ADMIN};
use crate::ipam;
use crate::models::{DeploymentSettingsRow, NodeRole, NodeRow};
use crate::state::AppState;

pub async fn get_settings(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> Result<Json<DeploymentSettingsRow>, ApiError> {
    let row = ipam::load_settings(state.db().pool()).await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub overlay_prefix: String,
    pub hub_to_hub_prefix: String,
    pub hub_worker_prefix_template: String,
    pub loopback_prefix: String,
    pub wireguard_base_port: i32,
    pub hub_to_hub_cost: i32,
    pub hub_to_worker_cost: i32,
    pub worker_to_hub_cost: i32,
    pub ospf_area: i32,
    pub ospf_hello_interval: i32,
    pub ospf_dead_interval: i32,
    /// Must be `true` for a request that changes any CIDR; otherwise the
    /// update is refused so an operator can't trigger a rebuild by accident.
    #[serde(default)]
    pub rebuild: bool,
}

fn cidr_fields_changed(current: &DeploymentSettingsRow, next: &UpdateSettingsRequest) -> bool {
    current.overlay_prefix != next.overlay_prefix
        || current.hub_to_hub_prefix != next.hub_to_hub_prefix
        || current.hub_worker_prefix_template != next.hub_worker_prefix_template
        || current.loopback_prefix != next.loopback_prefix
}

pub async fn update_settings(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Json(body): Json<UpdateSettingsRequest>,
) -> Result<Json<DeploymentSettingsRow>, ApiError> {
    let pool = state.db().pool();
    let current = ipam::load_settings(pool).await?;

    if cidr_fields_changed(&current, &body) && !body.rebuild {
        return Err(ApiError {
            status: axum::http::StatusCode::CONFLICT,
            response: crate::api::error::ErrorResponse::new(
                "requires_rebuild",
                "networking rebuild required for CIDR changes",
            ),
        });
    }

    let mut tx = pool.begin().await?;

    let updated = sqlx::query_as::<_, DeploymentSettingsRow>(
        r#"
        UPDATE deployment_settings
        SET overlay_prefix = $1, hub_to_hub_prefix = $2, hub_worker_prefix_template = $3,
            loopback_prefix = $4, wireguard_base_port = $5, hub_to_hub_cost = $6,
            hub_to_worker_cost = $7, worker_to_hub_cost = $8, ospf_area = $9,
            ospf_hello_interval = $10, ospf_dead_interval = $11, updated_at = now()
        WHERE id = 1
        RETURNING id, overlay_prefix, hub_to_hub_prefix, hub_worker_prefix_template,
                  loopback_prefix, wireguard_base_port, hub_to_hub_cost, hub_to_worker_cost,
                  worker_to_hub_cost, ospf_area, ospf_hello_interval, ospf_dead_interval,
                  updated_at
        "#,
    )
    .bind(&body.overlay_prefix)
    .bind(&body.hub_to_hub_prefix)
    .bind(&body.hub_worker_prefix_template)
    .bind(&body.loopback_prefix)
    .bind(body.wireguard_base_port)
    .bind(body.hub_to_hub_cost)
    .bind(body.hub_to_worker_cost)
    .bind(body.worker_to_hub_cost)
    .bind(body.ospf_area)
    .bind(body.ospf_hello_interval)
    .bind(body.ospf_dead_interval)
    .fetch_one(&mut *tx)
    .await?;

    if body.rebuild {
        rebuild_network(&mut tx, &updated).await?;
    }

    tx.commit().await?;

    events::record_audit(
        pool,
        ACTOR_ADMIN,
        "deployment_settings.updated",
        serde_json::json!({"rebuild": body.rebuild}),
    )
    .await;

    Ok(Json(updated))
}

/// Tears down every derived allocation and pool, then re-derives them from
/// scratch under the new settings, in a single transaction so a failure
/// midway leaves nothing half-migrated for callers to observe.
async fn rebuild_network(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    settings: &DeploymentSettingsRow,
) -> Result<(), ApiError> {
    sqlx::query("DELETE FROM link_allocations").execute(&mut **tx).await?;
    sqlx::query("DELETE FROM ip_allocations").execute(&mut **tx).await?;
    sqlx::query("DELETE FROM ip_pools").execute(&mut **tx).await?;

    ensure_default_pools_in_tx(tx, settings).await?;

    let nodes: Vec<NodeRow> = sqlx::query_as(
        r#"SELECT id, hostname, provider, os, role, status, hub_number, wireguard_keys,
                  public_address, reported_desired_role, kubernetes_joined_role,
                  last_heartbeat_at, last_heartbeat_snapshot, created_at, updated_at
           FROM nodes WHERE status != 'decommissioned' ORDER BY id"#,
    )
    .fetch_all(&mut **tx)
    .await?;

    for node in &nodes {
        allocate_loopback_in_tx(tx, node.id).await?;
        if node.role == NodeRole::Hub {
            sqlx::query("UPDATE nodes SET hub_number = NULL WHERE id = $1")
                .bind(node.id)
                .execute(&mut **tx)
                .await?;
        }
    }
    for node in &nodes {
        if node.role == NodeRole::Hub && ipam::role_requires_hub_number(node.role) {
            ensure_hub_number_in_tx(tx, node.id).await?;
        }
    }

    Ok(())
}

async fn ensure_default_pools_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    settings: &DeploymentSettingsRow,
) -> Result<(), ApiError> {
    use crate::models::IpPoolPurpose;

    async fn insert_pool(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        purpose: IpPoolPurpose,
        hub_number: Option<i32>,
        cidr: &str,
    ) -> Result<(), ApiError> {
        sqlx::query("INSERT INTO ip_pools (purpose, hub_number, cidr) VALUES ($1, $2, $3)")
            .bind(purpose)
            .bind(hub_number)
            .bind(cidr)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    insert_pool(tx, IpPoolPurpose::Loopback, None, &settings.loopback_prefix).await?;
    insert_pool(tx, IpPoolPurpose::HubToHub, None, &settings.hub_to_hub_prefix).await?;
    for hub_number in ipam::HUB_NUMBERS {
        let cidr = settings.hub_worker_prefix_template.replace("{hub}", &hub_number.to_string());
        insert_pool(tx, IpPoolPurpose::HubWorker, Some(hub_number), &cidr).await?;
    }
    Ok(())
}

async fn allocate_loopback_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    node_id: i64,
) -> Result<(), ApiError> {
    use gluon_networking::{Ipv4Allocator, Ipv4Prefix};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    let pool_row: (i64, String) =
        sqlx::query_as("SELECT id, cidr FROM ip_pools WHERE purpose = 'loopback'")
            .fetch_one(&mut **tx)
            .await?;

    let taken: Vec<String> = sqlx::query_scalar("SELECT address FROM ip_allocations WHERE pool_id = $1")
        .bind(pool_row.0)
        .fetch_all(&mut **tx)
        .await?;
    let taken: Vec<Ipv4Addr> = taken.iter().map(|a| Ipv4Addr::from_str(a).expect("stored address is valid IPv4")).collect();

    let prefix = Ipv4Prefix::from_cidr(&pool_row.1).map_err(|e| ApiError::internal("internal_error", e.to_string()))?;
    let allocator = Ipv4Allocator::new(prefix);
    let address = allocator.allocate(&taken).map_err(|e| ApiError::internal("internal_error", e.to_string()))?;

    sqlx::query("INSERT INTO ip_allocations (pool_id, node_id, address) VALUES ($1, $2, $3)")
        .bind(pool_row.0)
        .bind(node_id)
        .bind(address.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn ensure_hub_number_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    node_id: i64,
) -> Result<(), ApiError> {
    let taken: Vec<i32> = sqlx::query_scalar(
        "SELECT hub_number FROM nodes WHERE hub_number IS NOT NULL ORDER BY hub_number",
    )
    .fetch_all(&mut **tx)
    .await?;

    let next = ipam::HUB_NUMBERS
        .into_iter()
        .find(|n| !taken.contains(n))
        .ok_or_else(|| ApiError::internal("hub_numbers_exhausted", "no hub numbers remain"))?;

    sqlx::query("UPDATE nodes SET hub_number = $2 WHERE id = $1")
        .bind(node_id)
        .bind(next)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_settings() -> DeploymentSettingsRow {
        DeploymentSettingsRow {
            id: 1,
            overlay_prefix: "10.10.0.0/16".into(),
            hub_to_hub_prefix: "10.10.1.0/24".into(),
            hub_worker_prefix_template: "10.10.{hub}.0/24".into(),
            loopback_prefix: "10.10.255.0/24".into(),
            wireguard_base_port: 51820,
            hub_to_hub_cost: 10,
            hub_to_worker_cost: 20,
            worker_to_hub_cost: 20,
            ospf_area: 10,
            ospf_hello_interval: 1,
            ospf_dead_interval: 3,
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn detects_cidr_change() {
        let current = sample_settings();
        let mut next = UpdateSettingsRequest {
            overlay_prefix: current.overlay_prefix.clone(),
            hub_to_hub_prefix: current.hub_to_hub_prefix.clone(),
            hub_worker_prefix_template: current.hub_worker_prefix_template.clone(),
            loopback_prefix: current.loopback_prefix.clone(),
            wireguard_base_port: current.wireguard_base_port,
            hub_to_hub_cost: current.hub_to_hub_cost,
            hub_to_worker_cost: current.hub_to_worker_cost,
            worker_to_hub_cost: current.worker_to_hub_cost,
            ospf_area: current.ospf_area,
            ospf_hello_interval: current.ospf_hello_interval,
            ospf_dead_interval: current.ospf_dead_interval,
            rebuild: false,
        };
        assert!(!cidr_fields_changed(&current, &next));
        next.loopback_prefix = "10.11.255.0/24".into();
        assert!(cidr_fields_changed(&current, &next));
    }
}
