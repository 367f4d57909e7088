//! Config bundle delivery: renders (and caches) the node's current bundle,
//! and records when the agent confirms it applied one.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::NodeAuth;
use crate::config_bundle::render_bundle;
use crate::models::{NodeConfigRow, SshKeyRow};
use crate::state::AppState;
use crate::{ipam, topology};

#[derive(Debug, Serialize)]
pub struct SshAuthorizedKeyEntry {
    pub username: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub version: i64,
    pub hash: String,
    pub wireguard_configs: std::collections::BTreeMap<String, String>,
    pub network_interface_file: String,
    pub frr_config_file: String,
    pub ssh_authorized_keys: Vec<SshAuthorizedKeyEntry>,
}

pub async fn get_config(
    State(state): State<AppState>,
    NodeAuth { node_id }: NodeAuth,
) -> Result<Json<ConfigResponse>, ApiError> {
    let pool = state.db().pool();

    let node = topology::load_node(pool, node_id.value())
        .await?
        .ok_or_else(|| ApiError::not_found("not_found", "node not found"))?;
    let settings = ipam::load_settings(pool).await?;
    let spec = topology::build_bundle_spec(pool, &settings, &node).await?;
    let rendered = render_bundle(&spec);

    let wireguard_configs_json = serde_json::to_value(&rendered.wireguard_configs)
        .map_err(|e| ApiError::internal("internal_error", e.to_string()))?;

    let row = sqlx::query_as::<_, NodeConfigRow>(
        r#"
        INSERT INTO node_configs (node_id, fingerprint, wireguard_configs, interfaces_config, frr_config)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (node_id) DO UPDATE SET
            fingerprint = EXCLUDED.fingerprint,
            wireguard_configs = EXCLUDED.wireguard_configs,
            interfaces_config = EXCLUDED.interfaces_config,
            frr_config = EXCLUDED.frr_config,
            generated_at = now()
        RETURNING id, node_id, fingerprint, wireguard_configs, interfaces_config, frr_config,
                  generated_at, applied_fingerprint, applied_at
        "#,
    )
    .bind(node_id.value())
    .bind(rendered.fingerprint.to_string())
    .bind(&wireguard_configs_json)
    .bind(&rendered.interfaces_config)
    .bind(&rendered.frr_config)
    .fetch_one(pool)
    .await?;

    let ssh_keys: Vec<SshKeyRow> = sqlx::query_as(
        r#"SELECT id, node_id, username, public_key, comment, created_at
           FROM ssh_keys WHERE node_id = $1 ORDER BY username, id"#,
    )
    .bind(node_id.value())
    .fetch_all(pool)
    .await?;

    Ok(Json(ConfigResponse {
        version: row.id,
        hash: row.fingerprint,
        wireguard_configs: rendered.wireguard_configs,
        network_interface_file: rendered.interfaces_config,
        frr_config_file: rendered.frr_config,
        ssh_authorized_keys: ssh_keys
            .into_iter()
            .map(|k| SshAuthorizedKeyEntry {
                username: k.username,
                public_key: k.public_key,
                comment: k.comment,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConfigAppliedRequest {
    pub version: i64,
    pub hash: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigAppliedResponse {
    pub recorded: bool,
}

pub async fn config_applied(
    State(state): State<AppState>,
    NodeAuth { node_id }: NodeAuth,
    Json(body): Json<ConfigAppliedRequest>,
) -> Result<Json<ConfigAppliedResponse>, ApiError> {
    let pool = state.db().pool();

    let outcome = sqlx::query(
        r#"UPDATE node_configs SET applied_fingerprint = $3, applied_at = now()
           WHERE node_id = $1 AND id = $2 AND fingerprint = $3"#,
    )
    .bind(node_id.value())
    .bind(body.version)
    .bind(&body.hash)
    .execute(pool)
    .await?;

    Ok(Json(ConfigAppliedResponse {
        recorded: outcome.rows_affected() > 0,
    }))
}
