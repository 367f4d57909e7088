//! Endpoints an agent uses to learn what WireGuard interfaces it must bring
//! up and to publish the public keys those interfaces should use.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::api::error::ApiError;
use crate::api::request_context::NodeAuth;
use crate::models::NodeRole;
use crate::state::AppState;
use crate::{ipam, topology};

#[derive(Debug, Serialize)]
pub struct NetworkInfoResponse {
    pub node_id: i64,
    pub role: NodeRole,
    pub hub_number: Option<i32>,
    pub required_interfaces: Vec<String>,
}

pub async fn info(
    State(state): State<AppState>,
    NodeAuth { node_id }: NodeAuth,
) -> Result<Json<NetworkInfoResponse>, ApiError> {
    let pool = state.db().pool();

    let node = topology::load_node(pool, node_id.value())
        .await?
        .ok_or_else(|| ApiError::not_found("not_found", "node not found"))?;
    let settings = ipam::load_settings(pool).await?;
    let spec = topology::build_bundle_spec(pool, &settings, &node).await?;

    Ok(Json(NetworkInfoResponse {
        node_id: node.id,
        role: node.role,
        hub_number: node.hub_number,
        required_interfaces: spec.links.into_iter().map(|link| link.interface_name).collect(),
    }))
}

/// Each per-link WireGuard interface gets its own keypair, so a node
/// uploads a map of interface name to public key rather than one key for
/// the whole node.
#[derive(Debug, Deserialize)]
pub struct UploadKeysRequest {
    pub keys: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct UploadKeysResponse {
    pub count: usize,
}

pub async fn upload_keys(
    State(state): State<AppState>,
    NodeAuth { node_id }: NodeAuth,
    Json(body): Json<UploadKeysRequest>,
) -> Result<Json<UploadKeysResponse>, ApiError> {
    let pool = state.db().pool();

    let existing: Option<Option<serde_json::Value>> =
        sqlx::query_scalar(r#"SELECT wireguard_keys FROM nodes WHERE id = $1"#)
            .bind(node_id.value())
            .fetch_optional(pool)
            .await?;
    let existing = existing.flatten();

    let mut merged = match existing {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    for (iface, key) in &body.keys {
        merged.insert(iface.clone(), serde_json::Value::String(key.clone()));
    }

    sqlx::query(r#"UPDATE nodes SET wireguard_keys = $2, updated_at = now() WHERE id = $1"#)
        .bind(node_id.value())
        .bind(serde_json::Value::Object(merged))
        .execute(pool)
        .await?;

    Ok(Json(UploadKeysResponse { count: body.keys.len() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_keys_request_deserializes_iface_to_key_map() {
        let body: UploadKeysRequest =
            serde_json::from_str(r#"{"keys":{"wg-hub1":"abc="}}"#).unwrap();
        assert_eq!(body.keys.get("wg-hub1"), Some(&"abc=".to_string()));
    }
}
