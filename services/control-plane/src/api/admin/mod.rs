//! Operator-facing CRUD surface: node management, enrollment approval, SSH
//! keys, command queueing, IP pool/allocation inspection, deployment
//! settings, and Kubernetes cluster status. Thin by design — direct `sqlx`
//! queries against the tables in [`crate::models`], no business logic beyond
//! what the agent-facing modules already specify.

pub mod commands;
pub mod deployment_settings;
pub mod enrollment;
pub mod ip_pools;
pub mod kubernetes;
pub mod nodes;
pub mod ssh_keys;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/{id}", get(nodes::get_node).patch(nodes::patch_node))
        .route("/nodes/{id}/decommission", post(nodes::decommission_node))
        .route("/enrollment-requests", get(enrollment::list_requests))
        .route("/enrollment-requests/{id}/approve", post(enrollment::approve))
        .route("/enrollment-requests/{id}/reject", post(enrollment::reject))
        .route("/nodes/{id}/ssh-keys", get(ssh_keys::list_for_node).post(ssh_keys::create))
        .route("/ssh-keys/{id}", delete(ssh_keys::delete_key))
        .route("/nodes/{id}/commands", get(commands::list_for_node).post(commands::create))
        .route("/ip-pools", get(ip_pools::list_pools))
        .route("/ip-pools/{id}/allocations", get(ip_pools::list_allocations))
        .route(
            "/deployment-settings",
            get(deployment_settings::get_settings).put(deployment_settings::update_settings),
        )
        .route("/kubernetes/cluster", get(kubernetes::get_cluster))
        .route("/kubernetes/refresh-join", post(kubernetes::refresh_join))
}
