//! The agent-facing HTTP surface: enrollment, heartbeat, commands, network
//! info/key upload, config bundle delivery, and kubernetes task polling.
//!
//! Everything here authenticates with [`crate::api::request_context::NodeAuth`]
//! except the two enrollment endpoints, which predate the node having an API
//! key at all.

pub mod commands;
pub mod config;
pub mod enroll;
pub mod heartbeat;
pub mod kubernetes;
pub mod network;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/enroll", post(enroll::enroll))
        .route("/enroll/status", post(enroll::enroll_status))
        .route("/heartbeat", post(heartbeat::heartbeat))
        .route("/commands/report", post(commands::report))
        .route("/network/info", get(network::info))
        .route("/network/keys", post(network::upload_keys))
        .route("/config", get(config::get_config))
        .route("/config/applied", post(config::config_applied))
        .route("/kubernetes/task", get(kubernetes::task))
        .route("/kubernetes/report", post(kubernetes::report))
}
