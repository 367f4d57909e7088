//! HTTP API handlers and routing.

pub mod admin;
pub mod agent;
pub mod error;
mod health;
pub mod request_context;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{
        MakeRequestId, PropagateRequestIdLayer, RequestId as TowerRequestId, SetRequestIdLayer,
    },
    trace::TraceLayer,
};

use crate::state::AppState;

#[derive(Clone, Copy)]
struct MakeGluonRequestId;

impl MakeRequestId for MakeGluonRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<TowerRequestId> {
        let request_id = uuid::Uuid::now_v7().to_string();
        let header_value = axum::http::HeaderValue::from_str(&request_id).ok()?;
        Some(TowerRequestId::new(header_value))
    }
}

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    let request_id_header = header::HeaderName::from_static("x-request-id");
    let set_request_id = SetRequestIdLayer::new(request_id_header.clone(), MakeGluonRequestId);
    let propagate_request_id = PropagateRequestIdLayer::new(request_id_header);

    Router::new()
        .nest("/", health::routes())
        .nest("/api/agent", agent::routes())
        .nest("/api/admin", admin::routes())
        .layer(TraceLayer::new_for_http())
        .layer(propagate_request_id)
        .layer(set_request_id)
        .layer(cors)
        .with_state(state)
}
