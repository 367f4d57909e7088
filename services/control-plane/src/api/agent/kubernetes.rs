//! Agent-facing surface for kubernetes lifecycle arbitration: what to do
//! next, and reporting back what happened.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::NodeAuth;
use crate::kubernetes::{self, KubernetesReport, KubernetesTask};
use crate::state::AppState;
use crate::{ipam, topology};

/// The wire shape of [`KubernetesTask`]: `action` tags the variant, the
/// other fields are populated only for the action that needs them.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_command: Option<String>,
}

impl From<KubernetesTask> for TaskResponse {
    fn from(task: KubernetesTask) -> Self {
        match task {
            KubernetesTask::None => TaskResponse {
                action: "none",
                control_plane_endpoint: None,
                pod_cidr: None,
                service_cidr: None,
                version: None,
                join_command: None,
            },
            KubernetesTask::Wait => TaskResponse {
                action: "wait",
                control_plane_endpoint: None,
                pod_cidr: None,
                service_cidr: None,
                version: None,
                join_command: None,
            },
            KubernetesTask::Init {
                control_plane_endpoint,
                pod_cidr,
                service_cidr,
                version,
            } => TaskResponse {
                action: "init",
                control_plane_endpoint: Some(control_plane_endpoint),
                pod_cidr: Some(pod_cidr),
                service_cidr: Some(service_cidr),
                version: Some(version),
                join_command: None,
            },
            KubernetesTask::JoinControlPlane { join_command } => TaskResponse {
                action: "join_control_plane",
                control_plane_endpoint: None,
                pod_cidr: None,
                service_cidr: None,
                version: None,
                join_command: Some(join_command),
            },
            KubernetesTask::JoinWorker { join_command } => TaskResponse {
                action: "join_worker",
                control_plane_endpoint: None,
                pod_cidr: None,
                service_cidr: None,
                version: None,
                join_command: Some(join_command),
            },
        }
    }
}

pub async fn task(
    State(state): State<AppState>,
    NodeAuth { node_id }: NodeAuth,
) -> Result<Json<TaskResponse>, ApiError> {
    let pool = state.db().pool();

    let node = topology::load_node(pool, node_id.value())
        .await?
        .ok_or_else(|| ApiError::not_found("not_found", "node not found"))?;
    let loopback_address = ipam::allocate_loopback_ip(pool, node_id).await?;

    let task = kubernetes::next_task(pool, &node, &loopback_address.to_string()).await?;
    Ok(Json(task.into()))
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub control_plane_endpoint: Option<String>,
    #[serde(default)]
    pub pod_cidr: Option<String>,
    #[serde(default)]
    pub service_cidr: Option<String>,
    #[serde(default)]
    pub kubernetes_version: Option<String>,
    #[serde(default)]
    pub worker_join_command: Option<String>,
    #[serde(default)]
    pub control_plane_join_command: Option<String>,
    #[serde(default)]
    pub join_command_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub recorded: bool,
}

pub async fn report(
    State(state): State<AppState>,
    NodeAuth { node_id }: NodeAuth,
    Json(body): Json<ReportRequest>,
) -> Result<Json<ReportResponse>, ApiError> {
    let pool = state.db().pool();

    let report = KubernetesReport {
        state: body.state,
        message: body.message,
        control_plane_endpoint: body.control_plane_endpoint,
        pod_cidr: body.pod_cidr,
        service_cidr: body.service_cidr,
        kubernetes_version: body.kubernetes_version,
        worker_join_command: body.worker_join_command,
        control_plane_join_command: body.control_plane_join_command,
        join_command_expires_at: body.join_command_expires_at,
    };

    kubernetes::record_report(pool, node_id, &report).await?;

    if let Some(endpoint) = &report.control_plane_endpoint {
        kubernetes::correct_advertise_address(pool, endpoint).await?;
    }

    Ok(Json(ReportResponse { recorded: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_task_omits_all_optional_fields() {
        let response: TaskResponse = KubernetesTask::Wait.into();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({"action": "wait"}));
    }

    #[test]
    fn join_worker_task_carries_only_join_command() {
        let response: TaskResponse = KubernetesTask::JoinWorker {
            join_command: "kubeadm join ...".into(),
        }
        .into();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "join_worker", "join_command": "kubeadm join ..."})
        );
    }
}
