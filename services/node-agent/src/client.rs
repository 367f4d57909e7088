//! Control plane API client for the node agent.
//!
//! Every method follows the same shape: build the URL, send, check the
//! status, log and bail with the response body on failure, else decode JSON.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::{Config, NodeRole};

/// Control plane API client.
///
/// Unauthenticated until [`ControlPlaneClient::set_api_key`] is called with
/// the key handed back by `/enroll/status`; the two enrollment endpoints
/// are the only ones that don't need one.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ControlPlaneClient {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: config.control_plane_url.clone(),
            api_key: config.enrollment.api_key.clone(),
        }
    }

    pub fn set_api_key(&mut self, api_key: String) {
        self.api_key = Some(api_key);
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/agent{path}", self.base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    pub async fn enroll(&self, request: &EnrollRequest) -> Result<EnrollResponse> {
        let url = self.url("/enroll");
        debug!(url = %url, "submitting enrollment request");

        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "enrollment submission failed");
            anyhow::bail!("enrollment submission failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }

    pub async fn enroll_status(&self, request: &EnrollStatusRequest) -> Result<EnrollStatusResponse> {
        let url = self.url("/enroll/status");

        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "enrollment status poll failed");
            anyhow::bail!("enrollment status poll failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }

    pub async fn heartbeat(&self, snapshot: &serde_json::Value) -> Result<HeartbeatResponse> {
        let url = self.url("/heartbeat");

        let response = self
            .authed(self.client.post(&url).json(snapshot))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "heartbeat failed");
            anyhow::bail!("heartbeat failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }

    pub async fn report_commands(&self, request: &CommandReportRequest) -> Result<CommandReportResponse> {
        let url = self.url("/commands/report");

        let response = self.authed(self.client.post(&url).json(request)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "command report failed");
            anyhow::bail!("command report failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }

    pub async fn network_info(&self) -> Result<NetworkInfoResponse> {
        let url = self.url("/network/info");

        let response = self.authed(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "fetching network info failed");
            anyhow::bail!("fetching network info failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }

    pub async fn upload_keys(&self, keys: BTreeMap<String, String>) -> Result<UploadKeysResponse> {
        let url = self.url("/network/keys");

        let response = self
            .authed(self.client.post(&url).json(&UploadKeysRequest { keys }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "uploading wireguard keys failed");
            anyhow::bail!("uploading wireguard keys failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }

    pub async fn get_config(&self) -> Result<ConfigResponse> {
        let url = self.url("/config");

        let response = self.authed(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "fetching config bundle failed");
            anyhow::bail!("fetching config bundle failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }

    pub async fn config_applied(&self, version: i64, hash: String) -> Result<ConfigAppliedResponse> {
        let url = self.url("/config/applied");

        let response = self
            .authed(self.client.post(&url).json(&ConfigAppliedRequest { version, hash }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "reporting applied config failed");
            anyhow::bail!("reporting applied config failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }

    pub async fn kubernetes_task(&self) -> Result<KubernetesTaskResponse> {
        let url = self.url("/kubernetes/task");

        let response = self.authed(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "fetching kubernetes task failed");
            anyhow::bail!("fetching kubernetes task failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }

    pub async fn kubernetes_report(&self, request: &KubernetesReportRequest) -> Result<KubernetesReportResponse> {
        let url = self.url("/kubernetes/report");

        let response = self.authed(self.client.post(&url).json(request)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "reporting kubernetes status failed");
            anyhow::bail!("reporting kubernetes status failed: {status} - {body}");
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, Serialize)]
pub struct EnrollRequest {
    pub hostname: String,
    pub provider: String,
    pub os: String,
    pub desired_role: NodeRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Deserialize)]
pub struct EnrollResponse {
    pub request_id: i64,
    pub enrollment_secret: String,
    pub status: EnrollmentStatus,
}

#[derive(Debug, Serialize)]
pub struct EnrollStatusRequest {
    pub request_id: i64,
    pub enrollment_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct EnrollStatusResponse {
    pub status: EnrollmentStatus,
    #[serde(default)]
    pub node_id: Option<i64>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCommandKind {
    RestartService,
    RebootAgent,
    RestartKubernetes,
    ForceRejoin,
    ResyncConfig,
}

#[derive(Debug, Deserialize)]
pub struct QueuedCommand {
    pub id: i64,
    pub kind: NodeCommandKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatResponse {
    pub commands: Vec<QueuedCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct CommandResult {
    pub id: i64,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandReportRequest {
    pub results: Vec<CommandResult>,
}

#[derive(Debug, Deserialize)]
pub struct CommandReportResponse {
    pub updated: usize,
}

#[derive(Debug, Deserialize)]
pub struct NetworkInfoResponse {
    pub node_id: i64,
    pub role: NodeRole,
    pub hub_number: Option<i32>,
    pub required_interfaces: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UploadKeysRequest {
    keys: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadKeysResponse {
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct SshAuthorizedKeyEntry {
    pub username: String,
    pub public_key: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigResponse {
    pub version: i64,
    pub hash: String,
    pub wireguard_configs: BTreeMap<String, String>,
    pub network_interface_file: String,
    pub frr_config_file: String,
    pub ssh_authorized_keys: Vec<SshAuthorizedKeyEntry>,
}

#[derive(Debug, Serialize)]
struct ConfigAppliedRequest {
    version: i64,
    hash: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfigAppliedResponse {
    pub recorded: bool,
}

/// The wire shape of the control plane's kubernetes task arbiter: `action`
/// tags the variant, the rest are populated only for the action it names.
#[derive(Debug, Deserialize)]
pub struct KubernetesTaskResponse {
    pub action: String,
    #[serde(default)]
    pub control_plane_endpoint: Option<String>,
    #[serde(default)]
    pub pod_cidr: Option<String>,
    #[serde(default)]
    pub service_cidr: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub join_command: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct KubernetesReportRequest {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_join_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_join_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_command_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct KubernetesReportResponse {
    pub recorded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enroll_status_response_accepts_minimal_pending_body() {
        let body: EnrollStatusResponse =
            serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert_eq!(body.status, EnrollmentStatus::Pending);
        assert_eq!(body.node_id, None);
        assert_eq!(body.api_key, None);
    }

    #[test]
    fn enroll_status_response_decodes_accepted_with_key() {
        let body: EnrollStatusResponse =
            serde_json::from_str(r#"{"status":"accepted","node_id":7,"api_key":"key_abc"}"#)
                .unwrap();
        assert_eq!(body.status, EnrollmentStatus::Accepted);
        assert_eq!(body.node_id, Some(7));
        assert_eq!(body.api_key.as_deref(), Some("key_abc"));
    }

    #[test]
    fn command_result_omits_absent_output_and_error() {
        let result = CommandResult {
            id: 1,
            status: CommandStatus::Succeeded,
            output: None,
            error: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(!json.as_object().unwrap().contains_key("output"));
        assert!(!json.as_object().unwrap().contains_key("error"));
    }

    #[test]
    fn kubernetes_task_response_decodes_wait_action() {
        let body: KubernetesTaskResponse = serde_json::from_str(r#"{"action":"wait"}"#).unwrap();
        assert_eq!(body.action, "wait");
        assert!(body.join_command.is_none());
    }
}
