//! Two-phase enrollment: submit a request once, then poll until an
//! operator approves or rejects it.
//!
//! Grounded on the original agent's config/enrollment split: a request id
//! and enrollment secret are persisted the moment they're issued, never
//! regenerated, and the node id / API key are persisted the moment they're
//! handed back so a later restart picks up mid-poll instead of re-enrolling.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::client::{ControlPlaneClient, EnrollRequest, EnrollStatusRequest, EnrollmentStatus};
use crate::config::Config;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Ensures `config.enrollment` ends up fully enrolled, blocking until an
/// operator approves or rejects the request. Returns an error if rejected;
/// callers should treat that as fatal rather than retrying forever.
pub async fn ensure_enrolled(config: &mut Config, client: &mut ControlPlaneClient) -> Result<()> {
    if config.enrollment.is_enrolled() {
        return Ok(());
    }

    if !config.enrollment.has_pending_enrollment() {
        submit(config, client).await?;
    }

    loop {
        match poll_once(config, client).await? {
            EnrollmentStatus::Pending => {
                info!("enrollment still pending, waiting for operator approval");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            EnrollmentStatus::Accepted => {
                if config.enrollment.is_enrolled() {
                    return Ok(());
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            EnrollmentStatus::Rejected => {
                anyhow::bail!("enrollment request {:?} was rejected", config.enrollment.request_id);
            }
        }
    }
}

async fn submit(config: &mut Config, client: &ControlPlaneClient) -> Result<()> {
    let request = EnrollRequest {
        hostname: config.hostname.clone(),
        provider: config.provider.clone(),
        os: config.os.clone(),
        desired_role: config.desired_role,
    };

    let response = client.enroll(&request).await?;
    info!(request_id = response.request_id, "submitted enrollment request");

    config.enrollment.request_id = Some(response.request_id);
    config.enrollment.enrollment_secret = Some(response.enrollment_secret);
    config.save_enrollment()?;
    Ok(())
}

async fn poll_once(config: &mut Config, client: &mut ControlPlaneClient) -> Result<EnrollmentStatus> {
    let request_id = config
        .enrollment
        .request_id
        .expect("poll_once called without a pending request id");
    let secret = config
        .enrollment
        .enrollment_secret
        .clone()
        .expect("poll_once called without an enrollment secret");

    let response = match client
        .enroll_status(&EnrollStatusRequest { request_id, enrollment_secret: secret })
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "enrollment status poll failed, retrying");
            return Ok(EnrollmentStatus::Pending);
        }
    };

    if let (Some(node_id), Some(api_key)) = (response.node_id, response.api_key.clone()) {
        config.enrollment.node_id = Some(node_id);
        config.enrollment.api_key = Some(api_key.clone());
        config.save_enrollment()?;
        client.set_api_key(api_key);
        info!(node_id, "enrollment approved, API key acquired");
    } else if let Some(node_id) = response.node_id {
        config.enrollment.node_id = Some(node_id);
        config.save_enrollment()?;
    }

    Ok(response.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnrollmentState, NodeRole};
    use std::path::PathBuf;

    fn base_config() -> Config {
        Config {
            control_plane_url: "http://example".into(),
            data_dir: PathBuf::from("/tmp/does-not-matter"),
            hostname: "host".into(),
            provider: "bare-metal".into(),
            os: "linux".into(),
            desired_role: NodeRole::Worker,
            heartbeat_interval_secs: 10,
            log_level: "info".into(),
            enrollment: EnrollmentState::default(),
        }
    }

    #[test]
    fn fresh_config_has_no_pending_enrollment() {
        let config = base_config();
        assert!(!config.enrollment.has_pending_enrollment());
        assert!(!config.enrollment.is_enrolled());
    }
}
