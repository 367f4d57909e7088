//! Bounded execution of commands dispatched by an admin via the heartbeat
//! channel. Every command kind runs against a deadline so a hung subprocess
//! can't wedge the heartbeat loop indefinitely.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::time::timeout;

use crate::client::NodeCommandKind;

const RESTART_SERVICE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the given command to completion (or until its deadline), returning
/// combined stdout+stderr on success and an error otherwise.
pub async fn run(kind: NodeCommandKind, payload: &serde_json::Value) -> Result<String> {
    match kind {
        NodeCommandKind::RestartService => restart_service(payload).await,
        NodeCommandKind::RebootAgent => run_bounded("systemctl", &["reboot"], DEFAULT_TIMEOUT).await,
        NodeCommandKind::RestartKubernetes => {
            run_bounded("systemctl", &["restart", "kubelet"], DEFAULT_TIMEOUT).await
        }
        NodeCommandKind::ForceRejoin => force_rejoin().await,
        NodeCommandKind::ResyncConfig => {
            // The reconciler already polls on a short interval; nothing to
            // do here beyond acknowledging the request.
            Ok("resync requested; next reconcile pass will pick up the latest bundle".to_string())
        }
    }
}

async fn restart_service(payload: &serde_json::Value) -> Result<String> {
    let name = payload
        .get("name")
        .and_then(|v| v.as_str())
        .context("restart_service payload missing \"name\"")?;

    if !is_valid_unit_name(name) {
        anyhow::bail!("refusing to restart unit with invalid name: {name}");
    }

    run_bounded("systemctl", &["restart", name], RESTART_SERVICE_TIMEOUT).await
}

async fn force_rejoin() -> Result<String> {
    run_bounded("kubeadm", &["reset", "--force"], DEFAULT_TIMEOUT).await
}

/// Mirrors the control plane's own validation so a bug there isn't the
/// only thing standing between an admin and a shell-metacharacter payload.
fn is_valid_unit_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 128 {
        return false;
    }
    name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':' | '\\'))
}

async fn run_bounded(command: &str, args: &[&str], deadline: Duration) -> Result<String> {
    let child = Command::new(command).args(args).output();

    let output = timeout(deadline, child)
        .await
        .with_context(|| format!("{command} {args:?} timed out after {deadline:?}"))?
        .with_context(|| format!("failed to run {command} {args:?}"))?;

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if !output.status.success() {
        anyhow::bail!("{command} {args:?} exited with {}: {combined}", output.status);
    }

    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_unit_name() {
        assert!(is_valid_unit_name("wg-quick@wg-hub1.service"));
        assert!(is_valid_unit_name("frr.service"));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(!is_valid_unit_name("frr.service; rm -rf /"));
        assert!(!is_valid_unit_name("frr.service && echo pwned"));
        assert!(!is_valid_unit_name(""));
    }

    #[tokio::test]
    async fn restart_service_requires_name_field() {
        let result = restart_service(&serde_json::json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn restart_service_rejects_invalid_name_before_spawning() {
        let result = restart_service(&serde_json::json!({"name": "foo; echo pwned"})).await;
        assert!(result.is_err());
    }
}
