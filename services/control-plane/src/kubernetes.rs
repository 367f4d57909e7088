//! Kubernetes lifecycle arbitration.
//!
//! The control plane holds the single source of truth for "has the cluster
//! been initialized, and by whom" in the `kubernetes_cluster` singleton row.
//! Agents ask this module what to do next each time they poll; the answer
//! is always derived fresh from that row plus the node's own status, never
//! cached, so a restarted control plane can't hand out a stale instruction.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use thiserror::Error;

use gluon_id::NodeId;

use crate::db::DbError;
use crate::models::{KubernetesClusterRow, NodeRole, NodeRow};

#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<sqlx::Error> for KubernetesError {
    fn from(e: sqlx::Error) -> Self {
        KubernetesError::Db(e.into())
    }
}

/// What an agent should do on its next kubernetes reconciliation pass.
/// A tagged sum rather than a status string plus optional fields, so a
/// caller can't observe e.g. a `join_worker` task with no join command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubernetesTask {
    /// Already joined in the role this node wants; nothing to do.
    None,
    /// Cluster not initialized yet and this node isn't the bootstrap hub.
    Wait,
    /// Run `kubeadm init`. Issued to the bootstrap hub, either for the
    /// first time or to mint fresh join commands.
    Init {
        control_plane_endpoint: String,
        pod_cidr: String,
        service_cidr: String,
        version: String,
    },
    JoinControlPlane { join_command: String },
    JoinWorker { join_command: String },
}

/// A join command is refreshed once less than this much time remains on it,
/// rather than waiting for it to expire outright.
const JOIN_COMMAND_REFRESH_WINDOW: ChronoDuration = ChronoDuration::minutes(30);

async fn load_cluster_row(pool: &PgPool) -> Result<KubernetesClusterRow, KubernetesError> {
    let row = sqlx::query_as::<_, KubernetesClusterRow>(
        r#"SELECT id, initialized, control_plane_node_id, advertise_address, pod_cidr,
                  service_cidr, kubernetes_version, worker_join_command, control_plane_join_command,
                  join_command_expires_at, updated_at
           FROM kubernetes_cluster WHERE id = 1"#,
    )
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// `role==hub` or the node has separately reported wanting to run control
/// plane despite its enrolled role being `worker` (a promotion).
fn wants_control_plane(node: &NodeRow) -> bool {
    matches!(node.role, NodeRole::Hub) || matches!(node.reported_desired_role, Some(NodeRole::Hub))
}

/// The bootstrap hub is whichever hub has the lowest `hub_number`: the one
/// hub allowed to run the very first `kubeadm init` and to mint refreshed
/// join commands thereafter.
fn is_bootstrap_hub(node: &NodeRow) -> bool {
    matches!(node.role, NodeRole::Hub) && node.hub_number == Some(1)
}

fn join_command_is_fresh(expires_at: Option<DateTime<Utc>>) -> bool {
    match expires_at {
        Some(expires_at) => expires_at > Utc::now() + JOIN_COMMAND_REFRESH_WINDOW,
        None => false,
    }
}

fn already_joined(node: &NodeRow, target_role: NodeRole) -> bool {
    node.kubernetes_joined_role == Some(target_role)
}

/// Decides the next lifecycle task for a polling node.
pub async fn next_task(
    pool: &PgPool,
    node: &NodeRow,
    loopback_address: &str,
) -> Result<KubernetesTask, KubernetesError> {
    let target_role = if wants_control_plane(node) { NodeRole::Hub } else { NodeRole::Worker };
    if already_joined(node, target_role) {
        return Ok(KubernetesTask::None);
    }

    let row = load_cluster_row(pool).await?;

    if !row.initialized {
        if !is_bootstrap_hub(node) {
            return Ok(KubernetesTask::Wait);
        }
        return claim_and_init(pool, node, loopback_address, &row).await;
    }

    if wants_control_plane(node) {
        if join_command_is_fresh(row.join_command_expires_at) {
            if let Some(join_command) = row.control_plane_join_command.clone() {
                return Ok(KubernetesTask::JoinControlPlane { join_command });
            }
        }
        if is_bootstrap_hub(node) {
            return refresh_join_commands(pool, node, loopback_address, &row).await;
        }
        return Ok(KubernetesTask::Wait);
    }

    match row.worker_join_command.clone() {
        Some(join_command) => Ok(KubernetesTask::JoinWorker { join_command }),
        None => Ok(KubernetesTask::Wait),
    }
}

/// Claims the uninitialized cluster row for this bootstrap hub and returns
/// `init`. If another bootstrap-hub poll won the race first (shouldn't
/// happen since there's only one bootstrap hub, but polls can overlap),
/// falls back to whatever task the now-initialized row implies.
async fn claim_and_init(
    pool: &PgPool,
    node: &NodeRow,
    loopback_address: &str,
    row: &KubernetesClusterRow,
) -> Result<KubernetesTask, KubernetesError> {
    let claimed = sqlx::query(
        r#"
        UPDATE kubernetes_cluster
        SET initialized = true, control_plane_node_id = $1, advertise_address = $2, updated_at = now()
        WHERE id = 1 AND initialized = false
        "#,
    )
    .bind(node.id)
    .bind(loopback_address)
    .execute(pool)
    .await?;

    if claimed.rows_affected() == 1 {
        return Ok(KubernetesTask::Init {
            control_plane_endpoint: loopback_address.to_string(),
            pod_cidr: row.pod_cidr.clone(),
            service_cidr: row.service_cidr.clone(),
            version: row.kubernetes_version.clone(),
        });
    }

    let row = load_cluster_row(pool).await?;
    match row.control_plane_join_command.clone() {
        Some(join_command) => Ok(KubernetesTask::JoinControlPlane { join_command }),
        None => Ok(KubernetesTask::Wait),
    }
}

/// The bootstrap hub re-runs `init` to mint fresh join commands when the
/// current ones are absent or about to expire. The cluster is already
/// initialized, so this doesn't touch `control_plane_node_id`.
async fn refresh_join_commands(
    pool: &PgPool,
    node: &NodeRow,
    loopback_address: &str,
    row: &KubernetesClusterRow,
) -> Result<KubernetesTask, KubernetesError> {
    let _ = node;
    sqlx::query(r#"UPDATE kubernetes_cluster SET updated_at = now() WHERE id = 1"#)
        .execute(pool)
        .await?;
    Ok(KubernetesTask::Init {
        control_plane_endpoint: row.advertise_address.clone().unwrap_or_else(|| loopback_address.to_string()),
        pod_cidr: row.pod_cidr.clone(),
        service_cidr: row.service_cidr.clone(),
        version: row.kubernetes_version.clone(),
    })
}

/// A node's self-report of its kubernetes sync outcome, as POSTed to
/// `/kubernetes/report`.
#[derive(Debug, Clone)]
pub struct KubernetesReport {
    pub state: String,
    pub message: Option<String>,
    pub control_plane_endpoint: Option<String>,
    pub pod_cidr: Option<String>,
    pub service_cidr: Option<String>,
    pub kubernetes_version: Option<String>,
    pub worker_join_command: Option<String>,
    pub control_plane_join_command: Option<String>,
    pub join_command_expires_at: Option<DateTime<Utc>>,
}

/// A node's reported error text containing all three of these substrings
/// means kubeadm's upload-certs secret expired server-side; the bootstrap
/// hub needs to take the `init`-refresh branch on its next poll rather than
/// keep handing out join commands that can never work.
fn report_indicates_expired_certs_secret(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("kubeadm-certs") && lower.contains("secret") && lower.contains("not found")
}

/// Upserts the singleton cluster row from an agent's report and updates the
/// reporting node's joined-role marker, without the agent needing to own
/// any version/conflict logic itself.
pub async fn record_report(
    pool: &PgPool,
    node_id: NodeId,
    report: &KubernetesReport,
) -> Result<(), KubernetesError> {
    let joined_role = match report.state.as_str() {
        "cluster_initialized" | "joined_control_plane" => Some(NodeRole::Hub),
        "joined_worker" => Some(NodeRole::Worker),
        _ => None,
    };
    if let Some(role) = joined_role {
        sqlx::query(r#"UPDATE nodes SET kubernetes_joined_role = $2, updated_at = now() WHERE id = $1"#)
            .bind(node_id.value())
            .bind(role)
            .execute(pool)
            .await?;
    }

    let force_cert_refresh = report
        .message
        .as_deref()
        .is_some_and(report_indicates_expired_certs_secret);

    if force_cert_refresh {
        sqlx::query(
            r#"
            UPDATE kubernetes_cluster
            SET worker_join_command = NULL,
                control_plane_join_command = NULL,
                join_command_expires_at = now() - interval '1 hour',
                updated_at = now()
            WHERE id = 1
            "#,
        )
        .execute(pool)
        .await?;
        return Ok(());
    }

    sqlx::query(
        r#"
        UPDATE kubernetes_cluster
        SET advertise_address = COALESCE($2, advertise_address),
            pod_cidr = COALESCE($3, pod_cidr),
            service_cidr = COALESCE($4, service_cidr),
            kubernetes_version = COALESCE($5, kubernetes_version),
            worker_join_command = COALESCE($6, worker_join_command),
            control_plane_join_command = COALESCE($7, control_plane_join_command),
            join_command_expires_at = COALESCE($8, join_command_expires_at),
            updated_at = now()
        WHERE id = 1
        "#,
    )
    .bind(1_i32)
    .bind(&report.control_plane_endpoint)
    .bind(&report.pod_cidr)
    .bind(&report.service_cidr)
    .bind(&report.kubernetes_version)
    .bind(&report.worker_join_command)
    .bind(&report.control_plane_join_command)
    .bind(report.join_command_expires_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Corrects the cluster's recorded advertise address when a control-plane
/// node reports a different one than what's on file (the drift-detection
/// self-heal described for the agent side, mirrored on the control plane so
/// a later join picks up the corrected address).
pub async fn correct_advertise_address(
    pool: &PgPool,
    observed: &str,
) -> Result<(), KubernetesError> {
    sqlx::query(
        r#"UPDATE kubernetes_cluster SET advertise_address = $1, updated_at = now() WHERE id = 1 AND advertise_address IS DISTINCT FROM $1"#,
    )
    .bind(observed)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_node(role: NodeRole, hub_number: Option<i32>) -> NodeRow {
        NodeRow {
            id: 1,
            hostname: "hub-1".into(),
            provider: "bare-metal".into(),
            os: "debian12".into(),
            role,
            status: crate::models::NodeStatus::Online,
            hub_number,
            wireguard_keys: None,
            public_address: None,
            reported_desired_role: None,
            kubernetes_joined_role: None,
            last_heartbeat_at: None,
            last_heartbeat_snapshot: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn wants_control_plane_true_for_hub_role() {
        assert!(wants_control_plane(&sample_node(NodeRole::Hub, Some(1))));
    }

    #[test]
    fn wants_control_plane_true_for_promoted_worker() {
        let mut node = sample_node(NodeRole::Worker, None);
        node.reported_desired_role = Some(NodeRole::Hub);
        assert!(wants_control_plane(&node));
    }

    #[test]
    fn wants_control_plane_false_for_plain_worker() {
        assert!(!wants_control_plane(&sample_node(NodeRole::Worker, None)));
    }

    #[test]
    fn bootstrap_hub_is_hub_number_one_only() {
        assert!(is_bootstrap_hub(&sample_node(NodeRole::Hub, Some(1))));
        assert!(!is_bootstrap_hub(&sample_node(NodeRole::Hub, Some(2))));
        assert!(!is_bootstrap_hub(&sample_node(NodeRole::Worker, None)));
    }

    #[test]
    fn join_command_near_expiry_is_not_fresh() {
        assert!(!join_command_is_fresh(Some(Utc::now() + ChronoDuration::minutes(10))));
        assert!(join_command_is_fresh(Some(Utc::now() + ChronoDuration::hours(1))));
        assert!(!join_command_is_fresh(None));
    }

    #[test]
    fn expired_certs_secret_is_detected_case_insensitively() {
        assert!(report_indicates_expired_certs_secret(
            "configmaps \"kubeadm-certs\" not found: Secret not found"
        ));
        assert!(!report_indicates_expired_certs_secret("connection refused"));
    }
}
