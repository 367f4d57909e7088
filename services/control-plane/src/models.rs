//! Row types for every entity in the relational data model.
//!
//! Each struct here maps directly onto one table via `sqlx::FromRow`. IDs are
//! stored as plain `i64` (the `BIGSERIAL` primary key) and converted to their
//! typed `gluon_id` newtype at the module boundary, once the row leaves the
//! query layer — `sqlx::FromRow` only needs to know about the wire column
//! type, not the newtype.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A node's lifecycle status as tracked by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "node_status", rename_all = "snake_case")]
pub enum NodeStatus {
    /// Enrollment request accepted, node has not yet sent its first
    /// heartbeat.
    Pending,
    /// Node is heartbeating within the configured timeout.
    Online,
    /// Administratively taken out of the overlay: excluded from topology the
    /// same as a decommissioned node, but allocations and the node row are
    /// kept untouched so an admin can return it to service.
    Maintenance,
    /// Node missed its heartbeat deadline.
    Offline,
    /// Node was administratively removed; its allocations are retained for
    /// audit but it no longer participates in config generation.
    Decommissioned,
}

/// The overlay role a node plays: hub (control-plane-capable) or worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "node_role", rename_all = "snake_case")]
pub enum NodeRole {
    Hub,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeRow {
    pub id: i64,
    pub hostname: String,
    pub provider: String,
    pub os: String,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub hub_number: Option<i32>,
    /// Interface name -> base64 public key, one entry per WireGuard
    /// interface this node has uploaded a key for. Each per-link interface
    /// gets its own keypair (mirrors the agent's `wg-keys-state.json`), so
    /// this is a map rather than a single node-wide key.
    pub wireguard_keys: Option<serde_json::Value>,
    /// The address peers should dial to reach this node's WireGuard listen
    /// port, reported by the agent during enrollment (its public IP or a
    /// DNS name, depending on deployment).
    pub public_address: Option<String>,
    /// A role the node has asked to take on that differs from its enrolled
    /// `role`, e.g. a worker promoted to also run control plane. Feeds the
    /// kubernetes arbiter's "wants control plane" check alongside `role`.
    pub reported_desired_role: Option<NodeRole>,
    /// The role this node last reported as successfully joined under, per
    /// `/kubernetes/report`. `None` until the first such report.
    pub kubernetes_joined_role: Option<NodeRole>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// The most recent heartbeat document verbatim (CPU/mem/disk/uptime,
    /// journal tail, `wg`/OSPF-neighbor snapshots, users, service status).
    /// Kept as opaque JSON rather than individually typed columns: nothing
    /// on the server side queries into its fields, it's surfaced to admins
    /// as-is and otherwise only used to decide liveness via `last_heartbeat_at`.
    pub last_heartbeat_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The current state of a two-phase enrollment: the agent submits its
/// request, an operator approves it out of band, then the agent polls with
/// the enrollment secret until the approval is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "enrollment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    /// Wire name is `accepted`: an operator "approves" a request out of
    /// band, but the agent polling `/enroll/status` sees `accepted`.
    #[serde(rename = "accepted")]
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EnrollmentRequestRow {
    pub id: i64,
    pub hostname: String,
    pub provider: String,
    pub os: String,
    pub desired_role: NodeRole,
    pub secret_hash: String,
    pub secret_hash_index: String,
    pub status: EnrollmentStatus,
    pub node_id: Option<i64>,
    /// Set the first (and only) time `/enroll/status` hands back a live API
    /// key for this request, so a later poll on an already-accepted request
    /// can be told `accepted` without the key instead of re-issuing it.
    pub api_key_delivered: bool,
    /// Caller IP captured at submission time, used to reject a second
    /// request from the same address while this one is still pending.
    pub public_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: i64,
    pub node_id: i64,
    pub key_hash: String,
    pub key_hash_index: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Optional expiry; `None` means the key never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
    /// Updated at most once per 30s by the authenticating request, so a busy
    /// agent doesn't turn every heartbeat into a write.
    pub last_used_at: Option<DateTime<Utc>>,
}

/// What an IP pool's addresses are used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ip_pool_purpose", rename_all = "snake_case")]
pub enum IpPoolPurpose {
    Loopback,
    HubToHub,
    HubWorker,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IpPoolRow {
    pub id: i64,
    pub purpose: IpPoolPurpose,
    /// For `hub_worker` pools, which hub (1..=3) the pool belongs to.
    pub hub_number: Option<i32>,
    pub cidr: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IpAllocationRow {
    pub id: i64,
    pub pool_id: i64,
    pub node_id: i64,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LinkAllocationRow {
    pub id: i64,
    pub pool_id: i64,
    pub hub_node_id: i64,
    pub peer_node_id: i64,
    pub subnet_cidr: String,
    pub hub_address: String,
    pub peer_address: String,
    /// The hub-side interface's listen port for a hub-worker link (the
    /// per-worker port derived from `ipam::worker_listen_port`). `NULL` for
    /// hub-to-hub links, which use the mesh port instead.
    pub hub_listen_port: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeConfigRow {
    pub id: i64,
    pub node_id: i64,
    pub fingerprint: String,
    /// Interface name -> rendered WireGuard config text, one entry per
    /// peer link (see `config_bundle::render_bundle`). Stored as JSONB
    /// since the number of interfaces varies per node.
    pub wireguard_configs: serde_json::Value,
    pub interfaces_config: String,
    pub frr_config: String,
    pub generated_at: DateTime<Utc>,
    /// The fingerprint the agent last confirmed it applied, via
    /// `/config/applied`. `None` until the agent's first report.
    pub applied_fingerprint: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
}

/// One `authorized_keys` entry an admin has assigned to a node, for a
/// specific Linux username on that node.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SshKeyRow {
    pub id: i64,
    pub node_id: i64,
    pub username: String,
    pub public_key: String,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a dispatched command, per the commands subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "node_command_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeCommandStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "node_command_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeCommandKind {
    /// `payload = {"name": "<unit>"}`; the agent runs `systemctl restart <unit>`
    /// against a 15s deadline.
    RestartService,
    RebootAgent,
    RestartKubernetes,
    ForceRejoin,
    ResyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeCommandRow {
    pub id: i64,
    pub node_id: i64,
    pub kind: NodeCommandKind,
    /// Kind-specific arguments, e.g. `{"name": "<unit>"}` for `restart_service`.
    pub payload: serde_json::Value,
    pub status: NodeCommandStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The Kubernetes cluster's single-row lifecycle record: which node
/// initialized the cluster and what join commands are currently valid.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct KubernetesClusterRow {
    pub id: i32,
    pub initialized: bool,
    pub control_plane_node_id: Option<i64>,
    pub advertise_address: Option<String>,
    pub pod_cidr: String,
    pub service_cidr: String,
    pub kubernetes_version: String,
    pub worker_join_command: Option<String>,
    pub control_plane_join_command: Option<String>,
    pub join_command_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeploymentSettingsRow {
    pub id: i32,
    pub overlay_prefix: String,
    pub hub_to_hub_prefix: String,
    pub hub_worker_prefix_template: String,
    pub loopback_prefix: String,
    pub wireguard_base_port: i32,
    /// OSPF interface cost for hub-to-hub mesh links.
    pub hub_to_hub_cost: i32,
    /// OSPF interface cost on the hub side of a hub-worker link.
    pub hub_to_worker_cost: i32,
    /// OSPF interface cost on the worker side of a hub-worker link.
    pub worker_to_hub_cost: i32,
    /// OSPF area every interface (dummy and links alike) is placed in.
    pub ospf_area: i32,
    /// OSPF hello-interval for link interfaces, in seconds.
    pub ospf_hello_interval: i32,
    /// OSPF dead-interval for link interfaces, in seconds.
    pub ospf_dead_interval: i32,
    pub updated_at: DateTime<Utc>,
}

/// A row in `events` or `audit_log`: something that happened (an agent
/// enrolling, a heartbeat rotating a key) or something an operator did
/// (approving a request, dispatching a command). Both tables share this
/// shape; which one a given fact lands in is a decision made by the caller
/// of [`crate::events::record_event`] / [`crate::events::record_audit`].
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRow {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    /// `"system"` for agent/control-plane-initiated events, `"admin"` for
    /// operator-initiated ones (the admin surface has no per-operator
    /// identity to narrow this further).
    pub actor: String,
    pub kind: String,
    pub payload: serde_json::Value,
}
