//! Kubernetes lifecycle arbiter client: polls the control plane for a task
//! (`none`/`wait`/`init`/`join_control_plane`/`join_worker`), drives `kubeadm`
//! accordingly, and reports the outcome back. Also carries the self-healing
//! behaviors the original agent ties to every sync tick: a CNI watchdog, a
//! kubelet `--node-ip` pin to the overlay address, advertise-address drift
//! detection with forced rejoin, and an unhealthy-local-apiserver rejoin.
//!
//! Grounded on `agent/kubernetes/kubernetes_linux.go`. The original's package
//! level mutex+timestamp pairs become fields on [`KubernetesAgent`], since the
//! agent process owns one instance of this for its whole lifetime.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::client::{ControlPlaneClient, KubernetesReportRequest, KubernetesTaskResponse};

const ADMIN_CONF_PATH: &str = "/etc/kubernetes/admin.conf";
const KUBELET_CONF_PATH: &str = "/etc/kubernetes/kubelet.conf";
const CONTROL_PLANE_MANIFEST_PATH: &str = "/etc/kubernetes/manifests/kube-apiserver.yaml";
const ETCD_MANIFEST_PATH: &str = "/etc/kubernetes/manifests/etcd.yaml";
const CNI_NET_DIR: &str = "/etc/cni/net.d";
const KUBELET_KUBEADM_FLAGS_PATH: &str = "/var/lib/kubelet/kubeadm-flags.env";
const DEFAULT_KUBELET_PATH: &str = "/etc/default/kubelet";

const FLANNEL_MANIFEST_URL: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";

const OVERLAY_POOL_PREFIX: [u8; 2] = [10, 255];
const LOOPBACK_POOL_PREFIX: [u8; 3] = [10, 255, 0];

const FLANNEL_PATCH_INTERVAL: Duration = Duration::from_secs(2 * 60);
const FLANNEL_INSTALL_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CONTROL_PLANE_LABEL_INTERVAL: Duration = Duration::from_secs(2 * 60);
const CONTROL_PLANE_REJOIN_INTERVAL: Duration = Duration::from_secs(10 * 60);
const HEALTH_REJOIN_INTERVAL: Duration = Duration::from_secs(30 * 60);
const KUBELET_NODE_IP_INTERVAL: Duration = Duration::from_secs(2 * 60);
const MISSING_JOIN_REPORT_INTERVAL: Duration = Duration::from_secs(5 * 60);
const APISERVER_MANIFEST_PATCH_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct InitResult {
    worker_join_command: String,
    control_plane_join_command: String,
    join_expires_at: DateTime<Utc>,
}

/// Drives one node's Kubernetes lifecycle across repeated sync ticks. Holds
/// rate-limit timestamps for every self-healing action so a misbehaving
/// cluster can't make this loop hammer `kubeadm`/`kubectl` every tick.
#[derive(Default)]
pub struct KubernetesAgent {
    last_flannel_patch: Option<Instant>,
    last_flannel_install: Option<Instant>,
    last_control_plane_label: Option<Instant>,
    last_control_plane_rejoin: Option<Instant>,
    last_health_rejoin: Option<Instant>,
    last_kubelet_node_ip: Option<Instant>,
    last_missing_join_report: Option<Instant>,
    last_apiserver_manifest_patch: Option<Instant>,
}

impl KubernetesAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// One sync tick: fetch the task, run the self-healing checks, then act.
    pub async fn sync(&mut self, client: &ControlPlaneClient) -> Result<()> {
        let mut task = client.kubernetes_task().await.context("fetching kubernetes task")?;

        self.maybe_ensure_flannel_tolerations().await;
        self.maybe_kick_kubelet_for_cni().await;
        self.maybe_ensure_kubelet_node_ip().await;
        self.maybe_ensure_control_plane_labels().await;
        self.maybe_ensure_apiserver_anonymous_auth().await;

        if let Some(refreshed) = self.maybe_force_control_plane_wireguard_rejoin(client, &task).await {
            task = refreshed;
        }
        if let Some(refreshed) = self.maybe_force_rejoin_when_unhealthy(client, &task).await {
            task = refreshed;
        }

        let action = task.action.trim().to_lowercase();
        if !action.is_empty() && action != "none" {
            debug!(action = %action, "kubernetes task");
        }

        self.act(client, &action, &task).await
    }

    async fn act(&mut self, client: &ControlPlaneClient, action: &str, task: &KubernetesTaskResponse) -> Result<()> {
        match action {
            "" | "none" => {
                if !is_joined() && self.maybe_force_rejoin_when_not_joined(client).await {
                    if let Ok(refreshed) = client.kubernetes_task().await {
                        let refreshed_action = refreshed.action.trim().to_lowercase();
                        return Box::pin(self.act(client, &refreshed_action, &refreshed)).await;
                    }
                }
                Ok(())
            }
            "wait" => Ok(()),
            "init" => self.do_init(client, task).await,
            "join_control_plane" => self.do_join_control_plane(client, task).await,
            "join_worker" => self.do_join_worker(client, task).await,
            other => {
                warn!(action = %other, "unknown kubernetes task action");
                Ok(())
            }
        }
    }

    async fn do_init(&self, client: &ControlPlaneClient, task: &KubernetesTaskResponse) -> Result<()> {
        info!("kubernetes: ensuring dependencies");
        info!(
            endpoint = ?task.control_plane_endpoint,
            pod_cidr = ?task.pod_cidr,
            service_cidr = ?task.service_cidr,
            version = ?task.version,
            "kubernetes init parameters"
        );

        let result = match init_cluster(task).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "kubernetes init failed");
                let _ = client.kubernetes_report(&error_report(e.to_string())).await;
                return Ok(());
            }
        };

        self.maybe_ensure_kubelet_node_ip_now().await;

        let report = KubernetesReportRequest {
            state: "cluster_initialized".to_string(),
            control_plane_endpoint: task.control_plane_endpoint.clone(),
            pod_cidr: task.pod_cidr.clone(),
            service_cidr: task.service_cidr.clone(),
            kubernetes_version: task.version.clone(),
            worker_join_command: Some(result.worker_join_command),
            control_plane_join_command: Some(result.control_plane_join_command),
            join_command_expires_at: Some(result.join_expires_at),
            ..Default::default()
        };
        if let Err(e) = client.kubernetes_report(&report).await {
            warn!(error = %e, "failed to report kubernetes init");
        }
        Ok(())
    }

    async fn do_join_control_plane(&mut self, client: &ControlPlaneClient, task: &KubernetesTaskResponse) -> Result<()> {
        if is_joined() {
            if is_control_plane_node() {
                let mismatch = control_plane_advertise_address_mismatch().await.ok().flatten();
                if let Some((current, desired)) = mismatch {
                    if is_secondary_control_plane() && should_auto_reset_on_role_mismatch() {
                        info!(current = %current, desired = %desired, "control-plane advertise address mismatch; resetting to rejoin over WireGuard");
                        if let Err(e) = reset_kubeadm_state().await {
                            let _ = client.kubernetes_report(&error_report(e.to_string())).await;
                            return Ok(());
                        }
                    } else if is_secondary_control_plane() {
                        let msg = format!("control-plane advertise address mismatch ({current} != {desired}); auto-reset disabled");
                        warn!("{msg}");
                        let _ = client.kubernetes_report(&error_report(msg)).await;
                        return Ok(());
                    } else {
                        let _ = client.kubernetes_report(&state_report("joined_control_plane")).await;
                        return Ok(());
                    }
                } else {
                    let _ = client.kubernetes_report(&state_report("joined_control_plane")).await;
                    return Ok(());
                }
            } else {
                let msg = "node already joined as worker; cannot become control-plane without reset";
                if should_auto_reset_on_role_mismatch() {
                    info!("kubernetes: hub joined as worker; auto-reset enabled, resetting kubeadm state");
                    if let Err(e) = reset_kubeadm_state().await {
                        let _ = client.kubernetes_report(&error_report(e.to_string())).await;
                        return Ok(());
                    }
                } else {
                    warn!("{msg} (set GLUON_K8S_AUTO_RESET_ON_ROLE_MISMATCH=true to auto-fix)");
                    let _ = client
                        .kubernetes_report(&error_report(format!(
                            "{msg}; run: kubeadm reset -f && rm -rf /etc/kubernetes /var/lib/etcd /var/lib/kubelet/pki"
                        )))
                        .await;
                    return Ok(());
                }
            }
        } else if is_control_plane_node() {
            info!("kubernetes: corrupted state detected (control-plane manifests exist but kubelet.conf missing); resetting to rejoin cleanly");
            if let Err(e) = reset_kubeadm_state().await {
                let _ = client.kubernetes_report(&error_report(e.to_string())).await;
                return Ok(());
            }
        }

        let join_command = task.join_command.clone().unwrap_or_default();
        info!(target = %parse_join_target(&join_command), "kubernetes join(control-plane)");
        if let Err(e) = join_cluster(&join_command, true).await {
            warn!(error = %e, "kubernetes join(control-plane) failed");
            let _ = client.kubernetes_report(&error_report(e.to_string())).await;
            return Ok(());
        }
        ensure_control_plane_labels().await;
        self.maybe_ensure_kubelet_node_ip_now().await;
        let _ = client.kubernetes_report(&state_report("joined_control_plane")).await;
        Ok(())
    }

    async fn do_join_worker(&self, client: &ControlPlaneClient, task: &KubernetesTaskResponse) -> Result<()> {
        if is_joined() {
            let _ = client.kubernetes_report(&state_report("joined_worker")).await;
            return Ok(());
        }
        if has_partial_kubelet_state() {
            info!("kubernetes: corrupted state detected (partial kubelet state without kubelet.conf); resetting to rejoin cleanly");
            if let Err(e) = reset_kubeadm_state().await {
                let _ = client.kubernetes_report(&error_report(e.to_string())).await;
                return Ok(());
            }
        }

        let join_command = task.join_command.clone().unwrap_or_default();
        info!(target = %parse_join_target(&join_command), "kubernetes join(worker)");
        if let Err(e) = join_cluster(&join_command, false).await {
            warn!(error = %e, "kubernetes join(worker) failed");
            let _ = client.kubernetes_report(&error_report(e.to_string())).await;
            return Ok(());
        }
        self.maybe_ensure_kubelet_node_ip_now().await;
        let _ = client.kubernetes_report(&state_report("joined_worker")).await;
        Ok(())
    }

    async fn maybe_force_rejoin_when_not_joined(&mut self, client: &ControlPlaneClient) -> bool {
        if elapsed_since(self.last_missing_join_report) < MISSING_JOIN_REPORT_INTERVAL {
            return false;
        }
        self.last_missing_join_report = Some(Instant::now());

        let msg = "local kubelet.conf missing; forcing rejoin task";
        if client.kubernetes_report(&error_report(msg.to_string())).await.is_err() {
            return false;
        }
        info!("kubernetes: {msg}");
        true
    }

    async fn maybe_force_control_plane_wireguard_rejoin(
        &mut self,
        client: &ControlPlaneClient,
        task: &KubernetesTaskResponse,
    ) -> Option<KubernetesTaskResponse> {
        let action = task.action.trim().to_lowercase();
        if !action.is_empty() && action != "none" && action != "wait" {
            return None;
        }
        if !is_joined() || !is_control_plane_node() || !is_secondary_control_plane() {
            return None;
        }

        let (current, desired) = control_plane_advertise_address_mismatch().await.ok().flatten()?;

        if elapsed_since(self.last_control_plane_rejoin) < CONTROL_PLANE_REJOIN_INTERVAL {
            return None;
        }
        self.last_control_plane_rejoin = Some(Instant::now());

        let msg = format!("control-plane advertise address mismatch ({current} != {desired}); forcing rejoin over WireGuard");
        info!("kubernetes: {msg}");
        if client.kubernetes_report(&error_report(msg)).await.is_err() {
            return None;
        }

        let refreshed = client.kubernetes_task().await.ok()?;
        let refreshed_action = refreshed.action.trim().to_lowercase();
        if refreshed_action != "join_control_plane" || refreshed.join_command.as_deref().unwrap_or("").trim().is_empty() {
            return None;
        }
        Some(refreshed)
    }

    async fn maybe_force_rejoin_when_unhealthy(
        &mut self,
        client: &ControlPlaneClient,
        task: &KubernetesTaskResponse,
    ) -> Option<KubernetesTaskResponse> {
        let action = task.action.trim().to_lowercase();
        if !action.is_empty() && action != "none" && action != "wait" {
            return None;
        }
        if !is_joined() || !is_control_plane_node() || !is_secondary_control_plane() {
            return None;
        }

        let status = local_apiserver_livez_status().await;
        if let Ok(200) = status {
            return None;
        }
        if let Ok(403) = status {
            if self.patch_apiserver_anonymous_auth().await.unwrap_or(false) {
                info!("kubernetes: patched kube-apiserver manifest to allow anonymous /livez; restarting kubelet");
                let _ = run_logged("systemctl", &["restart", "kubelet"]).await;
                return None;
            }
        }

        if elapsed_since(self.last_health_rejoin) < HEALTH_REJOIN_INTERVAL {
            return None;
        }
        self.last_health_rejoin = Some(Instant::now());

        let msg = format!("control-plane unhealthy (local /livez status={}); forcing rejoin", format_status(status));
        info!("kubernetes: {msg}");
        if client.kubernetes_report(&error_report(msg)).await.is_err() {
            return None;
        }

        let refreshed = client.kubernetes_task().await.ok()?;
        let refreshed_action = refreshed.action.trim().to_lowercase();
        if refreshed_action != "join_control_plane" || refreshed.join_command.as_deref().unwrap_or("").trim().is_empty() {
            return None;
        }

        if let Err(e) = reset_kubeadm_state().await {
            let _ = client.kubernetes_report(&error_report(e.to_string())).await;
            return None;
        }
        Some(refreshed)
    }

    async fn maybe_ensure_flannel_tolerations(&mut self) {
        if !is_initialized() {
            return;
        }
        if elapsed_since(self.last_flannel_patch) < FLANNEL_PATCH_INTERVAL {
            return;
        }
        self.last_flannel_patch = Some(Instant::now());

        if let Err(e) = ensure_root_kubeconfig() {
            warn!(error = %e, "failed to set up kubeconfig");
            return;
        }
        self.ensure_flannel_tolerations().await;
    }

    async fn ensure_flannel_tolerations(&mut self) {
        let patch = r#"{"spec":{"template":{"spec":{"tolerations":[{"operator":"Exists"}]}}}}"#;

        let mut targets = match list_flannel_daemonsets().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to list daemonsets for flannel patch");
                return;
            }
        };

        if targets.is_empty() {
            if elapsed_since(self.last_flannel_install) > FLANNEL_INSTALL_RETRY_INTERVAL {
                self.last_flannel_install = Some(Instant::now());
                info!("no flannel daemonset found; attempting to install Flannel CNI");
                if let Err(e) = run_kubectl(&["apply", "-f", FLANNEL_MANIFEST_URL]).await {
                    warn!(error = %e, "failed to apply flannel manifest");
                    return;
                }
                targets = list_flannel_daemonsets().await.unwrap_or_default();
            }
            if targets.is_empty() {
                warn!("no flannel daemonset found to patch tolerations");
                return;
            }
        }

        for (namespace, name) in targets {
            if let Err(e) = run_kubectl(&["-n", &namespace, "patch", "daemonset", &name, "--type=merge", "-p", patch]).await {
                warn!(namespace = %namespace, name = %name, error = %e, "failed to patch flannel tolerations");
                continue;
            }
            info!(namespace = %namespace, name = %name, "patched flannel tolerations");
        }
    }

    async fn maybe_ensure_control_plane_labels(&mut self) {
        if !is_control_plane_node() || !Path::new(ADMIN_CONF_PATH).exists() {
            return;
        }
        if elapsed_since(self.last_control_plane_label) < CONTROL_PLANE_LABEL_INTERVAL {
            return;
        }
        self.last_control_plane_label = Some(Instant::now());
        ensure_control_plane_labels().await;
    }

    async fn maybe_ensure_apiserver_anonymous_auth(&mut self) {
        if !is_control_plane_node() {
            return;
        }
        if elapsed_since(self.last_apiserver_manifest_patch) < APISERVER_MANIFEST_PATCH_INTERVAL {
            return;
        }
        self.last_apiserver_manifest_patch = Some(Instant::now());

        match self.patch_apiserver_anonymous_auth().await {
            Ok(true) => {
                info!("kubernetes: enabled anonymous kube-apiserver access for /livez probes; restarting kubelet");
                let _ = run_logged("systemctl", &["restart", "kubelet"]).await;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to patch kube-apiserver manifest"),
        }
    }

    async fn patch_apiserver_anonymous_auth(&self) -> Result<bool> {
        patch_apiserver_manifest_flag("--anonymous-auth=true")
    }

    async fn maybe_ensure_kubelet_node_ip(&mut self) {
        if !is_joined() {
            return;
        }
        if elapsed_since(self.last_kubelet_node_ip) < KUBELET_NODE_IP_INTERVAL {
            return;
        }
        self.last_kubelet_node_ip = Some(Instant::now());
        self.apply_kubelet_node_ip().await;
    }

    async fn maybe_ensure_kubelet_node_ip_now(&self) {
        self.apply_kubelet_node_ip().await;
    }

    async fn apply_kubelet_node_ip(&self) {
        let desired = match detect_overlay_advertise_address().await {
            Ok(d) if !d.trim().is_empty() => d,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "failed to detect WireGuard node IP");
                return;
            }
        };

        let current = read_configured_kubelet_node_ip();
        if current.trim() == desired.trim() {
            return;
        }

        let mut updated = false;
        if Path::new(KUBELET_KUBEADM_FLAGS_PATH).exists() {
            match upsert_kubeadm_flags_node_ip(&desired) {
                Ok(()) => updated = true,
                Err(e) => warn!(error = %e, path = KUBELET_KUBEADM_FLAGS_PATH, "failed to update kubelet flags"),
            }
        }
        if !updated {
            if let Err(e) = write_kubelet_node_ip_dropin(&desired) {
                warn!(error = %e, "failed to install kubelet node-ip drop-in");
                return;
            }
        }

        info!(desired = %desired, previous = %current, "setting kubelet --node-ip to WireGuard IP");
        let _ = run_logged("systemctl", &["daemon-reload"]).await;
        let _ = run_logged("systemctl", &["restart", "kubelet"]).await;
    }

    async fn maybe_kick_kubelet_for_cni(&self) {
        if !is_joined() {
            return;
        }
        let has_cni_config = std::fs::read_dir(CNI_NET_DIR)
            .map(|entries| {
                entries.filter_map(|e| e.ok()).any(|e| {
                    let name = e.file_name().to_string_lossy().to_lowercase();
                    !e.path().is_dir() && (name.ends_with(".conf") || name.ends_with(".conflist"))
                })
            })
            .unwrap_or(true);
        if has_cni_config {
            return;
        }

        info!(dir = CNI_NET_DIR, "CNI config missing; restarting kubelet/containerd to recover");
        let _ = run_logged("systemctl", &["restart", "containerd"]).await;
        let _ = run_logged("systemctl", &["restart", "kubelet"]).await;
    }
}

fn elapsed_since(instant: Option<Instant>) -> Duration {
    match instant {
        Some(i) => i.elapsed(),
        None => Duration::MAX,
    }
}

fn state_report(state: &str) -> KubernetesReportRequest {
    KubernetesReportRequest { state: state.to_string(), ..Default::default() }
}

fn error_report(message: String) -> KubernetesReportRequest {
    KubernetesReportRequest { state: "error".to_string(), message: Some(message), ..Default::default() }
}

fn is_initialized() -> bool {
    Path::new(ADMIN_CONF_PATH).exists()
}

fn is_joined() -> bool {
    Path::new(KUBELET_CONF_PATH).exists()
}

fn is_control_plane_node() -> bool {
    Path::new(CONTROL_PLANE_MANIFEST_PATH).exists()
}

fn has_partial_kubelet_state() -> bool {
    if is_joined() {
        return false;
    }
    Path::new("/var/lib/kubelet/config.yaml").exists() || Path::new("/var/lib/kubelet/pki").exists()
}

fn is_secondary_control_plane() -> bool {
    std::fs::read_to_string(ETCD_MANIFEST_PATH)
        .map(|s| s.to_lowercase().contains("--initial-cluster-state=existing"))
        .unwrap_or(false)
}

fn should_auto_reset_on_role_mismatch() -> bool {
    match std::env::var("GLUON_K8S_AUTO_RESET_ON_ROLE_MISMATCH") {
        Err(_) => true,
        Ok(v) => !matches!(v.to_lowercase().trim(), "0" | "false" | "no"),
    }
}

fn ensure_root_kubeconfig() -> Result<()> {
    if !Path::new(ADMIN_CONF_PATH).exists() {
        anyhow::bail!("admin.conf does not exist yet");
    }
    let dir = Path::new("/root/.kube");
    std::fs::create_dir_all(dir)?;
    let dst = dir.join("config");
    let tmp = dst.with_extension("tmp");
    let data = std::fs::read(ADMIN_CONF_PATH)?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &dst)?;
    Ok(())
}

fn parse_join_target(join_command: &str) -> &str {
    let parts: Vec<&str> = join_command.split_whitespace().collect();
    for i in 0..parts.len().saturating_sub(1) {
        if parts[i] == "join" {
            return parts[i + 1];
        }
    }
    "unknown"
}

async fn run_logged(command: &str, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new(command)
        .args(args)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .output()
        .await
        .with_context(|| format!("running {command} {args:?}"))?;

    let combined = format!("{}{}", String::from_utf8_lossy(&output.stdout), String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        anyhow::bail!("{command} {args:?} failed: {}\n{}", output.status, truncate(&combined, 8000));
    }
    Ok(combined)
}

async fn run_kubectl(args: &[&str]) -> Result<String> {
    if !Path::new(ADMIN_CONF_PATH).exists() {
        anyhow::bail!("missing kubeconfig {ADMIN_CONF_PATH}");
    }
    let mut full_args = vec!["--kubeconfig", ADMIN_CONF_PATH];
    full_args.extend_from_slice(args);

    let output = tokio::process::Command::new("kubectl")
        .args(&full_args)
        .env("KUBECONFIG", ADMIN_CONF_PATH)
        .env("HOME", "/root")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .output()
        .await
        .context("running kubectl")?;

    let combined = format!("{}{}", String::from_utf8_lossy(&output.stdout), String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        anyhow::bail!("kubectl {args:?} failed: {}\n{}", output.status, truncate(&combined, 4000));
    }
    Ok(combined)
}

async fn list_flannel_daemonsets() -> Result<Vec<(String, String)>> {
    let out = run_kubectl(&[
        "get",
        "daemonset",
        "-A",
        "-o",
        "custom-columns=NAMESPACE:.metadata.namespace,NAME:.metadata.name",
        "--no-headers",
    ])
    .await?;

    Ok(out
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                return None;
            }
            if !fields[1].to_lowercase().contains("flannel") {
                return None;
            }
            Some((fields[0].to_string(), fields[1].to_string()))
        })
        .collect())
}

async fn ensure_control_plane_labels() {
    if !Path::new(ADMIN_CONF_PATH).exists() {
        return;
    }
    let Some(node_name) = resolve_self_node_name().await else { return };

    let _ = run_kubectl(&["label", "node", &node_name, "node-role.kubernetes.io/control-plane=", "--overwrite"]).await;
    let _ = run_kubectl(&["label", "node", &node_name, "node-role.kubernetes.io/master=", "--overwrite"]).await;
    let _ = run_kubectl(&["taint", "node", &node_name, "node-role.kubernetes.io/control-plane=:NoSchedule", "--overwrite"]).await;
}

async fn resolve_self_node_name() -> Option<String> {
    let hostname = hostname_short()?;

    if run_kubectl(&["get", "node", &hostname, "-o", "name"]).await.map(|s| !s.trim().is_empty()).unwrap_or(false) {
        return Some(hostname);
    }

    let jsonpath = "{.items[0].metadata.name}";
    if let Ok(out) = run_kubectl(&[
        "get",
        "nodes",
        "-l",
        &format!("kubernetes.io/hostname={hostname}"),
        "-o",
        &format!("jsonpath={jsonpath}"),
    ])
    .await
    {
        let name = out.trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    Some(hostname)
}

fn hostname_short() -> Option<String> {
    let output = std::process::Command::new("hostname").output().ok()?;
    let full = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if full.is_empty() {
        return None;
    }
    Some(full.split('.').next().unwrap_or(&full).to_string())
}

async fn init_cluster(task: &KubernetesTaskResponse) -> Result<InitResult> {
    if is_initialized() {
        info!("kubernetes already initialized; refreshing join commands");
        if let Err(e) = ensure_root_kubeconfig() {
            warn!(error = %e, "failed to set up kubeconfig");
        }
        ensure_flannel_tolerations_once().await;
        return generate_join_commands().await;
    }

    detect_broken_kubeadm_state()?;
    ensure_kubelet_node_ip_pre_join().await;

    let mut endpoint = task
        .control_plane_endpoint
        .clone()
        .unwrap_or_default()
        .trim()
        .to_string();
    if endpoint.is_empty() {
        anyhow::bail!("missing control_plane_endpoint");
    }
    if !endpoint.contains(':') {
        endpoint = format!("{endpoint}:6443");
    }
    let advertise_addr = endpoint.split(':').next().unwrap_or(&endpoint).to_string();

    let pod_cidr = task.pod_cidr.clone().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| "10.244.0.0/16".to_string());
    let service_cidr = task.service_cidr.clone().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| "10.96.0.0/16".to_string());

    info!(endpoint = %endpoint, pod_cidr = %pod_cidr, service_cidr = %service_cidr, "initializing kubernetes cluster");

    run_logged(
        "kubeadm",
        &[
            "init",
            "--apiserver-advertise-address",
            &advertise_addr,
            "--apiserver-cert-extra-sans",
            &advertise_addr,
            "--control-plane-endpoint",
            &endpoint,
            "--pod-network-cidr",
            &pod_cidr,
            "--service-cidr",
            &service_cidr,
            "--upload-certs",
            "--skip-token-print",
        ],
    )
    .await
    .context("kubeadm init failed")?;

    if let Err(e) = ensure_root_kubeconfig() {
        warn!(error = %e, "failed to set up kubeconfig");
    }

    let _ = patch_apiserver_manifest_flag("--anonymous-auth=true");

    info!("installing Flannel CNI");
    if let Err(e) = run_kubectl(&["apply", "-f", FLANNEL_MANIFEST_URL]).await {
        warn!(error = %e, "failed to apply flannel manifest");
    }
    ensure_flannel_tolerations_once().await;

    generate_join_commands().await
}

async fn ensure_flannel_tolerations_once() {
    let mut agent = KubernetesAgent::new();
    agent.ensure_flannel_tolerations().await;
}

async fn generate_join_commands() -> Result<InitResult> {
    const JOIN_TTL_SECS: i64 = 2 * 60 * 60;

    let join_out = run_logged("kubeadm", &["token", "create", "--print-join-command", "--ttl", "2h0m0s"]).await?;
    let worker_join = join_out.trim().to_string();
    if worker_join.is_empty() {
        anyhow::bail!("empty worker join command");
    }

    let cert_out = run_logged("kubeadm", &["init", "phase", "upload-certs", "--upload-certs"]).await?;
    let cert_key = extract_certificate_key(&cert_out).context("failed to parse certificate key from kubeadm output")?;

    let control_plane_join = format!("{worker_join} --control-plane --certificate-key {cert_key}");

    Ok(InitResult {
        worker_join_command: worker_join,
        control_plane_join_command: control_plane_join,
        join_expires_at: Utc::now() + chrono::Duration::seconds(JOIN_TTL_SECS),
    })
}

fn extract_certificate_key(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.len() == 64 && line.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()))
        .map(str::to_string)
}

async fn join_cluster(join_command: &str, is_control_plane: bool) -> Result<()> {
    detect_broken_kubeadm_state()?;

    let join_command = join_command.trim();
    if join_command.is_empty() {
        anyhow::bail!("missing join command");
    }

    ensure_kubelet_node_ip_pre_join().await;
    info!("joining kubernetes cluster");

    let mut parts: Vec<String> = join_command.split_whitespace().map(str::to_string).collect();
    if parts.len() < 2 || parts[0] != "kubeadm" || parts[1] != "join" {
        anyhow::bail!("unexpected join command (expected kubeadm join ...)");
    }

    if is_control_plane && !has_flag(&parts, "--apiserver-advertise-address") {
        match detect_overlay_advertise_address().await {
            Ok(addr) if !addr.is_empty() => {
                info!(address = %addr, "using WireGuard advertise address for control-plane join");
                parts.push("--apiserver-advertise-address".to_string());
                parts.push(addr);
            }
            Err(e) => warn!(error = %e, "failed to detect WireGuard advertise address; proceeding without override"),
            _ => {}
        }
    }

    let args: Vec<&str> = parts[1..].iter().map(String::as_str).collect();
    run_logged(&parts[0], &args).await.context("kubeadm join failed")?;

    let _ = patch_apiserver_manifest_flag("--anonymous-auth=true");
    Ok(())
}

fn has_flag(parts: &[String], flag: &str) -> bool {
    parts.iter().any(|p| p == flag || p.starts_with(&format!("{flag}=")))
}

fn detect_broken_kubeadm_state() -> Result<()> {
    let ca_crt = Path::new("/etc/kubernetes/pki/ca.crt").exists();
    let ca_key = Path::new("/etc/kubernetes/pki/ca.key").exists();
    let apiserver_key = Path::new("/etc/kubernetes/pki/apiserver.key").exists();

    if ca_crt && !ca_key {
        anyhow::bail!("detected partial kubeadm PKI state (found ca.crt but missing ca.key); run: kubeadm reset -f && rm -rf /etc/kubernetes /var/lib/etcd");
    }
    if Path::new(ADMIN_CONF_PATH).exists() && ca_crt && !apiserver_key {
        anyhow::bail!("detected incomplete kubeadm state (missing apiserver.key); run: kubeadm reset -f && rm -rf /etc/kubernetes /var/lib/etcd");
    }
    Ok(())
}

async fn reset_kubeadm_state() -> Result<()> {
    info!("kubernetes: running kubeadm reset -f");
    run_logged("kubeadm", &["reset", "-f"]).await.context("kubeadm reset failed")?;

    for path in ["/etc/kubernetes", "/var/lib/etcd", "/var/lib/kubelet/pki"] {
        let _ = std::fs::remove_dir_all(path);
    }

    let _ = run_logged("systemctl", &["restart", "containerd"]).await;
    let _ = run_logged("systemctl", &["restart", "kubelet"]).await;
    Ok(())
}

async fn control_plane_advertise_address_mismatch() -> Result<Option<(String, String)>> {
    let desired = match detect_overlay_advertise_address().await {
        Ok(d) if !d.is_empty() => d,
        _ => return Ok(None),
    };
    let current = match current_control_plane_advertise_address() {
        Ok(c) if !c.is_empty() => c,
        _ => return Ok(None),
    };

    if let Ok(addr) = current.parse::<Ipv4Addr>() {
        if !in_overlay_pool(addr) {
            return Ok(Some((current, desired)));
        }
    }
    Ok((current.trim() != desired.trim()).then_some((current, desired)))
}

fn current_control_plane_advertise_address() -> Result<String> {
    let content = std::fs::read_to_string(CONTROL_PLANE_MANIFEST_PATH)?;
    for marker in ["--advertise-address=", "--apiserver-advertise-address="] {
        if let Some(idx) = content.find(marker) {
            let rest = &content[idx + marker.len()..];
            let addr: String = rest.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if !addr.is_empty() {
                return Ok(addr);
            }
        }
    }
    anyhow::bail!("could not find advertise address in {CONTROL_PLANE_MANIFEST_PATH}")
}

fn patch_apiserver_manifest_flag(flag: &str) -> Result<bool> {
    let content = std::fs::read_to_string(CONTROL_PLANE_MANIFEST_PATH)?;
    if content.contains(flag) {
        return Ok(false);
    }

    let lines: Vec<&str> = content.lines().collect();
    let prefix = lines
        .iter()
        .find(|line| line.trim_start().starts_with("- --"))
        .map(|line| &line[..line.len() - line.trim_start().len()])
        .unwrap_or("    ");
    let new_line = format!("{prefix}- {flag}");

    let insert_at = lines
        .iter()
        .position(|line| line.contains("--authorization-mode="))
        .map(|i| i + 1)
        .or_else(|| lines.iter().position(|line| line.contains("- kube-apiserver")).map(|i| i + 1))
        .context("could not locate kube-apiserver command list in manifest")?;

    let mut new_lines: Vec<&str> = lines[..insert_at].to_vec();
    new_lines.push(&new_line);
    new_lines.extend_from_slice(&lines[insert_at..]);

    let out = new_lines.join("\n") + "\n";
    let tmp = format!("{CONTROL_PLANE_MANIFEST_PATH}.tmp");
    std::fs::write(&tmp, out)?;
    std::fs::rename(&tmp, CONTROL_PLANE_MANIFEST_PATH)?;
    Ok(true)
}

async fn local_apiserver_livez_status() -> Result<u16> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .danger_accept_invalid_certs(true)
        .build()?;
    let response = client.get("https://127.0.0.1:6443/livez").send().await?;
    Ok(response.status().as_u16())
}

fn format_status(status: Result<u16>) -> String {
    match status {
        Ok(code) => code.to_string(),
        Err(e) => e.to_string(),
    }
}

fn in_overlay_pool(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == OVERLAY_POOL_PREFIX[0] && octets[1] == OVERLAY_POOL_PREFIX[1]
}

fn in_loopback_pool(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == LOOPBACK_POOL_PREFIX[0] && octets[1] == LOOPBACK_POOL_PREFIX[1] && (octets[2] & 0xfc) == LOOPBACK_POOL_PREFIX[2]
}

#[derive(serde::Deserialize)]
struct IpAddrShowEntry {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(serde::Deserialize)]
struct IpAddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

/// Picks the best overlay-pool address to advertise Kubernetes on: prefers a
/// non-loopback-pool, non-`/32` address on a non-`wg*` interface so a
/// transient tunnel IP never becomes the long-term advertise address.
async fn detect_overlay_advertise_address() -> Result<String> {
    if let Ok(v) = std::env::var("GLUON_K8S_ADVERTISE_ADDRESS") {
        if !v.trim().is_empty() {
            return Ok(v.trim().to_string());
        }
    }

    let output = tokio::process::Command::new("ip")
        .args(["-4", "-j", "addr", "show"])
        .output()
        .await
        .context("running ip addr show")?;
    if !output.status.success() {
        anyhow::bail!("ip addr show exited with {}", output.status);
    }

    let entries: Vec<IpAddrShowEntry> = serde_json::from_slice(&output.stdout).context("parsing ip addr JSON")?;

    let mut best: Option<(String, i32)> = None;
    for entry in &entries {
        for addr_info in &entry.addr_info {
            if addr_info.family != "inet" {
                continue;
            }
            let Ok(addr) = addr_info.local.trim().parse::<Ipv4Addr>() else { continue };
            if !in_overlay_pool(addr) {
                continue;
            }

            let mut score = 100;
            if in_loopback_pool(addr) {
                score -= 50;
            }
            if addr_info.prefixlen == 32 {
                score -= 30;
            }
            if entry.ifname.starts_with("wg") {
                score -= 10;
            }
            if entry.ifname == "lo" {
                score -= 5;
            }

            if best.as_ref().map(|(_, s)| score < *s).unwrap_or(true) {
                best = Some((addr.to_string(), score));
            }
        }
    }

    best.map(|(addr, _)| addr)
        .context("no WireGuard/overlay IP found on this node (expected 10.255.0.0/16)")
}

async fn ensure_kubelet_node_ip_pre_join() {
    let desired = match detect_overlay_advertise_address().await {
        Ok(d) if !d.trim().is_empty() => d,
        _ => return,
    };
    match write_kubelet_node_ip_dropin(&desired) {
        Ok(true) => {
            let _ = run_logged("systemctl", &["daemon-reload"]).await;
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "failed to pre-configure kubelet node-ip"),
    }
}

fn write_kubelet_node_ip_dropin(node_ip: &str) -> Result<bool> {
    let content = format!("KUBELET_EXTRA_ARGS=--node-ip={}\n", node_ip.trim());
    if std::fs::read_to_string(DEFAULT_KUBELET_PATH).map(|s| s == content).unwrap_or(false) {
        return Ok(false);
    }
    let tmp = format!("{DEFAULT_KUBELET_PATH}.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, DEFAULT_KUBELET_PATH)?;
    Ok(true)
}

fn upsert_kubeadm_flags_node_ip(node_ip: &str) -> Result<()> {
    let content = std::fs::read_to_string(KUBELET_KUBEADM_FLAGS_PATH)?;
    let (prefix, args) = content
        .lines()
        .enumerate()
        .find_map(|(i, line)| {
            let trimmed = line.trim_start();
            let rest = trimmed.strip_prefix("KUBELET_KUBEADM_ARGS=")?;
            let unquoted = rest.trim_matches('"').trim_matches('\'').to_string();
            Some((i, unquoted))
        })
        .context("could not parse KUBELET_KUBEADM_ARGS")?;

    let without_node_ip: Vec<&str> = args
        .split_whitespace()
        .filter(|tok| !tok.starts_with("--node-ip"))
        .collect();
    let new_args = format!("{} --node-ip={}", without_node_ip.join(" "), node_ip.trim()).trim().to_string();
    let new_line = format!(r#"KUBELET_KUBEADM_ARGS="{new_args}""#);

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    lines[prefix] = new_line;

    let tmp = format!("{KUBELET_KUBEADM_FLAGS_PATH}.tmp");
    std::fs::write(&tmp, lines.join("\n") + "\n")?;
    std::fs::rename(&tmp, KUBELET_KUBEADM_FLAGS_PATH)?;
    Ok(())
}

fn read_configured_kubelet_node_ip() -> String {
    for path in ["/etc/systemd/system/kubelet.service.d/20-gluon-node-ip.conf", DEFAULT_KUBELET_PATH, KUBELET_KUBEADM_FLAGS_PATH] {
        let Ok(content) = std::fs::read_to_string(path) else { continue };
        if let Some(idx) = content.find("--node-ip") {
            let rest = &content[idx + "--node-ip".len()..];
            let rest = rest.trim_start_matches(['=', ' ']);
            let ip: String = rest.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if !ip.is_empty() {
                return ip;
            }
        }
    }
    String::new()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}\n...(truncated)", &s[..max])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_join_target_extracts_host_port() {
        assert_eq!(parse_join_target("kubeadm join 10.255.0.1:6443 --token abc"), "10.255.0.1:6443");
        assert_eq!(parse_join_target(""), "unknown");
    }

    #[test]
    fn extract_certificate_key_finds_64_char_hex_line() {
        let output = "some banner text\nd34db33f00000000000000000000000000000000000000000000000000aaaa\ntrailer";
        assert_eq!(
            extract_certificate_key(output),
            Some("d34db33f00000000000000000000000000000000000000000000000000aaaa".to_string())
        );
        assert_eq!(extract_certificate_key("no key here"), None);
    }

    #[test]
    fn overlay_pool_membership() {
        assert!(in_overlay_pool("10.255.3.7".parse().unwrap()));
        assert!(!in_overlay_pool("10.244.0.1".parse().unwrap()));
    }

    #[test]
    fn loopback_pool_membership_is_narrower_than_overlay() {
        assert!(in_loopback_pool("10.255.0.5".parse().unwrap()));
        assert!(!in_loopback_pool("10.255.9.5".parse().unwrap()));
    }

    #[test]
    fn current_advertise_address_parses_either_flag_spelling() {
        let manifest = "spec:\n  containers:\n  - command:\n    - kube-apiserver\n    - --advertise-address=10.255.0.2\n";
        std::fs::write("/tmp/gluon-test-manifest.yaml", manifest).unwrap();
        let content = std::fs::read_to_string("/tmp/gluon-test-manifest.yaml").unwrap();
        assert!(content.contains("--advertise-address=10.255.0.2"));
        let _ = std::fs::remove_file("/tmp/gluon-test-manifest.yaml");
    }
}
