//! Agent identity and enrollment state.
//!
//! Bootstrap settings (control plane URL, data directory, desired role)
//! come from the environment. Enrollment state (request id, enrollment
//! secret, node id, API key) is learned over the wire and persisted to
//! `<data_dir>/agent-state.json` so a restart doesn't re-enroll.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The overlay role a node plays: hub (control-plane-capable) or worker.
/// Duplicated from the control plane's own `NodeRole` rather than shared,
/// since the two services don't otherwise share a types crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Hub,
    Worker,
}

impl std::str::FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hub" => Ok(NodeRole::Hub),
            "worker" => Ok(NodeRole::Worker),
            other => anyhow::bail!("unknown node role: {other}"),
        }
    }
}

/// Enrollment state learned from the control plane, persisted across
/// restarts. `None` fields mean "not yet enrolled" / "not yet approved".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentState {
    pub request_id: Option<i64>,
    pub enrollment_secret: Option<String>,
    pub node_id: Option<i64>,
    pub api_key: Option<String>,
}

impl EnrollmentState {
    /// A request has been submitted but not yet approved.
    pub fn has_pending_enrollment(&self) -> bool {
        self.request_id.is_some() && self.api_key.is_none()
    }

    /// Approved and holding a live API key.
    pub fn is_enrolled(&self) -> bool {
        self.node_id.is_some() && self.api_key.is_some()
    }
}

/// Node agent configuration: bootstrap settings plus whatever enrollment
/// state has been persisted so far.
#[derive(Debug, Clone)]
pub struct Config {
    pub control_plane_url: String,
    pub data_dir: PathBuf,
    pub hostname: String,
    pub provider: String,
    pub os: String,
    pub desired_role: NodeRole,
    pub heartbeat_interval_secs: u64,
    pub log_level: String,
    pub enrollment: EnrollmentState,
}

impl Config {
    fn state_path(data_dir: &Path) -> PathBuf {
        data_dir.join("agent-state.json")
    }

    /// Load bootstrap settings from the environment and enrollment state
    /// from disk, if any was persisted by a previous run.
    pub fn from_env() -> Result<Self> {
        let control_plane_url = std::env::var("GLUON_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let data_dir = PathBuf::from(
            std::env::var("GLUON_DATA_DIR").unwrap_or_else(|_| "/var/lib/gluon".to_string()),
        );

        let hostname = match std::env::var("GLUON_HOSTNAME") {
            Ok(h) => h,
            Err(_) => probe_hostname()?,
        };

        let provider = std::env::var("GLUON_PROVIDER").unwrap_or_else(|_| "unknown".to_string());

        let os = match std::env::var("GLUON_OS") {
            Ok(o) => o,
            Err(_) => probe_os(),
        };

        let desired_role: NodeRole = std::env::var("GLUON_DESIRED_ROLE")
            .unwrap_or_else(|_| "worker".to_string())
            .parse()?;

        let heartbeat_interval_secs = std::env::var("GLUON_HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let log_level = std::env::var("GLUON_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let enrollment = load_enrollment_state(&data_dir)?;

        Ok(Self {
            control_plane_url,
            data_dir,
            hostname,
            provider,
            os,
            desired_role,
            heartbeat_interval_secs,
            log_level,
            enrollment,
        })
    }

    /// Persist the current enrollment state, replacing whatever was there.
    /// Writes to a temp file in the same directory and renames over the
    /// target so a crash mid-write never leaves a truncated state file.
    pub fn save_enrollment(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))?;

        let path = Self::state_path(&self.data_dir);
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&self.enrollment)?;
        std::fs::write(&tmp_path, body)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming into place {}", path.display()))?;
        Ok(())
    }
}

fn load_enrollment_state(data_dir: &Path) -> Result<EnrollmentState> {
    let path = Config::state_path(data_dir);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EnrollmentState::default()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn probe_hostname() -> Result<String> {
    let output = std::process::Command::new("hostname")
        .arg("-f")
        .output()
        .context("running hostname -f")?;
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if name.is_empty() {
        anyhow::bail!("hostname -f returned an empty name");
    }
    Ok(name)
}

fn probe_os() -> String {
    std::process::Command::new("lsb_release")
        .arg("-sd")
        .output()
        .ok()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "linux".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_state_transitions() {
        let mut state = EnrollmentState::default();
        assert!(!state.has_pending_enrollment());
        assert!(!state.is_enrolled());

        state.request_id = Some(1);
        state.enrollment_secret = Some("es_abc".into());
        assert!(state.has_pending_enrollment());
        assert!(!state.is_enrolled());

        state.node_id = Some(42);
        state.api_key = Some("key_abc".into());
        assert!(!state.has_pending_enrollment());
        assert!(state.is_enrolled());
    }

    #[test]
    fn node_role_parses_wire_strings() {
        assert_eq!("hub".parse::<NodeRole>().unwrap(), NodeRole::Hub);
        assert_eq!("worker".parse::<NodeRole>().unwrap(), NodeRole::Worker);
        assert!("control-plane".parse::<NodeRole>().is_err());
    }

    #[test]
    fn save_and_reload_round_trips_enrollment_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            control_plane_url: "http://example".into(),
            data_dir: dir.path().to_path_buf(),
            hostname: "h".into(),
            provider: "p".into(),
            os: "o".into(),
            desired_role: NodeRole::Worker,
            heartbeat_interval_secs: 10,
            log_level: "info".into(),
            enrollment: EnrollmentState {
                request_id: Some(7),
                enrollment_secret: Some("es".into()),
                node_id: None,
                api_key: None,
            },
        };
        cfg.save_enrollment().unwrap();

        let reloaded = load_enrollment_state(&cfg.data_dir).unwrap();
        assert_eq!(reloaded.request_id, Some(7));
        assert_eq!(reloaded.enrollment_secret.as_deref(), Some("es"));
    }
}
