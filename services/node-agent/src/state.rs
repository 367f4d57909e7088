//! Local JSON snapshots the agent uses to avoid redundant work: don't
//! re-upload a WireGuard key the control plane already has, don't re-apply
//! a config bundle it's already converged to, don't rewrite SSH
//! authorized_keys files that haven't changed.
//!
//! Each snapshot is a single flat JSON file written with a rename-over-temp
//! so a crash mid-write never leaves a truncated file behind.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

fn load<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp_path, body).with_context(|| format!("writing {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("renaming into place {}", path.display()))?;
    Ok(())
}

/// Interface name -> last-uploaded public key, mirrors the original
/// agent's `wg-keys-state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireguardKeysState {
    pub public_keys: BTreeMap<String, String>,
}

impl WireguardKeysState {
    pub fn load(path: &Path) -> Result<Self> {
        load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save(path, self)
    }
}

/// The fingerprint of the last config bundle this agent successfully
/// applied, so a restart doesn't blindly reapply an identical bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigState {
    pub version: Option<i64>,
    pub hash: Option<String>,
}

impl ConfigState {
    pub fn load(path: &Path) -> Result<Self> {
        load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save(path, self)
    }

    pub fn matches(&self, version: i64, hash: &str) -> bool {
        self.version == Some(version) && self.hash.as_deref() == Some(hash)
    }
}

/// The authorized_keys content this agent last wrote per username, so the
/// reconciler only touches a file whose managed block actually changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshState {
    pub rendered_by_username: BTreeMap<String, String>,
}

impl SshState {
    pub fn load(path: &Path) -> Result<Self> {
        load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_state_matches_only_exact_version_and_hash() {
        let state = ConfigState { version: Some(3), hash: Some("abc".into()) };
        assert!(state.matches(3, "abc"));
        assert!(!state.matches(3, "def"));
        assert!(!state.matches(4, "abc"));
    }

    #[test]
    fn missing_snapshot_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let state = WireguardKeysState::load(&path).unwrap();
        assert!(state.public_keys.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-keys-state.json");
        let mut state = WireguardKeysState::default();
        state.public_keys.insert("wg-hub1".into(), "abc=".into());
        state.save(&path).unwrap();

        let reloaded = WireguardKeysState::load(&path).unwrap();
        assert_eq!(reloaded.public_keys.get("wg-hub1"), Some(&"abc=".to_string()));
    }
}
