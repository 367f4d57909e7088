//! Fetches the node's config bundle and converges the host to match it:
//! WireGuard interface configs, the `/etc/network/interfaces.d` stanza,
//! FRR's config, and SSH authorized_keys. Skips all of it when the bundle's
//! fingerprint matches what was last applied.
//!
//! Grounded on the original agent's `applier` package: write files first,
//! only bounce interfaces/reload FRR if something network-shaped actually
//! changed, and persist the applied fingerprint last so a crash mid-apply
//! is retried rather than silently considered done.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::client::{ConfigResponse, ControlPlaneClient, SshAuthorizedKeyEntry};
use crate::network::{self, InterfaceKey};
use crate::state::{ConfigState, SshState};

const WIREGUARD_DIR: &str = "etc/wireguard";
const NETWORK_INTERFACES_DIR: &str = "etc/network/interfaces.d";
const FRR_CONFIG_PATH: &str = "etc/frr/frr.conf";
const SSH_MANAGED_BEGIN: &str = "# BEGIN GLUON MANAGED KEYS";
const SSH_MANAGED_END: &str = "# END GLUON MANAGED KEYS";

pub struct Reconciler {
    data_dir: PathBuf,
    /// Filesystem root every host path (`/etc/wireguard`, ...) is joined
    /// onto. `/` in production; a scratch directory in tests.
    root: PathBuf,
    /// Whether to shell out to `ifup`/`ifdown`/`systemctl` after writing
    /// files. Disabled in tests, where those binaries don't exist.
    apply_host_commands: bool,
}

impl Reconciler {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            root: PathBuf::from("/"),
            apply_host_commands: true,
        }
    }

    /// Builds a reconciler that writes every host-rooted path under `root`
    /// instead of `/`, and skips `ifup`/`ifdown`/`systemctl` invocations.
    /// For tests only.
    pub fn rooted_at(data_dir: PathBuf, root: PathBuf) -> Self {
        Self {
            data_dir,
            root,
            apply_host_commands: false,
        }
    }

    fn config_state_path(&self) -> PathBuf {
        self.data_dir.join("config-state.json")
    }

    fn ssh_state_path(&self) -> PathBuf {
        self.data_dir.join("ssh-state.json")
    }

    fn keys_state_path(&self) -> PathBuf {
        self.data_dir.join("wg-keys-state.json")
    }

    fn wireguard_dir(&self) -> PathBuf {
        self.root.join(WIREGUARD_DIR)
    }

    /// One reconcile pass: learn required interfaces, sync WireGuard keys,
    /// fetch the bundle, apply it if it's new, report back if it was.
    pub async fn reconcile_once(&self, client: &ControlPlaneClient) -> Result<()> {
        let network_info = client.network_info().await?;
        let keys = network::ensure_keys(self.wireguard_dir().join("keys").as_path(), &network_info.required_interfaces)?;
        network::sync_keys(client, &self.keys_state_path(), &keys).await?;

        let bundle = client.get_config().await?;
        let current_state = ConfigState::load(&self.config_state_path())?;

        if current_state.matches(bundle.version, &bundle.hash) {
            return Ok(());
        }

        self.apply(&bundle, &keys)?;

        let next_state = ConfigState { version: Some(bundle.version), hash: Some(bundle.hash.clone()) };
        next_state.save(&self.config_state_path())?;

        client.config_applied(bundle.version, bundle.hash).await?;
        info!(version = next_state.version, "applied and reported new config bundle");
        Ok(())
    }

    fn apply(&self, bundle: &ConfigResponse, keys: &[InterfaceKey]) -> Result<()> {
        info!(version = bundle.version, "applying config bundle");

        let mut network_touched = false;

        if !bundle.wireguard_configs.is_empty() {
            apply_wireguard_configs(&self.root, &bundle.wireguard_configs, keys)?;
            network_touched = true;
        }
        if !bundle.network_interface_file.trim().is_empty() {
            apply_network_interfaces(&self.root, &bundle.network_interface_file)?;
            network_touched = true;
        }
        if !bundle.frr_config_file.trim().is_empty() {
            apply_frr_config(&self.root, &bundle.frr_config_file)?;
            network_touched = true;
        }

        self.apply_ssh_authorized_keys(&bundle.ssh_authorized_keys)?;

        if network_touched && self.apply_host_commands {
            bring_up_interfaces(&bundle.wireguard_configs)?;
            reload_frr()?;
        }

        Ok(())
    }

    fn apply_ssh_authorized_keys(&self, keys: &[SshAuthorizedKeyEntry]) -> Result<()> {
        let mut by_user: HashMap<String, Vec<String>> = HashMap::new();
        for entry in keys {
            let user = entry.username.trim();
            let line = entry.public_key.trim();
            if user.is_empty() || line.is_empty() {
                continue;
            }
            by_user.entry(user.to_string()).or_default().push(line.to_string());
        }

        let mut state = SshState::load(&self.ssh_state_path())?;
        let mut next_rendered = HashMap::new();

        for (username, lines) in &by_user {
            ensure_user_exists(username)?;
            let home_dir = user_home_dir(username);
            reconcile_authorized_keys(username, &home_dir, lines)?;
            next_rendered.insert(username.clone(), normalize_key_lines(lines).join("\n"));
        }

        for username in state.rendered_by_username.keys() {
            if by_user.contains_key(username) && user_exists(username) {
                let home_dir = user_home_dir(username);
                reconcile_authorized_keys(username, &home_dir, &[])?;
            }
        }

        state.rendered_by_username = next_rendered;
        state.save(&self.ssh_state_path())?;
        Ok(())
    }
}

fn apply_wireguard_configs(
    root: &Path,
    configs: &std::collections::BTreeMap<String, String>,
    keys: &[InterfaceKey],
) -> Result<()> {
    let wireguard_dir = root.join(WIREGUARD_DIR);
    std::fs::create_dir_all(&wireguard_dir)
        .with_context(|| format!("creating {}", wireguard_dir.display()))?;

    let private_keys: HashMap<&str, String> = keys
        .iter()
        .map(|k| (k.interface_name.as_str(), std::fs::read_to_string(&k.private_key_path).unwrap_or_default().trim().to_string()))
        .collect();

    for (iface_name, config_content) in configs {
        let private_key = private_keys
            .get(iface_name.as_str())
            .cloned()
            .with_context(|| format!("no private key generated for interface {iface_name}"))?;

        let final_config = config_content.replacen(
            "PrivateKey = PRIVATE_KEY_PLACEHOLDER",
            &format!("PrivateKey = {private_key}"),
            1,
        );

        let config_path = wireguard_dir.join(format!("{iface_name}.conf"));
        write_mode(&config_path, &final_config, 0o600)?;
    }
    Ok(())
}

fn apply_network_interfaces(root: &Path, content: &str) -> Result<()> {
    let dir = root.join(NETWORK_INTERFACES_DIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    write_mode(&dir.join("gluon"), content, 0o644)
}

fn apply_frr_config(root: &Path, content: &str) -> Result<()> {
    let path = root.join(FRR_CONFIG_PATH);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    write_mode(&path, content, 0o640)
}

fn write_mode(path: &Path, content: &str, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting permissions on {}", path.display()))?;
    Ok(())
}

fn bring_up_interfaces(configs: &std::collections::BTreeMap<String, String>) -> Result<()> {
    for iface in configs.keys() {
        let _ = std::process::Command::new("ifdown").args(["--force", iface]).status();
        let _ = std::process::Command::new("ip").args(["link", "delete", iface]).status();
    }

    let status = std::process::Command::new("ifup").arg("dummy").status();
    if let Err(e) = status {
        warn!(error = %e, "failed to bring up dummy interface");
    }

    for iface in configs.keys() {
        let status = std::process::Command::new("ifup").arg(iface).status();
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => anyhow::bail!("ifup {iface} exited with {s}"),
            Err(e) => anyhow::bail!("failed to run ifup {iface}: {e}"),
        }
    }
    Ok(())
}

fn reload_frr() -> Result<()> {
    let status = std::process::Command::new("systemctl").args(["reload", "frr"]).status().context("running systemctl reload frr")?;
    if !status.success() {
        anyhow::bail!("systemctl reload frr exited with {status}");
    }
    Ok(())
}

fn ensure_user_exists(username: &str) -> Result<()> {
    if user_exists(username) {
        return Ok(());
    }
    let status = std::process::Command::new("useradd")
        .args(["-m", "-s", "/bin/bash", username])
        .status()
        .with_context(|| format!("running useradd for {username}"))?;
    if !status.success() {
        anyhow::bail!("useradd {username} exited with {status}");
    }
    Ok(())
}

fn user_exists(username: &str) -> bool {
    std::process::Command::new("id").args(["-u", username]).status().map(|s| s.success()).unwrap_or(false)
}

fn user_home_dir(username: &str) -> PathBuf {
    if username == "root" {
        return PathBuf::from("/root");
    }
    std::process::Command::new("getent")
        .args(["passwd", username])
        .output()
        .ok()
        .and_then(|o| {
            let text = String::from_utf8_lossy(&o.stdout).trim().to_string();
            let fields: Vec<&str> = text.split(':').collect();
            fields.get(5).filter(|s| !s.is_empty()).map(|s| PathBuf::from(s))
        })
        .unwrap_or_else(|| PathBuf::from("/home").join(username))
}

fn normalize_key_lines(lines: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for line in lines {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() || !seen.insert(collapsed.clone()) {
            continue;
        }
        out.push(collapsed);
    }
    out
}

fn reconcile_authorized_keys(username: &str, home_dir: &Path, public_keys: &[String]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let ssh_dir = home_dir.join(".ssh");
    let auth_keys_path = ssh_dir.join("authorized_keys");

    std::fs::create_dir_all(&ssh_dir).with_context(|| format!("creating {}", ssh_dir.display()))?;
    let _ = std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700));

    let existing = std::fs::read_to_string(&auth_keys_path).unwrap_or_default();
    let base = strip_managed_block(&existing);

    let desired = normalize_key_lines(public_keys);
    let managed = render_managed_block(&desired);

    let base_trim = base.trim_end_matches('\n');
    let mut next_text = base_trim.to_string();
    if !managed.is_empty() {
        next_text = if base_trim.is_empty() {
            managed
        } else {
            format!("{base_trim}\n\n{managed}")
        };
    }
    if !next_text.ends_with('\n') {
        next_text.push('\n');
    }

    if next_text != existing {
        std::fs::write(&auth_keys_path, &next_text).with_context(|| format!("writing {}", auth_keys_path.display()))?;
        std::fs::set_permissions(&auth_keys_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("setting permissions on {}", auth_keys_path.display()))?;
    }

    let _ = std::process::Command::new("chown")
        .args(["-R", &format!("{username}:{username}"), ssh_dir.to_str().unwrap_or_default()])
        .status();
    Ok(())
}

fn strip_managed_block(content: &str) -> String {
    let mut out = Vec::new();
    let mut in_managed = false;
    for line in content.lines() {
        match line.trim() {
            SSH_MANAGED_BEGIN => {
                in_managed = true;
                continue;
            }
            SSH_MANAGED_END => {
                in_managed = false;
                continue;
            }
            _ => {}
        }
        if in_managed {
            continue;
        }
        out.push(line);
    }
    let joined = out.join("\n");
    format!("{}\n", joined.trim_end_matches('\n'))
}

fn render_managed_block(keys: &[String]) -> String {
    if keys.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    out.push_str(SSH_MANAGED_BEGIN);
    out.push('\n');
    for key in keys {
        out.push_str(key);
        out.push('\n');
    }
    out.push_str(SSH_MANAGED_END);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_managed_block_removes_only_the_managed_region() {
        let content = "ssh-ed25519 AAA user@host\n# BEGIN GLUON MANAGED KEYS\nssh-ed25519 BBB\n# END GLUON MANAGED KEYS\n";
        let stripped = strip_managed_block(content);
        assert_eq!(stripped, "ssh-ed25519 AAA user@host\n");
    }

    #[test]
    fn render_managed_block_empty_for_no_keys() {
        assert_eq!(render_managed_block(&[]), "");
    }

    #[test]
    fn normalize_key_lines_dedupes_and_collapses_whitespace() {
        let lines = vec!["ssh-ed25519   AAA   comment".to_string(), "ssh-ed25519 AAA comment".to_string()];
        let normalized = normalize_key_lines(&lines);
        assert_eq!(normalized, vec!["ssh-ed25519 AAA comment".to_string()]);
    }
}
