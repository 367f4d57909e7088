//! WireGuard keypair management: learns which interfaces this node needs
//! from the control plane, generates or loads a keypair per interface, and
//! uploads public keys that haven't been uploaded yet.
//!
//! Grounded on the original agent's `keys` package: keys are generated with
//! the `wg` CLI rather than an in-process crypto implementation, one
//! keypair per interface, and an upload snapshot avoids re-uploading a key
//! that's already been seen by the control plane.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::client::ControlPlaneClient;
use crate::state::WireguardKeysState;

const KEYS_DIR: &str = "/etc/wireguard/keys";

/// Public key for one interface, plus the path its private key lives at
/// (for the reconciler to reference when it renders the interface config).
pub struct InterfaceKey {
    pub interface_name: String,
    pub private_key_path: PathBuf,
    pub public_key: String,
}

/// Ensures every interface the control plane told us about has a keypair
/// on disk, generating new ones as needed, and returns all of them.
pub fn ensure_keys(keys_dir: &Path, required_interfaces: &[String]) -> Result<Vec<InterfaceKey>> {
    std::fs::create_dir_all(keys_dir)
        .with_context(|| format!("creating {}", keys_dir.display()))?;

    required_interfaces
        .iter()
        .map(|iface| ensure_key(keys_dir, iface))
        .collect()
}

fn ensure_key(keys_dir: &Path, interface_name: &str) -> Result<InterfaceKey> {
    let private_key_path = keys_dir.join(format!("{interface_name}.key"));
    let public_key_path = keys_dir.join(format!("{interface_name}.pub"));

    if private_key_path.exists() && public_key_path.exists() {
        let public_key = std::fs::read_to_string(&public_key_path)
            .with_context(|| format!("reading {}", public_key_path.display()))?
            .trim()
            .to_string();
        return Ok(InterfaceKey {
            interface_name: interface_name.to_string(),
            private_key_path,
            public_key,
        });
    }

    let (private_key, public_key) = generate_keypair()?;

    write_key_file(&private_key_path, &private_key, 0o600)?;
    write_key_file(&public_key_path, &public_key, 0o644)?;

    info!(interface = %interface_name, "generated new wireguard keypair");

    Ok(InterfaceKey {
        interface_name: interface_name.to_string(),
        private_key_path,
        public_key,
    })
}

fn write_key_file(path: &Path, contents: &str, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("{contents}\n")).with_context(|| format!("writing {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting permissions on {}", path.display()))?;
    Ok(())
}

fn generate_keypair() -> Result<(String, String)> {
    let genkey = std::process::Command::new("wg")
        .arg("genkey")
        .output()
        .context("running wg genkey")?;
    if !genkey.status.success() {
        anyhow::bail!("wg genkey exited with {}", genkey.status);
    }
    let private_key = String::from_utf8(genkey.stdout)?.trim().to_string();

    let pubkey = std::process::Command::new("wg")
        .arg("pubkey")
        .arg_stdin(&private_key)
        .context("running wg pubkey")?;

    Ok((private_key, pubkey))
}

/// Uploads any interface public key that differs from (or is missing from)
/// the last uploaded snapshot, then persists the new snapshot.
pub async fn sync_keys(
    client: &ControlPlaneClient,
    state_path: &Path,
    keys: &[InterfaceKey],
) -> Result<()> {
    let previous = WireguardKeysState::load(state_path)?;

    let current: BTreeMap<String, String> = keys
        .iter()
        .map(|k| (k.interface_name.clone(), k.public_key.clone()))
        .collect();

    if previous.public_keys == current {
        return Ok(());
    }

    let pending: BTreeMap<String, String> = current
        .iter()
        .filter(|(iface, key)| previous.public_keys.get(*iface) != Some(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    client.upload_keys(pending).await?;

    let next = WireguardKeysState { public_keys: current };
    next.save(state_path)?;
    Ok(())
}

trait CommandStdinExt {
    fn arg_stdin(&mut self, input: &str) -> Result<String>;
}

impl CommandStdinExt for std::process::Command {
    fn arg_stdin(&mut self, input: &str) -> Result<String> {
        use std::io::Write;
        use std::process::Stdio;

        let mut child = self
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .context("spawning wg pubkey")?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(input.as_bytes())
            .context("writing private key to wg pubkey stdin")?;
        let output = child.wait_with_output().context("waiting for wg pubkey")?;
        if !output.status.success() {
            anyhow::bail!("wg pubkey exited with {}", output.status);
        }
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_key_reuses_existing_keypair() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wg-hub1.key"), "privatekey\n").unwrap();
        std::fs::write(dir.path().join("wg-hub1.pub"), "publickey\n").unwrap();

        let key = ensure_key(dir.path(), "wg-hub1").unwrap();
        assert_eq!(key.public_key, "publickey");
        assert_eq!(key.interface_name, "wg-hub1");
    }

    #[test]
    fn keys_dir_constant_matches_original_layout() {
        assert_eq!(KEYS_DIR, "/etc/wireguard/keys");
    }
}
