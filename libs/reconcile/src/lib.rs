//! Config bundle fingerprinting and self-heal rate limiting.
//!
//! The control plane renders each node's WireGuard/interfaces/FRR/SSH text
//! into a bundle and tags it with a [`BundleFingerprint`] so the agent can
//! tell, on every poll, whether anything changed without re-downloading or
//! re-rendering the bundle itself.
//!
//! The node agent's self-healing watchdogs (CNI restart, node-IP pinning,
//! advertise-address correction, `/livez` patching, missing-join detection)
//! all share one shape: "don't re-attempt this fix more often than every N
//! minutes." [`Debounce`] tracks that per named check.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// Resource not found.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Conflict detected (concurrent modification).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A full SHA-256 fingerprint over a config bundle's canonical contents.
///
/// Unlike a dedup hash that can tolerate truncation, this fingerprint is the
/// thing the agent compares byte-for-byte against its last-applied bundle to
/// decide whether to re-render and restart services, so it carries the full
/// 32-byte digest rather than a shortened prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BundleFingerprint(String);

impl BundleFingerprint {
    /// Computes a fingerprint over a JSON value (canonicalized: sorted keys,
    /// no incidental whitespace) plus an ordered list of rendered text files.
    ///
    /// The JSON value carries the bundle's structured metadata (addresses,
    /// peer list, hub number); the text files are the exact WireGuard,
    /// `/etc/network/interfaces`, and FRR config text the agent writes to
    /// disk. Both must be included: two bundles can render to the same text
    /// from different metadata only if the generator is buggy, but the
    /// reverse (same metadata, different text because of a generator bug)
    /// is exactly what a fingerprint over metadata alone would miss.
    pub fn compute(metadata: &serde_json::Value, rendered_files: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(metadata).as_bytes());
        for file in rendered_files {
            hasher.update(b"\0");
            hasher.update(file.as_bytes());
        }
        let digest = hasher.finalize();
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BundleFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Tracks the last time each named self-heal check fired, so a watchdog loop
/// that runs every few seconds doesn't re-attempt the same fix on every tick.
#[derive(Debug, Clone)]
pub struct Debounce {
    interval: Duration,
    last_fired: BTreeMap<String, Instant>,
}

impl Debounce {
    /// Creates a debounce gate with a fixed minimum re-attempt interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: BTreeMap::new(),
        }
    }

    /// Returns true if `key` has never fired, or fired longer than
    /// `interval` ago. Does not record the attempt; call [`Self::mark_fired`]
    /// once the caller actually performs the fix.
    pub fn ready(&self, key: &str, now: Instant) -> bool {
        match self.last_fired.get(key) {
            None => true,
            Some(last) => now.duration_since(*last) >= self.interval,
        }
    }

    /// Records that `key` fired at `now`.
    pub fn mark_fired(&mut self, key: &str, now: Instant) {
        self.last_fired.insert(key.to_string(), now);
    }

    /// Convenience: if `ready`, records the firing and returns true.
    pub fn try_fire(&mut self, key: &str, now: Instant) -> bool {
        if self.ready(key, now) {
            self.mark_fired(key, now);
            true
        } else {
            false
        }
    }
}

/// Minimum re-attempt interval for node-IP pinning self-heal.
pub const NODE_IP_PIN_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Minimum re-attempt interval for advertise-address drift correction.
pub const ADVERTISE_ADDRESS_CORRECTION_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Minimum re-attempt interval for patching a `/livez` 403 to allow
/// anonymous auth.
pub const LIVEZ_ANONYMOUS_AUTH_PATCH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Minimum re-attempt interval for the missing-join watchdog.
pub const MISSING_JOIN_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_under_key_reordering() {
        let meta1 = serde_json::json!({"b": 2, "a": 1});
        let meta2 = serde_json::json!({"a": 1, "b": 2});

        let fp1 = BundleFingerprint::compute(&meta1, &["wg0 config text"]);
        let fp2 = BundleFingerprint::compute(&meta2, &["wg0 config text"]);

        assert_eq!(fp1, fp2);
    }

    #[test]
    fn fingerprint_changes_with_rendered_text() {
        let meta = serde_json::json!({"hub_number": 1});
        let fp1 = BundleFingerprint::compute(&meta, &["old text"]);
        let fp2 = BundleFingerprint::compute(&meta, &["new text"]);
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn fingerprint_is_full_sha256_not_truncated() {
        let meta = serde_json::json!({});
        let fp = BundleFingerprint::compute(&meta, &[]);
        // A 32-byte digest hex-encodes to 64 characters; truncating to 16
        // bytes (as a dedup-only hash might) would yield 32.
        assert_eq!(fp.as_str().len(), 64);
    }

    #[test]
    fn debounce_blocks_until_interval_elapses() {
        let mut d = Debounce::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(d.try_fire("node-ip-pin", t0));
        assert!(!d.ready("node-ip-pin", t0 + Duration::from_secs(30)));
        assert!(d.ready("node-ip-pin", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn debounce_tracks_keys_independently() {
        let mut d = Debounce::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(d.try_fire("node-ip-pin", t0));
        assert!(d.ready("advertise-address", t0));
    }
}
