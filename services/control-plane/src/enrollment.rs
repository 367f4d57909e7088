//! Enrollment secret and node API key generation and verification.
//!
//! A credential is 32 random bytes, hex-encoded
//! and prefixed so it's recognizable in logs (`es_` for enrollment secrets,
//! `glx_` for node API keys), then stored as a bcrypt hash. Because bcrypt
//! can't be looked up by value, each credential also gets an 8-byte SHA-256
//! **prefix of the digest** stored alongside the hash as a search index —
//! looking up a presented credential means re-deriving its index and
//! narrowing to the handful of rows that share it before the bcrypt check.

use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to hash credential: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// A freshly minted credential: the plaintext to hand to the caller once,
/// plus what the store should persist.
pub struct IssuedCredential {
    pub plaintext: String,
    pub hash: String,
    pub hash_index: String,
}

const ENROLLMENT_SECRET_PREFIX: &str = "es_";
const API_KEY_PREFIX: &str = "glx_";

/// Generates a new enrollment secret, handed to an operator to give to a
/// node being enrolled out of band.
pub fn generate_enrollment_secret() -> Result<IssuedCredential, CredentialError> {
    issue_credential(ENROLLMENT_SECRET_PREFIX)
}

/// Generates a new node API key, issued once a node's enrollment is
/// approved.
pub fn generate_api_key() -> Result<IssuedCredential, CredentialError> {
    issue_credential(API_KEY_PREFIX)
}

fn issue_credential(prefix: &str) -> Result<IssuedCredential, CredentialError> {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let plaintext = format!("{prefix}{}", hex::encode(bytes));
    let hash = bcrypt::hash(&plaintext, bcrypt::DEFAULT_COST)?;
    let hash_index = credential_hash_index(&plaintext);
    Ok(IssuedCredential {
        plaintext,
        hash,
        hash_index,
    })
}

/// Derives the lookup index for a presented credential: the first 8 bytes
/// (16 hex chars) of its SHA-256 digest.
pub fn credential_hash_index(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    hex::encode(&digest[..8])
}

/// Verifies a presented credential against a stored bcrypt hash.
pub fn verify_credential(plaintext: &str, hash: &str) -> bool {
    bcrypt::verify(plaintext, hash).unwrap_or(false)
}

fn is_well_formed(s: &str, prefix: &str) -> bool {
    match s.strip_prefix(prefix) {
        Some(rest) => rest.len() == 64 && rest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
        None => false,
    }
}

/// Whether a string has the shape of an enrollment secret (`es_` + 64 lowercase
/// hex chars), without touching the database. A malformed credential is
/// rejected before any lookup so a probe can't distinguish "wrong shape" from
/// "valid shape, wrong value" by response latency.
pub fn is_well_formed_enrollment_secret(s: &str) -> bool {
    is_well_formed(s, ENROLLMENT_SECRET_PREFIX)
}

/// Whether a string has the shape of a node API key (`glx_` + 64 lowercase hex
/// chars).
pub fn is_well_formed_api_key(s: &str) -> bool {
    is_well_formed(s, API_KEY_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_secret_has_expected_prefix_and_length() {
        let cred = generate_enrollment_secret().unwrap();
        assert!(cred.plaintext.starts_with("es_"));
        assert_eq!(cred.plaintext.len(), 3 + 64);
    }

    #[test]
    fn api_key_has_expected_prefix_and_length() {
        let cred = generate_api_key().unwrap();
        assert!(cred.plaintext.starts_with("glx_"));
        assert_eq!(cred.plaintext.len(), 4 + 64);
    }

    #[test]
    fn verify_roundtrips() {
        let cred = generate_api_key().unwrap();
        assert!(verify_credential(&cred.plaintext, &cred.hash));
        assert!(!verify_credential("glx_wrong", &cred.hash));
    }

    #[test]
    fn hash_index_is_stable_and_narrow() {
        let cred = generate_api_key().unwrap();
        assert_eq!(credential_hash_index(&cred.plaintext), cred.hash_index);
        assert_eq!(cred.hash_index.len(), 16);
    }

    #[test]
    fn hash_index_differs_for_different_secrets() {
        let a = generate_api_key().unwrap();
        let b = generate_api_key().unwrap();
        assert_ne!(a.hash_index, b.hash_index);
    }

    #[test]
    fn well_formed_check_accepts_generated_credentials() {
        assert!(is_well_formed_enrollment_secret(&generate_enrollment_secret().unwrap().plaintext));
        assert!(is_well_formed_api_key(&generate_api_key().unwrap().plaintext));
    }

    #[test]
    fn well_formed_check_rejects_wrong_prefix_length_or_case() {
        assert!(!is_well_formed_enrollment_secret("glx_aaaa"));
        assert!(!is_well_formed_enrollment_secret(&format!("es_{}", "a".repeat(63))));
        assert!(!is_well_formed_enrollment_secret(&format!("es_{}", "A".repeat(64))));
    }
}
