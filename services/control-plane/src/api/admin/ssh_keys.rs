//! Per-node `authorized_keys` entries: an admin grants a public key access
//! under a given Linux username, which the agent renders into that user's
//! `authorized_keys` file on its next config apply.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::request_context::AdminAuth;
use crate::models::SshKeyRow;
use crate::state::AppState;

/// Mirrors `useradd`'s own name validation: lowercase start, then
/// lowercase/digit/underscore/dash, with an optional trailing `$` for
/// machine accounts.
fn is_valid_linux_username(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first == '_') {
        return false;
    }
    let rest: Vec<char> = chars.collect();
    let (body, trailing_dollar) = match rest.last() {
        Some('$') => (&rest[..rest.len() - 1], true),
        _ => (&rest[..], false),
    };
    let _ = trailing_dollar;
    body.iter().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
}

/// Collapses whitespace in a pasted key line and rejects anything that
/// doesn't look like `<algo> <base64> [comment]`.
fn normalize_authorized_key_line(public_key: &str) -> Option<String> {
    let collapsed: Vec<&str> = public_key.split_whitespace().collect();
    if collapsed.len() < 2 {
        return None;
    }
    let algo = collapsed[0];
    let known_algo = algo.starts_with("ssh-") || algo.starts_with("ecdsa-") || algo == "sk-ssh-ed25519@openssh.com";
    if !known_algo {
        return None;
    }
    use base64::Engine;
    if base64::engine::general_purpose::STANDARD.decode(collapsed[1]).is_err() {
        return None;
    }
    Some(collapsed.join(" "))
}

pub async fn list_for_node(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(node_id): Path<i64>,
) -> Result<Json<Vec<SshKeyRow>>, ApiError> {
    let rows = sqlx::query_as::<_, SshKeyRow>(
        r#"SELECT id, node_id, username, public_key, comment, created_at
           FROM ssh_keys WHERE node_id = $1 ORDER BY username, id"#,
    )
    .bind(node_id)
    .fetch_all(state.db().pool())
    .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateSshKeyRequest {
    pub username: String,
    pub public_key: String,
    #[serde(default)]
    pub comment: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(node_id): Path<i64>,
    Json(body): Json<CreateSshKeyRequest>,
) -> Result<Json<SshKeyRow>, ApiError> {
    let username = body.username.trim();
    if !is_valid_linux_username(username) {
        return Err(ApiError::bad_request("invalid_username", "username is not a valid Linux account name"));
    }

    let Some(line) = normalize_authorized_key_line(&body.public_key) else {
        return Err(ApiError::bad_request("invalid_public_key", "public_key is not a recognizable authorized_keys line"));
    };

    let pool = state.db().pool();
    let node_exists: Option<i64> = sqlx::query_scalar("SELECT id FROM nodes WHERE id = $1")
        .bind(node_id)
        .fetch_optional(pool)
        .await?;
    if node_exists.is_none() {
        return Err(ApiError::not_found("not_found", "node not found"));
    }

    let duplicate: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM ssh_keys WHERE node_id = $1 AND username = $2 AND public_key = $3",
    )
    .bind(node_id)
    .bind(username)
    .bind(&line)
    .fetch_optional(pool)
    .await?;
    if duplicate.is_some() {
        return Err(ApiError::conflict("duplicate_key", "this key is already authorized for this user on this node"));
    }

    let comment = body.comment.as_deref().map(str::trim).filter(|c| !c.is_empty());

    let row = sqlx::query_as::<_, SshKeyRow>(
        r#"INSERT INTO ssh_keys (node_id, username, public_key, comment)
           VALUES ($1, $2, $3, $4)
           RETURNING id, node_id, username, public_key, comment, created_at"#,
    )
    .bind(node_id)
    .bind(username)
    .bind(&line)
    .bind(comment)
    .fetch_one(pool)
    .await?;

    Ok(Json(row))
}

pub async fn delete_key(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = sqlx::query("DELETE FROM ssh_keys WHERE id = $1")
        .bind(id)
        .execute(state.db().pool())
        .await?;
    if outcome.rows_affected() == 0 {
        return Err(ApiError::not_found("not_found", "ssh key not found"));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_username() {
        assert!(is_valid_linux_username("deploy"));
        assert!(is_valid_linux_username("svc-app_1"));
    }

    #[test]
    fn rejects_leading_digit_or_uppercase() {
        assert!(!is_valid_linux_username("1deploy"));
        assert!(!is_valid_linux_username("Deploy"));
    }

    #[test]
    fn allows_trailing_dollar_for_machine_accounts() {
        assert!(is_valid_linux_username("host$"));
    }

    #[test]
    fn normalizes_whitespace_and_validates_base64() {
        let line = normalize_authorized_key_line("ssh-ed25519   AAAAC3NzaC1lZDI1NTE5AAAAIJ  me@host").unwrap();
        assert_eq!(line, "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJ me@host");
    }

    #[test]
    fn rejects_unrecognized_key_type() {
        assert!(normalize_authorized_key_line("not-a-key AAAA").is_none());
    }
}
