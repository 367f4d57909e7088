//! Append-only `events`/`audit_log` writers.
//!
//! Both tables share the same shape (`occurred_at`, `actor`, `kind`, a
//! free-form `payload`), so one row type ([`crate::models::EventRow`])
//! and one write path cover either; which table a given fact belongs in is
//! the caller's call. Writes here are best-effort: a failure is logged and
//! swallowed rather than surfaced, so an audit-log hiccup never turns into a
//! failed enrollment or a lost heartbeat.

use sqlx::PgPool;
use tracing::warn;

/// Actor string for control-plane/agent-initiated facts.
pub const ACTOR_SYSTEM: &str = "system";

/// Actor string for operator-initiated facts. The admin surface authenticates
/// against a single shared token with no per-operator identity, so there is
/// no finer-grained subject to record.
pub const ACTOR_ADMIN: &str = "admin";

/// Records a fact into `events`: something that happened, independent of
/// whether an operator asked for it (an agent enrolling, a heartbeat
/// arriving, a key rotating).
pub async fn record_event(pool: &PgPool, actor: &str, kind: &str, payload: serde_json::Value) {
    if let Err(err) = sqlx::query(
        r#"INSERT INTO events (actor, kind, payload) VALUES ($1, $2, $3)"#,
    )
    .bind(actor)
    .bind(kind)
    .bind(payload)
    .execute(pool)
    .await
    {
        warn!(%err, kind, "failed to record event");
    }
}

/// Records a fact into `audit_log`: something an operator did (approving a
/// request, dispatching a command, editing settings).
pub async fn record_audit(pool: &PgPool, actor: &str, kind: &str, payload: serde_json::Value) {
    if let Err(err) = sqlx::query(
        r#"INSERT INTO audit_log (actor, kind, payload) VALUES ($1, $2, $3)"#,
    )
    .bind(actor)
    .bind(kind)
    .bind(payload)
    .execute(pool)
    .await
    {
        warn!(%err, kind, "failed to record audit entry");
    }
}
