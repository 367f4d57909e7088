//! Application state shared across request handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Database,
    admin_token: String,
    heartbeat_timeout: Duration,
}

impl AppState {
    /// Create a new application state.
    pub fn new(db: Database, admin_token: String, heartbeat_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                db,
                admin_token,
                heartbeat_timeout,
            }),
        }
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    /// The shared secret required on admin routes.
    pub fn admin_token(&self) -> &str {
        &self.inner.admin_token
    }

    /// How long a node may go without a heartbeat before it's offline.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.inner.heartbeat_timeout
    }
}
