//! Persistence gateway for scan sessions and their final results.

use std::collections::HashMap;

use ::time::{format_description::well_known, OffsetDateTime};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{FullResults, ScanMode, SessionId, SessionStatus};

/// Where the monitor records outcomes.
///
/// Updating or attaching results to a session that does not exist is not an
/// error: implementations log a warning and succeed.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn update_session_status(
        &self,
        session: SessionId,
        status: SessionStatus,
    ) -> Result<(), StoreError>;

    async fn create_full_results(
        &self,
        session: SessionId,
        mode: ScanMode,
        results: &FullResults,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScanSessionRecord {
    pub id: SessionId,
    pub url: String,
    pub mode: ScanMode,
    pub status: SessionStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FullResultsRecord {
    pub session: SessionId,
    pub mode: ScanMode,
    pub results: FullResults,
    pub created_at: String,
}

/// In-process store backing the HTTP surface.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, ScanSessionRecord>>,
    results: RwLock<Vec<FullResultsRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session in the running state.
    pub async fn create_session(&self, url: &str, mode: ScanMode) -> SessionId {
        let id = SessionId::new();
        let now = now_rfc3339();
        let record = ScanSessionRecord {
            id,
            url: url.to_string(),
            mode,
            status: SessionStatus::running(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.sessions.write().await.insert(id, record);
        debug!(session = %id, %mode, "scan session created");
        id
    }

    pub async fn session(&self, id: SessionId) -> Option<ScanSessionRecord> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn full_results_for(&self, id: SessionId) -> Vec<FullResultsRecord> {
        self.results
            .read()
            .await
            .iter()
            .filter(|r| r.session == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn update_session_status(
        &self,
        session: SessionId,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session) {
            Some(record) => {
                debug!(%session, state = ?status.state, "session status updated");
                record.status = status;
                record.updated_at = now_rfc3339();
            }
            None => warn!(%session, "status update for unknown scan session"),
        }
        Ok(())
    }

    async fn create_full_results(
        &self,
        session: SessionId,
        mode: ScanMode,
        results: &FullResults,
    ) -> Result<(), StoreError> {
        if !self.sessions.read().await.contains_key(&session) {
            warn!(%session, "results for unknown scan session dropped");
            return Ok(());
        }
        self.results.write().await.push(FullResultsRecord {
            session,
            mode,
            results: results.clone(),
            created_at: now_rfc3339(),
        });
        Ok(())
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
