//! Session-metadata persistence seam.
//!
//! Only `{state, timestamps}` ever goes through here — key material never
//! outlives the live conversation, so a resumed record in READY state
//! still means a fresh key exchange. Writes are best-effort; the
//! orchestrator logs and continues on store failure.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::SessionError;
use crate::session::SessionState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, record: SessionRecord) -> Result<(), SessionError>;
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError>;
    async fn delete(&self, session_id: &str) -> Result<(), SessionError>;
    /// Remove records not updated within `max_age`. Returns the count.
    async fn clear_expired(&self, max_age: Duration) -> Result<usize, SessionError>;
}

/// In-memory keyed store; the reference implementation and the test
/// double. Production embeddings supply their own keyed store.
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, record: SessionRecord) -> Result<(), SessionError> {
        self.records
            .lock()
            .await
            .insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.records.lock().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        self.records.lock().await.remove(session_id);
        Ok(())
    }

    async fn clear_expired(&self, max_age: Duration) -> Result<usize, SessionError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| SessionError::Persistence(e.to_string()))?;
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.updated_at > cutoff);
        Ok(before - records.len())
    }
}
