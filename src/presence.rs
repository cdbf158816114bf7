use chrono::Utc;

use crate::db::{queries, Pool};
use crate::errors::AppResult;
use crate::models::PresenceStatus;

/// Durable per-user online/offline record.
///
/// Sessions are counted, so a user with two tabs stays online until the
/// second one closes. `last_seen` moves on every transition.
#[derive(Clone)]
pub struct PresenceTracker {
    db: Pool,
}

impl PresenceTracker {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }

    /// Force the user online without touching the session count.
    pub async fn set_online(&self, user_id: i64) -> AppResult<PresenceStatus> {
        queries::upsert_presence(&self.db, user_id, true, Utc::now()).await
    }

    /// Force the user offline and forget any counted sessions.
    pub async fn set_offline(&self, user_id: i64) -> AppResult<PresenceStatus> {
        queries::upsert_presence(&self.db, user_id, false, Utc::now()).await
    }

    pub async fn session_opened(&self, user_id: i64) -> AppResult<PresenceStatus> {
        let status = queries::presence_session_opened(&self.db, user_id, Utc::now()).await?;
        tracing::debug!(user_id, sessions = status.active_sessions, "presence: session opened");
        Ok(status)
    }

    /// Returns the row after the decrement; `is_online` is false once the
    /// last session is gone.
    pub async fn session_closed(&self, user_id: i64) -> AppResult<PresenceStatus> {
        let status = queries::presence_session_closed(&self.db, user_id, Utc::now()).await?;
        tracing::debug!(user_id, sessions = status.active_sessions, "presence: session closed");
        Ok(status)
    }

    pub async fn get(&self, user_id: i64) -> AppResult<Option<PresenceStatus>> {
        queries::find_presence(&self.db, user_id).await
    }

    pub async fn get_many(&self, user_ids: &[i64]) -> AppResult<Vec<PresenceStatus>> {
        queries::find_presences(&self.db, user_ids).await
    }

    /// A user with no presence row has never connected and counts as offline.
    pub async fn is_online(&self, user_id: i64) -> AppResult<bool> {
        Ok(self.get(user_id).await?.map(|p| p.is_online).unwrap_or(false))
    }

    /// True if the row moved past `version` since it was read. Lookup
    /// errors count as not superseded.
    pub async fn superseded(&self, user_id: i64, version: i64) -> bool {
        match self.get(user_id).await {
            Ok(Some(current)) => current.version > version,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(user_id, "Failed to re-read presence: {}", e);
                false
            }
        }
    }

    /// Mark every user offline. Called once at startup.
    pub async fn reset_all(&self) -> AppResult<u64> {
        let reset = queries::reset_presence(&self.db).await?;
        if reset > 0 {
            tracing::info!("Reset {} stale presence records", reset);
        }
        Ok(reset)
    }
}
