//! Durable archive of finished sessions.
//!
//! Written once per session at termination; never touched by the realtime loop.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{PitchlineError, Result};

/// Final summary of one practice call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub persona: String,
    pub offer: String,
    pub history: String,
    pub score: Option<i64>,
    pub feedback: String,
    pub title: String,
    /// Unix seconds.
    pub created_at: i64,
}

/// Compact row for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionListing {
    pub session_id: String,
    pub title: String,
    pub created_at: i64,
    pub score: Option<i64>,
}

impl From<&SessionRecord> for SessionListing {
    fn from(r: &SessionRecord) -> Self {
        Self {
            session_id: r.session_id.clone(),
            title: r.title.clone(),
            created_at: r.created_at,
            score: r.score,
        }
    }
}

#[async_trait]
pub trait SessionArchive: Send + Sync {
    async fn insert(&self, record: &SessionRecord) -> Result<()>;

    /// Listings ordered newest first.
    async fn list(&self) -> Result<Vec<SessionListing>>;

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>>;
}

/// File-based archive: one JSON record per line in `<base>/sessions.jsonl`.
pub struct JsonlArchive {
    base: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlArchive {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self) -> PathBuf {
        self.base.join("sessions.jsonl")
    }

    async fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let path = self.path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut records = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SessionRecord = serde_json::from_str(line)
                .map_err(|e| PitchlineError::Archive(format!("corrupt archive line: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl SessionArchive for JsonlArchive {
    async fn insert(&self, record: &SessionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.base).await?;

        if self
            .load_all()
            .await?
            .iter()
            .any(|r| r.session_id == record.session_id)
        {
            return Err(PitchlineError::Archive(format!(
                "session already archived: {}",
                record.session_id
            )));
        }

        let line = serde_json::to_string(record)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        debug!(session_id = %record.session_id, "Archived session");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionListing>> {
        let mut listings: Vec<SessionListing> =
            self.load_all().await?.iter().map(SessionListing::from).collect();
        listings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listings)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .find(|r| r.session_id == session_id))
    }
}
