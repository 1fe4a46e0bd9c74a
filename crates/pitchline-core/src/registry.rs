//! Process-wide session registry.
//!
//! Lookups are safe from any number of concurrent handlers. Mutation of a
//! session's transcript is restricted to the holder of that session's
//! [`SessionWriter`]; at most one writer exists per session at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PitchlineError, Result};
use crate::session::{Speaker, Transcript, Turn};

/// A live session. Persona and offer never change after creation.
#[derive(Debug)]
pub struct SessionEntry {
    id: String,
    persona: String,
    offer: String,
    created_at: DateTime<Utc>,
    history: RwLock<Transcript>,
    active: AtomicBool,
    writer_claimed: AtomicBool,
    writer_released: Notify,
}

impl SessionEntry {
    fn new(id: String, persona: String, offer: String, history: Transcript) -> Self {
        Self {
            id,
            persona,
            offer,
            created_at: Utc::now(),
            history: RwLock::new(history),
            active: AtomicBool::new(true),
            writer_claimed: AtomicBool::new(false),
            writer_released: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn offer(&self) -> &str {
        &self.offer
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark inactive. Returns true only for the call that flipped the flag.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Copy of the transcript at this instant.
    pub fn history(&self) -> Transcript {
        self.history.read().clone()
    }

    pub fn rendered_history(&self) -> String {
        self.history.read().render()
    }

    pub fn has_writer(&self) -> bool {
        self.writer_claimed.load(Ordering::Acquire)
    }

    /// Resolve once no [`SessionWriter`] is held for this session.
    pub async fn writer_released(&self) {
        loop {
            let mut notified = std::pin::pin!(self.writer_released.notified());
            notified.as_mut().enable();
            if !self.has_writer() {
                return;
            }
            notified.await;
        }
    }

    /// Claim exclusive write access to this session's transcript.
    pub fn claim_writer(self: &Arc<Self>) -> Result<SessionWriter> {
        if !self.is_active() {
            return Err(PitchlineError::SessionInactive(self.id.clone()));
        }
        if self
            .writer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PitchlineError::SessionBusy(self.id.clone()));
        }
        debug!(session_id = %self.id, "Session writer claimed");
        Ok(SessionWriter {
            entry: Arc::clone(self),
        })
    }
}

/// Exclusive write handle for one session's transcript. Released on drop.
#[derive(Debug)]
pub struct SessionWriter {
    entry: Arc<SessionEntry>,
}

impl SessionWriter {
    pub fn session(&self) -> &Arc<SessionEntry> {
        &self.entry
    }

    pub fn append(&self, speaker: Speaker, text: impl Into<String>) {
        self.entry.history.write().push(Turn::new(speaker, text));
    }

    pub fn rendered_history(&self) -> String {
        self.entry.rendered_history()
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        self.entry.writer_claimed.store(false, Ordering::Release);
        self.entry.writer_released.notify_waiters();
        debug!(session_id = %self.entry.id, "Session writer released");
    }
}

/// Mapping from session id to live session state.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session. A missing id is replaced by a fresh UUID.
    pub fn create(
        &self,
        id: Option<String>,
        persona: impl Into<String>,
        offer: impl Into<String>,
        history: Transcript,
    ) -> Result<Arc<SessionEntry>> {
        let id = id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(PitchlineError::InvalidRequest(format!(
                "session id already in use: {id}"
            )));
        }
        let entry = Arc::new(SessionEntry::new(
            id.clone(),
            persona.into(),
            offer.into(),
            history,
        ));
        sessions.insert(id.clone(), Arc::clone(&entry));
        debug!(session_id = %id, total = sessions.len(), "Session created");
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Result<Arc<SessionEntry>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PitchlineError::SessionNotFound(id.to_string()))
    }

    /// Remove a session. Only the first caller for a given id gets the entry.
    pub fn remove(&self, id: &str) -> Option<Arc<SessionEntry>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            debug!(session_id = %id, "Session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_remove() {
        let registry = SessionRegistry::new();
        let entry = registry
            .create(Some("abc".into()), "CFO at a bank", "Fraud analytics", Transcript::new())
            .unwrap();
        assert_eq!(entry.id(), "abc");
        assert_eq!(entry.persona(), "CFO at a bank");
        assert!(entry.is_active());

        let fetched = registry.get("abc").unwrap();
        assert!(Arc::ptr_eq(&entry, &fetched));

        assert!(registry.remove("abc").is_some());
        assert!(registry.remove("abc").is_none());
        assert!(matches!(
            registry.get("abc"),
            Err(PitchlineError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_generated_id_when_missing() {
        let registry = SessionRegistry::new();
        let a = registry.create(None, "p", "o", Transcript::new()).unwrap();
        let b = registry.create(Some("  ".into()), "p", "o", Transcript::new()).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(Uuid::parse_str(a.id()).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = SessionRegistry::new();
        registry.create(Some("dup".into()), "p", "o", Transcript::new()).unwrap();
        assert!(registry.create(Some("dup".into()), "p", "o", Transcript::new()).is_err());
    }

    #[test]
    fn test_single_writer() {
        let registry = SessionRegistry::new();
        let entry = registry.create(None, "p", "o", Transcript::new()).unwrap();

        let writer = entry.claim_writer().unwrap();
        assert!(entry.has_writer());
        assert!(matches!(
            entry.claim_writer(),
            Err(PitchlineError::SessionBusy(_))
        ));

        writer.append(Speaker::User, "hello");
        drop(writer);
        assert!(!entry.has_writer());

        let again = entry.claim_writer().unwrap();
        again.append(Speaker::Agent, "who is this?");
        assert_eq!(entry.rendered_history(), "User: hello\nAgent: who is this?");
    }

    #[tokio::test]
    async fn test_writer_released_waits_for_last_append() {
        let registry = SessionRegistry::new();
        let entry = registry.create(None, "p", "o", Transcript::new()).unwrap();

        // No writer: resolves immediately.
        entry.writer_released().await;

        let writer = entry.claim_writer().unwrap();
        let waiter = tokio::spawn({
            let entry = Arc::clone(&entry);
            async move {
                entry.writer_released().await;
                entry.rendered_history()
            }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        writer.append(Speaker::User, "one last thing");
        drop(writer);
        assert_eq!(waiter.await.unwrap(), "User: one last thing");
    }

    #[test]
    fn test_inactive_session_refuses_writer() {
        let registry = SessionRegistry::new();
        let entry = registry.create(None, "p", "o", Transcript::new()).unwrap();
        assert!(entry.deactivate());
        assert!(!entry.deactivate());
        assert!(matches!(
            entry.claim_writer(),
            Err(PitchlineError::SessionInactive(_))
        ));
    }

    #[test]
    fn test_concurrent_lookups() {
        let registry = Arc::new(SessionRegistry::new());
        for i in 0..8 {
            registry
                .create(Some(format!("s{i}")), "p", "o", Transcript::new())
                .unwrap();
        }
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(registry.get(&format!("s{i}")).is_ok());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
