//! External collaborators behind trait seams.
//!
//! The realtime loop only sees [`ReplyGenerator`]; session finalization uses
//! [`CallCoach`]. [`google::GeminiProvider`] implements both.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod google;
pub mod prompts;
pub mod supabase;

/// Input for one prospect reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRequest {
    /// What the salesperson just said.
    pub user_text: String,
    /// Rendered transcript so far (already includes `user_text`).
    pub history: String,
    pub persona: String,
    pub offer: String,
}

/// A finished (or in-progress) call to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub history: String,
    pub persona: String,
    pub offer: String,
}

/// Coaching verdict for a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallScore {
    pub score: Option<i64>,
    pub feedback: String,
}

/// Produces the simulated prospect's next line.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn reply(&self, request: &ReplyRequest) -> anyhow::Result<String>;
}

/// Scores and titles completed calls.
#[async_trait]
pub trait CallCoach: Send + Sync {
    async fn score(&self, call: &CallContext) -> anyhow::Result<CallScore>;

    async fn title(&self, call: &CallContext) -> anyhow::Result<String>;
}
