//! Session model — persona, offer, and the append-only call transcript.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who spoke a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// The salesperson practicing the pitch.
    User,
    /// The simulated prospect.
    Agent,
}

impl Speaker {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Agent => "Agent",
        }
    }
}

/// One line of the call transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.speaker.label(), self.text)
    }
}

/// Ordered, append-only log of turns.
///
/// Entries cannot be removed or edited once pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    /// History carried over from before the session started (free text).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    preamble: String,
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously rendered history text.
    pub fn with_preamble(preamble: impl Into<String>) -> Self {
        Self {
            preamble: preamble.into().trim().to_string(),
            turns: Vec::new(),
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// True when neither turns nor carried-over history exist.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.preamble.is_empty()
    }

    /// Render as interleaved `User: ...` / `Agent: ...` lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.preamble.is_empty() {
            out.push_str(&self.preamble);
        }
        for turn in &self.turns {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&turn.to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_interleaves_speakers() {
        let mut t = Transcript::new();
        t.push(Turn::new(Speaker::User, "Hi, do you have a minute?"));
        t.push(Turn::new(Speaker::Agent, "Make it quick."));
        assert_eq!(t.render(), "User: Hi, do you have a minute?\nAgent: Make it quick.");
    }

    #[test]
    fn test_preamble_rendered_first() {
        let mut t = Transcript::with_preamble("  User: earlier\nAgent: earlier reply \n");
        assert!(!t.is_empty());
        t.push(Turn::new(Speaker::User, "now"));
        assert_eq!(t.render(), "User: earlier\nAgent: earlier reply\nUser: now");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_empty_transcript() {
        let t = Transcript::new();
        assert!(t.is_empty());
        assert_eq!(t.render(), "");
    }

    #[test]
    fn test_append_only_prefix() {
        let mut t = Transcript::new();
        t.push(Turn::new(Speaker::User, "one"));
        let before = t.turns().to_vec();
        t.push(Turn::new(Speaker::Agent, "two"));
        assert_eq!(&t.turns()[..before.len()], before.as_slice());
    }
}
