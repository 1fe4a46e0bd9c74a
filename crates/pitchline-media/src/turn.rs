//! Silence-based end-of-turn detection.
//!
//! A turn completes when no finalized transcript has arrived for longer than
//! the silence threshold. Partial transcripts never reach the detector.

use std::time::Duration;

use tokio::time::Instant;

use pitchline_core::config::TurnPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Nothing awaiting a reply.
    Listening,
    /// Finalized text collected; waiting for the silence threshold.
    TurnPending,
}

#[derive(Debug)]
pub struct TurnDetector {
    policy: TurnPolicy,
    threshold: Duration,
    fragments: Vec<String>,
    last_final_at: Option<Instant>,
}

impl TurnDetector {
    pub fn new(policy: TurnPolicy, threshold: Duration) -> Self {
        Self {
            policy,
            threshold,
            fragments: Vec::new(),
            last_final_at: None,
        }
    }

    pub fn state(&self) -> TurnState {
        if self.fragments.is_empty() {
            TurnState::Listening
        } else {
            TurnState::TurnPending
        }
    }

    /// Record a finalized fragment and restart the silence timer.
    /// Blank text is ignored; returns whether the fragment was taken.
    pub fn observe_final(&mut self, text: &str, now: Instant) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.fragments.push(text.to_string());
        self.last_final_at = Some(now);
        true
    }

    /// Check the silence timer. Returns the turn text exactly once per
    /// silence interval, then resets to `Listening`.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        let last = self.last_final_at?;
        if self.fragments.is_empty() || now.saturating_duration_since(last) <= self.threshold {
            return None;
        }

        let fragments = std::mem::take(&mut self.fragments);
        self.last_final_at = Some(now);
        match self.policy {
            TurnPolicy::Accumulate => Some(fragments.join(" ")),
            TurnPolicy::Latest => fragments.into_iter().last(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_millis(2500);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_fires_once_after_threshold() {
        let t0 = Instant::now();
        let mut d = TurnDetector::new(TurnPolicy::Accumulate, THRESHOLD);
        assert!(d.observe_final("I'm not interested", t0));
        assert_eq!(d.state(), TurnState::TurnPending);

        assert_eq!(d.poll(t0 + ms(2500)), None);
        assert_eq!(d.poll(t0 + ms(2501)).as_deref(), Some("I'm not interested"));
        assert_eq!(d.state(), TurnState::Listening);

        // Continued silence never re-fires.
        assert_eq!(d.poll(t0 + ms(6000)), None);
        assert_eq!(d.poll(t0 + ms(60_000)), None);
    }

    #[test]
    fn test_new_final_restarts_timer() {
        let t0 = Instant::now();
        let mut d = TurnDetector::new(TurnPolicy::Accumulate, THRESHOLD);
        d.observe_final("Hi", t0);
        d.observe_final("Hi there", t0 + ms(1000));

        assert_eq!(d.poll(t0 + ms(2600)), None);
        assert_eq!(d.poll(t0 + ms(3500)), None);
        assert_eq!(d.poll(t0 + ms(3600)).as_deref(), Some("Hi Hi there"));
        assert_eq!(d.poll(t0 + ms(9000)), None);
    }

    #[test]
    fn test_latest_policy_keeps_last_fragment() {
        let t0 = Instant::now();
        let mut d = TurnDetector::new(TurnPolicy::Latest, THRESHOLD);
        d.observe_final("Hi", t0);
        d.observe_final("Hi there", t0 + ms(1000));
        assert_eq!(d.poll(t0 + ms(3600)).as_deref(), Some("Hi there"));
    }

    #[test]
    fn test_blank_final_ignored() {
        let t0 = Instant::now();
        let mut d = TurnDetector::new(TurnPolicy::Accumulate, THRESHOLD);
        assert!(!d.observe_final("   ", t0));
        assert_eq!(d.state(), TurnState::Listening);
        assert_eq!(d.poll(t0 + ms(10_000)), None);
    }

    #[test]
    fn test_one_firing_per_silence_gap() {
        let t0 = Instant::now();
        let mut d = TurnDetector::new(TurnPolicy::Accumulate, THRESHOLD);
        let mut fired = Vec::new();

        d.observe_final("first", t0);
        for step in 1..=40 {
            let now = t0 + ms(step * 100);
            if let Some(t) = d.poll(now) {
                fired.push((step, t));
            }
        }
        d.observe_final("second", t0 + ms(4100));
        for step in 42..=100 {
            let now = t0 + ms(step * 100);
            if let Some(t) = d.poll(now) {
                fired.push((step, t));
            }
        }

        assert_eq!(
            fired,
            vec![(26, "first".to_string()), (67, "second".to_string())]
        );
    }
}
