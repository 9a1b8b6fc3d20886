use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Map size above which expired entries are swept on the next accepted event.
const DEFAULT_PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    Reject { retry_after_ms: i64 },
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, GateDecision::Accept)
    }
}

/// Per-sender cooldown. Owned by one engine instance; never persisted.
pub struct CooldownGate {
    cooldown: Duration,
    prune_threshold: usize,
    last_accepted: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CooldownGate {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            cooldown: Duration::milliseconds(cooldown_ms as i64),
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_prune_threshold(mut self, threshold: usize) -> Self {
        self.prune_threshold = threshold.max(1);
        self
    }

    /// Check and record in one critical section.
    pub fn check(&self, sender_id: &str, now: DateTime<Utc>) -> GateDecision {
        let mut last_accepted = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = last_accepted.get(sender_id) {
            let elapsed = now - *last;
            if elapsed < self.cooldown {
                return GateDecision::Reject {
                    retry_after_ms: (self.cooldown - elapsed).num_milliseconds(),
                };
            }
        }

        if last_accepted.len() >= self.prune_threshold {
            // Expired entries would be accepted anyway, dropping them changes nothing.
            let cutoff = now - self.cooldown;
            last_accepted.retain(|_, ts| *ts > cutoff);
        }
        last_accepted.insert(sender_id.to_string(), now);
        GateDecision::Accept
    }

    pub fn tracked_senders(&self) -> usize {
        self.last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
