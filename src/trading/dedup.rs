//! Ledger of (master event, follower) pairs already processed.
//!
//! The claim is taken in a single critical section before any exchange call,
//! so a re-delivered event can never produce a second submission while its
//! entry is retained. Entries expire after the retention window and the
//! ledger is also capped at `max_entries`, evicting oldest first.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::models::ReplicaStatus;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub event_id: String,
    pub follower_id: String,
}

impl DedupKey {
    pub fn new(event_id: &str, follower_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            follower_id: follower_id.to_string(),
        }
    }
}

/// Outcome of [`DedupLedger::check_and_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First sighting; the caller owns processing of this pair.
    NewlyClaimed,
    /// Seen before, with its terminal status if one was recorded.
    AlreadyProcessed(Option<ReplicaStatus>),
}

struct Entry {
    outcome: Option<ReplicaStatus>,
}

struct LedgerState {
    entries: HashMap<DedupKey, Entry>,
    /// Insertion order for expiry and capacity eviction
    order: VecDeque<(Instant, DedupKey)>,
}

impl LedgerState {
    fn evict_expired(&mut self, now: Instant, retention: Duration) -> usize {
        let mut removed = 0;
        while let Some((at, _)) = self.order.front() {
            if now.saturating_duration_since(*at) < retention {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }
}

pub struct DedupLedger {
    retention: Duration,
    max_entries: usize,
    state: Mutex<LedgerState>,
}

impl DedupLedger {
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        Self {
            retention,
            max_entries: max_entries.max(1),
            state: Mutex::new(LedgerState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn check_and_mark(&self, event_id: &str, follower_id: &str) -> Claim {
        self.check_and_mark_at(event_id, follower_id, Instant::now())
    }

    pub fn check_and_mark_at(&self, event_id: &str, follower_id: &str, now: Instant) -> Claim {
        let key = DedupKey::new(event_id, follower_id);
        let mut state = self.state.lock();
        state.evict_expired(now, self.retention);

        if let Some(entry) = state.entries.get(&key) {
            return Claim::AlreadyProcessed(entry.outcome);
        }

        state.entries.insert(
            key.clone(),
            Entry { outcome: None },
        );
        state.order.push_back((now, key));

        while state.entries.len() > self.max_entries {
            match state.order.pop_front() {
                Some((_, oldest)) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }

        Claim::NewlyClaimed
    }

    /// Store the terminal status of a claimed pair.
    pub fn record_outcome(&self, event_id: &str, follower_id: &str, status: ReplicaStatus) {
        let key = DedupKey::new(event_id, follower_id);
        if let Some(entry) = self.state.lock().entries.get_mut(&key) {
            entry.outcome = Some(status);
        }
    }

    #[cfg(test)]
    pub fn outcome(&self, event_id: &str, follower_id: &str) -> Option<ReplicaStatus> {
        let key = DedupKey::new(event_id, follower_id);
        self.state
            .lock()
            .entries
            .get(&key)
            .and_then(|e| e.outcome)
    }

    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    /// Drop entries older than the retention window.
    pub fn prune_at(&self, now: Instant) -> usize {
        let removed = self.state.lock().evict_expired(now, self.retention);
        if removed > 0 {
            debug!(removed, "Pruned dedup ledger");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
