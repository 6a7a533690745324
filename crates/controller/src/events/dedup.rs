//! Sliding-window deduplication of cluster events
//!
//! Watch reconnects replay events the controller already saw. An event is
//! identified by `(uid, reason, message, timestamp)`; a repeat inside the
//! window is dropped, a repeat after the window is forwarded again.

use super::ClusterEvent;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Default dedup window
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    uid: String,
    reason: String,
    message: String,
    timestamp: DateTime<Utc>,
}

impl DedupKey {
    fn of(event: &ClusterEvent) -> Self {
        Self {
            uid: event.involved_object.uid.clone(),
            reason: event.reason.clone(),
            message: event.message.clone(),
            timestamp: event.timestamp,
        }
    }
}

#[derive(Debug)]
pub struct EventDeduplicator {
    window: chrono::Duration,
    seen: HashMap<DedupKey, DateTime<Utc>>,
    order: VecDeque<(DateTime<Utc>, DedupKey)>,
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl EventDeduplicator {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window: to_chrono(window),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = to_chrono(window);
    }

    /// Returns `true` if the event should be forwarded.
    pub fn observe(&mut self, event: &ClusterEvent) -> bool {
        self.observe_at(event, Utc::now())
    }

    /// Same as [`Self::observe`] with an explicit clock.
    pub fn observe_at(&mut self, event: &ClusterEvent, now: DateTime<Utc>) -> bool {
        self.prune(now);

        let key = DedupKey::of(event);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key.clone(), now);
        self.order.push_back((now, key));
        true
    }

    /// Forget entries older than the window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        while let Some((seen_at, _)) = self.order.front() {
            if now - *seen_at < self.window {
                break;
            }
            if let Some((seen_at, key)) = self.order.pop_front() {
                // Only drop the map entry if it still belongs to this slot
                if self.seen.get(&key) == Some(&seen_at) {
                    self.seen.remove(&key);
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn to_chrono(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(30))
}
