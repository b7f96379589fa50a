//! Consumer-session bookkeeping.
//!
//! Tracks what the server is believed to hold for this channel: the
//! consumer instance id, the acknowledged subscription set, the set the
//! next subscribe call should install, and the offsets delivered to the
//! caller but not yet committed.

use serde::Serialize;

/// One pending offset acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitEntry {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// Local consumer state.
///
/// Idle (no consumer id) → Created (id known) → Subscribed (active set
/// non-empty) → Subscribed with pending commits. [`reset`](Self::reset)
/// returns to Idle from any state; the requested subscription set
/// survives a reset so recovery can re-install it.
#[derive(Debug, Default)]
pub(crate) struct ConsumerState {
    pub consumer_id: Option<String>,
    pub active_subscriptions: Vec<String>,
    pub requested_subscriptions: Vec<String>,
    pub commit_log: Vec<CommitEntry>,
}

impl ConsumerState {
    /// Drop the server-bound state: id, acknowledged subscriptions, and
    /// pending commits. Requested subscriptions are kept.
    pub fn reset(&mut self) {
        self.consumer_id = None;
        self.active_subscriptions.clear();
        self.commit_log.clear();
    }

    pub fn set_consumer(&mut self, id: String) {
        self.consumer_id = Some(id);
    }

    /// Record an acknowledged subscription set.
    pub fn set_subscriptions(&mut self, topics: Vec<String>) {
        self.requested_subscriptions = topics.clone();
        self.active_subscriptions = topics;
    }

    /// Whether `topics` is element-wise equal to the acknowledged set.
    pub fn is_subscribed_to(&self, topics: &[String]) -> bool {
        !topics.is_empty() && self.active_subscriptions == topics
    }

    /// Append a delivered record's position to the pending commit log.
    pub fn record_delivery(&mut self, entry: CommitEntry) {
        self.commit_log.push(entry);
    }

    pub fn clear_commit_log(&mut self) {
        self.commit_log.clear();
    }
}
