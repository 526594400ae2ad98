//! Sync state tracker
//!
//! Tracks batch sequence numbers and inbound event sequence numbers of one
//! client. Each outgoing request acknowledges the highest event applied so far.

/// Batch and event bookkeeping of a client.
///
/// - `last_seq`: sequence number of the last detached batch
/// - `completed` / `failed`: batches finished with or without a usable response
/// - `event_seq`: highest event sequence number applied
/// - `acked_event_seq`: highest event sequence number sent as ack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncTracker {
    /// Sequence number of the last detached batch
    last_seq: u64,
    /// Batches completed with a response
    completed: u64,
    /// Batches failed as a whole
    failed: u64,
    /// Highest event sequence number applied
    event_seq: u64,
    /// Number of events applied
    events_applied: u64,
    /// Highest event sequence number acked to the hub
    acked_event_seq: u64,
}

impl SyncTracker {
    /// Create a new sync tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the last detached batch
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Number of round trips executed (completed or failed)
    pub fn sync_count(&self) -> u64 {
        self.completed + self.failed
    }

    /// Number of batches that failed as a whole
    pub fn failed_count(&self) -> u64 {
        self.failed
    }

    /// Highest event sequence number applied
    pub fn event_seq(&self) -> u64 {
        self.event_seq
    }

    /// Number of events applied
    pub fn events_applied(&self) -> u64 {
        self.events_applied
    }

    /// Check if applied events were not yet acknowledged
    pub fn needs_ack(&self) -> bool {
        self.event_seq > self.acked_event_seq
    }

    /// Allocate the sequence number of the next batch
    pub fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    /// Record a finished batch
    pub fn record_complete(&mut self, success: bool) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Record an applied event
    ///
    /// Events are applied in arrival order; the counter keeps the highest
    /// sequence number seen.
    pub fn record_event(&mut self, seq: u64) {
        self.events_applied += 1;
        if seq > self.event_seq {
            self.event_seq = seq;
        }
    }

    /// Ack value for the next request, marking it as sent
    pub fn take_event_ack(&mut self) -> Option<u64> {
        if self.event_seq == 0 {
            return None;
        }
        self.acked_event_seq = self.event_seq;
        Some(self.event_seq)
    }

    /// Reset event bookkeeping
    ///
    /// Batch sequence numbers keep increasing so in-flight responses stay distinguishable.
    pub fn reset(&mut self) {
        self.event_seq = 0;
        self.events_applied = 0;
        self.acked_event_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tracker() {
        let tracker = SyncTracker::new();
        assert_eq!(tracker.last_seq(), 0);
        assert_eq!(tracker.sync_count(), 0);
        assert_eq!(tracker.event_seq(), 0);
        assert!(!tracker.needs_ack());
    }

    #[test]
    fn test_next_seq() {
        let mut tracker = SyncTracker::new();

        assert_eq!(tracker.next_seq(), 1);
        assert_eq!(tracker.next_seq(), 2);
        assert_eq!(tracker.last_seq(), 2);
    }

    #[test]
    fn test_record_complete() {
        let mut tracker = SyncTracker::new();
        tracker.record_complete(true);
        tracker.record_complete(false);
        tracker.record_complete(true);

        assert_eq!(tracker.sync_count(), 3);
        assert_eq!(tracker.failed_count(), 1);
    }

    #[test]
    fn test_event_ack() {
        let mut tracker = SyncTracker::new();
        assert_eq!(tracker.take_event_ack(), None);

        tracker.record_event(1);
        tracker.record_event(2);
        assert!(tracker.needs_ack());
        assert_eq!(tracker.take_event_ack(), Some(2));
        assert!(!tracker.needs_ack());

        // ack is repeated until a newer event arrives
        assert_eq!(tracker.take_event_ack(), Some(2));
    }

    #[test]
    fn test_reset_keeps_seq() {
        let mut tracker = SyncTracker::new();
        tracker.next_seq();
        tracker.record_event(5);
        tracker.reset();

        assert_eq!(tracker.event_seq(), 0);
        assert_eq!(tracker.events_applied(), 0);
        assert_eq!(tracker.last_seq(), 1);
    }
}
