//! Cached record of a single entity.

use parking_lot::Mutex;
use serde_json::Value;

use crate::core::{EntityError, EntityKey};
use crate::protocol::patch::{self, PatchOp};

/// Client-side record for one key of a container.
///
/// A peer holds the current in-memory value (absent while only referenced),
/// the last synced raw payload used as patch baseline, and the last entity
/// error reported for the key. Every handle referring to a key shares the
/// same peer, so local mutations are visible through all of them.
#[derive(Debug)]
pub struct Peer<K, T> {
    key: K,
    state: Mutex<PeerState<T>>,
}

/// A create, upsert or patch awaiting its result.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    /// Payload as sent. Identifies the write when it settles.
    pub sent: Value,
    /// Operations of a patch. `None` for writes carrying the full payload.
    pub ops: Option<Vec<PatchOp>>,
    /// Payload the hub holds once this write and every earlier one succeed.
    pub expected: Value,
}

#[derive(Debug)]
pub(crate) struct PeerState<T> {
    /// Current value.
    pub entity: Option<T>,
    /// Payload last confirmed by the hub.
    pub baseline: Option<Value>,
    /// Writes sent but not yet settled, oldest first.
    pub in_flight: Vec<InFlight>,
    /// A create for this entity is queued or in flight.
    pub create_queued: bool,
    /// Last entity error.
    pub error: Option<EntityError>,
}

impl<T> Default for PeerState<T> {
    fn default() -> Self {
        Self {
            entity: None,
            baseline: None,
            in_flight: Vec::new(),
            create_queued: false,
            error: None,
        }
    }
}

impl<K: EntityKey, T: Clone> Peer<K, T> {
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            state: Mutex::new(PeerState::default()),
        }
    }

    /// Key of the entity.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Copy of the current value.
    pub fn get(&self) -> Option<T> {
        self.state.lock().entity.clone()
    }

    /// Check if the peer holds a value.
    pub fn has_value(&self) -> bool {
        self.state.lock().entity.is_some()
    }

    /// Run `f` on the current value.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.state.lock().entity.as_ref().map(f)
    }

    /// Mutate the current value in place.
    ///
    /// The change is sent by the next patch detection.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.state.lock().entity.as_mut().map(f)
    }

    /// Replace the current value.
    pub fn set(&self, entity: T) {
        self.state.lock().entity = Some(entity);
    }

    /// Last entity error reported for this key.
    pub fn error(&self) -> Option<EntityError> {
        self.state.lock().error.clone()
    }

    /// Check if the hub confirmed a payload for this key.
    pub fn is_synced(&self) -> bool {
        self.state.lock().baseline.is_some()
    }

    /// The last synced payload.
    pub fn baseline(&self) -> Option<Value> {
        self.state.lock().baseline.clone()
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, PeerState<T>> {
        self.state.lock()
    }
}

impl<T> PeerState<T> {
    /// Baseline new diffs are computed against.
    pub fn diff_base(&self) -> Option<&Value> {
        self.in_flight
            .last()
            .map(|write| &write.expected)
            .or(self.baseline.as_ref())
    }

    /// Record a write carrying the full payload.
    pub fn reserve_write(&mut self, sent: Value) {
        self.in_flight.push(InFlight {
            expected: sent.clone(),
            sent,
            ops: None,
        });
    }

    /// Record a patch diffed against [`diff_base`](Self::diff_base).
    pub fn reserve_patch(&mut self, ops: Vec<PatchOp>, sent: Value) {
        self.in_flight.push(InFlight {
            expected: sent.clone(),
            sent,
            ops: Some(ops),
        });
    }

    /// Accept a payload confirmed by the hub.
    pub fn confirm(&mut self, entity: T, payload: Value) {
        self.entity = Some(entity);
        self.baseline = Some(payload);
        self.in_flight.clear();
        self.create_queued = false;
        self.error = None;
    }

    /// Accept a write confirmed by the hub.
    ///
    /// A patch only carries its own operations, so they are applied to the
    /// baseline instead of taking the sent snapshot, which may include
    /// changes of an earlier write that failed.
    pub fn commit(&mut self, sent: &Value) {
        let write = self.take_in_flight(sent);
        let ops = write.as_ref().and_then(|write| write.ops.as_deref());
        self.baseline = Some(match (ops, self.baseline.take()) {
            (Some(ops), Some(mut base)) => match patch::apply(&mut base, ops) {
                Ok(()) => base,
                Err(_) => sent.clone(),
            },
            _ => sent.clone(),
        });
        self.create_queued = false;
        self.error = None;
        self.rebase();
    }

    /// Forget a failed write, so its changes are detected again.
    pub fn rollback(&mut self, sent: &Value) {
        self.take_in_flight(sent);
        self.create_queued = false;
        self.rebase();
    }

    fn take_in_flight(&mut self, sent: &Value) -> Option<InFlight> {
        let index = self.in_flight.iter().position(|write| write.sent == *sent)?;
        Some(self.in_flight.remove(index))
    }

    /// Recompute the expected payloads of the remaining writes from the baseline.
    fn rebase(&mut self) {
        let mut expected = self.baseline.clone();
        for write in &mut self.in_flight {
            write.expected = match (&write.ops, expected) {
                (Some(ops), Some(mut base)) => match patch::apply(&mut base, ops) {
                    Ok(()) => base,
                    Err(_) => write.sent.clone(),
                },
                _ => write.sent.clone(),
            };
            expected = Some(write.expected.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_peer_value_access() {
        let peer: Peer<String, u32> = Peer::new("k".into());
        assert!(!peer.has_value());
        assert_eq!(peer.modify(|v| *v += 1), None);

        peer.set(1);
        peer.modify(|v| *v += 1);
        assert_eq!(peer.get(), Some(2));
        assert_eq!(peer.read(|v| v * 10), Some(20));
        assert!(!peer.is_synced());
    }

    fn replace(path: &str, value: Value) -> PatchOp {
        PatchOp::Replace {
            path: path.into(),
            value,
        }
    }

    #[test]
    fn test_commit_and_rollback() {
        let mut state: PeerState<u32> = PeerState::default();
        state.reserve_write(json!(1));
        state.create_queued = true;

        state.rollback(&json!(1));
        assert!(state.in_flight.is_empty());
        assert!(!state.create_queued);
        assert!(state.diff_base().is_none());

        state.reserve_write(json!(2));
        state.commit(&json!(2));
        assert_eq!(state.baseline, Some(json!(2)));
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn test_commit_keeps_newer_write() {
        let mut state: PeerState<u32> = PeerState::default();
        state.reserve_write(json!(2));
        // a later batch already detected a newer snapshot
        state.reserve_write(json!(3));
        state.commit(&json!(2));
        assert_eq!(state.baseline, Some(json!(2)));
        assert_eq!(state.diff_base(), Some(&json!(3)));
    }

    #[test]
    fn test_failed_write_is_not_committed_by_later_patch() {
        let mut state: PeerState<u32> = PeerState::default();
        state.baseline = Some(json!({"x": 0, "y": 0}));
        state.reserve_patch(vec![replace("/x", json!(1))], json!({"x": 1, "y": 0}));
        // diffed against the first patch
        assert_eq!(state.diff_base(), Some(&json!({"x": 1, "y": 0})));
        state.reserve_patch(vec![replace("/y", json!(1))], json!({"x": 1, "y": 1}));

        state.rollback(&json!({"x": 1, "y": 0}));
        assert_eq!(state.diff_base(), Some(&json!({"x": 0, "y": 1})));

        state.commit(&json!({"x": 1, "y": 1}));
        assert_eq!(state.baseline, Some(json!({"x": 0, "y": 1})));
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn test_confirm_drops_in_flight_writes() {
        let mut state: PeerState<u32> = PeerState::default();
        state.reserve_write(json!(1));
        state.create_queued = true;
        state.confirm(5, json!(5));
        assert!(state.in_flight.is_empty());
        assert_eq!(state.diff_base(), Some(&json!(5)));

        // settling the dropped write afterwards still takes its payload
        state.commit(&json!(1));
        assert_eq!(state.baseline, Some(json!(1)));
    }
}
