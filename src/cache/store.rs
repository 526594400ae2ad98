//! Identity cache of one container.
//!
//! [`EntityCache`] maps typed keys to shared [`Peer`]s. The sync engine and the
//! subscription applier both reach it through the type-erased [`EntityStore`]
//! trait and both go through `get_or_create`, so a key never has two peers.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{trace, warn};

use super::peer::{Peer, PeerState};
use crate::core::codec::{self, payload_key};
use crate::core::{
    CodecError, Entity, EntityError, EntityErrorKind, EntityKey, JsonKey,
};
use crate::protocol::patch::{self as patch_ops, EntityPatch, PatchOp};
use crate::protocol::{ChangeKinds, ChangeRecord, ContainerEntities};

/// Keys touched by one applied change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changes<K> {
    /// Container name.
    pub container: String,
    /// Keys of created entities.
    pub created: Vec<K>,
    /// Keys of upserted entities.
    pub upserted: Vec<K>,
    /// Keys of deleted entities.
    pub deleted: Vec<K>,
    /// Keys of patched entities.
    pub patched: Vec<K>,
}

impl<K> Changes<K> {
    fn new(container: &str) -> Self {
        Self {
            container: container.to_string(),
            created: Vec::new(),
            upserted: Vec::new(),
            deleted: Vec::new(),
            patched: Vec::new(),
        }
    }

    /// Total number of changed keys.
    pub fn count(&self) -> usize {
        self.created.len() + self.upserted.len() + self.deleted.len() + self.patched.len()
    }

    /// Check if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Callback receiving the changes applied to a container.
pub type ChangeListener<K> = Arc<dyn Fn(&Changes<K>) + Send + Sync>;

/// Result of scanning peers for local changes.
#[derive(Debug, Default)]
pub(crate) struct DetectedChanges {
    /// Patches of synced entities with the snapshot they lead to.
    pub patches: Vec<(EntityPatch, Value)>,
    /// Payloads of entities never synced.
    pub creates: Vec<(JsonKey, Value)>,
    /// Entities that could not be encoded.
    pub errors: Vec<EntityError>,
    /// Requested keys without a peer.
    pub missing: Vec<JsonKey>,
}

impl DetectedChanges {
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.creates.is_empty()
    }
}

/// Type-erased operations on a container cache.
pub(crate) trait EntityStore: Send + Sync + 'static {
    /// Container name.
    fn name(&self) -> &str;

    /// Name of the key field of the stored entities.
    fn key_field(&self) -> &'static str;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Apply the entities section of a response.
    ///
    /// Returns the entity errors of the section, including payloads that failed to decode.
    fn apply_section(&self, section: &ContainerEntities) -> Vec<EntityError>;

    /// Record an entity error without touching the cached value.
    fn set_error(&self, error: &EntityError);

    /// Confirm a snapshot sent by a successful create, upsert or patch.
    fn commit(&self, key: &JsonKey, sent: &Value);

    /// Discard a snapshot sent by a failed create or patch.
    fn rollback(&self, key: &JsonKey, sent: &Value);

    /// Remove a peer after a confirmed delete.
    fn remove(&self, key: &JsonKey);

    /// Remove all peers.
    fn clear(&self);

    /// Last synced payload of a key.
    fn snapshot(&self, key: &JsonKey) -> Option<Value>;

    /// Diff tracked peers against their baseline.
    ///
    /// `None` scans every peer. Detected writes are recorded as in flight.
    fn detect(&self, scope: Option<&[JsonKey]>) -> DetectedChanges;

    /// Build patches for selected members of the given entities.
    ///
    /// An empty member list diffs the whole entity.
    fn detect_members(&self, members: &IndexMap<JsonKey, Vec<String>>) -> DetectedChanges;

    /// Change kinds of the active subscription.
    fn subscription(&self) -> ChangeKinds;

    /// Activate or (with an empty set) drop the subscription.
    fn set_subscription(&self, changes: ChangeKinds);

    /// Apply an inbound change. Returns `false` if the container ignored it.
    fn apply_change(&self, change: &ChangeRecord) -> bool;

    /// Drop all peers and the subscription.
    fn reset(&self);
}

/// Identity cache of entities of type `T` keyed by `K`.
pub struct EntityCache<K, T> {
    name: String,
    peers: Mutex<IndexMap<K, Arc<Peer<K, T>>>>,
    subscription: Mutex<ChangeKinds>,
    listener: Mutex<Option<ChangeListener<K>>>,
    _entity: PhantomData<fn() -> T>,
}

impl<K: EntityKey, T: Entity> EntityCache<K, T> {
    pub(crate) fn new() -> Self {
        Self {
            name: T::CONTAINER.to_string(),
            peers: Mutex::new(IndexMap::new()),
            subscription: Mutex::new(ChangeKinds::empty()),
            listener: Mutex::new(None),
            _entity: PhantomData,
        }
    }

    /// Container name.
    pub fn container_name(&self) -> &str {
        &self.name
    }

    /// Return the peer for `key`, allocating a valueless one if missing.
    pub fn get_or_create(&self, key: &K) -> Arc<Peer<K, T>> {
        self.peers
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Peer::new(key.clone())))
            .clone()
    }

    /// Return the peer for `key` if tracked.
    pub fn get(&self, key: &K) -> Option<Arc<Peer<K, T>>> {
        self.peers.lock().get(key).cloned()
    }

    /// All tracked peers in insertion order.
    pub fn peers(&self) -> Vec<Arc<Peer<K, T>>> {
        self.peers.lock().values().cloned().collect()
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Check if no peer is tracked.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub(crate) fn set_listener(&self, listener: Option<ChangeListener<K>>) {
        *self.listener.lock() = listener;
    }

    fn typed_key(&self, key: &JsonKey) -> Option<K> {
        match K::from_json_key(key) {
            Ok(k) => Some(k),
            Err(e) => {
                warn!(container = %self.name, %key, "ignoring key: {e}");
                None
            }
        }
    }

    fn peer_of(&self, key: &JsonKey) -> Option<Arc<Peer<K, T>>> {
        self.typed_key(key).and_then(|k| self.get(&k))
    }

    /// Decode a payload from the hub and store it as value and baseline.
    fn store_payload(&self, payload: &Value) -> Result<K, EntityError> {
        let json_key = payload_key(payload, T::KEY_FIELD).map_err(|e| {
            EntityError::new(EntityErrorKind::ParseError, JsonKey::Str(String::new()), e.to_string())
        })?;
        let parse_error = |e: CodecError| {
            EntityError::new(EntityErrorKind::ParseError, json_key.clone(), e.to_string())
        };
        let key = K::from_json_key(&json_key).map_err(|e| parse_error(e.into()))?;
        let peer = self.get_or_create(&key);
        let mut state = peer.lock();
        match codec::decode::<T>(payload) {
            Ok(entity) => {
                state.confirm(entity, payload.clone());
                Ok(key)
            }
            Err(e) => {
                let error = parse_error(e);
                state.error = Some(error.clone());
                Err(error)
            }
        }
    }

    fn detect_peer(
        &self,
        key: &K,
        state: &mut PeerState<T>,
        members: Option<&[String]>,
        out: &mut DetectedChanges,
    ) {
        if state.create_queued {
            return;
        }
        let Some(entity) = state.entity.as_ref() else {
            return;
        };
        let current = match codec::encode(entity) {
            Ok(current) => current,
            Err(e) => {
                out.errors.push(EntityError::new(
                    EntityErrorKind::WriteError,
                    key.to_json_key(),
                    e.to_string(),
                ));
                return;
            }
        };
        let Some(base) = state.diff_base() else {
            // never synced: created instead of patched
            state.reserve_write(current.clone());
            state.create_queued = true;
            out.creates.push((key.to_json_key(), current));
            return;
        };
        let (ops, sent) = match members {
            Some(members) if !members.is_empty() => {
                let ops = select_members(base, &current, members);
                let mut sent = base.clone();
                if patch_ops::apply(&mut sent, &ops).is_err() {
                    sent = current.clone();
                }
                (ops, sent)
            }
            _ => (patch_ops::diff(base, &current), current),
        };
        if ops.is_empty() {
            return;
        }
        state.reserve_patch(ops.clone(), sent.clone());
        out.patches.push((
            EntityPatch {
                key: key.to_json_key(),
                ops,
            },
            sent,
        ));
    }

    fn apply_entity_patch(&self, patch: &EntityPatch) -> Option<K> {
        let key = self.typed_key(&patch.key)?;
        let peer = self.get_or_create(&key);
        let mut state = peer.lock();
        let patched = state
            .entity
            .as_ref()
            .map(|entity| -> Result<(T, Value), String> {
                let mut current = codec::encode(entity).map_err(|e| e.to_string())?;
                patch_ops::apply(&mut current, &patch.ops).map_err(|e| e.to_string())?;
                let entity = codec::decode::<T>(&current).map_err(|e| e.to_string())?;
                Ok((entity, current))
            });
        match patched {
            None => {
                trace!(container = %self.name, key = %patch.key, "patch for placeholder peer");
            }
            Some(Ok((entity, current))) => {
                let baseline = state.baseline.take().and_then(|mut base| {
                    patch_ops::apply(&mut base, &patch.ops).ok().map(|_| base)
                });
                state.entity = Some(entity);
                state.baseline = Some(baseline.unwrap_or(current));
                state.error = None;
            }
            Some(Err(message)) => {
                state.error = Some(EntityError::new(
                    EntityErrorKind::PatchError,
                    patch.key.clone(),
                    message,
                ));
            }
        }
        Some(key)
    }
}

fn select_members(base: &Value, current: &Value, members: &[String]) -> Vec<PatchOp> {
    members
        .iter()
        .filter_map(|path| match current.pointer(path) {
            Some(value) => Some(PatchOp::Replace {
                path: path.clone(),
                value: value.clone(),
            }),
            None => base
                .pointer(path)
                .map(|_| PatchOp::Remove { path: path.clone() }),
        })
        .collect()
}

impl<K: EntityKey, T: Entity> EntityStore for EntityCache<K, T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_field(&self) -> &'static str {
        T::KEY_FIELD
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn apply_section(&self, section: &ContainerEntities) -> Vec<EntityError> {
        let mut errors = Vec::new();
        for payload in &section.entities {
            if let Err(error) = self.store_payload(payload) {
                warn!(container = %self.name, "failed to decode entity: {error}");
                errors.push(error);
            }
        }
        for key in &section.not_found {
            if let Some(peer) = self.peer_of(key) {
                let mut state = peer.lock();
                if !state.create_queued {
                    state.entity = None;
                    state.baseline = None;
                    state.in_flight.clear();
                }
            }
        }
        for error in &section.errors {
            self.set_error(error);
            errors.push(error.clone());
        }
        errors
    }

    fn set_error(&self, error: &EntityError) {
        if let Some(key) = self.typed_key(&error.key) {
            self.get_or_create(&key).lock().error = Some(error.clone());
        }
    }

    fn commit(&self, key: &JsonKey, sent: &Value) {
        if let Some(peer) = self.peer_of(key) {
            peer.lock().commit(sent);
        }
    }

    fn rollback(&self, key: &JsonKey, sent: &Value) {
        if let Some(peer) = self.peer_of(key) {
            peer.lock().rollback(sent);
        }
    }

    fn remove(&self, key: &JsonKey) {
        if let Some(k) = self.typed_key(key) {
            self.peers.lock().shift_remove(&k);
        }
    }

    fn clear(&self) {
        self.peers.lock().clear();
    }

    fn snapshot(&self, key: &JsonKey) -> Option<Value> {
        self.peer_of(key).and_then(|p| p.baseline())
    }

    fn detect(&self, scope: Option<&[JsonKey]>) -> DetectedChanges {
        let mut out = DetectedChanges::default();
        let peers = match scope {
            None => self.peers(),
            Some(keys) => keys
                .iter()
                .filter_map(|key| {
                    let peer = self.peer_of(key);
                    if peer.is_none() {
                        out.missing.push(key.clone());
                    }
                    peer
                })
                .collect(),
        };
        for peer in peers {
            let mut state = peer.lock();
            self.detect_peer(peer.key(), &mut state, None, &mut out);
        }
        out
    }

    fn detect_members(&self, members: &IndexMap<JsonKey, Vec<String>>) -> DetectedChanges {
        let mut out = DetectedChanges::default();
        for (key, paths) in members {
            match self.peer_of(key) {
                Some(peer) => {
                    let mut state = peer.lock();
                    self.detect_peer(peer.key(), &mut state, Some(paths), &mut out);
                }
                None => out.missing.push(key.clone()),
            }
        }
        out
    }

    fn subscription(&self) -> ChangeKinds {
        *self.subscription.lock()
    }

    fn set_subscription(&self, changes: ChangeKinds) {
        *self.subscription.lock() = changes;
    }

    fn apply_change(&self, change: &ChangeRecord) -> bool {
        if !self.subscription().contains(change.kind()) {
            return false;
        }
        let mut changes = Changes::new(&self.name);
        match change {
            ChangeRecord::Create { entities, .. } => {
                changes.created = entities
                    .iter()
                    .filter_map(|p| self.store_payload(p).ok())
                    .collect();
            }
            ChangeRecord::Upsert { entities, .. } => {
                changes.upserted = entities
                    .iter()
                    .filter_map(|p| self.store_payload(p).ok())
                    .collect();
            }
            ChangeRecord::Delete { ids, .. } => {
                for key in ids {
                    if let Some(k) = self.typed_key(key) {
                        self.peers.lock().shift_remove(&k);
                        changes.deleted.push(k);
                    }
                }
            }
            ChangeRecord::Patch { patches, .. } => {
                changes.patched = patches
                    .iter()
                    .filter_map(|p| self.apply_entity_patch(p))
                    .collect();
            }
        }
        trace!(container = %self.name, count = changes.count(), "applied change");
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(&changes);
        }
        true
    }

    fn reset(&self) {
        self.peers.lock().clear();
        self.set_subscription(ChangeKinds::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KeyKind;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Article {
        id: String,
        name: String,
    }

    impl Entity for Article {
        const CONTAINER: &'static str = "articles";
        const KEY_KIND: KeyKind = KeyKind::String;
    }

    fn cache() -> EntityCache<String, Article> {
        EntityCache::new()
    }

    fn section(entities: Vec<Value>) -> ContainerEntities {
        ContainerEntities {
            container: "articles".into(),
            entities,
            ..Default::default()
        }
    }

    #[test]
    fn test_get_or_create_identity() {
        let cache = cache();
        let a = cache.get_or_create(&"a1".to_string());
        let b = cache.get_or_create(&"a1".to_string());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(!a.has_value());
    }

    #[test]
    fn test_apply_section_sets_baseline() {
        let cache = cache();
        let errors = cache.apply_section(&section(vec![json!({"id": "a1", "name": "A"})]));
        assert!(errors.is_empty());
        let peer = cache.get(&"a1".to_string()).unwrap();
        assert_eq!(peer.get().unwrap().name, "A");
        assert_eq!(peer.baseline(), Some(json!({"id": "a1", "name": "A"})));
    }

    #[test]
    fn test_entity_error_keeps_value() {
        let cache = cache();
        cache.apply_section(&section(vec![json!({"id": "a1", "name": "A"})]));
        let errors = cache.apply_section(&ContainerEntities {
            container: "articles".into(),
            errors: vec![EntityError::new(
                EntityErrorKind::ReadError,
                "a1".into(),
                "io",
            )],
            ..Default::default()
        });
        assert_eq!(errors.len(), 1);
        let peer = cache.get(&"a1".to_string()).unwrap();
        assert_eq!(peer.get().unwrap().name, "A");
        assert_eq!(peer.error().unwrap().kind, EntityErrorKind::ReadError);
    }

    #[test]
    fn test_parse_error_reported() {
        let cache = cache();
        let errors = cache.apply_section(&section(vec![json!({"id": "a1", "name": 5})]));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, EntityErrorKind::ParseError);
        assert_eq!(errors[0].key, JsonKey::from("a1"));
    }

    #[test]
    fn test_detect_patch_then_idempotent() {
        let cache = cache();
        cache.apply_section(&section(vec![json!({"id": "a1", "name": "A"})]));
        let peer = cache.get(&"a1".to_string()).unwrap();
        peer.modify(|a| a.name = "B".into());

        let first = cache.detect(None);
        assert_eq!(first.patches.len(), 1);
        assert_eq!(first.patches[0].0.ops.len(), 1);
        assert_eq!(first.patches[0].0.ops[0].path(), "/name");

        let second = cache.detect(None);
        assert!(second.is_empty());
    }

    #[test]
    fn test_detect_unsynced_is_create() {
        let cache = cache();
        let peer = cache.get_or_create(&"n1".to_string());
        peer.set(Article {
            id: "n1".into(),
            name: "new".into(),
        });
        let detected = cache.detect(None);
        assert!(detected.patches.is_empty());
        assert_eq!(detected.creates.len(), 1);
        // create is queued, not detected twice
        assert!(cache.detect(None).is_empty());
    }

    #[test]
    fn test_detect_reports_missing_keys() {
        let cache = cache();
        cache.apply_section(&section(vec![json!({"id": "a1", "name": "A"})]));
        let detected = cache.detect(Some(&[JsonKey::from("a1"), JsonKey::from("gone")]));
        assert!(detected.is_empty());
        assert_eq!(detected.missing, vec![JsonKey::from("gone")]);

        let mut members = IndexMap::new();
        members.insert(JsonKey::from("gone"), vec!["/name".to_string()]);
        assert_eq!(cache.detect_members(&members).missing, vec![JsonKey::from("gone")]);
    }

    #[test]
    fn test_detect_members() {
        let cache = cache();
        cache.apply_section(&section(vec![json!({"id": "a1", "name": "A"})]));
        let mut members = IndexMap::new();
        members.insert(JsonKey::from("a1"), vec!["/name".to_string()]);
        let detected = cache.detect_members(&members);
        assert_eq!(
            detected.patches[0].0.ops,
            vec![PatchOp::Replace {
                path: "/name".into(),
                value: json!("A")
            }]
        );
    }

    #[test]
    fn test_change_requires_subscription() {
        let cache = cache();
        let change = ChangeRecord::Upsert {
            container: "articles".into(),
            entities: vec![json!({"id": "a1", "name": "A"})],
        };
        assert!(!cache.apply_change(&change));
        assert!(cache.is_empty());

        cache.set_subscription(ChangeKinds::UPSERT);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        cache.set_listener(Some(Arc::new(move |changes: &Changes<String>| {
            counter.fetch_add(changes.upserted.len(), Ordering::SeqCst);
        })));
        assert!(cache.apply_change(&change));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(cache.get(&"a1".to_string()).unwrap().has_value());
    }

    #[test]
    fn test_patch_change_updates_value_and_baseline() {
        let cache = cache();
        cache.set_subscription(ChangeKinds::all());
        cache.apply_section(&section(vec![json!({"id": "a1", "name": "A"})]));
        cache.apply_change(&ChangeRecord::Patch {
            container: "articles".into(),
            patches: vec![EntityPatch {
                key: "a1".into(),
                ops: vec![PatchOp::Replace {
                    path: "/name".into(),
                    value: json!("Z"),
                }],
            }],
        });
        let peer = cache.get(&"a1".to_string()).unwrap();
        assert_eq!(peer.get().unwrap().name, "Z");
        assert_eq!(peer.baseline(), Some(json!({"id": "a1", "name": "Z"})));
        // hub state equals local state: nothing to detect
        assert!(cache.detect(None).is_empty());
    }
}
