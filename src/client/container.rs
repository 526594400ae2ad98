//! Typed container API.
//!
//! A [`Container`] queues tasks for one entity type. Every method validates its
//! arguments, queues a task and returns its handle; nothing is sent before
//! [`super::HubClient::sync_tasks`].

use std::sync::Arc;

use serde_json::Value;

use crate::cache::{ChangeListener, Changes, EntityCache, Peer};
use crate::core::codec;
use crate::core::constants::{FILTER_ALL, MAX_RESERVE_KEYS};
use crate::core::{ClientError, Entity, EntityKey, JsonKey};
use crate::protocol::ChangeKinds;
use crate::sync::handles::{
    CloseCursorsTask, CountTask, DetectPatchesTask, PatchTask, QueryTask, ReadTask,
    ReserveKeysTask, WriteTask,
};
use crate::sync::{PatchScope, SyncContext, TaskKind};

/// Tasks and cached entities of one container.
pub struct Container<K, T> {
    context: Arc<SyncContext>,
    cache: Arc<EntityCache<K, T>>,
    max_query_count: Option<u32>,
}

impl<K, T> Clone for Container<K, T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            cache: self.cache.clone(),
            max_query_count: self.max_query_count,
        }
    }
}

impl<K: EntityKey, T: Entity> Container<K, T> {
    pub(crate) fn new(
        context: Arc<SyncContext>,
        cache: Arc<EntityCache<K, T>>,
        max_query_count: Option<u32>,
    ) -> Self {
        Self {
            context,
            cache,
            max_query_count,
        }
    }

    /// Container name.
    pub fn name(&self) -> &str {
        T::CONTAINER
    }

    fn name_owned(&self) -> String {
        T::CONTAINER.to_string()
    }

    /// Encode entities and remember the sent payloads on their peers.
    ///
    /// All entities are encoded before any peer is touched, so a failing
    /// entity leaves the cache unchanged.
    fn stage_writes<'a>(
        &self,
        entities: impl IntoIterator<Item = &'a T>,
    ) -> Result<Vec<(JsonKey, Value)>, ClientError> {
        let encoded = entities
            .into_iter()
            .map(|entity| -> Result<_, ClientError> {
                let (key, payload) = codec::encode_keyed::<K, T>(entity, T::KEY_FIELD)?;
                Ok((key, entity.clone(), payload))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let staged = encoded
            .into_iter()
            .map(|(key, entity, payload)| {
                let peer = self.cache.get_or_create(&key);
                let mut state = peer.lock();
                if state.baseline.is_none() {
                    state.create_queued = true;
                }
                state.entity = Some(entity);
                state.reserve_write(payload.clone());
                (key.to_json_key(), payload)
            })
            .collect();
        Ok(staged)
    }

    fn push_write(&self, kind: TaskKind) -> WriteTask {
        WriteTask::new(self.context.queue.push(kind))
    }

    /// Create an entity.
    pub fn create(&self, entity: &T) -> Result<WriteTask, ClientError> {
        self.create_range(std::slice::from_ref(entity))
    }

    /// Create several entities in one task.
    pub fn create_range(&self, entities: &[T]) -> Result<WriteTask, ClientError> {
        let entities = self.stage_writes(entities)?;
        Ok(self.push_write(TaskKind::Create {
            container: self.name_owned(),
            entities,
        }))
    }

    /// Create or replace an entity.
    pub fn upsert(&self, entity: &T) -> Result<WriteTask, ClientError> {
        self.upsert_range(std::slice::from_ref(entity))
    }

    /// Create or replace several entities in one task.
    pub fn upsert_range(&self, entities: &[T]) -> Result<WriteTask, ClientError> {
        let entities = self.stage_writes(entities)?;
        Ok(self.push_write(TaskKind::Upsert {
            container: self.name_owned(),
            entities,
        }))
    }

    /// Start a read. Keys are added with [`ReadTask::find`].
    pub fn read(&self) -> ReadTask<K, T> {
        let cell = self.context.queue.push(TaskKind::Read {
            container: self.name_owned(),
            ids: Vec::new(),
        });
        ReadTask::new(cell, self.context.clone(), self.cache.clone())
    }

    /// Query entities matching `filter`.
    ///
    /// The filter is passed to the hub unexamined.
    pub fn query(&self, filter: &str) -> Result<QueryTask<K, T>, ClientError> {
        if filter.trim().is_empty() {
            return Err(ClientError::InvalidArgument("filter must not be empty".into()));
        }
        let cell = self.context.queue.push(TaskKind::Query {
            container: self.name_owned(),
            filter: filter.to_string(),
            max_count: self.max_query_count,
            cursor: None,
        });
        Ok(QueryTask::new(cell, self.context.clone(), self.cache.clone()))
    }

    /// Query every entity of the container.
    pub fn query_all(&self) -> QueryTask<K, T> {
        let cell = self.context.queue.push(TaskKind::Query {
            container: self.name_owned(),
            filter: FILTER_ALL.to_string(),
            max_count: self.max_query_count,
            cursor: None,
        });
        QueryTask::new(cell, self.context.clone(), self.cache.clone())
    }

    /// Count entities matching `filter`.
    pub fn count(&self, filter: &str) -> Result<CountTask, ClientError> {
        if filter.trim().is_empty() {
            return Err(ClientError::InvalidArgument("filter must not be empty".into()));
        }
        Ok(CountTask::new(self.context.queue.push(TaskKind::Count {
            container: self.name_owned(),
            filter: filter.to_string(),
        })))
    }

    /// Count every entity of the container.
    pub fn count_all(&self) -> CountTask {
        CountTask::new(self.context.queue.push(TaskKind::Count {
            container: self.name_owned(),
            filter: FILTER_ALL.to_string(),
        }))
    }

    /// Delete an entity by key.
    pub fn delete(&self, key: &K) -> WriteTask {
        self.delete_range(std::slice::from_ref(key))
    }

    /// Delete several entities by key.
    ///
    /// Peers are removed from the cache once the hub acknowledged the delete.
    pub fn delete_range(&self, keys: &[K]) -> WriteTask {
        self.push_write(TaskKind::Delete {
            container: self.name_owned(),
            ids: keys.iter().map(EntityKey::to_json_key).collect(),
        })
    }

    /// Delete every entity of the container.
    pub fn delete_all(&self) -> WriteTask {
        self.push_write(TaskKind::DeleteAll {
            container: self.name_owned(),
        })
    }

    /// Patch one tracked entity.
    ///
    /// Without [`PatchTask::member`] the whole entity is diffed against its
    /// baseline when the batch is sent.
    pub fn patch(&self, key: &K) -> Result<PatchTask<K, T>, ClientError> {
        let json_key = self.tracked_key(key)?;
        let members = [(json_key.clone(), Vec::new())].into_iter().collect();
        let cell = self.context.queue.push(TaskKind::Patch {
            container: self.name_owned(),
            members,
        });
        Ok(PatchTask::new(cell, json_key))
    }

    /// Detect changes of every cached entity when the batch is sent.
    ///
    /// Entities never synced are created instead of patched.
    pub fn detect_patches(&self) -> DetectPatchesTask {
        self.push_detect(None)
    }

    /// Detect changes of the given entities when the batch is sent.
    ///
    /// Fails if a key is not tracked by the container.
    pub fn detect_patches_for(&self, keys: &[K]) -> Result<DetectPatchesTask, ClientError> {
        let keys = keys
            .iter()
            .map(|key| self.tracked_key(key))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.push_detect(Some(keys)))
    }

    fn push_detect(&self, keys: Option<Vec<JsonKey>>) -> DetectPatchesTask {
        DetectPatchesTask::new(self.context.queue.push(TaskKind::DetectPatches {
            scope: PatchScope::Container {
                container: self.name_owned(),
                keys,
            },
        }))
    }

    fn tracked_key(&self, key: &K) -> Result<JsonKey, ClientError> {
        let json_key = key.to_json_key();
        match self.cache.get(key) {
            Some(_) => Ok(json_key),
            None => Err(ClientError::UnknownPeer {
                container: self.name_owned(),
                key: json_key,
            }),
        }
    }

    /// Subscribe to changes made by other clients.
    ///
    /// Events are applied to this container once the task succeeded.
    pub fn subscribe_changes(
        &self,
        changes: ChangeKinds,
        filter: Option<&str>,
    ) -> Result<WriteTask, ClientError> {
        if filter.is_some_and(|f| f.trim().is_empty()) {
            return Err(ClientError::InvalidArgument("filter must not be empty".into()));
        }
        Ok(self.push_write(TaskKind::SubscribeChanges {
            container: self.name_owned(),
            changes,
            filter: filter.map(str::to_string),
        }))
    }

    /// Remove the change subscription.
    pub fn unsubscribe_changes(&self) -> WriteTask {
        self.push_write(TaskKind::SubscribeChanges {
            container: self.name_owned(),
            changes: ChangeKinds::empty(),
            filter: None,
        })
    }

    /// Reserve integer keys for new entities.
    pub fn reserve_keys(&self, count: u32) -> Result<ReserveKeysTask, ClientError> {
        if count == 0 || count > MAX_RESERVE_KEYS {
            return Err(ClientError::InvalidArgument(format!(
                "reserve count must be in 1..={MAX_RESERVE_KEYS}, got {count}"
            )));
        }
        Ok(ReserveKeysTask::new(self.context.queue.push(
            TaskKind::ReserveKeys {
                container: self.name_owned(),
                count,
            },
        )))
    }

    /// Release query cursors. An empty list releases every cursor of the container.
    pub fn close_cursors(&self, cursors: Vec<String>) -> CloseCursorsTask {
        CloseCursorsTask::new(self.context.queue.push(TaskKind::CloseCursors {
            container: self.name_owned(),
            cursors,
        }))
    }

    /// Track a locally created entity without queuing a task.
    ///
    /// The entity is created by the next patch detection covering it.
    pub fn track(&self, entity: T) -> Result<Arc<Peer<K, T>>, ClientError> {
        let (key, _) = codec::encode_keyed::<K, T>(&entity, T::KEY_FIELD)?;
        let peer = self.cache.get_or_create(&key);
        peer.set(entity);
        Ok(peer)
    }

    /// Cached value of `key`.
    pub fn get(&self, key: &K) -> Option<T> {
        self.cache.get(key).and_then(|peer| peer.get())
    }

    /// Peer of `key`, allocated if missing.
    pub fn peer(&self, key: &K) -> Arc<Peer<K, T>> {
        self.cache.get_or_create(key)
    }

    /// The identity cache of this container.
    pub fn cache(&self) -> &Arc<EntityCache<K, T>> {
        &self.cache
    }

    /// Call `listener` with a summary of every applied event touching this container.
    pub fn set_change_listener(
        &self,
        listener: impl Fn(&Changes<K>) + Send + Sync + 'static,
    ) {
        let listener: ChangeListener<K> = Arc::new(listener);
        self.cache.set_listener(Some(listener));
    }

    /// Remove the change listener.
    pub fn clear_change_listener(&self) {
        self.cache.set_listener(None);
    }
}
