//! Task handles.
//!
//! Every operation returns a handle immediately. Handles are cheap to clone
//! and all clones observe the same task. Reading a result before the batch of
//! the task completed fails with [`TaskAccessError::NotSynced`]; reading the
//! result of a failed task returns its [`TaskError`].
//!
//! Entity values are not copied into handles. Results look up the shared
//! peers of the identity cache, so they always show the current value.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;

use super::context::SyncContext;
use super::task::{TaskCell, TaskId, TaskKind, TaskOutput, TaskState};
use crate::cache::{EntityCache, EntityStore};
use crate::core::codec;
use crate::core::{
    ClientError, Entity, EntityErrors, EntityKey, JsonKey, TaskAccessError, TaskError,
    TaskErrorKind,
};
use crate::patch::{ContainerPatches, member_pointer};
use crate::protocol::EntityPatch;
use crate::refs::{Selector, declare_chain};

/// Untyped view of a task.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Arc<TaskCell> {
        &self.cell
    }

    /// Task identifier.
    pub fn id(&self) -> TaskId {
        self.cell.id()
    }

    /// Name if set, otherwise a short description of the task.
    pub fn label(&self) -> String {
        self.cell.label()
    }

    /// User assigned name.
    pub fn name(&self) -> Option<String> {
        self.cell.lock().name.clone()
    }

    /// Assign a name shown in error summaries.
    pub fn set_name(&self, name: impl Into<String>) {
        self.cell.lock().name = Some(name.into());
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// Check if the batch of this task completed.
    pub fn is_synced(&self) -> bool {
        self.state() != TaskState::Pending
    }

    /// Whether the task succeeded.
    pub fn success(&self) -> Result<bool, TaskAccessError> {
        let inner = self.cell.lock();
        match inner.state {
            TaskState::Pending => Err(TaskAccessError::NotSynced {
                task: inner.label(),
            }),
            state => Ok(state == TaskState::Success),
        }
    }

    /// Error of a failed task.
    pub fn error(&self) -> Option<TaskError> {
        self.cell.lock().error.clone()
    }

    /// Check if both handles refer to the same task.
    pub fn same_task(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Read the output of a successful task.
    pub(crate) fn output<R>(
        &self,
        f: impl FnOnce(&TaskOutput) -> Option<R>,
    ) -> Result<R, TaskAccessError> {
        let inner = self.cell.lock();
        match inner.state {
            TaskState::Pending => Err(TaskAccessError::NotSynced {
                task: inner.label(),
            }),
            TaskState::Failed => Err(TaskAccessError::Failed(failed_error(&inner.error))),
            TaskState::Success => f(&inner.output).ok_or_else(|| {
                TaskAccessError::Failed(TaskError::new(
                    TaskErrorKind::InvalidResponse,
                    "unexpected task output",
                ))
            }),
        }
    }

    fn ensure_pending(&self) -> Result<(), ClientError> {
        if self.cell.lock().detached {
            return Err(ClientError::SourceAlreadySynced { task: self.label() });
        }
        Ok(())
    }
}

fn failed_error(error: &Option<TaskError>) -> TaskError {
    error.clone().unwrap_or_else(|| {
        TaskError::new(TaskErrorKind::UnhandledException, "task failed without error")
    })
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}

macro_rules! deref_handle {
    ($($name:ident $(<$($param:ident),+>)?),* $(,)?) => {$(
        impl$(<$($param),+>)? Deref for $name$(<$($param),+>)? {
            type Target = TaskHandle;

            fn deref(&self) -> &TaskHandle {
                &self.handle
            }
        }
    )*};
}

deref_handle!(
    WriteTask,
    ReadTask<K, T>,
    FindTask<K, T>,
    QueryTask<K, T>,
    ReadRefsTask<K, T>,
    ReadRefTask<K, T>,
    CountTask,
    ReserveKeysTask,
    CloseCursorsTask,
    CommandTask<R>,
    DetectPatchesTask,
    PatchTask<K, T>,
);

/// Values of the given keys from the identity cache.
fn lookup<K: EntityKey, T: Entity>(
    cache: &EntityCache<K, T>,
    keys: &[JsonKey],
) -> IndexMap<K, Option<T>> {
    keys.iter()
        .filter_map(|key| K::from_json_key(key).ok())
        .map(|key| {
            let value = cache.get(&key).and_then(|peer| peer.get());
            (key, value)
        })
        .collect()
}

fn typed_keys<K: EntityKey>(keys: &[JsonKey]) -> Vec<K> {
    keys.iter().filter_map(|key| K::from_json_key(key).ok()).collect()
}

/// Handle of a task without result data: writes, deletes, subscriptions, messages.
#[derive(Debug, Clone)]
pub struct WriteTask {
    handle: TaskHandle,
}

impl WriteTask {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self {
            handle: TaskHandle::new(cell),
        }
    }

    /// Name the task.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.handle.set_name(name);
        self
    }

    /// Entity errors of a partially failed write.
    pub fn entity_errors(&self) -> Result<EntityErrors, TaskAccessError> {
        match self.handle.output(|_| Some(())) {
            Ok(()) => Ok(EntityErrors::new()),
            Err(TaskAccessError::Failed(error)) if error.kind == TaskErrorKind::EntityErrors => {
                Ok(error.entity_errors)
            }
            Err(e) => Err(e),
        }
    }
}

/// Read of entities by key.
pub struct ReadTask<K, T> {
    handle: TaskHandle,
    context: Arc<SyncContext>,
    cache: Arc<EntityCache<K, T>>,
}

impl<K, T> Clone for ReadTask<K, T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            context: self.context.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<K: EntityKey, T: Entity> ReadTask<K, T> {
    pub(crate) fn new(
        cell: Arc<TaskCell>,
        context: Arc<SyncContext>,
        cache: Arc<EntityCache<K, T>>,
    ) -> Self {
        Self {
            handle: TaskHandle::new(cell),
            context,
            cache,
        }
    }

    /// Name the task.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.handle.set_name(name);
        self
    }

    /// Add a key to the read.
    ///
    /// Finding the same key twice returns a handle to the same sub-result.
    pub fn find(&self, key: &K) -> Result<FindTask<K, T>, ClientError> {
        self.handle.ensure_pending()?;
        let json_key = key.to_json_key();
        if let TaskKind::Read { ids, .. } = &mut self.handle.cell.lock().kind {
            if !ids.contains(&json_key) {
                ids.push(json_key);
            }
        }
        Ok(FindTask {
            handle: self.handle.clone(),
            read: self.clone(),
            key: key.clone(),
        })
    }

    /// Add several keys to the read.
    pub fn find_range<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a K>,
    ) -> Result<Vec<FindTask<K, T>>, ClientError> {
        keys.into_iter().map(|key| self.find(key)).collect()
    }

    /// Requested keys with their values; `None` for keys not found.
    pub fn result(&self) -> Result<IndexMap<K, Option<T>>, TaskAccessError> {
        let keys = self.handle.output(|output| match output {
            TaskOutput::Keys(keys) => Some(keys.clone()),
            _ => None,
        })?;
        Ok(lookup(&self.cache, &keys))
    }

    /// Follow the foreign keys selected from the read entities.
    pub fn read_refs<K2: EntityKey, T2: Entity>(
        &self,
        selector: &str,
    ) -> Result<ReadRefsTask<K2, T2>, ClientError> {
        ReadRefsTask::declare(&self.context, &self.handle.cell, selector)
    }
}

/// One key of a [`ReadTask`].
pub struct FindTask<K, T> {
    handle: TaskHandle,
    read: ReadTask<K, T>,
    key: K,
}

impl<K: Clone, T> Clone for FindTask<K, T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            read: self.read.clone(),
            key: self.key.clone(),
        }
    }
}

impl<K: EntityKey, T: Entity> FindTask<K, T> {
    /// Requested key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Check if both handles refer to the same key of the same read.
    pub fn is_same(&self, other: &FindTask<K, T>) -> bool {
        self.handle.same_task(&other.handle) && self.key == other.key
    }

    /// Value of the key, `None` if not found.
    ///
    /// Errors of other keys of the same read do not affect this result.
    pub fn result(&self) -> Result<Option<T>, TaskAccessError> {
        let json_key = self.key.to_json_key();
        {
            let inner = self.handle.cell.lock();
            match inner.state {
                TaskState::Pending => {
                    return Err(TaskAccessError::NotSynced {
                        task: inner.label(),
                    });
                }
                TaskState::Failed => {
                    let error = failed_error(&inner.error);
                    if error.kind != TaskErrorKind::EntityErrors {
                        return Err(TaskAccessError::Failed(error));
                    }
                    if let Some(entity_error) = error.entity_errors.get(&json_key) {
                        let errors = EntityErrors::from([(json_key, entity_error.clone())]);
                        return Err(TaskAccessError::Failed(TaskError::from_entities(errors)));
                    }
                }
                TaskState::Success => {}
            }
        }
        Ok(self.read.cache.get(&self.key).and_then(|peer| peer.get()))
    }

    /// Follow a single foreign key of the found entity.
    pub fn read_ref<K2: EntityKey, T2: Entity>(
        &self,
        selector: &str,
    ) -> Result<ReadRefTask<K2, T2>, ClientError> {
        let refs = self.read.read_refs::<K2, T2>(selector)?;
        let selector =
            Selector::parse(selector).map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
        let source: Arc<dyn EntityStore> = self.read.cache.clone();
        Ok(ReadRefTask {
            handle: refs.handle.clone(),
            refs,
            source,
            source_key: self.key.to_json_key(),
            selector,
        })
    }
}

/// Query of entities by filter.
pub struct QueryTask<K, T> {
    handle: TaskHandle,
    context: Arc<SyncContext>,
    cache: Arc<EntityCache<K, T>>,
}

impl<K, T> Clone for QueryTask<K, T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            context: self.context.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<K: EntityKey, T: Entity> QueryTask<K, T> {
    pub(crate) fn new(
        cell: Arc<TaskCell>,
        context: Arc<SyncContext>,
        cache: Arc<EntityCache<K, T>>,
    ) -> Self {
        Self {
            handle: TaskHandle::new(cell),
            context,
            cache,
        }
    }

    /// Name the task.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.handle.set_name(name);
        self
    }

    fn modify(&self, f: impl FnOnce(&mut Option<u32>, &mut Option<String>)) -> Result<(), ClientError> {
        self.handle.ensure_pending()?;
        if let TaskKind::Query {
            max_count, cursor, ..
        } = &mut self.handle.cell.lock().kind
        {
            f(max_count, cursor);
        }
        Ok(())
    }

    /// Limit the number of returned entities. The result then carries a cursor
    /// if more entities match.
    pub fn set_max_count(&self, count: u32) -> Result<(), ClientError> {
        if count == 0 {
            return Err(ClientError::InvalidArgument("max count must be positive".into()));
        }
        self.modify(|max_count, _| *max_count = Some(count))
    }

    /// Continue a previous query.
    pub fn set_cursor(&self, cursor: impl Into<String>) -> Result<(), ClientError> {
        let cursor = cursor.into();
        self.modify(|_, current| *current = Some(cursor))
    }

    /// Matching entities in result order.
    pub fn result(&self) -> Result<Vec<T>, TaskAccessError> {
        let keys = self.query_keys()?;
        Ok(lookup(&self.cache, &keys).into_values().flatten().collect())
    }

    /// Keys of the matching entities.
    pub fn keys(&self) -> Result<Vec<K>, TaskAccessError> {
        Ok(typed_keys(&self.query_keys()?))
    }

    /// Cursor to continue the query, `None` if all matches were returned.
    pub fn cursor(&self) -> Result<Option<String>, TaskAccessError> {
        self.handle.output(|output| match output {
            TaskOutput::Query { cursor, .. } => Some(cursor.clone()),
            _ => None,
        })
    }

    fn query_keys(&self) -> Result<Vec<JsonKey>, TaskAccessError> {
        self.handle.output(|output| match output {
            TaskOutput::Query { ids, .. } => Some(ids.clone()),
            _ => None,
        })
    }

    /// Follow the foreign keys selected from the matching entities.
    pub fn read_refs<K2: EntityKey, T2: Entity>(
        &self,
        selector: &str,
    ) -> Result<ReadRefsTask<K2, T2>, ClientError> {
        ReadRefsTask::declare(&self.context, &self.handle.cell, selector)
    }
}

/// Entities referenced by the results of a read, query or another reference read.
pub struct ReadRefsTask<K, T> {
    handle: TaskHandle,
    context: Arc<SyncContext>,
    cache: Arc<EntityCache<K, T>>,
}

impl<K, T> Clone for ReadRefsTask<K, T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            context: self.context.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<K: EntityKey, T: Entity> ReadRefsTask<K, T> {
    fn declare(
        context: &Arc<SyncContext>,
        source: &Arc<TaskCell>,
        selector: &str,
    ) -> Result<Self, ClientError> {
        let cache = context.registry.open::<K, T>()?;
        let cell = declare_chain(&context.queue, source, selector, T::CONTAINER, T::KEY_FIELD)?;
        Ok(Self {
            handle: TaskHandle::new(cell),
            context: context.clone(),
            cache,
        })
    }

    /// Referenced keys with their values; `None` for dangling references.
    pub fn result(&self) -> Result<IndexMap<K, Option<T>>, TaskAccessError> {
        Ok(lookup(&self.cache, &self.ref_keys()?))
    }

    /// Distinct referenced keys in first-seen order.
    pub fn keys(&self) -> Result<Vec<K>, TaskAccessError> {
        Ok(typed_keys(&self.ref_keys()?))
    }

    fn ref_keys(&self) -> Result<Vec<JsonKey>, TaskAccessError> {
        self.handle.output(|output| match output {
            TaskOutput::Keys(keys) => Some(keys.clone()),
            _ => None,
        })
    }

    /// Follow references of the referenced entities.
    pub fn read_refs<K2: EntityKey, T2: Entity>(
        &self,
        selector: &str,
    ) -> Result<ReadRefsTask<K2, T2>, ClientError> {
        ReadRefsTask::declare(&self.context, &self.handle.cell, selector)
    }
}

/// Entity referenced by a single found entity.
///
/// Shares the chained read of its [`ReadTask`]; the referenced key is selected
/// from the synced payload of the found entity.
pub struct ReadRefTask<K, T> {
    handle: TaskHandle,
    refs: ReadRefsTask<K, T>,
    source: Arc<dyn EntityStore>,
    source_key: JsonKey,
    selector: Selector,
}

impl<K: EntityKey, T: Entity> ReadRefTask<K, T> {
    /// Key referenced by the source entity.
    pub fn key(&self) -> Result<Option<K>, TaskAccessError> {
        self.handle.output(|_| Some(()))?;
        let key = self
            .source
            .snapshot(&self.source_key)
            .and_then(|payload| self.selector.select(&payload).into_iter().next())
            .and_then(|key| K::from_json_key(&key).ok());
        Ok(key)
    }

    /// Referenced entity, `None` if the source holds no reference or it dangles.
    pub fn result(&self) -> Result<Option<T>, TaskAccessError> {
        Ok(self
            .key()?
            .and_then(|key| self.refs.cache.get(&key))
            .and_then(|peer| peer.get()))
    }
}

/// Number of entities matching a filter.
#[derive(Debug, Clone)]
pub struct CountTask {
    handle: TaskHandle,
}

impl CountTask {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self {
            handle: TaskHandle::new(cell),
        }
    }

    /// The count.
    pub fn result(&self) -> Result<u64, TaskAccessError> {
        self.handle.output(|output| match output {
            TaskOutput::Count(count) => Some(*count),
            _ => None,
        })
    }
}

/// Integer keys reserved for new entities.
#[derive(Debug, Clone)]
pub struct ReserveKeysTask {
    handle: TaskHandle,
}

impl ReserveKeysTask {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self {
            handle: TaskHandle::new(cell),
        }
    }

    /// The reserved keys.
    pub fn result(&self) -> Result<Vec<i64>, TaskAccessError> {
        self.handle.output(|output| match output {
            TaskOutput::ReservedKeys(keys) => Some(keys.clone()),
            _ => None,
        })
    }
}

/// Release of query cursors.
#[derive(Debug, Clone)]
pub struct CloseCursorsTask {
    handle: TaskHandle,
}

impl CloseCursorsTask {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self {
            handle: TaskHandle::new(cell),
        }
    }

    /// Number of cursors still open on the hub for the container.
    pub fn result(&self) -> Result<u32, TaskAccessError> {
        self.handle.output(|output| match output {
            TaskOutput::ClosedCursors(count) => Some(*count),
            _ => None,
        })
    }
}

/// Command with a typed result.
pub struct CommandTask<R> {
    handle: TaskHandle,
    _result: PhantomData<fn() -> R>,
}

impl<R> Clone for CommandTask<R> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _result: PhantomData,
        }
    }
}

impl<R: DeserializeOwned> CommandTask<R> {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self {
            handle: TaskHandle::new(cell),
            _result: PhantomData,
        }
    }

    /// Name the task.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.handle.set_name(name);
        self
    }

    /// Decoded command result.
    pub fn result(&self) -> Result<R, TaskAccessError> {
        let value = self.handle.output(|output| match output {
            TaskOutput::Command(value) => Some(value.clone()),
            _ => None,
        })?;
        codec::decode(&value).map_err(|e| {
            TaskAccessError::Failed(TaskError::new(TaskErrorKind::InvalidResponse, e.to_string()))
        })
    }
}

/// Patches detected at detach time.
#[derive(Debug, Clone)]
pub struct DetectPatchesTask {
    handle: TaskHandle,
}

impl DetectPatchesTask {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self {
            handle: TaskHandle::new(cell),
        }
    }

    /// Patches and creates per container.
    pub fn result(&self) -> Result<Vec<ContainerPatches>, TaskAccessError> {
        self.handle.output(|output| match output {
            TaskOutput::Patches(patches) => Some(patches.clone()),
            _ => None,
        })
    }

    /// Total number of patched and created entities.
    pub fn count(&self) -> Result<usize, TaskAccessError> {
        Ok(self
            .result()?
            .iter()
            .map(|c| c.patches.len() + c.created.len())
            .sum())
    }
}

/// Patch of selected members of one entity.
pub struct PatchTask<K, T> {
    handle: TaskHandle,
    key: JsonKey,
    _entity: PhantomData<fn() -> (K, T)>,
}

impl<K, T> Clone for PatchTask<K, T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            key: self.key.clone(),
            _entity: PhantomData,
        }
    }
}

impl<K: EntityKey, T: Entity> PatchTask<K, T> {
    pub(crate) fn new(cell: Arc<TaskCell>, key: JsonKey) -> Self {
        Self {
            handle: TaskHandle::new(cell),
            key,
            _entity: PhantomData,
        }
    }

    /// Restrict the patch to a member, e.g. `name` or `address.city`.
    ///
    /// Without members the whole entity is diffed.
    pub fn member(self, path: &str) -> Result<Self, ClientError> {
        let pointer = member_pointer(path)?;
        self.handle.ensure_pending()?;
        if let TaskKind::Patch { members, .. } = &mut self.handle.cell.lock().kind {
            let paths = members.entry(self.key.clone()).or_default();
            if !paths.contains(&pointer) {
                paths.push(pointer);
            }
        }
        Ok(self)
    }

    /// The sent patch, `None` if nothing changed or the entity was created instead.
    pub fn result(&self) -> Result<Option<EntityPatch>, TaskAccessError> {
        let patches = self.handle.output(|output| match output {
            TaskOutput::Patches(patches) => Some(patches.clone()),
            _ => None,
        })?;
        Ok(patches
            .into_iter()
            .flat_map(|c| c.patches)
            .find(|patch| patch.key == self.key))
    }
}
