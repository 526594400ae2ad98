//! In-process hub.
//!
//! [`LoopbackHub`] executes requests against in-memory JSON containers and
//! publishes change and message events to the other connected clients. It
//! serves offline use and tests; it is not a storage engine. Only the
//! match-all filter is understood, any other filter fails with
//! [`TaskErrorKind::FilterError`].
//!
//! Failures can be injected per container, per entity or for the whole hub.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, trace};

use super::{Transport, TransportError, TransportResult};
use crate::core::codec::payload_key;
use crate::core::constants::{DEFAULT_KEY_FIELD, FILTER_ALL, STD_CLIENT, STD_ECHO};
use crate::core::{EntityError, EntityErrorKind, JsonKey, TaskErrorKind};
use crate::protocol::{
    ChangeKinds, ChangeRecord, ContainerEntities, EventMessage, MessageEvent, ReferencesResult,
    RefsRequest, SyncRequest, SyncRequestTask, SyncResponse, SyncTaskResult, TaskErrorResult,
    patch,
};
use crate::refs::Selector;
use crate::subscription::EventSink;

/// Arguments of a command call.
#[derive(Debug)]
pub struct CommandCall<'a> {
    /// Command name.
    pub name: &'a str,
    /// Command parameter.
    pub param: &'a Value,
    /// Calling client.
    pub client_id: &'a str,
    /// User of the request.
    pub user_id: Option<&'a str>,
}

/// Handler of a hub command. An error fails the task with
/// [`TaskErrorKind::CommandError`].
///
/// Handlers run while the hub is locked and must not call into the hub.
pub type CommandHandler = Arc<dyn Fn(&CommandCall<'_>) -> Result<Value, String> + Send + Sync>;

type Entities = IndexMap<JsonKey, Value>;

/// Events of one connection awaiting delivery, in sequence order.
///
/// Events are queued while the hub is locked and delivered after it is
/// released. Deliveries of one connection never overlap, and each takes the
/// oldest queued event, so a client sees its events in sequence order even
/// when requests of several connections complete concurrently.
#[derive(Default)]
struct Outbox {
    events: Mutex<VecDeque<EventMessage>>,
    delivering: Mutex<()>,
}

impl Outbox {
    fn push(&self, event: EventMessage) {
        self.events.lock().push_back(event);
    }

    fn flush(&self, mut deliver: impl FnMut(EventMessage)) {
        let _delivering = self.delivering.lock();
        loop {
            let Some(event) = self.events.lock().pop_front() else {
                break;
            };
            deliver(event);
        }
    }
}

#[derive(Default)]
struct Connection {
    client_id: Option<String>,
    sink: Option<EventSink>,
    outbox: Arc<Outbox>,
    changes: IndexMap<String, ChangeKinds>,
    messages: IndexSet<String>,
    event_seq: u64,
}

impl Connection {
    fn wants_message(&self, name: &str) -> bool {
        self.messages.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => pattern == name,
        })
    }
}

struct Cursor {
    container: String,
    offset: usize,
}

#[derive(Default)]
struct Failures {
    offline: bool,
    containers: IndexMap<String, TaskErrorKind>,
    entities: IndexSet<(String, JsonKey)>,
}

#[derive(Default)]
struct HubState {
    containers: IndexMap<String, Entities>,
    connections: IndexMap<u64, Connection>,
    cursors: IndexMap<String, Cursor>,
    key_sequences: IndexMap<String, i64>,
    commands: IndexMap<String, CommandHandler>,
    failures: Failures,
    next_connection: u64,
    next_client: u64,
    next_cursor: u64,
    requests: u64,
}

/// An in-process hub shared by its connections.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection.
    pub fn connect(&self) -> LoopbackTransport {
        let mut state = self.state.lock();
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(id, Connection::default());
        LoopbackTransport {
            hub: self.clone(),
            connection: id,
        }
    }

    /// Register a command. Names starting with `std.` are reserved for
    /// built-in commands, which cannot be replaced.
    pub fn register_command(
        &self,
        name: &str,
        handler: impl Fn(&CommandCall<'_>) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        self.state
            .lock()
            .commands
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Store an entity directly, bypassing clients and events.
    pub fn insert(&self, container: &str, entity: Value) -> Result<(), EntityError> {
        let key = payload_key(&entity, DEFAULT_KEY_FIELD).map_err(|e| {
            EntityError::new(EntityErrorKind::WriteError, JsonKey::from(""), e.to_string())
        })?;
        self.state
            .lock()
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(key, entity);
        Ok(())
    }

    /// Stored entity.
    pub fn entity(&self, container: &str, key: impl Into<JsonKey>) -> Option<Value> {
        let key = key.into();
        self.state
            .lock()
            .containers
            .get(container)
            .and_then(|entities| entities.get(&key).cloned())
    }

    /// Number of stored entities of a container.
    pub fn len(&self, container: &str) -> usize {
        self.state
            .lock()
            .containers
            .get(container)
            .map_or(0, IndexMap::len)
    }

    /// Number of requests executed.
    pub fn request_count(&self) -> u64 {
        self.state.lock().requests
    }

    /// Fail every task on `container` with `kind`. `None` removes the failure.
    pub fn fail_container(&self, container: &str, kind: Option<TaskErrorKind>) {
        let failures = &mut self.state.lock().failures;
        match kind {
            Some(kind) => {
                failures.containers.insert(container.to_string(), kind);
            }
            None => {
                failures.containers.shift_remove(container);
            }
        }
    }

    /// Fail every read and write of one entity.
    pub fn fail_entity(&self, container: &str, key: impl Into<JsonKey>) {
        self.state
            .lock()
            .failures
            .entities
            .insert((container.to_string(), key.into()));
    }

    /// Reject every request with [`TransportError::NotConnected`] while set.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().failures.offline = offline;
    }
}

/// One client connection to a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: LoopbackHub,
    connection: u64,
}

impl LoopbackTransport {
    /// The hub of this connection.
    pub fn hub(&self) -> &LoopbackHub {
        &self.hub
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.hub.state.lock().connections.shift_remove(&self.connection);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn execute(&self, request: SyncRequest) -> TransportResult<SyncResponse> {
        let (response, deliveries) = {
            let mut state = self.hub.state.lock();
            if state.failures.offline {
                return Err(TransportError::NotConnected);
            }
            state.requests += 1;
            let mut exec = Execution::new(&mut state, self.connection, &request);
            let tasks = request
                .tasks
                .iter()
                .map(|task| exec.task(task))
                .collect::<Vec<_>>();
            let (containers, changes, messages, client_id) = exec.finish();
            let deliveries = state.publish(self.connection, &client_id, changes, messages);
            let response = SyncResponse {
                seq: request.seq,
                client_id: Some(client_id),
                tasks,
                containers,
            };
            (response, deliveries)
        };
        debug!(
            seq = response.seq,
            tasks = response.tasks.len(),
            events = deliveries.len(),
            "loopback request executed"
        );
        for (outbox, sink) in deliveries {
            outbox.flush(|event| {
                sink.deliver(event);
            });
        }
        Ok(response)
    }

    fn connect_events(&self, sink: EventSink) {
        if let Some(connection) = self.hub.state.lock().connections.get_mut(&self.connection) {
            connection.sink = Some(sink);
        }
    }
}

impl HubState {
    /// Queue events for every other connection subscribed to the changes or
    /// messages. Returns the outboxes to flush.
    fn publish(
        &mut self,
        source: u64,
        source_client: &str,
        changes: Vec<ChangeRecord>,
        messages: Vec<MessageEvent>,
    ) -> Vec<(Arc<Outbox>, EventSink)> {
        if changes.is_empty() && messages.is_empty() {
            return Vec::new();
        }
        let mut deliveries = Vec::new();
        for (id, connection) in self.connections.iter_mut() {
            if *id == source {
                continue;
            }
            let Some(sink) = connection.sink.clone() else {
                continue;
            };
            let changes: Vec<_> = changes
                .iter()
                .filter(|change| {
                    connection
                        .changes
                        .get(change.container())
                        .is_some_and(|kinds| kinds.contains(change.kind()))
                })
                .cloned()
                .collect();
            let messages: Vec<_> = messages
                .iter()
                .filter(|message| connection.wants_message(&message.name))
                .cloned()
                .collect();
            if changes.is_empty() && messages.is_empty() {
                continue;
            }
            connection.event_seq += 1;
            connection.outbox.push(EventMessage {
                seq: connection.event_seq,
                source_client: Some(source_client.to_string()),
                changes,
                messages,
            });
            deliveries.push((connection.outbox.clone(), sink));
        }
        deliveries
    }
}

#[derive(Default)]
struct Section {
    entities: Entities,
    not_found: IndexSet<JsonKey>,
    errors: IndexMap<JsonKey, EntityError>,
}

/// Execution of one request.
struct Execution<'a> {
    state: &'a mut HubState,
    connection: u64,
    client_id: String,
    user_id: Option<&'a str>,
    database: Option<&'a str>,
    sections: IndexMap<String, Section>,
    changes: Vec<ChangeRecord>,
    messages: Vec<MessageEvent>,
}

fn task_error(kind: TaskErrorKind, message: impl Into<String>) -> SyncTaskResult {
    SyncTaskResult::error(kind, message)
}

fn is_match_all(filter: &str) -> bool {
    filter.trim() == FILTER_ALL
}

impl<'a> Execution<'a> {
    fn new(state: &'a mut HubState, connection: u64, request: &'a SyncRequest) -> Self {
        let client_id = match &request.client_id {
            Some(id) => id.clone(),
            None => match state
                .connections
                .get(&connection)
                .and_then(|c| c.client_id.clone())
            {
                Some(id) => id,
                None => {
                    state.next_client += 1;
                    state.next_client.to_string()
                }
            },
        };
        if let Some(conn) = state.connections.get_mut(&connection) {
            conn.client_id = Some(client_id.clone());
        }
        Self {
            state,
            connection,
            client_id,
            user_id: request.user_id.as_deref(),
            database: request.database.as_deref(),
            sections: IndexMap::new(),
            changes: Vec::new(),
            messages: Vec::new(),
        }
    }

    fn finish(self) -> (Vec<ContainerEntities>, Vec<ChangeRecord>, Vec<MessageEvent>, String) {
        let containers = self
            .sections
            .into_iter()
            .map(|(container, section)| ContainerEntities {
                container,
                entities: section.entities.into_values().collect(),
                not_found: section.not_found.into_iter().collect(),
                errors: section.errors.into_values().collect(),
            })
            .collect();
        (containers, self.changes, self.messages, self.client_id)
    }

    fn container_failure(&self, container: &str) -> Option<SyncTaskResult> {
        self.state
            .failures
            .containers
            .get(container)
            .map(|kind| task_error(*kind, format!("container '{container}' failed")))
    }

    fn entity_fails(&self, container: &str, key: &JsonKey) -> bool {
        self.state
            .failures
            .entities
            .contains(&(container.to_string(), key.clone()))
    }

    fn section(&mut self, container: &str) -> &mut Section {
        self.sections.entry(container.to_string()).or_default()
    }

    fn task(&mut self, task: &SyncRequestTask) -> SyncTaskResult {
        trace!(task = task.kind(), "loopback task");
        let container = match task {
            SyncRequestTask::Create { container, .. }
            | SyncRequestTask::Upsert { container, .. }
            | SyncRequestTask::Read { container, .. }
            | SyncRequestTask::Query { container, .. }
            | SyncRequestTask::Merge { container, .. }
            | SyncRequestTask::Delete { container, .. }
            | SyncRequestTask::DeleteAll { container }
            | SyncRequestTask::Count { container, .. }
            | SyncRequestTask::SubscribeChanges { container, .. }
            | SyncRequestTask::ReserveKeys { container, .. }
            | SyncRequestTask::CloseCursors { container, .. } => Some(container.as_str()),
            _ => None,
        };
        if let Some(failure) = container.and_then(|c| self.container_failure(c)) {
            return failure;
        }
        match task {
            SyncRequestTask::Create {
                container,
                key_field,
                entities,
            } => self.write(container, key_field.as_deref(), entities, false),
            SyncRequestTask::Upsert {
                container,
                key_field,
                entities,
            } => self.write(container, key_field.as_deref(), entities, true),
            SyncRequestTask::Read {
                container,
                ids,
                references,
                ..
            } => {
                let found = self.read_keys(container, ids);
                let references = self.references(references, &found);
                SyncTaskResult::Read { references }
            }
            SyncRequestTask::Query {
                container,
                filter,
                max_count,
                cursor,
                references,
                ..
            } => self.query(container, filter, *max_count, cursor.as_deref(), references),
            SyncRequestTask::Merge {
                container,
                patches,
                ..
            } => self.merge(container, patches),
            SyncRequestTask::Delete { container, ids } => self.delete(container, ids),
            SyncRequestTask::DeleteAll { container } => {
                let removed = self
                    .state
                    .containers
                    .get_mut(container)
                    .map(|entities| std::mem::take(entities).into_keys().collect::<Vec<_>>())
                    .unwrap_or_default();
                if !removed.is_empty() {
                    self.changes.push(ChangeRecord::Delete {
                        container: container.clone(),
                        ids: removed,
                    });
                }
                SyncTaskResult::DeleteAll
            }
            SyncRequestTask::Count { container, filter } => {
                if !is_match_all(filter) {
                    return task_error(TaskErrorKind::FilterError, format!("unsupported filter '{filter}'"));
                }
                let count = self.state.containers.get(container).map_or(0, IndexMap::len);
                SyncTaskResult::Count {
                    count: count as u64,
                }
            }
            SyncRequestTask::SubscribeChanges {
                container,
                changes,
                filter,
            } => {
                if let Some(filter) = filter.as_deref().filter(|f| !is_match_all(f)) {
                    return task_error(TaskErrorKind::FilterError, format!("unsupported filter '{filter}'"));
                }
                if let Some(connection) = self.state.connections.get_mut(&self.connection) {
                    if changes.is_empty() {
                        connection.changes.shift_remove(container);
                    } else {
                        connection.changes.insert(container.clone(), *changes);
                    }
                }
                SyncTaskResult::SubscribeChanges
            }
            SyncRequestTask::SubscribeMessage { name, remove } => {
                if let Some(connection) = self.state.connections.get_mut(&self.connection) {
                    if *remove {
                        connection.messages.shift_remove(name);
                    } else {
                        connection.messages.insert(name.clone());
                    }
                }
                SyncTaskResult::SubscribeMessage
            }
            SyncRequestTask::ReserveKeys { container, count } => {
                let next = self.state.key_sequences.entry(container.clone()).or_insert(0);
                let keys = (1..=i64::from(*count)).map(|i| *next + i).collect();
                *next += i64::from(*count);
                SyncTaskResult::ReserveKeys { keys }
            }
            SyncRequestTask::CloseCursors { container, cursors } => {
                self.state.cursors.retain(|id, cursor| {
                    cursor.container != *container || !(cursors.is_empty() || cursors.contains(id))
                });
                let count = self
                    .state
                    .cursors
                    .values()
                    .filter(|cursor| cursor.container == *container)
                    .count();
                SyncTaskResult::CloseCursors {
                    count: count as u32,
                }
            }
            SyncRequestTask::Command { name, param } => self.command(name, param),
            SyncRequestTask::Message { name, param } => {
                self.messages.push(MessageEvent {
                    name: name.clone(),
                    param: param.clone(),
                });
                SyncTaskResult::Message
            }
        }
    }

    fn write(
        &mut self,
        container: &str,
        key_field: Option<&str>,
        entities: &[Value],
        replace: bool,
    ) -> SyncTaskResult {
        let key_field = key_field.unwrap_or(DEFAULT_KEY_FIELD);
        let mut errors = Vec::new();
        let mut written = Vec::new();
        for entity in entities {
            let key = match payload_key(entity, key_field) {
                Ok(key) => key,
                Err(e) => {
                    return task_error(TaskErrorKind::ValidationError, e.to_string());
                }
            };
            if self.entity_fails(container, &key) {
                errors.push(EntityError::new(EntityErrorKind::WriteError, key, "write failed"));
                continue;
            }
            let stored = self.state.containers.entry(container.to_string()).or_default();
            if !replace && stored.contains_key(&key) {
                errors.push(EntityError::new(
                    EntityErrorKind::WriteError,
                    key,
                    "entity already exists",
                ));
                continue;
            }
            stored.insert(key, entity.clone());
            written.push(entity.clone());
        }
        if !written.is_empty() {
            let container = container.to_string();
            self.changes.push(if replace {
                ChangeRecord::Upsert {
                    container,
                    entities: written,
                }
            } else {
                ChangeRecord::Create {
                    container,
                    entities: written,
                }
            });
        }
        if replace {
            SyncTaskResult::Upsert { errors }
        } else {
            SyncTaskResult::Create { errors }
        }
    }

    /// Add the given keys to the section of `container`. Returns the found payloads.
    fn read_keys(&mut self, container: &str, keys: &[JsonKey]) -> Vec<Value> {
        let mut found = Vec::new();
        for key in keys {
            if self.entity_fails(container, key) {
                self.section(container).errors.insert(
                    key.clone(),
                    EntityError::new(EntityErrorKind::ReadError, key.clone(), "read failed"),
                );
                continue;
            }
            let payload = self
                .state
                .containers
                .get(container)
                .and_then(|entities| entities.get(key).cloned());
            let section = self.section(container);
            match payload {
                Some(payload) => {
                    section.entities.insert(key.clone(), payload.clone());
                    found.push(payload);
                }
                None => {
                    section.not_found.insert(key.clone());
                }
            }
        }
        found
    }

    fn references(&mut self, requests: &[RefsRequest], sources: &[Value]) -> Vec<ReferencesResult> {
        requests
            .iter()
            .map(|request| {
                let mut result = ReferencesResult {
                    selector: request.selector.clone(),
                    container: request.container.clone(),
                    ids: Vec::new(),
                    error: None,
                    references: Vec::new(),
                };
                let selector = match Selector::parse(&request.selector) {
                    Ok(selector) => selector,
                    Err(e) => {
                        result.error = Some(TaskErrorResult {
                            kind: TaskErrorKind::InvalidTask,
                            message: e.to_string(),
                        });
                        return result;
                    }
                };
                if let Some(kind) = self.state.failures.containers.get(&request.container) {
                    result.error = Some(TaskErrorResult {
                        kind: *kind,
                        message: format!("container '{}' failed", request.container),
                    });
                    return result;
                }
                result.ids = selector.select_distinct(sources);
                let targets = self.read_keys(&request.container, &result.ids);
                result.references = self.references(&request.references, &targets);
                result
            })
            .collect()
    }

    fn query(
        &mut self,
        container: &str,
        filter: &str,
        max_count: Option<u32>,
        cursor: Option<&str>,
        references: &[RefsRequest],
    ) -> SyncTaskResult {
        if !is_match_all(filter) {
            return task_error(TaskErrorKind::FilterError, format!("unsupported filter '{filter}'"));
        }
        let offset = match cursor {
            None => 0,
            Some(id) => match self.state.cursors.shift_remove(id) {
                Some(cursor) if cursor.container == container => cursor.offset,
                _ => return task_error(TaskErrorKind::InvalidTask, format!("unknown cursor '{id}'")),
            },
        };
        let all: Vec<JsonKey> = self
            .state
            .containers
            .get(container)
            .map(|entities| entities.keys().cloned().collect())
            .unwrap_or_default();
        let limit = max_count.map_or(usize::MAX, |count| count as usize);
        let ids: Vec<JsonKey> = all.iter().skip(offset).take(limit).cloned().collect();
        let end = offset + ids.len();
        let cursor = (end < all.len()).then(|| {
            self.state.next_cursor += 1;
            let id = format!("cursor-{}", self.state.next_cursor);
            self.state.cursors.insert(
                id.clone(),
                Cursor {
                    container: container.to_string(),
                    offset: end,
                },
            );
            id
        });
        let found = self.read_keys(container, &ids);
        let references = self.references(references, &found);
        SyncTaskResult::Query {
            ids,
            cursor,
            references,
        }
    }

    fn merge(&mut self, container: &str, patches: &[crate::protocol::EntityPatch]) -> SyncTaskResult {
        let mut errors = Vec::new();
        let mut merged = Vec::new();
        for entity_patch in patches {
            let key = &entity_patch.key;
            if self.entity_fails(container, key) {
                errors.push(EntityError::new(EntityErrorKind::WriteError, key.clone(), "write failed"));
                continue;
            }
            let Some(stored) = self
                .state
                .containers
                .get_mut(container)
                .and_then(|entities| entities.get_mut(key))
            else {
                errors.push(EntityError::new(EntityErrorKind::PatchError, key.clone(), "entity not found"));
                continue;
            };
            let mut patched = stored.clone();
            match patch::apply(&mut patched, &entity_patch.ops) {
                Ok(()) => {
                    *stored = patched;
                    merged.push(entity_patch.clone());
                }
                Err(e) => {
                    errors.push(EntityError::new(EntityErrorKind::PatchError, key.clone(), e.to_string()));
                }
            }
        }
        if !merged.is_empty() {
            self.changes.push(ChangeRecord::Patch {
                container: container.to_string(),
                patches: merged,
            });
        }
        SyncTaskResult::Merge { errors }
    }

    fn delete(&mut self, container: &str, ids: &[JsonKey]) -> SyncTaskResult {
        let mut errors = Vec::new();
        let mut deleted = Vec::new();
        for key in ids {
            if self.entity_fails(container, key) {
                errors.push(EntityError::new(EntityErrorKind::WriteError, key.clone(), "delete failed"));
                continue;
            }
            if let Some(entities) = self.state.containers.get_mut(container) {
                entities.shift_remove(key);
            }
            deleted.push(key.clone());
        }
        if !deleted.is_empty() {
            self.changes.push(ChangeRecord::Delete {
                container: container.to_string(),
                ids: deleted,
            });
        }
        SyncTaskResult::Delete { errors }
    }

    fn command(&mut self, name: &str, param: &Value) -> SyncTaskResult {
        match name {
            STD_ECHO => SyncTaskResult::Command {
                result: param.clone(),
            },
            STD_CLIENT => SyncTaskResult::Command {
                result: json!({
                    "clientId": self.client_id,
                    "userId": self.user_id,
                    "database": self.database,
                }),
            },
            _ => {
                let Some(handler) = self.state.commands.get(name).cloned() else {
                    return task_error(TaskErrorKind::NotImplemented, format!("unknown command '{name}'"));
                };
                let call = CommandCall {
                    name,
                    param,
                    client_id: &self.client_id,
                    user_id: self.user_id,
                };
                match handler(&call) {
                    Ok(result) => SyncTaskResult::Command { result },
                    Err(message) => task_error(TaskErrorKind::CommandError, message),
                }
            }
        }
    }
}
