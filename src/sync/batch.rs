//! Batch building and completion.
//!
//! Detaching freezes the pending queue into a [`Batch`]: each task maps to a
//! range of wire tasks, so response index `i` always answers request index `i`.
//! Chained reads travel nested in their source task and occupy no wire slot.
//! Patch detections are resolved here and may expand into a merge and a
//! create per container.
//!
//! Completion first applies the entity sections of the response to the
//! caches, then settles each task in batch order. A batch that failed as a
//! whole (transport error, cancellation, malformed response) leaves the caches
//! untouched apart from releasing snapshots it had reserved.

use std::ops::Range;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use super::context::SyncContext;
use super::task::{TaskCell, TaskKind, TaskOutput, TaskState};
use crate::client::SyncResult;
use crate::core::constants::DEFAULT_KEY_FIELD;
use crate::core::{
    BatchError, EntityError, EntityErrors, JsonKey, TaskError, TaskErrorKind,
};
use crate::patch::{DetectedPart, detect, detect_members};
use crate::protocol::{SyncRequest, SyncRequestTask, SyncResponse, SyncTaskResult};
use crate::refs::{build_refs, complete_chains};

/// Entity errors of the response sections, by container and key.
#[derive(Debug, Default)]
pub(crate) struct SectionErrors {
    by_container: IndexMap<String, EntityErrors>,
}

impl SectionErrors {
    pub fn insert(&mut self, container: &str, errors: Vec<EntityError>) {
        let entry = self.by_container.entry(container.to_string()).or_default();
        for error in errors {
            entry.insert(error.key.clone(), error);
        }
    }

    /// Errors of the given keys.
    pub fn for_keys(&self, container: &str, keys: &[JsonKey]) -> EntityErrors {
        let Some(errors) = self.by_container.get(container) else {
            return EntityErrors::new();
        };
        keys.iter()
            .filter_map(|key| errors.get(key).map(|e| (key.clone(), e.clone())))
            .collect()
    }
}

/// Wire tasks planned for one container of a patch detection.
#[derive(Debug)]
pub(crate) struct DetectPlan {
    pub part: DetectedPart,
    pub merge_at: Option<usize>,
    pub create_at: Option<usize>,
}

#[derive(Debug)]
pub(crate) enum EntryPlan {
    /// One wire task.
    Wire,
    /// Completed through the references result of its source.
    Chain,
    /// Zero or more merge and create tasks.
    Detect(Vec<DetectPlan>),
    /// Failed at detach. Nothing was sent.
    Rejected(TaskError),
}

#[derive(Debug)]
pub(crate) struct BatchEntry {
    pub cell: Arc<TaskCell>,
    pub wire: Range<usize>,
    pub plan: EntryPlan,
}

/// Tasks detached for one round trip.
#[derive(Debug)]
pub(crate) struct Batch {
    pub seq: u64,
    pub entries: Vec<BatchEntry>,
    request: Option<SyncRequest>,
    wire_len: usize,
}

impl Batch {
    /// Take the request to send. `None` once taken.
    pub fn take_request(&mut self) -> Option<SyncRequest> {
        self.request.take()
    }

    /// Number of wire tasks.
    pub fn wire_len(&self) -> usize {
        self.wire_len
    }
}

/// Check a write result and return its entity errors.
fn write_outcome<'a>(
    result: Option<&'a SyncTaskResult>,
    expected: &'static str,
) -> Result<&'a [EntityError], TaskError> {
    match result {
        Some(SyncTaskResult::Error(error)) => Err(error.clone().into()),
        Some(
            SyncTaskResult::Create { errors }
            | SyncTaskResult::Upsert { errors }
            | SyncTaskResult::Merge { errors }
            | SyncTaskResult::Delete { errors },
        ) if result.map(SyncTaskResult::kind) == Some(expected) => Ok(errors.as_slice()),
        Some(other) => Err(unexpected_result(other, expected)),
        None => Err(TaskError::new(
            TaskErrorKind::InvalidResponse,
            format!("missing {expected} result"),
        )),
    }
}

fn unexpected_result(result: &SyncTaskResult, expected: &str) -> TaskError {
    TaskError::new(
        TaskErrorKind::InvalidResponse,
        format!("expected {expected} result, got {}", result.kind()),
    )
}

fn keyed(errors: &[EntityError]) -> EntityErrors {
    errors.iter().map(|e| (e.key.clone(), e.clone())).collect()
}

impl SyncContext {
    /// Detach the pending queue into a batch.
    pub(crate) fn detach(&self) -> Batch {
        let cells = self.queue.detach();
        let (seq, event_ack) = {
            let mut tracker = self.tracker.lock();
            (tracker.next_seq(), tracker.take_event_ack())
        };
        let mut tasks = Vec::new();
        let mut entries = Vec::with_capacity(cells.len());
        for cell in cells {
            let start = tasks.len();
            let plan = self.plan_task(&cell, &mut tasks);
            entries.push(BatchEntry {
                cell,
                wire: start..tasks.len(),
                plan,
            });
        }
        debug!(seq, tasks = entries.len(), wire_tasks = tasks.len(), "detached batch");
        let wire_len = tasks.len();
        let request = SyncRequest {
            seq,
            client_id: self.client_id(),
            user_id: self.header.user_id.clone(),
            token: self.header.token.clone(),
            database: self.header.database.clone(),
            event_ack,
            tasks,
        };
        Batch {
            seq,
            entries,
            request: Some(request),
            wire_len,
        }
    }

    fn key_field(&self, container: &str) -> Option<String> {
        self.registry
            .get(container)
            .map(|store| store.key_field())
            .filter(|field| *field != DEFAULT_KEY_FIELD)
            .map(str::to_string)
    }

    fn plan_task(&self, cell: &TaskCell, tasks: &mut Vec<SyncRequestTask>) -> EntryPlan {
        let kind = cell.lock().kind.clone();
        let task = match kind {
            TaskKind::Create {
                container,
                entities,
            } => SyncRequestTask::Create {
                key_field: self.key_field(&container),
                container,
                entities: entities.into_iter().map(|(_, payload)| payload).collect(),
            },
            TaskKind::Upsert {
                container,
                entities,
            } => SyncRequestTask::Upsert {
                key_field: self.key_field(&container),
                container,
                entities: entities.into_iter().map(|(_, payload)| payload).collect(),
            },
            TaskKind::Read { container, ids } => SyncRequestTask::Read {
                key_field: self.key_field(&container),
                container,
                ids,
                references: build_refs(cell),
            },
            TaskKind::Query {
                container,
                filter,
                max_count,
                cursor,
            } => SyncRequestTask::Query {
                key_field: self.key_field(&container),
                container,
                filter,
                max_count,
                cursor,
                references: build_refs(cell),
            },
            TaskKind::Delete { container, ids } => SyncRequestTask::Delete { container, ids },
            TaskKind::DeleteAll { container } => SyncRequestTask::DeleteAll { container },
            TaskKind::Count { container, filter } => SyncRequestTask::Count { container, filter },
            TaskKind::SubscribeChanges {
                container,
                changes,
                filter,
            } => SyncRequestTask::SubscribeChanges {
                container,
                changes,
                filter,
            },
            TaskKind::SubscribeMessage { name, remove } => {
                SyncRequestTask::SubscribeMessage { name, remove }
            }
            TaskKind::ReserveKeys { container, count } => {
                SyncRequestTask::ReserveKeys { container, count }
            }
            TaskKind::CloseCursors { container, cursors } => {
                SyncRequestTask::CloseCursors { container, cursors }
            }
            TaskKind::Command { name, param } => SyncRequestTask::Command { name, param },
            TaskKind::Message { name, param } => SyncRequestTask::Message { name, param },
            TaskKind::ReadRefs { .. } => return EntryPlan::Chain,
            TaskKind::DetectPatches { scope } => {
                return self.plan_detect_task(detect(&self.registry, &scope), tasks);
            }
            TaskKind::Patch { container, members } => {
                let parts = detect_members(&self.registry, &container, &members);
                return self.plan_detect_task(parts, tasks);
            }
        };
        tasks.push(task);
        EntryPlan::Wire
    }

    /// Plan the writes of detected changes.
    ///
    /// Keys named by the task must still be tracked; otherwise the task fails
    /// as a whole and the detected writes are released.
    fn plan_detect_task(
        &self,
        parts: Vec<DetectedPart>,
        tasks: &mut Vec<SyncRequestTask>,
    ) -> EntryPlan {
        let missing = parts.iter().find_map(|part| {
            part.changes
                .missing
                .first()
                .map(|key| (part.container.as_str(), key))
        });
        if let Some((container, key)) = missing {
            let error = TaskError::new(
                TaskErrorKind::InvalidTask,
                format!("entity '{key}' is not tracked in '{container}'"),
            );
            warn!(%container, %key, "patch of untracked entity");
            for part in &parts {
                self.release_part(part);
            }
            return EntryPlan::Rejected(error);
        }
        EntryPlan::Detect(plan_detect(parts, tasks))
    }

    /// Apply the outcome of a round trip and report the task results.
    #[instrument(skip_all, fields(seq = batch.seq))]
    pub(crate) fn complete(
        &self,
        batch: Batch,
        outcome: Result<SyncResponse, BatchError>,
    ) -> SyncResult {
        let expected = batch.wire_len;
        let outcome = outcome.and_then(|response| {
            if response.tasks.len() == expected {
                Ok(response)
            } else {
                Err(BatchError::ResponseMismatch {
                    expected,
                    actual: response.tasks.len(),
                })
            }
        });
        let batch_error = match outcome {
            Ok(response) => {
                self.apply_response(&batch, &response);
                None
            }
            Err(error) => {
                warn!("batch failed: {error}");
                self.fail_batch(&batch, &error);
                Some(error)
            }
        };
        self.tracker.lock().record_complete(batch_error.is_none());
        let result = SyncResult::collect(batch.seq, &batch.entries, batch_error);
        debug!(failed = result.failed.len(), "completed batch");
        result
    }

    fn apply_response(&self, batch: &Batch, response: &SyncResponse) {
        if let Some(client_id) = &response.client_id {
            self.set_client_id(client_id);
        }
        let mut errors = SectionErrors::default();
        for section in &response.containers {
            match self.registry.get(&section.container) {
                Some(store) => errors.insert(&section.container, store.apply_section(section)),
                None => {
                    warn!(container = %section.container, "entities of unknown container");
                    errors.insert(&section.container, section.errors.clone());
                }
            }
        }
        for entry in &batch.entries {
            match &entry.plan {
                EntryPlan::Wire => {
                    let result = response.tasks.get(entry.wire.start);
                    self.apply_result(&entry.cell, result, &errors);
                }
                EntryPlan::Chain => {}
                EntryPlan::Detect(plans) => self.apply_detect(&entry.cell, plans, &response.tasks),
                EntryPlan::Rejected(error) => entry.cell.fail(error.clone()),
            }
        }
        // a chain is settled by its source, which always shares its batch
        for entry in &batch.entries {
            if matches!(entry.plan, EntryPlan::Chain) && entry.cell.state() == TaskState::Pending {
                entry.cell.fail(TaskError::new(
                    TaskErrorKind::InvalidResponse,
                    "source task produced no references result",
                ));
            }
        }
    }

    fn apply_result(
        &self,
        cell: &TaskCell,
        result: Option<&SyncTaskResult>,
        errors: &SectionErrors,
    ) {
        let kind = cell.lock().kind.clone();
        trace!(task = cell.id(), kind = %kind.describe(), "apply result");
        let Some(result) = result else {
            cell.fail_with_chains(&TaskError::new(
                TaskErrorKind::InvalidResponse,
                "missing task result",
            ));
            return;
        };
        match (kind, result) {
            (TaskKind::Create { container, entities }, result) => {
                let outcome = write_outcome(Some(result), "create");
                self.settle_writes(cell, &container, entities_of(&entities), outcome);
            }
            (TaskKind::Upsert { container, entities }, result) => {
                let outcome = write_outcome(Some(result), "upsert");
                self.settle_writes(cell, &container, entities_of(&entities), outcome);
            }
            (_, SyncTaskResult::Error(error)) => cell.fail_with_chains(&error.clone().into()),
            (TaskKind::Read { container, ids }, SyncTaskResult::Read { references }) => {
                let entity_errors = errors.for_keys(&container, &ids);
                cell.finish(TaskOutput::Keys(ids), entity_errors);
                complete_chains(cell, references, errors);
            }
            (
                TaskKind::Query { container, .. },
                SyncTaskResult::Query {
                    ids,
                    cursor,
                    references,
                },
            ) => {
                let entity_errors = errors.for_keys(&container, ids);
                let output = TaskOutput::Query {
                    ids: ids.clone(),
                    cursor: cursor.clone(),
                };
                cell.finish(output, entity_errors);
                complete_chains(cell, references, errors);
            }
            (TaskKind::Delete { container, ids }, SyncTaskResult::Delete { errors: failed }) => {
                let failed = keyed(failed);
                if let Some(store) = self.registry.get(&container) {
                    for key in ids.iter().filter(|k| !failed.contains_key(*k)) {
                        store.remove(key);
                    }
                    for error in failed.values() {
                        store.set_error(error);
                    }
                }
                cell.finish(TaskOutput::None, failed);
            }
            (TaskKind::DeleteAll { container }, SyncTaskResult::DeleteAll) => {
                if let Some(store) = self.registry.get(&container) {
                    store.clear();
                }
                cell.succeed(TaskOutput::None);
            }
            (TaskKind::Count { .. }, SyncTaskResult::Count { count }) => {
                cell.succeed(TaskOutput::Count(*count));
            }
            (
                TaskKind::SubscribeChanges {
                    container, changes, ..
                },
                SyncTaskResult::SubscribeChanges,
            ) => {
                if let Some(store) = self.registry.get(&container) {
                    store.set_subscription(changes);
                }
                cell.succeed(TaskOutput::None);
            }
            (TaskKind::SubscribeMessage { .. }, SyncTaskResult::SubscribeMessage)
            | (TaskKind::Message { .. }, SyncTaskResult::Message) => {
                cell.succeed(TaskOutput::None);
            }
            (TaskKind::ReserveKeys { .. }, SyncTaskResult::ReserveKeys { keys }) => {
                cell.succeed(TaskOutput::ReservedKeys(keys.clone()));
            }
            (TaskKind::CloseCursors { .. }, SyncTaskResult::CloseCursors { count }) => {
                cell.succeed(TaskOutput::ClosedCursors(*count));
            }
            (TaskKind::Command { .. }, SyncTaskResult::Command { result }) => {
                cell.succeed(TaskOutput::Command(result.clone()));
            }
            (kind, result) => {
                warn!(task = cell.id(), "unexpected {} result", result.kind());
                cell.fail_with_chains(&unexpected_result(result, &kind.describe()));
            }
        }
    }

    /// Commit or roll back the snapshots sent by a write.
    fn settle_writes<'a>(
        &self,
        cell: &TaskCell,
        container: &str,
        items: impl Iterator<Item = (&'a JsonKey, &'a Value)>,
        outcome: Result<&[EntityError], TaskError>,
    ) {
        match self.settle(container, items, outcome) {
            Ok(failed) => cell.finish(TaskOutput::None, failed),
            Err(error) => cell.fail(error),
        }
    }

    fn settle<'a>(
        &self,
        container: &str,
        items: impl Iterator<Item = (&'a JsonKey, &'a Value)>,
        outcome: Result<&[EntityError], TaskError>,
    ) -> Result<EntityErrors, TaskError> {
        let store = self.registry.get(container);
        match outcome {
            Ok(failed) => {
                let failed = keyed(failed);
                if let Some(store) = store {
                    for (key, sent) in items {
                        match failed.get(key) {
                            Some(error) => {
                                store.rollback(key, sent);
                                store.set_error(error);
                            }
                            None => store.commit(key, sent),
                        }
                    }
                }
                Ok(failed)
            }
            Err(error) => {
                self.rollback_all(container, items);
                Err(error)
            }
        }
    }

    fn apply_detect(&self, cell: &TaskCell, plans: &[DetectPlan], results: &[SyncTaskResult]) {
        let mut entity_errors = EntityErrors::new();
        let mut task_error = None;
        for plan in plans {
            let changes = &plan.part.changes;
            entity_errors.extend(keyed(&changes.errors));
            let container = &plan.part.container;
            if let Some(index) = plan.merge_at {
                let outcome = write_outcome(results.get(index), "merge");
                let items = changes.patches.iter().map(|(patch, sent)| (&patch.key, sent));
                match self.settle(container, items, outcome) {
                    Ok(failed) => entity_errors.extend(failed),
                    Err(error) => {
                        task_error.get_or_insert(error);
                    }
                }
            }
            if let Some(index) = plan.create_at {
                let outcome = write_outcome(results.get(index), "create");
                match self.settle(container, entities_of(&changes.creates), outcome) {
                    Ok(failed) => entity_errors.extend(failed),
                    Err(error) => {
                        task_error.get_or_insert(error);
                    }
                }
            }
        }
        let output = TaskOutput::Patches(plans.iter().map(|plan| plan.part.summary()).collect());
        match task_error {
            Some(error) => {
                cell.lock().output = output;
                cell.fail(error);
            }
            None => cell.finish(output, entity_errors),
        }
    }

    fn fail_batch(&self, batch: &Batch, error: &BatchError) {
        let task_error = TaskError::from_batch(error);
        for entry in &batch.entries {
            self.release_snapshots(entry);
            match &entry.plan {
                EntryPlan::Rejected(error) => entry.cell.fail(error.clone()),
                _ => entry.cell.fail(task_error.clone()),
            }
        }
    }

    /// Release snapshots reserved by the writes of a failed batch.
    fn release_snapshots(&self, entry: &BatchEntry) {
        match &entry.plan {
            EntryPlan::Detect(plans) => {
                for plan in plans {
                    self.release_part(&plan.part);
                }
            }
            EntryPlan::Wire => {
                let cell = entry.cell.lock();
                if let TaskKind::Create {
                    container,
                    entities,
                }
                | TaskKind::Upsert {
                    container,
                    entities,
                } = &cell.kind
                {
                    self.rollback_all(container, entities_of(entities));
                }
            }
            EntryPlan::Chain | EntryPlan::Rejected(_) => {}
        }
    }

    fn release_part(&self, part: &DetectedPart) {
        let changes = &part.changes;
        let patches = changes.patches.iter().map(|(p, sent)| (&p.key, sent));
        self.rollback_all(&part.container, patches);
        self.rollback_all(&part.container, entities_of(&changes.creates));
    }

    fn rollback_all<'a>(
        &self,
        container: &str,
        items: impl IntoIterator<Item = (&'a JsonKey, &'a Value)>,
    ) {
        if let Some(store) = self.registry.get(container) {
            for (key, sent) in items {
                store.rollback(key, sent);
            }
        }
    }
}

fn entities_of(entities: &[(JsonKey, Value)]) -> impl Iterator<Item = (&JsonKey, &Value)> {
    entities.iter().map(|(key, payload)| (key, payload))
}

/// Append the merge and create tasks of detected changes.
fn plan_detect(parts: Vec<DetectedPart>, tasks: &mut Vec<SyncRequestTask>) -> Vec<DetectPlan> {
    parts
        .into_iter()
        .map(|part| {
            let key_field =
                (part.key_field != DEFAULT_KEY_FIELD).then(|| part.key_field.to_string());
            let merge_at = (!part.changes.patches.is_empty()).then(|| {
                tasks.push(SyncRequestTask::Merge {
                    container: part.container.clone(),
                    key_field: key_field.clone(),
                    patches: part.changes.patches.iter().map(|(p, _)| p.clone()).collect(),
                });
                tasks.len() - 1
            });
            let create_at = (!part.changes.creates.is_empty()).then(|| {
                tasks.push(SyncRequestTask::Create {
                    container: part.container.clone(),
                    key_field: key_field.clone(),
                    entities: part.changes.creates.iter().map(|(_, v)| v.clone()).collect(),
                });
                tasks.len() - 1
            });
            DetectPlan {
                part,
                merge_at,
                create_at,
            }
        })
        .collect()
}
