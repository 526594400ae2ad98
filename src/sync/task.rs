//! Task model.
//!
//! Every queued operation is a [`TaskCell`]: a shared header (id, name, state,
//! error, output) plus a [`TaskKind`] describing what to send. Typed handles in
//! [`super::handles`] wrap a cell and decode its output on access.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;

use crate::core::{EntityErrors, JsonKey, TaskError};
use crate::patch::ContainerPatches;
use crate::protocol::ChangeKinds;

/// Identifier of a task, unique per client.
pub type TaskId = u64;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Queued or in flight.
    Pending,
    /// Synced without error.
    Success,
    /// Synced with a task error.
    Failed,
}

/// Which containers a patch detection scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PatchScope {
    /// Every opened container.
    All,
    /// One container, optionally restricted to some keys.
    Container {
        container: String,
        keys: Option<Vec<JsonKey>>,
    },
}

/// What a task does.
#[derive(Debug, Clone)]
pub(crate) enum TaskKind {
    Create {
        container: String,
        entities: Vec<(JsonKey, Value)>,
    },
    Upsert {
        container: String,
        entities: Vec<(JsonKey, Value)>,
    },
    Read {
        container: String,
        ids: Vec<JsonKey>,
    },
    Query {
        container: String,
        filter: String,
        max_count: Option<u32>,
        cursor: Option<String>,
    },
    Delete {
        container: String,
        ids: Vec<JsonKey>,
    },
    DeleteAll {
        container: String,
    },
    Count {
        container: String,
        filter: String,
    },
    SubscribeChanges {
        container: String,
        changes: ChangeKinds,
        filter: Option<String>,
    },
    SubscribeMessage {
        name: String,
        remove: bool,
    },
    ReserveKeys {
        container: String,
        count: u32,
    },
    CloseCursors {
        container: String,
        cursors: Vec<String>,
    },
    Command {
        name: String,
        param: Value,
    },
    Message {
        name: String,
        param: Value,
    },
    /// Follow foreign keys selected from the entities of the source task.
    ReadRefs {
        selector: String,
        container: String,
        key_field: &'static str,
    },
    DetectPatches {
        scope: PatchScope,
    },
    /// Patch selected members of single entities.
    Patch {
        container: String,
        members: IndexMap<JsonKey, Vec<String>>,
    },
}

impl TaskKind {
    /// Short description used as default task label.
    pub fn describe(&self) -> String {
        match self {
            TaskKind::Create { container, entities } => {
                format!("create {container} ({})", entities.len())
            }
            TaskKind::Upsert { container, entities } => {
                format!("upsert {container} ({})", entities.len())
            }
            TaskKind::Read { container, ids } => format!("read {container} ({})", ids.len()),
            TaskKind::Query { container, filter, .. } => format!("query {container} '{filter}'"),
            TaskKind::Delete { container, ids } => format!("delete {container} ({})", ids.len()),
            TaskKind::DeleteAll { container } => format!("deleteAll {container}"),
            TaskKind::Count { container, filter } => format!("count {container} '{filter}'"),
            TaskKind::SubscribeChanges { container, .. } => format!("subscribeChanges {container}"),
            TaskKind::SubscribeMessage { name, remove } => {
                if *remove {
                    format!("unsubscribeMessage {name}")
                } else {
                    format!("subscribeMessage {name}")
                }
            }
            TaskKind::ReserveKeys { container, count } => {
                format!("reserveKeys {container} ({count})")
            }
            TaskKind::CloseCursors { container, .. } => format!("closeCursors {container}"),
            TaskKind::Command { name, .. } => format!("command {name}"),
            TaskKind::Message { name, .. } => format!("message {name}"),
            TaskKind::ReadRefs {
                selector, container, ..
            } => format!("readRefs {container} {selector}"),
            TaskKind::DetectPatches { scope } => match scope {
                PatchScope::All => "detectPatches".to_string(),
                PatchScope::Container { container, .. } => format!("detectPatches {container}"),
            },
            TaskKind::Patch { container, members } => {
                format!("patch {container} ({})", members.len())
            }
        }
    }

    /// Check if chained reads can be declared on this task.
    pub fn accepts_refs(&self) -> bool {
        matches!(
            self,
            TaskKind::Read { .. } | TaskKind::Query { .. } | TaskKind::ReadRefs { .. }
        )
    }
}

/// Result data of a synced task.
#[derive(Debug, Clone, Default)]
pub(crate) enum TaskOutput {
    #[default]
    None,
    /// Keys of a read or a followed reference.
    Keys(Vec<JsonKey>),
    /// Keys and continuation cursor of a query.
    Query {
        ids: Vec<JsonKey>,
        cursor: Option<String>,
    },
    Count(u64),
    ReservedKeys(Vec<i64>),
    ClosedCursors(u32),
    Command(Value),
    Patches(Vec<ContainerPatches>),
}

/// Mutable part of a task.
#[derive(Debug)]
pub(crate) struct CellInner {
    pub kind: TaskKind,
    pub name: Option<String>,
    pub state: TaskState,
    /// Taken out of the pending queue by a batch.
    pub detached: bool,
    pub error: Option<TaskError>,
    pub output: TaskOutput,
    /// Chained reads keyed by (selector, container).
    pub refs: IndexMap<(String, String), Arc<TaskCell>>,
}

impl CellInner {
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.kind.describe())
    }
}

/// A queued task shared by its handles and the batch executing it.
#[derive(Debug)]
pub(crate) struct TaskCell {
    id: TaskId,
    inner: Mutex<CellInner>,
}

impl TaskCell {
    pub fn new(id: TaskId, kind: TaskKind) -> Self {
        Self {
            id,
            inner: Mutex::new(CellInner {
                kind,
                name: None,
                state: TaskState::Pending,
                detached: false,
                error: None,
                output: TaskOutput::None,
                refs: IndexMap::new(),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, CellInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// User assigned name, or a description of the task.
    pub fn label(&self) -> String {
        self.inner.lock().label()
    }

    pub fn succeed(&self, output: TaskOutput) {
        let mut inner = self.inner.lock();
        inner.state = TaskState::Success;
        inner.output = output;
        inner.error = None;
    }

    /// Fail the task, keeping any output gathered so far.
    pub fn fail(&self, error: TaskError) {
        let mut inner = self.inner.lock();
        inner.state = TaskState::Failed;
        inner.error = Some(error);
    }

    /// Complete the task, failing it if some entities failed.
    pub fn finish(&self, output: TaskOutput, errors: EntityErrors) {
        if errors.is_empty() {
            self.succeed(output);
        } else {
            self.lock().output = output;
            self.fail(TaskError::from_entities(errors));
        }
    }

    /// Fail the task and, recursively, its chained reads with the same error.
    pub fn fail_with_chains(&self, error: &TaskError) {
        self.fail(error.clone());
        let chains: Vec<_> = self.inner.lock().refs.values().cloned().collect();
        for chain in chains {
            chain.fail_with_chains(error);
        }
    }

    /// Chained reads in declaration order.
    pub fn chains(&self) -> Vec<Arc<TaskCell>> {
        self.inner.lock().refs.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskErrorKind;

    fn read_cell(id: TaskId) -> TaskCell {
        TaskCell::new(
            id,
            TaskKind::Read {
                container: "articles".into(),
                ids: vec![JsonKey::from("a1")],
            },
        )
    }

    #[test]
    fn test_label_defaults_to_description() {
        let cell = read_cell(1);
        assert_eq!(cell.label(), "read articles (1)");
        cell.lock().name = Some("readArticles".into());
        assert_eq!(cell.label(), "readArticles");
    }

    #[test]
    fn test_state_transitions() {
        let cell = read_cell(1);
        assert_eq!(cell.state(), TaskState::Pending);
        cell.succeed(TaskOutput::Count(3));
        assert_eq!(cell.state(), TaskState::Success);
        cell.fail(TaskError::new(TaskErrorKind::DatabaseError, "down"));
        assert_eq!(cell.state(), TaskState::Failed);
        assert!(matches!(cell.lock().output, TaskOutput::Count(3)));
    }

    #[test]
    fn test_fail_with_chains() {
        let source = read_cell(1);
        let chain = Arc::new(TaskCell::new(
            2,
            TaskKind::ReadRefs {
                selector: ".producer".into(),
                container: "producers".into(),
                key_field: "id",
            },
        ));
        source
            .lock()
            .refs
            .insert((".producer".into(), "producers".into()), chain.clone());

        let error = TaskError::new(TaskErrorKind::FilterError, "bad");
        source.fail_with_chains(&error);
        assert_eq!(chain.state(), TaskState::Failed);
        assert_eq!(chain.lock().error, Some(error));
    }

    #[test]
    fn test_accepts_refs() {
        assert!(read_cell(1).lock().kind.accepts_refs());
        let count = TaskKind::Count {
            container: "articles".into(),
            filter: "true".into(),
        };
        assert!(!count.accepts_refs());
    }
}
