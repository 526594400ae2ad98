//! Pending task queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::task::{TaskCell, TaskKind};
use crate::core::TaskError;

/// Tasks queued since the last detach, in declaration order.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    tasks: Mutex<Vec<Arc<TaskCell>>>,
    next_id: AtomicU64,
}

impl TaskQueue {
    /// Queue a new task.
    pub fn push(&self, kind: TaskKind) -> Arc<TaskCell> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cell = Arc::new(TaskCell::new(id, kind));
        self.tasks.lock().push(cell.clone());
        cell
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Take every queued task, marking it detached.
    ///
    /// The queue is empty afterwards, so tasks for the next batch can be queued
    /// while the detached ones are in flight.
    pub fn detach(&self) -> Vec<Arc<TaskCell>> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for cell in &tasks {
            cell.lock().detached = true;
        }
        tasks
    }

    /// Fail every queued task with `error` and drop it.
    pub fn abort(&self, error: &TaskError) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for cell in tasks {
            cell.fail(error.clone());
        }
    }
}
