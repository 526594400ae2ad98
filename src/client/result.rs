//! Outcome of a round trip.

use std::fmt::Write as _;

use thiserror::Error;

use crate::core::{BatchError, TaskError};
use crate::sync::{BatchEntry, TaskId, TaskState};

/// A task that failed in a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    /// Position of the task in its batch.
    pub index: usize,
    /// Task identifier.
    pub id: TaskId,
    /// Name or description of the task.
    pub label: String,
    /// Why it failed.
    pub error: TaskError,
}

/// Result of one round trip, as data.
///
/// A round trip succeeds only if every task succeeded. Tasks that succeeded
/// keep their results even if others failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// Sequence number of the batch.
    pub seq: u64,
    /// Number of tasks in the batch.
    pub task_count: usize,
    /// Failed tasks in batch order.
    pub failed: Vec<FailedTask>,
    /// Set if the round trip failed as a whole.
    pub batch_error: Option<BatchError>,
}

impl SyncResult {
    pub(crate) fn collect(
        seq: u64,
        entries: &[BatchEntry],
        batch_error: Option<BatchError>,
    ) -> Self {
        let failed = entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let inner = entry.cell.lock();
                if inner.state != TaskState::Failed {
                    return None;
                }
                Some(FailedTask {
                    index,
                    id: entry.cell.id(),
                    label: inner.label(),
                    error: inner.error.clone()?,
                })
            })
            .collect();
        Self {
            seq,
            task_count: entries.len(),
            failed,
            batch_error,
        }
    }

    /// Check if every task succeeded.
    pub fn success(&self) -> bool {
        self.batch_error.is_none() && self.failed.is_empty()
    }

    /// Human readable description of the failures, one task per line.
    ///
    /// ```text
    /// SyncTasks() failed with task errors. Count: 2
    /// |- #0 readArticles # EntityErrors ~ count: 1
    /// |   (ReadError) [a1] not readable
    /// |- #3 command app.Missing # NotImplemented ~ unknown command 'app.Missing'
    /// ```
    pub fn summary(&self) -> String {
        if let Some(error) = &self.batch_error {
            return format!("SyncTasks() failed: {error}");
        }
        if self.failed.is_empty() {
            return format!("SyncTasks() succeeded. Count: {}", self.task_count);
        }
        let mut summary = format!(
            "SyncTasks() failed with task errors. Count: {}",
            self.failed.len()
        );
        for task in &self.failed {
            let _ = write!(summary, "\n|- #{} {} # {}", task.index, task.label, task.error);
        }
        summary
    }

    /// Convert into a `Result`, failing if any task failed.
    pub fn into_result(self) -> Result<SyncResult, SyncTasksError> {
        if self.success() {
            Ok(self)
        } else {
            Err(SyncTasksError(self))
        }
    }
}

/// A round trip with failed tasks.
#[derive(Debug, Clone, Error)]
#[error("{}", .0.summary())]
pub struct SyncTasksError(pub SyncResult);

impl SyncTasksError {
    /// The failed round trip.
    pub fn result(&self) -> &SyncResult {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityError, EntityErrorKind, EntityErrors, TaskErrorKind};

    fn failed(index: usize, label: &str, error: TaskError) -> FailedTask {
        FailedTask {
            index,
            id: index as TaskId + 1,
            label: label.to_string(),
            error,
        }
    }

    #[test]
    fn test_summary_lists_failed_tasks() {
        let errors = EntityErrors::from([(
            "a1".into(),
            EntityError::new(EntityErrorKind::ReadError, "a1".into(), "not readable"),
        )]);
        let result = SyncResult {
            seq: 1,
            task_count: 4,
            failed: vec![
                failed(0, "readArticles", TaskError::from_entities(errors)),
                failed(
                    3,
                    "command app.Missing",
                    TaskError::new(TaskErrorKind::NotImplemented, "unknown command 'app.Missing'"),
                ),
            ],
            batch_error: None,
        };
        assert!(!result.success());
        assert_eq!(
            result.summary(),
            "SyncTasks() failed with task errors. Count: 2\n\
             |- #0 readArticles # EntityErrors ~ count: 1\n\
             |   (ReadError) [a1] not readable\n\
             |- #3 command app.Missing # NotImplemented ~ unknown command 'app.Missing'"
        );
    }

    #[test]
    fn test_into_result() {
        let ok = SyncResult {
            seq: 1,
            task_count: 2,
            failed: vec![],
            batch_error: None,
        };
        assert!(ok.clone().into_result().is_ok());

        let cancelled = SyncResult {
            batch_error: Some(BatchError::Cancelled),
            ..ok
        };
        let err = cancelled.into_result().unwrap_err();
        assert_eq!(err.to_string(), "SyncTasks() failed: batch cancelled");
        assert_eq!(err.result().seq, 1);
    }
}
