//! Chained read declaration, request building and result distribution.

use std::sync::Arc;

use super::selector::Selector;
use crate::core::constants::DEFAULT_KEY_FIELD;
use crate::core::{ClientError, TaskError, TaskErrorKind};
use crate::protocol::{ReferencesResult, RefsRequest};
use crate::sync::{SectionErrors, TaskCell, TaskKind, TaskOutput, TaskQueue, TaskState};

/// Declare a chained read on `source`.
///
/// Declaring the same selector and container twice returns the first chain.
/// Fails if `source` is no longer pending in the queue.
pub(crate) fn declare_chain(
    queue: &TaskQueue,
    source: &Arc<TaskCell>,
    selector: &str,
    container: &str,
    key_field: &'static str,
) -> Result<Arc<TaskCell>, ClientError> {
    Selector::parse(selector).map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
    let mut inner = source.lock();
    if inner.detached || inner.state != TaskState::Pending {
        drop(inner);
        return Err(ClientError::SourceAlreadySynced {
            task: source.label(),
        });
    }
    if !inner.kind.accepts_refs() {
        return Err(ClientError::InvalidArgument(format!(
            "references cannot be read from '{}'",
            inner.kind.describe()
        )));
    }
    let key = (selector.to_string(), container.to_string());
    if let Some(chain) = inner.refs.get(&key) {
        return Ok(chain.clone());
    }
    let chain = queue.push(TaskKind::ReadRefs {
        selector: selector.to_string(),
        container: container.to_string(),
        key_field,
    });
    inner.refs.insert(key, chain.clone());
    Ok(chain)
}

/// Nested reference requests of a read or query task.
pub(crate) fn build_refs(cell: &TaskCell) -> Vec<RefsRequest> {
    cell.chains()
        .iter()
        .filter_map(|chain| {
            let (selector, container, key_field) = match &chain.lock().kind {
                TaskKind::ReadRefs {
                    selector,
                    container,
                    key_field,
                } => (selector.clone(), container.clone(), *key_field),
                _ => return None,
            };
            Some(RefsRequest {
                selector,
                container,
                key_field: (key_field != DEFAULT_KEY_FIELD).then(|| key_field.to_string()),
                references: build_refs(chain),
            })
        })
        .collect()
}

/// Complete the chains of `cell` from the reference results of its source task.
pub(crate) fn complete_chains(cell: &TaskCell, results: &[ReferencesResult], errors: &SectionErrors) {
    for chain in cell.chains() {
        let target = match &chain.lock().kind {
            TaskKind::ReadRefs {
                selector, container, ..
            } => Some((selector.clone(), container.clone())),
            _ => None,
        };
        let Some((selector, container)) = target else {
            continue;
        };
        match results
            .iter()
            .find(|r| r.selector == selector && r.container == container)
        {
            Some(result) => complete_chain(&chain, result, errors),
            None => chain.fail_with_chains(&TaskError::new(
                TaskErrorKind::InvalidResponse,
                format!("missing references result for '{selector}' in {container}"),
            )),
        }
    }
}

fn complete_chain(chain: &TaskCell, result: &ReferencesResult, errors: &SectionErrors) {
    if let Some(error) = &result.error {
        // only the chain fails, its source keeps its own outcome
        chain.fail_with_chains(&error.clone().into());
        return;
    }
    let entity_errors = errors.for_keys(&result.container, &result.ids);
    chain.finish(TaskOutput::Keys(result.ids.clone()), entity_errors);
    complete_chains(chain, &result.references, errors);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityError, EntityErrorKind, JsonKey};
    use crate::protocol::TaskErrorResult;

    fn read(queue: &TaskQueue) -> Arc<TaskCell> {
        queue.push(TaskKind::Read {
            container: "orders".into(),
            ids: vec![JsonKey::Int(1)],
        })
    }

    #[test]
    fn test_declare_chain_dedup() {
        let queue = TaskQueue::default();
        let source = read(&queue);
        let a = declare_chain(&queue, &source, ".customer", "customers", "id").unwrap();
        let b = declare_chain(&queue, &source, ".customer", "customers", "id").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(queue.len(), 2);

        let c = declare_chain(&queue, &source, ".items[*].article", "articles", "id").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(build_refs(&source).len(), 2);
    }

    #[test]
    fn test_declare_on_detached_source() {
        let queue = TaskQueue::default();
        let source = read(&queue);
        queue.detach();
        let err = declare_chain(&queue, &source, ".customer", "customers", "id").unwrap_err();
        assert!(matches!(err, ClientError::SourceAlreadySynced { .. }));
    }

    #[test]
    fn test_invalid_selector() {
        let queue = TaskQueue::default();
        let source = read(&queue);
        let err = declare_chain(&queue, &source, ".", "customers", "id").unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn test_nested_refs_request() {
        let queue = TaskQueue::default();
        let source = read(&queue);
        let chain = declare_chain(&queue, &source, ".items[*].article", "articles", "id").unwrap();
        declare_chain(&queue, &chain, ".producer", "producers", "code").unwrap();

        let refs = build_refs(&source);
        assert_eq!(refs[0].container, "articles");
        assert_eq!(refs[0].key_field, None);
        assert_eq!(refs[0].references[0].selector, ".producer");
        assert_eq!(refs[0].references[0].key_field.as_deref(), Some("code"));
    }

    #[test]
    fn test_complete_chains() {
        let queue = TaskQueue::default();
        let source = read(&queue);
        let ok = declare_chain(&queue, &source, ".customer", "customers", "id").unwrap();
        let failing = declare_chain(&queue, &source, ".items[*].article", "articles", "id").unwrap();
        let missing = declare_chain(&queue, &source, ".seller", "sellers", "id").unwrap();

        let mut errors = SectionErrors::default();
        errors.insert(
            "customers",
            vec![EntityError::new(EntityErrorKind::ReadError, "c2".into(), "io")],
        );
        let results = vec![
            ReferencesResult {
                selector: ".customer".into(),
                container: "customers".into(),
                ids: vec![JsonKey::from("c1")],
                error: None,
                references: vec![],
            },
            ReferencesResult {
                selector: ".items[*].article".into(),
                container: "articles".into(),
                ids: vec![],
                error: Some(TaskErrorResult {
                    kind: TaskErrorKind::DatabaseError,
                    message: "articles offline".into(),
                }),
                references: vec![],
            },
        ];
        complete_chains(&source, &results, &errors);

        assert_eq!(ok.state(), TaskState::Success);
        assert_eq!(failing.state(), TaskState::Failed);
        assert_eq!(
            failing.lock().error.as_ref().map(|e| e.kind),
            Some(TaskErrorKind::DatabaseError)
        );
        assert_eq!(
            missing.lock().error.as_ref().map(|e| e.kind),
            Some(TaskErrorKind::InvalidResponse)
        );
        // the source is completed by its own result
        assert_eq!(source.state(), TaskState::Pending);
    }
}
