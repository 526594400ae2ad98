//! Patch detection.
//!
//! Detection is pull based: the current value of each tracked peer is encoded
//! and diffed against the snapshot it was last synced with. Peers never synced
//! are created instead of patched. Detection runs when a batch is detached, so
//! the patches reflect the entities at send time.

use indexmap::IndexMap;
use tracing::trace;

use crate::cache::{ContainerRegistry, DetectedChanges};
use crate::core::{ClientError, JsonKey};
use crate::protocol::EntityPatch;
use crate::protocol::patch::pointer;
use crate::sync::PatchScope;

/// Patches and creates detected in one container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerPatches {
    /// Container name.
    pub container: String,
    /// Patches of synced entities.
    pub patches: Vec<EntityPatch>,
    /// Keys of entities created because they were never synced.
    pub created: Vec<JsonKey>,
}

impl ContainerPatches {
    /// Check if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.created.is_empty()
    }
}

/// Changes detected in one container at detach time.
#[derive(Debug)]
pub(crate) struct DetectedPart {
    pub container: String,
    pub key_field: &'static str,
    pub changes: DetectedChanges,
}

impl DetectedPart {
    pub fn summary(&self) -> ContainerPatches {
        ContainerPatches {
            container: self.container.clone(),
            patches: self.changes.patches.iter().map(|(p, _)| p.clone()).collect(),
            created: self.changes.creates.iter().map(|(k, _)| k.clone()).collect(),
        }
    }
}

/// Detect changes of every peer in scope.
pub(crate) fn detect(registry: &ContainerRegistry, scope: &PatchScope) -> Vec<DetectedPart> {
    let stores = match scope {
        PatchScope::All => registry.all(),
        PatchScope::Container { container, .. } => registry.get(container).into_iter().collect(),
    };
    let keys = match scope {
        PatchScope::Container {
            keys: Some(keys), ..
        } => Some(keys.as_slice()),
        _ => None,
    };
    stores
        .into_iter()
        .map(|store| {
            let changes = store.detect(keys);
            if !changes.is_empty() {
                trace!(
                    container = store.name(),
                    patches = changes.patches.len(),
                    creates = changes.creates.len(),
                    "detected changes"
                );
            }
            DetectedPart {
                container: store.name().to_string(),
                key_field: store.key_field(),
                changes,
            }
        })
        .collect()
}

/// Detect changes of selected members of single entities.
pub(crate) fn detect_members(
    registry: &ContainerRegistry,
    container: &str,
    members: &IndexMap<JsonKey, Vec<String>>,
) -> Vec<DetectedPart> {
    registry
        .get(container)
        .map(|store| DetectedPart {
            container: store.name().to_string(),
            key_field: store.key_field(),
            changes: store.detect_members(members),
        })
        .into_iter()
        .collect()
}

/// Convert a member path like `address.city` into a JSON pointer.
///
/// Paths already starting with `/` are taken as pointers.
pub(crate) fn member_pointer(path: &str) -> Result<String, ClientError> {
    if path.starts_with('/') {
        return Ok(path.to_string());
    }
    let segments: Vec<&str> = path.trim_start_matches('.').split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ClientError::InvalidArgument(format!(
            "invalid member path '{path}'"
        )));
    }
    Ok(pointer(&segments))
}
