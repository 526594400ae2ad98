//! Patch operations on raw entity payloads.
//!
//! A patch is a list of path-scoped `replace`/`remove` operations. Paths are
//! JSON Pointers (RFC 6901). [`diff`] emits operations only for differing
//! fields: objects are compared member by member, arrays and scalars are
//! replaced as a whole. For any two payloads
//! `apply(baseline, diff(baseline, target)) == target`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::JsonKey;

/// Errors applying a patch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// The path is not a valid JSON Pointer.
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    /// A parent of the path does not exist.
    #[error("path not found '{0}'")]
    NotFound(String),

    /// The path addresses into a scalar value.
    #[error("invalid target at '{0}'")]
    InvalidTarget(String),
}

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Set the value at `path`, adding the member if missing.
    Replace {
        /// JSON Pointer to the target.
        path: String,
        /// New value.
        value: Value,
    },
    /// Remove the member at `path`.
    Remove {
        /// JSON Pointer to the target.
        path: String,
    },
}

impl PatchOp {
    /// Path the operation applies to.
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Replace { path, .. } | PatchOp::Remove { path } => path,
        }
    }
}

/// Patch of a single entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    /// Key of the patched entity.
    pub key: JsonKey,
    /// Operations, applied in order.
    pub ops: Vec<PatchOp>,
}

/// Build a JSON Pointer from path segments.
pub fn pointer<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&segment.as_ref().replace('~', "~0").replace('/', "~1"));
    }
    out
}

/// Split a JSON Pointer into unescaped segments.
pub fn segments(path: &str) -> Result<Vec<String>, PatchError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| PatchError::InvalidPath(path.to_string()))?;
    Ok(rest
        .split('/')
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Compute the operations transforming `baseline` into `target`.
pub fn diff(baseline: &Value, target: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    let mut path = Vec::new();
    diff_at(&mut ops, &mut path, baseline, target);
    ops
}

fn diff_at(ops: &mut Vec<PatchOp>, path: &mut Vec<String>, src: &Value, dst: &Value) {
    if src == dst {
        return;
    }
    match (src, dst) {
        (Value::Object(s), Value::Object(d)) => diff_object(ops, path, s, d),
        _ => ops.push(PatchOp::Replace {
            path: pointer(path),
            value: dst.clone(),
        }),
    }
}

fn diff_object(
    ops: &mut Vec<PatchOp>,
    path: &mut Vec<String>,
    src: &Map<String, Value>,
    dst: &Map<String, Value>,
) {
    for key in src.keys() {
        if !dst.contains_key(key) {
            path.push(key.clone());
            ops.push(PatchOp::Remove {
                path: pointer(path),
            });
            path.pop();
        }
    }
    for (key, dst_val) in dst {
        path.push(key.clone());
        match src.get(key) {
            Some(src_val) => diff_at(ops, path, src_val, dst_val),
            None => ops.push(PatchOp::Replace {
                path: pointer(path),
                value: dst_val.clone(),
            }),
        }
        path.pop();
    }
}

/// Apply operations to a payload in order.
///
/// On error the payload may be partially patched; callers apply to a copy.
pub fn apply(doc: &mut Value, ops: &[PatchOp]) -> Result<(), PatchError> {
    for op in ops {
        apply_op(doc, op)?;
    }
    Ok(())
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let path = op.path();
    let mut segs = segments(path)?;
    let Some(last) = segs.pop() else {
        // Root target
        match op {
            PatchOp::Replace { value, .. } => *doc = value.clone(),
            PatchOp::Remove { .. } => *doc = Value::Null,
        }
        return Ok(());
    };

    let mut parent = doc;
    for seg in &segs {
        parent = match parent {
            Value::Object(map) => map.get_mut(seg),
            Value::Array(arr) => seg.parse::<usize>().ok().and_then(|i| arr.get_mut(i)),
            _ => None,
        }
        .ok_or_else(|| PatchError::NotFound(path.to_string()))?;
    }

    match (parent, op) {
        (Value::Object(map), PatchOp::Replace { value, .. }) => {
            map.insert(last, value.clone());
        }
        (Value::Object(map), PatchOp::Remove { .. }) => {
            map.shift_remove(&last)
                .ok_or_else(|| PatchError::NotFound(path.to_string()))?;
        }
        (Value::Array(arr), op) => {
            let index = if last == "-" {
                arr.len()
            } else {
                last.parse::<usize>()
                    .map_err(|_| PatchError::InvalidPath(path.to_string()))?
            };
            match op {
                PatchOp::Replace { value, .. } if index < arr.len() => arr[index] = value.clone(),
                PatchOp::Replace { value, .. } if index == arr.len() => arr.push(value.clone()),
                PatchOp::Remove { .. } if index < arr.len() => {
                    arr.remove(index);
                }
                _ => return Err(PatchError::NotFound(path.to_string())),
            }
        }
        _ => return Err(PatchError::InvalidTarget(path.to_string())),
    }
    Ok(())
}
