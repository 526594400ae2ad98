//! Patch detector.
//!
//! Diffs tracked entities against their last synced snapshot and turns the
//! result into merge and create tasks of a batch.

mod detector;

pub use detector::ContainerPatches;
pub(crate) use detector::{DetectedPart, detect, detect_members, member_pointer};
