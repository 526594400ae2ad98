//! Reference resolver.
//!
//! Chained reads follow foreign keys selected from the entities of a read or
//! query task. They are sent nested in their source task, so a chain costs no
//! extra round trip and never executes when its source failed.

mod resolver;
pub mod selector;

pub(crate) use resolver::{build_refs, complete_chains, declare_chain};
pub use selector::{Selector, SelectorError};
