//! Subscription applier.
//!
//! Implements:
//! - Application of change events to containers with an active subscription
//! - Message dispatch through a name to handler table
//! - Immediate, runtime-bound and queued dispatch policies

mod applier;
mod dispatch;

pub(crate) use applier::SubscriptionApplier;
pub use applier::{AppliedEvent, MessageHandler};
pub use dispatch::{EventDispatch, EventSink};
