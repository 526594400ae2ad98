//! Applies inbound change events to the identity caches.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::cache::ContainerRegistry;
use crate::protocol::{EventMessage, MessageEvent};

/// Handler of a subscribed message.
pub type MessageHandler = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

/// Outcome of applying one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedEvent {
    /// Change records accepted by a container.
    pub changes: usize,
    /// Change records ignored for lack of an active subscription.
    pub ignored: usize,
    /// Messages passed to a handler.
    pub messages: usize,
}

/// Folds events into the caches, one event at a time.
///
/// Message handlers are registered by name. A name ending with `*` matches
/// every message starting with the part before it; exact names win over
/// prefixes.
#[derive(Default)]
pub(crate) struct SubscriptionApplier {
    serial: Mutex<()>,
    handlers: RwLock<IndexMap<String, MessageHandler>>,
}

impl SubscriptionApplier {
    pub fn register(&self, name: &str, handler: MessageHandler) {
        self.handlers.write().insert(name.to_string(), handler);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().shift_remove(name).is_some()
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn handler_for(&self, name: &str) -> Option<MessageHandler> {
        let handlers = self.handlers.read();
        if let Some(handler) = handlers.get(name) {
            return Some(handler.clone());
        }
        handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix('*')?;
                name.starts_with(prefix).then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler.clone())
    }

    /// Apply one event.
    ///
    /// Events are never applied concurrently. Handlers run on the applying
    /// thread and must not deliver events themselves.
    pub fn apply(&self, registry: &ContainerRegistry, event: &EventMessage) -> AppliedEvent {
        let _serial = self.serial.lock();
        let mut applied = AppliedEvent::default();
        for change in &event.changes {
            let accepted = registry
                .get(change.container())
                .is_some_and(|store| store.apply_change(change));
            if accepted {
                applied.changes += 1;
            } else {
                trace!(
                    seq = event.seq,
                    container = change.container(),
                    "change ignored without subscription"
                );
                applied.ignored += 1;
            }
        }
        for message in &event.messages {
            match self.handler_for(&message.name) {
                Some(handler) => {
                    handler(message);
                    applied.messages += 1;
                }
                None => warn!(seq = event.seq, name = %message.name, "no handler for message"),
            }
        }
        applied
    }
}
