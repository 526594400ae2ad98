//! Per-client sync context.
//!
//! Everything a client shares between task registration, batch completion and
//! event application lives here. There is no process-wide state: each client
//! owns exactly one context.

use std::collections::VecDeque;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::queue::TaskQueue;
use super::tracker::SyncTracker;
use crate::cache::ContainerRegistry;
use crate::client::ClientConfig;
use crate::core::{TaskError, TaskErrorKind};
use crate::protocol::EventMessage;
use crate::subscription::{AppliedEvent, SubscriptionApplier};

/// Request header fields taken from the client configuration.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestHeader {
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub database: Option<String>,
}

pub(crate) struct SyncContext {
    pub registry: ContainerRegistry,
    pub queue: TaskQueue,
    pub tracker: Mutex<SyncTracker>,
    pub applier: SubscriptionApplier,
    pub header: RequestHeader,
    queued_events: Mutex<VecDeque<EventMessage>>,
    client_id: RwLock<Option<String>>,
}

impl SyncContext {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            registry: ContainerRegistry::default(),
            queue: TaskQueue::default(),
            tracker: Mutex::new(SyncTracker::new()),
            applier: SubscriptionApplier::default(),
            header: RequestHeader {
                user_id: config.user_id.clone(),
                token: config.token.clone(),
                database: config.database.clone(),
            },
            queued_events: Mutex::new(VecDeque::new()),
            client_id: RwLock::new(config.client_id.clone()),
        }
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub fn set_client_id(&self, client_id: &str) {
        let mut current = self.client_id.write();
        if current.as_deref() != Some(client_id) {
            trace!(client_id, "client id assigned");
            *current = Some(client_id.to_string());
        }
    }

    /// Apply an event to the caches and record its sequence number.
    pub fn apply_event(&self, event: &EventMessage) -> AppliedEvent {
        let applied = self.applier.apply(&self.registry, event);
        self.tracker.lock().record_event(event.seq);
        trace!(seq = event.seq, ?applied, "applied event");
        applied
    }

    pub fn enqueue_event(&self, event: EventMessage) {
        self.queued_events.lock().push_back(event);
    }

    /// Apply queued events in arrival order. Returns the number of events applied.
    pub fn drain_events(&self) -> usize {
        let mut count = 0;
        loop {
            let Some(event) = self.queued_events.lock().pop_front() else {
                break;
            };
            self.apply_event(&event);
            count += 1;
        }
        count
    }

    pub fn queued_event_count(&self) -> usize {
        self.queued_events.lock().len()
    }

    /// Clear caches, queued events and message handlers.
    ///
    /// Queued tasks fail with a sync error. The client id is kept.
    pub fn reset(&self) {
        self.queue.abort(&TaskError::new(TaskErrorKind::SyncError, "client reset"));
        self.registry.reset();
        self.applier.clear();
        self.queued_events.lock().clear();
        self.tracker.lock().reset();
    }
}
