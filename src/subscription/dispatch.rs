//! Event dispatch policies.
//!
//! The transport hands inbound events to an [`EventSink`]. Depending on the
//! configured [`EventDispatch`] the sink applies them on the delivering
//! thread, forwards them to a task on a designated runtime, or queues them
//! until [`crate::HubClient::process_events`] drains the queue. Each policy
//! applies one event at a time.

use std::fmt;
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::EventMessage;
use crate::sync::SyncContext;

/// Where inbound events are applied.
#[derive(Debug, Clone, Default)]
pub enum EventDispatch {
    /// Apply on the thread delivering the event.
    #[default]
    Immediate,
    /// Apply on a task spawned on the given runtime, in arrival order.
    Context(Handle),
    /// Queue events until `process_events` is called.
    Queued,
}

#[derive(Clone)]
enum Route {
    Immediate,
    Channel(mpsc::UnboundedSender<EventMessage>),
    Queued,
}

/// Entry point for inbound events of one client.
///
/// Holds the client weakly: once the client is dropped, delivery returns `false`.
#[derive(Clone)]
pub struct EventSink {
    context: Weak<SyncContext>,
    route: Route,
}

impl EventSink {
    pub(crate) fn new(context: &Arc<SyncContext>, dispatch: &EventDispatch) -> Self {
        let route = match dispatch {
            EventDispatch::Immediate => Route::Immediate,
            EventDispatch::Queued => Route::Queued,
            EventDispatch::Context(handle) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<EventMessage>();
                let weak = Arc::downgrade(context);
                handle.spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let Some(context) = weak.upgrade() else {
                            break;
                        };
                        context.apply_event(&event);
                    }
                    trace!("event dispatch task stopped");
                });
                Route::Channel(tx)
            }
        };
        Self {
            context: Arc::downgrade(context),
            route,
        }
    }

    /// Deliver an event. Returns `false` if the client is gone.
    pub fn deliver(&self, event: EventMessage) -> bool {
        if let Route::Channel(tx) = &self.route {
            return tx.send(event).is_ok();
        }
        let Some(context) = self.context.upgrade() else {
            return false;
        };
        match self.route {
            Route::Queued => context.enqueue_event(event),
            _ => {
                context.apply_event(&event);
            }
        }
        true
    }

    /// Check if the client owning this sink was dropped.
    pub fn is_closed(&self) -> bool {
        self.context.strong_count() == 0
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let route = match self.route {
            Route::Immediate => "immediate",
            Route::Channel(_) => "context",
            Route::Queued => "queued",
        };
        f.debug_struct("EventSink")
            .field("route", &route)
            .field("closed", &self.is_closed())
            .finish()
    }
}
