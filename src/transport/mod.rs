//! Transport to the hub.
//!
//! A [`Transport`] executes one request per round trip and returns the hub
//! response with one task result per request task, in request order. Inbound
//! events are pushed into the [`EventSink`] handed to
//! [`Transport::connect_events`] in arrival order.
//!
//! Framing and connection handling belong to the implementation. The crate
//! ships an in-process hub behind the `loopback` feature.

#[cfg(feature = "loopback")]
#[cfg_attr(docsrs, doc(cfg(feature = "loopback")))]
pub mod loopback;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::BatchError;
use crate::protocol::{SyncRequest, SyncResponse};
use crate::subscription::EventSink;

/// Errors of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection to the hub is down.
    #[error("not connected")]
    NotConnected,

    /// The hub rejected the request as a whole.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Any other delivery failure.
    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for BatchError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Rejected(reason) => BatchError::Protocol(reason),
            other => BatchError::Transport(other.to_string()),
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Delivers requests to a hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one round trip.
    async fn execute(&self, request: SyncRequest) -> TransportResult<SyncResponse>;

    /// Route inbound events of this connection to `sink`.
    ///
    /// Transports without an event channel ignore the sink.
    fn connect_events(&self, sink: EventSink) {
        let _ = sink;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_error_from_transport() {
        assert_eq!(
            BatchError::from(TransportError::NotConnected),
            BatchError::Transport("not connected".into())
        );
        assert_eq!(
            BatchError::from(TransportError::Rejected("bad token".into())),
            BatchError::Protocol("bad token".into())
        );
    }
}
