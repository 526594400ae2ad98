//! Client configuration.

use crate::core::constants::{DEFAULT_DATABASE, DEFAULT_MAX_QUERY_COUNT};
use crate::subscription::EventDispatch;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// User sent with every request.
    pub user_id: Option<String>,

    /// Access token sent with every request.
    pub token: Option<String>,

    /// Client identifier. Assigned by the hub on the first round trip if not set.
    pub client_id: Option<String>,

    /// Database addressed by the requests.
    pub database: Option<String>,

    /// Where inbound events are applied.
    pub event_dispatch: EventDispatch,

    /// Page size applied to queries without an explicit max count.
    pub max_query_count: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            token: None,
            client_id: None,
            database: Some(DEFAULT_DATABASE.to_string()),
            event_dispatch: EventDispatch::default(),
            max_query_count: DEFAULT_MAX_QUERY_COUNT,
        }
    }
}

/// Builder for creating a [`super::HubClient`].
#[derive(Debug)]
pub struct HubClientBuilder {
    config: ClientConfig,
}

impl HubClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Set the user id.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.config.user_id = Some(user_id.into());
        self
    }

    /// Set the access token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Use a known client id instead of letting the hub assign one.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    /// Set the database. `None` addresses the hub default.
    pub fn database(mut self, database: Option<String>) -> Self {
        self.config.database = database;
        self
    }

    /// Set the event dispatch policy.
    pub fn event_dispatch(mut self, dispatch: EventDispatch) -> Self {
        self.config.event_dispatch = dispatch;
        self
    }

    /// Limit query pages to `count` entities unless a query sets its own limit.
    pub fn max_query_count(mut self, count: u32) -> Self {
        self.config.max_query_count = Some(count);
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for HubClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
