//! High-level hub client API.
//!
//! Provides [`HubClient`]: opens typed containers, queues tasks and executes
//! them in batches through a [`Transport`].

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::{ClientConfig, HubClientBuilder};
use super::container::Container;
use super::result::{SyncResult, SyncTasksError};
use crate::core::codec;
use crate::core::constants::{STD_CLIENT, STD_ECHO, STD_PREFIX};
use crate::core::{BatchError, ClientError, ConfigError, Entity, EntityKey};
use crate::protocol::{MessageEvent, SyncRequest, SyncResponse};
use crate::subscription::{EventSink, MessageHandler};
use crate::sync::handles::{CommandTask, DetectPatchesTask, WriteTask};
use crate::sync::{Batch, PatchScope, SyncContext, SyncTracker, TaskKind};
use crate::transport::Transport;

/// A hub client.
///
/// Operations on containers return handles immediately. Queued tasks are sent
/// as one batch by [`HubClient::sync_tasks`]; tasks queued while a batch is in
/// flight go into the next one.
///
/// # Example
///
/// ```ignore
/// use hubsync::prelude::*;
///
/// let hub = LoopbackHub::new();
/// let client = HubClient::new(hub.connect(), ClientConfig::default());
/// let articles = client.container::<String, Article>()?;
///
/// let read = articles.read();
/// let galaxy = read.find(&"galaxy".to_string())?;
/// let producer = galaxy.read_ref::<i64, Producer>(".producer")?;
/// client.sync_tasks().await?;
///
/// println!("{:?} by {:?}", galaxy.result()?, producer.result()?);
/// ```
pub struct HubClient {
    context: Arc<SyncContext>,
    transport: Arc<dyn Transport>,
    sink: EventSink,
    config: ClientConfig,
}

impl HubClient {
    /// Create a client using `transport`.
    pub fn new(transport: impl Transport + 'static, config: ClientConfig) -> Self {
        let context = Arc::new(SyncContext::new(&config));
        let sink = EventSink::new(&context, &config.event_dispatch);
        let transport: Arc<dyn Transport> = Arc::new(transport);
        transport.connect_events(sink.clone());
        Self {
            context,
            transport,
            sink,
            config,
        }
    }

    /// Start building a client configuration.
    pub fn builder() -> HubClientBuilder {
        HubClientBuilder::new()
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the container of entity type `T` with key type `K`.
    ///
    /// Opening the same container twice returns views of the same cache.
    pub fn container<K: EntityKey, T: Entity>(&self) -> Result<Container<K, T>, ConfigError> {
        let cache = self.context.registry.open::<K, T>()?;
        Ok(Container::new(
            self.context.clone(),
            cache,
            self.config.max_query_count,
        ))
    }

    /// Detach the queued tasks and start their round trip.
    ///
    /// Tasks queued after this call belong to the next batch.
    pub fn begin_sync(&self) -> SyncInFlight {
        let mut batch = self.context.detach();
        let request = batch.take_request().filter(|_| batch.wire_len() > 0);
        SyncInFlight {
            context: self.context.clone(),
            transport: self.transport.clone(),
            batch: Some(batch),
            request,
            cancel: CancellationToken::new(),
        }
    }

    /// Execute all queued tasks. Fails if any task failed.
    pub async fn sync_tasks(&self) -> Result<SyncResult, SyncTasksError> {
        self.begin_sync().finish().await.into_result()
    }

    /// Execute all queued tasks and return the outcome as data.
    pub async fn try_sync_tasks(&self) -> SyncResult {
        self.begin_sync().finish().await
    }

    /// Queue a command. The result is decoded into `R`.
    pub fn send_command<P: Serialize, R: DeserializeOwned>(
        &self,
        name: &str,
        param: &P,
    ) -> Result<CommandTask<R>, ClientError> {
        validate_name(name)?;
        let param = codec::encode(param)?;
        Ok(CommandTask::new(self.context.queue.push(TaskKind::Command {
            name: name.to_string(),
            param,
        })))
    }

    /// Queue a message to the clients subscribed to `name`.
    pub fn send_message<P: Serialize>(&self, name: &str, param: &P) -> Result<WriteTask, ClientError> {
        validate_name(name)?;
        if name.starts_with(STD_PREFIX) {
            return Err(ClientError::InvalidArgument(format!(
                "message name '{name}' uses the reserved prefix '{STD_PREFIX}'"
            )));
        }
        let param = codec::encode(param)?;
        Ok(WriteTask::new(self.context.queue.push(TaskKind::Message {
            name: name.to_string(),
            param,
        })))
    }

    /// Queue a command returning `value` unchanged.
    pub fn echo<V: Serialize + DeserializeOwned>(&self, value: &V) -> Result<CommandTask<V>, ClientError> {
        self.send_command(STD_ECHO, value)
    }

    /// Queue a command returning what the hub knows about this client.
    pub fn client_info(&self) -> CommandTask<serde_json::Value> {
        CommandTask::new(self.context.queue.push(TaskKind::Command {
            name: STD_CLIENT.to_string(),
            param: serde_json::Value::Null,
        }))
    }

    /// Subscribe to messages named `name` and handle them with `handler`.
    ///
    /// A name ending with `*` subscribes to every message with that prefix.
    pub fn subscribe_message(
        &self,
        name: &str,
        handler: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) -> Result<WriteTask, ClientError> {
        validate_name(name)?;
        let handler: MessageHandler = Arc::new(handler);
        self.context.applier.register(name, handler);
        Ok(WriteTask::new(self.context.queue.push(
            TaskKind::SubscribeMessage {
                name: name.to_string(),
                remove: false,
            },
        )))
    }

    /// Remove a message subscription and its handler.
    pub fn unsubscribe_message(&self, name: &str) -> Result<WriteTask, ClientError> {
        validate_name(name)?;
        self.context.applier.unregister(name);
        Ok(WriteTask::new(self.context.queue.push(
            TaskKind::SubscribeMessage {
                name: name.to_string(),
                remove: true,
            },
        )))
    }

    /// Detect changes in every opened container when the batch is sent.
    pub fn detect_all_patches(&self) -> DetectPatchesTask {
        DetectPatchesTask::new(self.context.queue.push(TaskKind::DetectPatches {
            scope: PatchScope::All,
        }))
    }

    /// Entry point for inbound events of this client.
    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Apply queued events. Only needed with [`crate::EventDispatch::Queued`].
    ///
    /// Returns the number of applied events.
    pub fn process_events(&self) -> usize {
        self.context.drain_events()
    }

    /// Number of events waiting for [`HubClient::process_events`].
    pub fn queued_event_count(&self) -> usize {
        self.context.queued_event_count()
    }

    /// Clear caches, queued tasks and message handlers. The client id is kept.
    pub fn reset(&self) {
        debug!("reset client");
        self.context.reset();
    }

    /// Client id assigned by the hub or configured.
    pub fn client_id(&self) -> Option<String> {
        self.context.client_id()
    }

    /// Number of round trips executed.
    pub fn sync_count(&self) -> u64 {
        self.context.tracker.lock().sync_count()
    }

    /// Number of tasks queued for the next batch.
    pub fn pending_task_count(&self) -> usize {
        self.context.queue.len()
    }

    /// Batch and event counters.
    pub fn stats(&self) -> SyncTracker {
        self.context.tracker.lock().clone()
    }
}

fn validate_name(name: &str) -> Result<(), ClientError> {
    if name.trim().is_empty() {
        return Err(ClientError::InvalidArgument("name must not be empty".into()));
    }
    Ok(())
}

/// A detached batch on its way to the hub.
///
/// Dropping it before [`SyncInFlight::finish`] completed cancels the batch.
pub struct SyncInFlight {
    context: Arc<SyncContext>,
    transport: Arc<dyn Transport>,
    batch: Option<Batch>,
    request: Option<SyncRequest>,
    cancel: CancellationToken,
}

impl SyncInFlight {
    /// Sequence number of the batch.
    pub fn seq(&self) -> u64 {
        self.batch.as_ref().map_or(0, |batch| batch.seq)
    }

    /// Token cancelling this batch.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the batch. Its tasks fail and the caches stay untouched.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the response and apply it.
    pub async fn finish(mut self) -> SyncResult {
        let Some(batch) = self.batch.take() else {
            return SyncResult {
                seq: 0,
                task_count: 0,
                failed: Vec::new(),
                batch_error: Some(BatchError::Cancelled),
            };
        };
        let outcome = match self.request.take() {
            // nothing to send
            None => Ok(SyncResponse {
                seq: batch.seq,
                ..Default::default()
            }),
            Some(request) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(BatchError::Cancelled),
                    response = self.transport.execute(request) => response.map_err(BatchError::from),
                }
            }
        };
        self.context.complete(batch, outcome)
    }
}

impl Drop for SyncInFlight {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            warn!(seq = batch.seq, "batch dropped before completion");
            self.context.complete(batch, Err(BatchError::Cancelled));
        }
    }
}

#[cfg(all(test, feature = "loopback"))]
mod tests {
    use super::*;
    use crate::cache::Changes;
    use crate::client::HubClientBuilder;
    use crate::core::constants::MAX_RESERVE_KEYS;
    use crate::core::{JsonKey, KeyKind, TaskAccessError, TaskErrorKind};
    use crate::protocol::{ChangeKinds, PatchOp};
    use crate::subscription::EventDispatch;
    use crate::sync::handles::TaskHandle;
    use crate::transport::loopback::{CommandCall, LoopbackHub};
    use serde::Deserialize;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Article {
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        producer: Option<i64>,
    }

    impl Entity for Article {
        const CONTAINER: &'static str = "articles";
        const KEY_KIND: KeyKind = KeyKind::String;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Producer {
        id: i64,
        name: String,
        #[serde(default)]
        employees: Vec<String>,
    }

    impl Entity for Producer {
        const CONTAINER: &'static str = "producers";
        const KEY_KIND: KeyKind = KeyKind::Int64;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Employee {
        id: String,
        name: String,
    }

    impl Entity for Employee {
        const CONTAINER: &'static str = "employees";
        const KEY_KIND: KeyKind = KeyKind::String;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: i64,
        article: String,
    }

    impl Entity for Order {
        const CONTAINER: &'static str = "orders";
        const KEY_KIND: KeyKind = KeyKind::Int64;
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    fn article(id: &str, name: &str, producer: Option<i64>) -> Article {
        Article {
            id: id.into(),
            name: name.into(),
            producer,
        }
    }

    fn seeded_hub() -> LoopbackHub {
        let hub = LoopbackHub::new();
        let entities = [
            ("producers", json!({"id": 1, "name": "Samsung", "employees": ["e1", "e2"]})),
            ("producers", json!({"id": 2, "name": "Apple", "employees": ["e3"]})),
            ("employees", json!({"id": "e1", "name": "Ada"})),
            ("employees", json!({"id": "e2", "name": "Brian"})),
            ("employees", json!({"id": "e3", "name": "Carol"})),
            ("articles", json!({"id": "galaxy", "name": "Galaxy", "producer": 1})),
            ("articles", json!({"id": "note", "name": "Note", "producer": 1})),
            ("articles", json!({"id": "iphone", "name": "iPhone", "producer": 2})),
            ("articles", json!({"id": "cable", "name": "Cable"})),
        ];
        for (container, entity) in entities {
            hub.insert(container, entity).unwrap();
        }
        hub
    }

    fn client(hub: &LoopbackHub) -> HubClient {
        HubClient::new(hub.connect(), ClientConfig::default())
    }

    fn failed_kind(handle: &TaskHandle) -> Option<TaskErrorKind> {
        handle.error().map(|e| e.kind)
    }

    #[tokio::test]
    async fn test_create_then_detect_patches() {
        let hub = LoopbackHub::new();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let create = articles.create(&article("a1", "Galaxy", None)).unwrap();
        client.sync_tasks().await.unwrap();
        assert!(create.success().unwrap());
        let peer = articles.peer(&key("a1"));
        assert_eq!(peer.baseline(), Some(json!({"id": "a1", "name": "Galaxy"})));

        peer.modify(|a| a.name = "Galaxy S".into());
        let detect = articles.detect_patches();
        client.sync_tasks().await.unwrap();
        let patches = detect.result().unwrap();
        assert_eq!(patches[0].patches.len(), 1);
        assert_eq!(
            patches[0].patches[0].ops,
            vec![PatchOp::Replace {
                path: "/name".into(),
                value: json!("Galaxy S"),
            }]
        );
        assert_eq!(hub.entity("articles", "a1").unwrap()["name"], "Galaxy S");

        // nothing changed since
        let again = articles.detect_patches();
        client.sync_tasks().await.unwrap();
        assert_eq!(again.count().unwrap(), 0);
        assert_eq!(client.sync_count(), 3);
    }

    #[tokio::test]
    async fn test_identity_dedup() {
        let hub = seeded_hub();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let first = articles.read();
        let galaxy = first.find(&key("galaxy")).unwrap();
        let galaxy_again = first.find(&key("galaxy")).unwrap();
        assert!(galaxy.is_same(&galaxy_again));
        let second = articles.read();
        let galaxy_other = second.find(&key("galaxy")).unwrap();
        assert!(!galaxy.is_same(&galaxy_other));
        client.sync_tasks().await.unwrap();

        assert_eq!(galaxy.result().unwrap(), galaxy_other.result().unwrap());
        let peer = articles.peer(&key("galaxy"));
        assert!(Arc::ptr_eq(&peer, &articles.peer(&key("galaxy"))));
        peer.modify(|a| a.name = "changed".into());
        assert_eq!(galaxy_other.result().unwrap().unwrap().name, "changed");
        assert_eq!(first.result().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let hub = seeded_hub();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let read = articles.read();
        let missing = read.find(&key("x")).unwrap();
        let found = read.find(&key("galaxy")).unwrap();
        assert!(matches!(
            found.result(),
            Err(TaskAccessError::NotSynced { .. })
        ));
        assert!(read.success().is_err());

        client.sync_tasks().await.unwrap();
        assert!(read.success().unwrap());
        assert_eq!(missing.result().unwrap(), None);
        assert_eq!(found.result().unwrap().unwrap().name, "Galaxy");
        let all = read.result().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&key("x")], None);
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let hub = seeded_hub();
        hub.fail_container("orders", Some(TaskErrorKind::DatabaseError));
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();
        let orders = client.container::<i64, Order>().unwrap();

        let count = articles.count_all();
        let query = orders.query_all();
        let create = articles.create(&article("new", "New", None)).unwrap();
        let err = client.sync_tasks().await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "SyncTasks() failed with task errors. Count: 1\n\
             |- #1 query orders 'true' # DatabaseError ~ container 'orders' failed"
        );
        assert_eq!(count.result().unwrap(), 4);
        assert!(create.success().unwrap());
        assert_eq!(failed_kind(&query), Some(TaskErrorKind::DatabaseError));
        assert!(matches!(query.result(), Err(TaskAccessError::Failed(_))));
    }

    #[tokio::test]
    async fn test_chain_dedup_and_synced_source() {
        let hub = seeded_hub();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let read = articles.read();
        let galaxy = read.find(&key("galaxy")).unwrap();
        read.find(&key("note")).unwrap();
        let producers = read.read_refs::<i64, Producer>(".producer").unwrap();
        let again = read.read_refs::<i64, Producer>(".producer").unwrap();
        assert!(producers.same_task(&again));
        let producer = galaxy.read_ref::<i64, Producer>(".producer").unwrap();
        assert!(producer.same_task(&producers));
        assert!(matches!(
            read.read_refs::<i64, Producer>("producer[0]"),
            Err(ClientError::InvalidArgument(_))
        ));

        client.sync_tasks().await.unwrap();
        assert_eq!(hub.request_count(), 1);
        assert_eq!(producers.keys().unwrap(), vec![1]);
        assert_eq!(producer.key().unwrap(), Some(1));
        assert_eq!(producer.result().unwrap().unwrap().name, "Samsung");
        assert!(matches!(
            read.read_refs::<i64, Producer>(".producer"),
            Err(ClientError::SourceAlreadySynced { .. })
        ));
    }

    #[tokio::test]
    async fn test_nested_refs() {
        let hub = seeded_hub();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let query = articles.query_all();
        let producers = query.read_refs::<i64, Producer>(".producer").unwrap();
        let employees = producers
            .read_refs::<String, Employee>(".employees[*]")
            .unwrap();
        client.sync_tasks().await.unwrap();

        assert_eq!(query.keys().unwrap().len(), 4);
        assert_eq!(producers.keys().unwrap(), vec![1, 2]);
        let employees = employees.result().unwrap();
        assert_eq!(
            employees.keys().cloned().collect::<Vec<_>>(),
            vec![key("e1"), key("e2"), key("e3")]
        );
        assert_eq!(employees[&key("e3")].as_ref().unwrap().name, "Carol");
    }

    #[tokio::test]
    async fn test_chain_only_failure() {
        let hub = seeded_hub();
        hub.fail_container("producers", Some(TaskErrorKind::DatabaseError));
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let read = articles.read();
        let galaxy = read.find(&key("galaxy")).unwrap();
        let producers = read.read_refs::<i64, Producer>(".producer").unwrap();
        let result = client.try_sync_tasks().await;

        assert!(!result.success());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].label, "readRefs producers .producer");
        assert!(read.success().unwrap());
        assert!(galaxy.result().unwrap().is_some());
        assert_eq!(failed_kind(&producers), Some(TaskErrorKind::DatabaseError));
    }

    #[tokio::test]
    async fn test_source_failure_fails_chain() {
        let hub = seeded_hub();
        hub.fail_container("articles", Some(TaskErrorKind::PermissionDenied));
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let read = articles.read().with_name("readArticles");
        read.find(&key("galaxy")).unwrap();
        let producers = read.read_refs::<i64, Producer>(".producer").unwrap();
        let result = client.try_sync_tasks().await;

        assert_eq!(result.failed.len(), 2);
        assert_eq!(result.failed[0].label, "readArticles");
        assert_eq!(failed_kind(&read), Some(TaskErrorKind::PermissionDenied));
        assert_eq!(failed_kind(&producers), Some(TaskErrorKind::PermissionDenied));
    }

    #[tokio::test]
    async fn test_entity_errors_keep_other_entities() {
        let hub = LoopbackHub::new();
        hub.fail_entity("articles", "bad");
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let write = articles
            .upsert_range(&[article("ok", "Ok", None), article("bad", "Bad", None)])
            .unwrap()
            .with_name("upsertArticles");
        let result = client.try_sync_tasks().await;

        assert!(!write.success().unwrap());
        let errors = write.entity_errors().unwrap();
        assert_eq!(errors.keys().collect::<Vec<_>>(), vec![&JsonKey::from("bad")]);
        assert!(articles.peer(&key("ok")).is_synced());
        let bad = articles.peer(&key("bad"));
        assert!(!bad.is_synced());
        assert!(bad.error().is_some());
        assert_eq!(bad.get().unwrap().name, "Bad");
        assert_eq!(
            result.summary(),
            "SyncTasks() failed with task errors. Count: 1\n\
             |- #0 upsertArticles # EntityErrors ~ count: 1\n\
             |   (WriteError) [bad] write failed"
        );
    }

    #[tokio::test]
    async fn test_subscribe_changes_immediate() {
        let hub = LoopbackHub::new();
        let writer = client(&hub);
        let reader = client(&hub);
        let bystander = client(&hub);
        let written = writer.container::<String, Article>().unwrap();
        let observed = reader.container::<String, Article>().unwrap();
        let ignored = bystander.container::<String, Article>().unwrap();

        let created = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = created.clone();
        observed.set_change_listener(move |changes: &Changes<String>| {
            sink.lock().extend(changes.created.iter().cloned());
        });
        let subscribe = observed.subscribe_changes(ChangeKinds::all(), None).unwrap();
        reader.sync_tasks().await.unwrap();
        assert!(subscribe.success().unwrap());

        written.create(&article("a1", "Galaxy", None)).unwrap();
        writer.sync_tasks().await.unwrap();

        assert_eq!(observed.get(&key("a1")).unwrap().name, "Galaxy");
        assert_eq!(*created.lock(), vec![key("a1")]);
        assert_eq!(reader.stats().event_seq(), 1);
        assert!(ignored.get(&key("a1")).is_none());

        written.delete(&key("a1"));
        writer.sync_tasks().await.unwrap();
        assert!(observed.cache().get(&key("a1")).is_none());
    }

    #[tokio::test]
    async fn test_queued_dispatch() {
        let hub = LoopbackHub::new();
        let writer = client(&hub);
        let config = HubClientBuilder::new()
            .event_dispatch(EventDispatch::Queued)
            .build();
        let reader = HubClient::new(hub.connect(), config);
        let observed = reader.container::<String, Article>().unwrap();
        observed.subscribe_changes(ChangeKinds::CREATE, None).unwrap();
        reader.sync_tasks().await.unwrap();

        let written = writer.container::<String, Article>().unwrap();
        written.create(&article("a1", "Galaxy", None)).unwrap();
        writer.sync_tasks().await.unwrap();

        assert_eq!(reader.queued_event_count(), 1);
        assert!(observed.get(&key("a1")).is_none());
        assert_eq!(reader.process_events(), 1);
        assert!(observed.get(&key("a1")).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_context_dispatch() {
        let hub = LoopbackHub::new();
        let writer = client(&hub);
        let config = HubClientBuilder::new()
            .event_dispatch(EventDispatch::Context(tokio::runtime::Handle::current()))
            .build();
        let reader = HubClient::new(hub.connect(), config);
        let observed = reader.container::<String, Article>().unwrap();
        observed.subscribe_changes(ChangeKinds::all(), None).unwrap();
        reader.sync_tasks().await.unwrap();

        let written = writer.container::<String, Article>().unwrap();
        written.create(&article("a1", "Galaxy", None)).unwrap();
        writer.sync_tasks().await.unwrap();

        for _ in 0..100 {
            if observed.get(&key("a1")).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(observed.get(&key("a1")).unwrap().name, "Galaxy");
    }

    #[tokio::test]
    async fn test_message_subscription() {
        let hub = LoopbackHub::new();
        let writer = client(&hub);
        let reader = client(&hub);
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = received.clone();
        reader
            .subscribe_message("chat.*", move |message: &MessageEvent| {
                if let Ok(text) = message.decode_param::<String>() {
                    sink.lock().push(text);
                }
            })
            .unwrap();
        reader.sync_tasks().await.unwrap();

        writer.send_message("chat.post", &"hello").unwrap();
        writer.send_message("news.post", &"ignored").unwrap();
        writer.sync_tasks().await.unwrap();
        assert_eq!(*received.lock(), vec!["hello".to_string()]);

        reader.unsubscribe_message("chat.*").unwrap();
        reader.sync_tasks().await.unwrap();
        writer.send_message("chat.post", &"again").unwrap();
        writer.sync_tasks().await.unwrap();
        assert_eq!(received.lock().len(), 1);

        assert!(matches!(
            writer.send_message("std.Echo", &1),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_leaves_cache_untouched() {
        let hub = LoopbackHub::new();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();
        articles.create(&article("a1", "Galaxy", None)).unwrap();
        client.sync_tasks().await.unwrap();

        let peer = articles.peer(&key("a1"));
        peer.modify(|a| a.name = "Galaxy S".into());
        let detect = articles.detect_patches();
        let in_flight = client.begin_sync();
        in_flight.cancel();
        let result = in_flight.finish().await;

        assert_eq!(result.batch_error, Some(BatchError::Cancelled));
        assert_eq!(failed_kind(&detect), Some(TaskErrorKind::SyncError));
        assert_eq!(peer.baseline().unwrap()["name"], "Galaxy");
        assert_eq!(hub.entity("articles", "a1").unwrap()["name"], "Galaxy");

        let retry = articles.detect_patches();
        client.sync_tasks().await.unwrap();
        assert_eq!(retry.count().unwrap(), 1);
        assert_eq!(hub.entity("articles", "a1").unwrap()["name"], "Galaxy S");
    }

    #[tokio::test]
    async fn test_dropped_batch_is_cancelled() {
        let hub = seeded_hub();
        let client = client(&hub);
        let count = client.container::<String, Article>().unwrap().count_all();
        drop(client.begin_sync());
        assert_eq!(failed_kind(&count), Some(TaskErrorKind::SyncError));
        assert_eq!(client.stats().failed_count(), 1);
        assert_eq!(hub.request_count(), 0);
    }

    #[tokio::test]
    async fn test_pipelining() {
        let hub = seeded_hub();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let read = articles.read();
        let galaxy = read.find(&key("galaxy")).unwrap();
        let first = client.begin_sync();
        assert_eq!(client.pending_task_count(), 0);
        assert!(matches!(
            read.find(&key("note")),
            Err(ClientError::SourceAlreadySynced { .. })
        ));

        let count = articles.count_all();
        let second = client.begin_sync();
        assert!(second.seq() > first.seq());

        assert!(second.finish().await.success());
        assert!(first.finish().await.success());
        assert!(galaxy.result().unwrap().is_some());
        assert_eq!(count.result().unwrap(), 4);
        assert_eq!(client.sync_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_before_pipelined_patch() {
        let hub = seeded_hub();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();
        articles.read().find(&key("galaxy")).unwrap();
        client.sync_tasks().await.unwrap();
        let peer = articles.peer(&key("galaxy"));

        peer.modify(|a| a.name = "Galaxy S".into());
        let rename = articles.detect_patches();
        let first = client.begin_sync();
        // diffed against the rename still in flight
        peer.modify(|a| a.producer = Some(2));
        let move_producer = articles.detect_patches();
        let second = client.begin_sync();

        hub.set_offline(true);
        assert!(!first.finish().await.success());
        assert_eq!(failed_kind(&rename), Some(TaskErrorKind::SyncError));
        hub.set_offline(false);
        assert!(second.finish().await.success());
        let sent = move_producer.result().unwrap();
        assert_eq!(sent[0].patches[0].ops.len(), 1);
        assert_eq!(hub.entity("articles", "galaxy").unwrap()["name"], "Galaxy");
        assert_eq!(hub.entity("articles", "galaxy").unwrap()["producer"], 2);
        assert_eq!(peer.baseline().unwrap()["name"], "Galaxy");

        // the failed rename is detected again
        let retry = articles.detect_patches();
        client.sync_tasks().await.unwrap();
        let sent = retry.result().unwrap();
        assert_eq!(sent[0].patches[0].ops[0].path(), "/name");
        assert_eq!(hub.entity("articles", "galaxy").unwrap()["name"], "Galaxy S");
        assert_eq!(peer.baseline(), hub.entity("articles", "galaxy"));
    }

    #[tokio::test]
    async fn test_detect_for_untracked_keys() {
        let hub = seeded_hub();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();
        assert!(matches!(
            articles.detect_patches_for(&[key("galaxy")]),
            Err(ClientError::UnknownPeer { .. })
        ));

        let read = articles.read();
        read.find(&key("galaxy")).unwrap();
        read.find(&key("note")).unwrap();
        client.sync_tasks().await.unwrap();

        // removed by a delete completing before the detection is sent
        let delete = articles.delete(&key("galaxy"));
        let first = client.begin_sync();
        articles.peer(&key("note")).modify(|a| a.name = "Note 2".into());
        let detect = articles
            .detect_patches_for(&[key("note"), key("galaxy")])
            .unwrap();
        assert!(first.finish().await.success());
        assert!(delete.success().unwrap());

        let requests = hub.request_count();
        let result = client.try_sync_tasks().await;
        assert_eq!(result.failed.len(), 1);
        assert_eq!(failed_kind(&detect), Some(TaskErrorKind::InvalidTask));
        assert_eq!(hub.request_count(), requests);
        assert_eq!(hub.entity("articles", "note").unwrap()["name"], "Note");

        // the change of the tracked key was released
        let rest = articles.detect_patches();
        client.sync_tasks().await.unwrap();
        assert_eq!(rest.count().unwrap(), 1);
        assert_eq!(hub.entity("articles", "note").unwrap()["name"], "Note 2");
    }

    #[tokio::test]
    async fn test_empty_sync_skips_transport() {
        let hub = LoopbackHub::new();
        let client = client(&hub);
        let result = client.sync_tasks().await.unwrap();
        assert_eq!(result.task_count, 0);
        assert_eq!(hub.request_count(), 0);
    }

    #[test]
    fn test_container_config_errors() {
        let hub = LoopbackHub::new();
        let client = client(&hub);
        assert!(matches!(
            client.container::<i64, Article>(),
            Err(ConfigError::KeyKindMismatch { .. })
        ));

        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct ArticleName {
            id: String,
        }

        impl Entity for ArticleName {
            const CONTAINER: &'static str = "articles";
            const KEY_KIND: KeyKind = KeyKind::String;
        }

        client.container::<String, Article>().unwrap();
        assert!(matches!(
            client.container::<String, ArticleName>(),
            Err(ConfigError::ContainerTypeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_commands() {
        let hub = LoopbackHub::new();
        hub.register_command("app.Add", |call: &CommandCall<'_>| {
            let a = call.param["a"].as_i64().ok_or("missing a")?;
            let b = call.param["b"].as_i64().ok_or("missing b")?;
            Ok(json!(a + b))
        });
        let client = HubClient::new(
            hub.connect(),
            HubClientBuilder::new().user_id("alice").build(),
        );

        let echo = client.echo(&json!({"a": 1})).unwrap();
        let info = client.client_info();
        let sum = client.send_command::<_, i64>("app.Add", &json!({"a": 2, "b": 3})).unwrap();
        let wrong_type = client.send_command::<_, String>("app.Add", &json!({"a": 1, "b": 1})).unwrap();
        let missing = client.send_command::<_, Value>("app.Missing", &()).unwrap();
        let result = client.try_sync_tasks().await;

        assert_eq!(echo.result().unwrap(), json!({"a": 1}));
        let info = info.result().unwrap();
        assert_eq!(info["clientId"], "1");
        assert_eq!(info["userId"], "alice");
        assert_eq!(info["database"], "main_db");
        assert_eq!(sum.result().unwrap(), 5);
        assert!(matches!(
            wrong_type.result(),
            Err(TaskAccessError::Failed(e)) if e.kind == TaskErrorKind::InvalidResponse
        ));
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].index, 4);
        assert_eq!(failed_kind(&missing), Some(TaskErrorKind::NotImplemented));
        assert_eq!(client.client_id().as_deref(), Some("1"));
        assert!(client.send_command::<_, Value>(" ", &()).is_err());
    }

    #[tokio::test]
    async fn test_query_pages_and_cursors() {
        let hub = seeded_hub();
        let client = HubClient::new(hub.connect(), HubClientBuilder::new().max_query_count(3).build());
        let articles = client.container::<String, Article>().unwrap();

        let first = articles.query_all();
        let filtered = articles.query("o.name == 'Galaxy'").unwrap();
        client.try_sync_tasks().await;
        assert_eq!(first.result().unwrap().len(), 3);
        assert_eq!(failed_kind(&filtered), Some(TaskErrorKind::FilterError));
        let cursor = first.cursor().unwrap().unwrap();

        let rest = articles.query_all();
        rest.set_cursor(cursor).unwrap();
        client.sync_tasks().await.unwrap();
        assert_eq!(rest.keys().unwrap(), vec![key("cable")]);
        assert_eq!(rest.cursor().unwrap(), None);

        let open = articles.query_all();
        client.sync_tasks().await.unwrap();
        assert!(open.cursor().unwrap().is_some());
        let close = articles.close_cursors(Vec::new());
        client.sync_tasks().await.unwrap();
        assert_eq!(close.result().unwrap(), 0);

        assert!(articles.query(" ").is_err());
        assert!(matches!(rest.set_max_count(5), Err(ClientError::SourceAlreadySynced { .. })));
    }

    #[tokio::test]
    async fn test_reserve_keys() {
        let hub = LoopbackHub::new();
        let client = client(&hub);
        let orders = client.container::<i64, Order>().unwrap();
        assert!(orders.reserve_keys(0).is_err());
        assert!(orders.reserve_keys(MAX_RESERVE_KEYS + 1).is_err());
        let keys = orders.reserve_keys(3).unwrap();
        client.sync_tasks().await.unwrap();
        assert_eq!(keys.result().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_delete_removes_peer() {
        let hub = seeded_hub();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();
        articles.read().find(&key("galaxy")).unwrap();
        client.sync_tasks().await.unwrap();
        assert_eq!(articles.cache().len(), 1);

        let delete = articles.delete(&key("galaxy"));
        client.sync_tasks().await.unwrap();
        assert!(delete.success().unwrap());
        assert!(articles.cache().get(&key("galaxy")).is_none());
        assert!(hub.entity("articles", "galaxy").is_none());

        articles.delete_all();
        client.sync_tasks().await.unwrap();
        assert_eq!(hub.len("articles"), 0);
    }

    #[tokio::test]
    async fn test_batch_error_releases_creates() {
        let hub = LoopbackHub::new();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();

        let create = articles.create(&article("a1", "Galaxy", None)).unwrap();
        hub.set_offline(true);
        let err = client.sync_tasks().await.unwrap_err();
        assert_eq!(
            err.result().batch_error,
            Some(BatchError::Transport("not connected".into()))
        );
        assert_eq!(failed_kind(&create), Some(TaskErrorKind::SyncError));
        assert!(!articles.peer(&key("a1")).is_synced());

        hub.set_offline(false);
        let detect = articles.detect_patches();
        client.sync_tasks().await.unwrap();
        assert_eq!(detect.result().unwrap()[0].created, vec![JsonKey::from("a1")]);
        assert!(hub.entity("articles", "a1").is_some());
    }

    #[tokio::test]
    async fn test_track_and_patch_members() {
        let hub = LoopbackHub::new();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();
        assert!(matches!(
            articles.patch(&key("a1")),
            Err(ClientError::UnknownPeer { .. })
        ));

        let peer = articles.track(article("a1", "Galaxy", Some(1))).unwrap();
        let detect = articles.detect_patches_for(&[key("a1")]).unwrap();
        client.sync_tasks().await.unwrap();
        assert_eq!(detect.count().unwrap(), 1);
        assert!(peer.is_synced());

        peer.modify(|a| {
            a.name = "Galaxy S".into();
            a.producer = Some(2);
        });
        let patch = articles.patch(&key("a1")).unwrap().member("name").unwrap();
        client.sync_tasks().await.unwrap();
        let sent = patch.result().unwrap().unwrap();
        assert_eq!(sent.ops.len(), 1);
        assert_eq!(sent.ops[0].path(), "/name");
        assert_eq!(hub.entity("articles", "a1").unwrap()["producer"], 1);

        // the producer change is still pending
        let rest = articles.detect_patches();
        client.sync_tasks().await.unwrap();
        assert_eq!(rest.count().unwrap(), 1);
        assert_eq!(hub.entity("articles", "a1").unwrap()["producer"], 2);
    }

    #[tokio::test]
    async fn test_reset_keeps_client_id() {
        let hub = seeded_hub();
        let client = client(&hub);
        let articles = client.container::<String, Article>().unwrap();
        articles.read().find(&key("galaxy")).unwrap();
        client.sync_tasks().await.unwrap();
        let count = articles.count_all();

        client.reset();
        assert_eq!(client.client_id().as_deref(), Some("1"));
        assert!(articles.cache().is_empty());
        assert_eq!(client.pending_task_count(), 0);
        // queued tasks are not left pending
        assert_eq!(failed_kind(&count), Some(TaskErrorKind::SyncError));
        assert!(count.result().is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_logs_batch_lifecycle() {
        let hub = seeded_hub();
        let client = client(&hub);
        client.container::<String, Article>().unwrap().count_all();
        client.sync_tasks().await.unwrap();
        assert!(logs_contain("detached batch"));
        assert!(logs_contain("completed batch"));
    }
}
