//! Session manager and the public client facade
//!
//! [`SafetyClient`] owns an `Arc<ClientShared>` context. `start()` spawns the
//! socket worker and the dispatch task; `stop()` signals the shutdown watch
//! channel, which interrupts a backoff sleep or connect attempt at once.
//!
//! # Example
//!
//! ```no_run
//! use safewatch::{ClientConfig, QoS, SafetyClient};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> safewatch::ClientResult<()> {
//! let client = SafetyClient::from_config(ClientConfig::default())?;
//! client.on_state_change(|state| println!("connection: {state}"));
//! client.start().await?;
//! client.wait_until_connected(Duration::from_secs(10)).await?;
//!
//! client
//!     .subscribe("home/+/door", QoS::AtLeastOnce, Arc::new(|event: &safewatch::InboundEvent| {
//!         println!("{} -> {} bytes", event.topic, event.payload.len());
//!     }))
//!     .await?;
//! client.publish("iot/ack", "seen", QoS::AtLeastOnce).await?;
//!
//! for notification in client.notifications().history() {
//!     println!("{}: {}", notification.title, notification.message);
//! }
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod state;
mod worker;

pub use state::{ControlRequest, SessionCore, SessionStart};

use crate::config::ClientConfig;
use crate::delivery::{DeliveryQueue, DeliveryStore, PendingMessage, QueueLimits};
use crate::error::{ClientError, ClientResult};
use crate::notifications::{DispatcherSettings, LoggingNotifier, NotificationDispatcher, Notifier};
use crate::observability::{ClientMetrics, MetricsSnapshot};
use crate::protocol::{validate_topic_name, QoS};
use crate::subscriptions::{EventHandler, SubscriptionId, SubscriptionRegistry};
use crate::transport::mqtt::{ConnectionEvent, HealthMonitor};
use crate::transport::{ConnectionState, Connector, MqttConnector};
use bytes::Bytes;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop()` waits for the worker before aborting it
const STOP_GRACE: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notable things that happened inside the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// Outbound message dropped after exhausting its retries
    DeliveryFailed {
        packet_id: Option<u16>,
        topic: String,
        attempts: u32,
    },
    /// The durable store failed; the queue now lives in memory only
    PersistenceDegraded { reason: String },
    /// The broker refused the credentials; the worker has stopped
    AuthRejected { reason: String },
    SubscriptionRejected { filter: String },
}

/// A subscription re-created from the store when the client was built
///
/// It is bound to the notification dispatcher until the host subscribes the
/// same filter again with its own handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredSubscription {
    pub id: SubscriptionId,
    pub filter: String,
    pub qos: QoS,
}

type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Context shared by the facade, the worker and the dispatch task
pub(crate) struct ClientShared {
    pub(crate) client_id: String,
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) core: Mutex<SessionCore>,
    registry: RwLock<SubscriptionRegistry>,
    /// Wakes the worker when the outbox or queue has new work
    pub(crate) outbound: Notify,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
    state_callbacks: std::sync::Mutex<Vec<StateCallback>>,
    auth_failure: std::sync::Mutex<Option<String>>,
    pub(crate) metrics: Arc<ClientMetrics>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl ClientShared {
    /// Apply a connection event to the state machine and notify observers
    pub(crate) async fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(&event);
        let previous = {
            let mut core = self.core.lock().await;
            std::mem::replace(&mut core.state, next)
        };
        if previous == next {
            return;
        }

        HealthMonitor::log_state_transition(previous, next, &self.client_id);
        self.state_tx.send_replace(next);
        self.metrics.state_changed(next);

        let callbacks = self
            .state_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(next))).is_err() {
                error!(client_id = %self.client_id, "State change callback panicked");
            }
        }

        self.emit(ClientEvent::StateChanged(next));
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        // no receivers is fine
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn record_auth_failure(&self, reason: &str) {
        *self
            .auth_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }

    fn auth_failure(&self) -> Option<String> {
        self.auth_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear_auth_failure(&self) {
        self.auth_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn report_degradation(&self, core: &mut SessionCore) {
        if let Some(reason) = core.queue.take_degradation() {
            let reason = crate::error::sanitize_error_message(&reason);
            warn!(client_id = %self.client_id, %reason, "Delivery queue degraded to memory only");
            self.metrics.persistence_degraded();
            self.emit(ClientEvent::PersistenceDegraded { reason });
        }
    }

    /// Report degradation and take the store if it has writes to sync
    ///
    /// Call with the core locked, then pass the result to
    /// [`sync_store`](Self::sync_store) once the lock is released.
    pub(crate) fn settle_store(&self, core: &mut SessionCore) -> Option<DeliveryStore> {
        self.report_degradation(core);
        core.queue.take_unsynced()
    }

    /// Flush writes made under the core lock without holding it
    pub(crate) async fn sync_store(&self, store: Option<DeliveryStore>) {
        let Some(store) = store else {
            return;
        };
        if let Err(e) = store.flush().await {
            let mut core = self.core.lock().await;
            core.queue.sync_failed(e);
            self.report_degradation(&mut core);
        }
    }

    pub(crate) fn report_resumption(
        &self,
        failed: Vec<PendingMessage>,
        completed: Vec<PendingMessage>,
    ) {
        for message in failed {
            self.metrics.delivery_failed();
            self.emit(ClientEvent::DeliveryFailed {
                packet_id: message.packet_id,
                topic: message.topic,
                attempts: message.attempts,
            });
        }
        for message in completed {
            debug!(
                packet_id = ?message.packet_id,
                topic = %message.topic,
                "QoS 2 message completed by session reset"
            );
        }
    }

    fn registry_read(&self) -> std::sync::RwLockReadGuard<'_, SubscriptionRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_write(&self) -> std::sync::RwLockWriteGuard<'_, SubscriptionRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn registry_filters(&self) -> Vec<(String, QoS)> {
        self.registry_read().filters()
    }

    pub(crate) fn matching_handlers(&self, topic: &str) -> Vec<Arc<dyn EventHandler>> {
        self.registry_read().matching_handlers(topic)
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

/// MQTT child-safety client
pub struct SafetyClient {
    shared: Arc<ClientShared>,
    running: Mutex<Option<Running>>,
    restored: Vec<RestoredSubscription>,
}

impl SafetyClient {
    /// Client for a real broker with log-only notifications
    pub fn from_config(config: ClientConfig) -> ClientResult<Self> {
        let connector = MqttConnector::new(&config.broker)?;
        Self::new(config, Arc::new(connector))
    }

    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> ClientResult<Self> {
        Self::with_notifier(config, connector, Arc::new(LoggingNotifier))
    }

    /// Build a client; opens the delivery store and restores subscriptions
    pub fn with_notifier(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        notifier: Arc<dyn Notifier>,
    ) -> ClientResult<Self> {
        config.validate()?;
        let client_id = config.resolve_client_id();
        let metrics = Arc::new(ClientMetrics::new());

        let dispatcher = Arc::new(
            NotificationDispatcher::new(
                DispatcherSettings::from(&config.notifications),
                notifier,
            )
            .with_metrics(Arc::clone(&metrics)),
        );

        let limits = QueueLimits {
            max_retries: config.delivery.max_retries,
            max_queued: config.delivery.max_queued,
        };
        let mut queue = match &config.delivery.store_path {
            Some(path) => DeliveryQueue::with_store(DeliveryStore::open(path)?, limits)?,
            None => DeliveryQueue::in_memory(limits),
        };

        let (registry, restored) = Self::build_registry(&config, &mut queue, &dispatcher)?;
        queue.sync_now();

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            client_id = %client_id,
            broker = %crate::error::sanitize_error_message(&config.broker.url),
            persistent = queue.is_persistent(),
            pending = queue.len(),
            subscriptions = registry.len(),
            "Safety client created"
        );

        Ok(Self {
            shared: Arc::new(ClientShared {
                client_id,
                config,
                connector,
                core: Mutex::new(SessionCore::new(queue)),
                registry: RwLock::new(registry),
                outbound: Notify::new(),
                state_tx,
                events_tx,
                state_callbacks: std::sync::Mutex::new(Vec::new()),
                auth_failure: std::sync::Mutex::new(None),
                metrics,
                dispatcher,
            }),
            running: Mutex::new(None),
            restored,
        })
    }

    /// Stored subscriptions first, at their original positions, then the
    /// configured notification topics
    fn build_registry(
        config: &ClientConfig,
        queue: &mut DeliveryQueue,
        dispatcher: &Arc<NotificationDispatcher>,
    ) -> ClientResult<(SubscriptionRegistry, Vec<RestoredSubscription>)> {
        let handler: Arc<dyn EventHandler> = dispatcher.clone();
        let mut registry = SubscriptionRegistry::new();
        let mut restored = Vec::new();

        for stored in queue.stored_subscriptions() {
            match registry.restore(&stored.filter, stored.qos, stored.seq, Arc::clone(&handler)) {
                Ok(outcome) => restored.push(RestoredSubscription {
                    id: outcome.id,
                    filter: stored.filter,
                    qos: stored.qos,
                }),
                Err(e) => {
                    warn!(filter = %stored.filter, error = %e, "Dropping invalid stored subscription");
                    queue.forget_subscription(&stored.filter);
                }
            }
        }

        let qos = config.notifications.qos;
        for topic in &config.notifications.topics {
            let outcome = registry.subscribe(topic, qos, Arc::clone(&handler))?;
            queue.persist_subscription(crate::delivery::StoredSubscription {
                filter: topic.clone(),
                qos,
                seq: outcome.seq,
            });
        }

        Ok((registry, restored))
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Spawn the session worker; the state becomes CONNECTING immediately
    pub async fn start(&self) -> ClientResult<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.worker.is_finished()) {
            return Err(ClientError::AlreadyRunning);
        }

        self.shared.clear_auth_failure();
        self.shared
            .transition(ConnectionEvent::ConnectStarted)
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let dispatch = tokio::spawn(worker::run_dispatch(Arc::clone(&self.shared), dispatch_rx));
        let worker = tokio::spawn(worker::run_session(
            Arc::clone(&self.shared),
            shutdown_rx,
            dispatch_tx,
        ));

        *running = Some(Running {
            shutdown_tx,
            worker,
            dispatch,
        });
        Ok(())
    }

    /// Stop the worker; returns once the state is DISCONNECTED
    ///
    /// Stopping a client that is not running is a no-op.
    pub async fn stop(&self) -> ClientResult<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let _ = running.shutdown_tx.send(true);

        match tokio::time::timeout(STOP_GRACE, &mut running.worker).await {
            Ok(Ok(())) => debug!(client_id = %self.shared.client_id, "Worker shut down gracefully"),
            Ok(Err(e)) => warn!(client_id = %self.shared.client_id, error = %e, "Worker ended abnormally"),
            Err(_) => {
                warn!(client_id = %self.shared.client_id, "Worker did not stop in time, aborting");
                running.worker.abort();
            }
        }

        self.shared.core.lock().await.end_session();
        self.shared.transition(ConnectionEvent::Stopped).await;

        // the worker dropped its sender, so the dispatch task drains and exits
        if tokio::time::timeout(STOP_GRACE, &mut running.dispatch)
            .await
            .is_err()
        {
            running.dispatch.abort();
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.worker.is_finished())
    }

    /// Register `handler` for `filter`; an existing filter keeps its id
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn EventHandler>,
    ) -> ClientResult<SubscriptionId> {
        let mut core = self.shared.core.lock().await;
        let outcome = self.shared.registry_write().subscribe(filter, qos, handler)?;
        core.persist_subscription(filter, qos, outcome.seq);
        if core.request_subscribe(filter, qos) {
            self.shared.outbound.notify_one();
        }
        let unsynced = self.shared.settle_store(&mut core);
        drop(core);
        self.shared.sync_store(unsynced).await;

        debug!(filter, id = %outcome.id, replaced = outcome.replaced, "Subscribed");
        Ok(outcome.id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> ClientResult<()> {
        let mut core = self.shared.core.lock().await;
        let removed = self
            .shared
            .registry_write()
            .unsubscribe(id)
            .ok_or(ClientError::UnknownSubscription(id))?;
        core.queue.forget_subscription(&removed.filter);
        if core.request_unsubscribe(&removed.filter) {
            self.shared.outbound.notify_one();
        }
        let unsynced = self.shared.settle_store(&mut core);
        drop(core);
        self.shared.sync_store(unsynced).await;

        debug!(filter = %removed.filter, %id, "Unsubscribed");
        Ok(())
    }

    /// Queue a message for the broker
    ///
    /// QoS 1 and 2 messages are stored before this returns and survive
    /// reconnects and restarts; they are sent as soon as a session is up.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> ClientResult<PendingMessage> {
        self.publish_with_retain(topic, payload, qos, false).await
    }

    pub async fn publish_with_retain(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> ClientResult<PendingMessage> {
        validate_topic_name(topic)?;

        let mut core = self.shared.core.lock().await;
        let message = match core.queue.enqueue(topic, payload.into(), qos, retain) {
            Ok(message) => message,
            Err(e) => {
                self.shared.metrics.publish_failed();
                warn!(topic, error = %e, "Publish rejected");
                return Err(e.into());
            }
        };
        let unsynced = self.shared.settle_store(&mut core);
        drop(core);
        self.shared.sync_store(unsynced).await;

        self.shared.outbound.notify_one();
        Ok(message)
    }

    /// Outbound messages not yet acknowledged, in enqueue order
    pub async fn pending_messages(&self) -> Vec<PendingMessage> {
        self.shared.core.lock().await.queue.pending()
    }

    /// Call `callback` on every connection state transition
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.shared
            .state_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Wait until the session is CONNECTED
    ///
    /// Fails with [`ClientError::Auth`] when the broker refused the
    /// credentials and [`ClientError::NotConnected`] on timeout.
    pub async fn wait_until_connected(&self, timeout: Duration) -> ClientResult<()> {
        let mut state_rx = self.shared.state_tx.subscribe();

        let waited = tokio::time::timeout(timeout, async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected => {
                        if let Some(reason) = self.shared.auth_failure() {
                            return Err(ClientError::auth(reason));
                        }
                        if !self.is_running().await {
                            return Err(ClientError::NotRunning);
                        }
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(ClientError::internal("connection state channel closed"));
                }
            }
        })
        .await;

        waited.unwrap_or(Err(ClientError::NotConnected(timeout)))
    }

    /// Dispatcher and notification history
    pub fn notifications(&self) -> Arc<NotificationDispatcher> {
        Arc::clone(&self.shared.dispatcher)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Subscriptions loaded from the delivery store at construction
    pub fn restored_subscriptions(&self) -> &[RestoredSubscription] {
        &self.restored
    }

    /// Filters in registration order, as replayed after each connect
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.shared.registry_filters()
    }
}

impl std::fmt::Debug for SafetyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyClient")
            .field("client_id", &self.shared.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, RecordingNotifier};
    use tempfile::TempDir;

    fn client() -> (SafetyClient, MockConnector) {
        let connector = MockConnector::new();
        let client = SafetyClient::with_notifier(
            ClientConfig::test_config(),
            Arc::new(connector.clone()),
            Arc::new(RecordingNotifier::new()),
        )
        .unwrap();
        (client, connector)
    }

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let (client, connector) = client();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.client_id(), "safewatch-test");
        assert_eq!(connector.connect_count(), 0);
        assert!(!client.is_running().await);
    }

    #[tokio::test]
    async fn test_default_topics_are_bound_to_dispatcher() {
        let (client, _) = client();
        assert_eq!(
            client.subscriptions(),
            vec![("iot/notifications".to_string(), QoS::AtLeastOnce)]
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (client, _) = client();
        client.start().await.unwrap();

        assert!(matches!(
            client.start().await,
            Err(ClientError::AlreadyRunning)
        ));
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let (client, _) = client();
        client.stop().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_without_start_reports_not_running() {
        let (client, _) = client();
        assert!(matches!(
            client.wait_until_connected(Duration::from_secs(1)).await,
            Err(ClientError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_publish_validates_topic() {
        let (client, _) = client();
        assert!(matches!(
            client.publish("a/+", "x", QoS::AtLeastOnce).await,
            Err(ClientError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_offline_is_queued() {
        let (client, _) = client();

        let message = client
            .publish("iot/ack", "seen", QoS::AtLeastOnce)
            .await
            .unwrap();

        assert!(message.packet_id.is_some());
        assert_eq!(client.pending_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_is_reported() {
        let mut config = ClientConfig::test_config();
        config.delivery.max_queued = 1;
        let client = SafetyClient::new(config, Arc::new(MockConnector::new())).unwrap();

        client.publish("a", "1", QoS::AtLeastOnce).await.unwrap();
        assert!(matches!(
            client.publish("a", "2", QoS::AtLeastOnce).await,
            Err(ClientError::QueueFull { capacity: 1 })
        ));
        assert_eq!(client.metrics().delivery.publish_failures, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id() {
        let (client, _) = client();
        let id = client
            .subscribe("a/b", QoS::AtMostOnce, Arc::new(|_: &crate::InboundEvent| {}))
            .await
            .unwrap();

        client.unsubscribe(id).await.unwrap();
        assert!(matches!(
            client.unsubscribe(id).await,
            Err(ClientError::UnknownSubscription(_))
        ));
    }

    #[tokio::test]
    async fn test_subscriptions_are_restored_from_store() {
        let dir = TempDir::new().unwrap();
        let mut config = ClientConfig::test_config();
        config.delivery.store_path = Some(dir.path().join("queue"));

        {
            let client = SafetyClient::new(config.clone(), Arc::new(MockConnector::new())).unwrap();
            client
                .subscribe("home/+/door", QoS::ExactlyOnce, Arc::new(|_: &crate::InboundEvent| {}))
                .await
                .unwrap();
            assert!(client.restored_subscriptions().is_empty());
        }

        let client = SafetyClient::new(config, Arc::new(MockConnector::new())).unwrap();
        let restored: Vec<_> = client
            .restored_subscriptions()
            .iter()
            .map(|r| r.filter.clone())
            .collect();

        assert_eq!(restored, vec!["iot/notifications", "home/+/door"]);
        assert_eq!(
            client.subscriptions(),
            vec![
                ("iot/notifications".to_string(), QoS::AtLeastOnce),
                ("home/+/door".to_string(), QoS::ExactlyOnce),
            ]
        );
    }
}
