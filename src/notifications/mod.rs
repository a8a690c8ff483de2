//! Notification dispatcher
//!
//! Turns inbound safety events into user-facing notifications. Repeats of
//! the same event key (kind plus subject) inside the dedup window are
//! suppressed; every shown notification lands in the history. The dispatcher
//! never fails outward: malformed payloads are logged and dropped.

pub mod event;
pub mod history;

pub use event::{EventKind, EventParseError, SafetyEvent};
pub use history::{Notification, NotificationHistory, MAX_MESSAGE_CHARS};

use crate::config::NotificationSection;
use crate::observability::ClientMetrics;
use crate::subscriptions::{EventHandler, InboundEvent};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Platform capability that actually shows a notification
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Notifier that only writes a log line
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, notification: &Notification) {
        info!(
            id = %notification.id,
            event_key = %notification.event_key,
            title = %notification.title,
            "{}",
            notification.message
        );
    }
}

/// Last time a notification was shown for an event key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub event_key: String,
    pub last_shown_at: DateTime<Utc>,
}

/// Dispatcher timing and presentation settings
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub dedup_window: Duration,
    pub record_ttl: Duration,
    pub history_retention: Duration,
    pub title: String,
}

impl From<&NotificationSection> for DispatcherSettings {
    fn from(section: &NotificationSection) -> Self {
        Self {
            dedup_window: seconds(section.dedup_window_secs),
            record_ttl: seconds(section.record_ttl_secs),
            history_retention: seconds(section.history_retention_hours.saturating_mul(3600)),
            title: section.title.clone(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&NotificationSection::default())
    }
}

// keeps `timestamp + window` far from the DateTime range limit
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 3600;

fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

/// What happened to one inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Shown(Uuid),
    Suppressed { event_key: String },
    Malformed(EventParseError),
}

struct DispatcherState {
    records: HashMap<String, NotificationRecord>,
    history: NotificationHistory,
}

pub struct NotificationDispatcher {
    settings: DispatcherSettings,
    notifier: Arc<dyn Notifier>,
    state: Mutex<DispatcherState>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl NotificationDispatcher {
    pub fn new(settings: DispatcherSettings, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            state: Mutex::new(DispatcherState {
                records: HashMap::new(),
                history: NotificationHistory::new(settings.history_retention),
            }),
            settings,
            notifier,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, DispatcherState> {
        // a panicking notifier never holds the lock, so the data is intact
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one inbound event
    pub fn on_event(&self, event: &InboundEvent) -> DispatchOutcome {
        let safety_event = match SafetyEvent::parse(event) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(topic = %event.topic, error = %e, "Dropping malformed safety event");
                if let Some(metrics) = &self.metrics {
                    metrics.malformed_event();
                }
                return DispatchOutcome::Malformed(e);
            }
        };

        let event_key = safety_event.event_key();
        let now = event.received_at;
        let _span = crate::notification_span!(event_key = %event_key).entered();

        let notification = {
            let mut state = self.state();
            self.evict_records(&mut state, now);

            if let Some(record) = state.records.get(&event_key) {
                if now < record.last_shown_at + self.settings.dedup_window {
                    debug!(
                        last_shown_at = %record.last_shown_at,
                        "Suppressing duplicate notification"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.notification_suppressed();
                    }
                    return DispatchOutcome::Suppressed { event_key };
                }
            }

            state.records.insert(
                event_key.clone(),
                NotificationRecord {
                    event_key: event_key.clone(),
                    last_shown_at: now,
                },
            );

            let notification =
                Notification::new(&self.settings.title, &safety_event.message, &event_key, now);
            state.history.delete_expired(now);
            state.history.add(notification.clone());
            notification
        };

        let notifier = Arc::clone(&self.notifier);
        if catch_unwind(AssertUnwindSafe(|| notifier.notify(&notification))).is_err() {
            error!(id = %notification.id, "Notifier panicked");
        }
        if let Some(metrics) = &self.metrics {
            metrics.notification_shown();
        }

        DispatchOutcome::Shown(notification.id)
    }

    fn evict_records(&self, state: &mut DispatcherState, now: DateTime<Utc>) {
        let ttl = self.settings.record_ttl;
        state
            .records
            .retain(|_, record| now < record.last_shown_at + ttl);
    }

    /// Drop dedup records older than the TTL
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state();
        let before = state.records.len();
        self.evict_records(&mut state, now);
        before - state.records.len()
    }

    pub fn record(&self, event_key: &str) -> Option<NotificationRecord> {
        self.state().records.get(event_key).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state().records.len()
    }

    /// Shown notifications, newest first
    pub fn history(&self) -> Vec<Notification> {
        self.state().history.list()
    }

    pub fn disclose(&self, id: Uuid) -> bool {
        self.state().history.disclose(id)
    }

    pub fn delete(&self, id: Uuid) -> bool {
        self.state().history.delete(id)
    }

    pub fn delete_disclosed(&self) -> usize {
        self.state().history.delete_disclosed()
    }

    pub fn delete_expired(&self, now: DateTime<Utc>) -> usize {
        self.state().history.delete_expired(now)
    }
}

impl EventHandler for NotificationDispatcher {
    fn handle(&self, event: &InboundEvent) {
        self.on_event(event);
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("settings", &self.settings)
            .field("records", &self.record_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use crate::testing::RecordingNotifier;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn event_at(payload: &'static str, offset_secs: i64) -> InboundEvent {
        InboundEvent::new("iot/notifications", payload.as_bytes(), QoS::AtLeastOnce)
            .at(base() + Duration::seconds(offset_secs))
    }

    fn dispatcher() -> (NotificationDispatcher, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = NotificationDispatcher::new(DispatcherSettings::default(), notifier.clone());
        (dispatcher, notifier)
    }

    const ALONE: &str = "A child has been alone in the room for over 15 seconds!";

    fn alone_key() -> String {
        format!("child-alone:iot/notifications:{}", ALONE.to_lowercase())
    }

    #[test]
    fn test_duplicates_within_window_show_once() {
        let (dispatcher, notifier) = dispatcher();

        assert!(matches!(dispatcher.on_event(&event_at(ALONE, 0)), DispatchOutcome::Shown(_)));
        assert!(matches!(
            dispatcher.on_event(&event_at(ALONE, 10)),
            DispatchOutcome::Suppressed { .. }
        ));
        assert!(matches!(
            dispatcher.on_event(&event_at(ALONE, 59)),
            DispatchOutcome::Suppressed { .. }
        ));

        assert_eq!(notifier.count(), 1);
        assert_eq!(dispatcher.history().len(), 1);
    }

    #[test]
    fn test_repeat_after_window_is_shown() {
        let (dispatcher, notifier) = dispatcher();

        dispatcher.on_event(&event_at(ALONE, 0));
        assert!(matches!(dispatcher.on_event(&event_at(ALONE, 60)), DispatchOutcome::Shown(_)));

        assert_eq!(notifier.count(), 2);
        assert_eq!(
            dispatcher.record(&alone_key()).unwrap().last_shown_at,
            base() + Duration::seconds(60)
        );
    }

    #[test]
    fn test_different_keys_are_independent() {
        let (dispatcher, notifier) = dispatcher();

        dispatcher.on_event(&event_at(ALONE, 0));
        dispatcher.on_event(&event_at("An appliance has been disabled for safety.", 1));

        assert_eq!(notifier.count(), 2);
        assert_eq!(dispatcher.record_count(), 2);
    }

    #[test]
    fn test_unrelated_plain_text_alerts_on_one_topic_are_all_shown() {
        let (dispatcher, notifier) = dispatcher();

        dispatcher.on_event(&event_at("The front door was opened", 0));
        let second = dispatcher.on_event(&event_at("Smoke detected in the kitchen", 1));

        assert!(matches!(second, DispatchOutcome::Shown(_)));
        assert_eq!(notifier.count(), 2);
        assert!(matches!(
            dispatcher.on_event(&event_at("The front door was opened", 2)),
            DispatchOutcome::Suppressed { .. }
        ));
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let (dispatcher, notifier) = dispatcher();

        assert_eq!(
            dispatcher.on_event(&event_at("", 0)),
            DispatchOutcome::Malformed(EventParseError::Empty)
        );
        assert_eq!(notifier.count(), 0);
        assert!(dispatcher.history().is_empty());
    }

    #[test]
    fn test_records_are_evicted_after_ttl() {
        let (dispatcher, _) = dispatcher();
        dispatcher.on_event(&event_at(ALONE, 0));

        assert_eq!(dispatcher.evict_expired(base() + Duration::seconds(599)), 0);
        assert_eq!(dispatcher.evict_expired(base() + Duration::seconds(600)), 1);
        assert_eq!(dispatcher.record_count(), 0);
    }

    #[test]
    fn test_notification_content() {
        let (dispatcher, notifier) = dispatcher();
        dispatcher.on_event(&event_at(ALONE, 0));

        let shown = notifier.notifications();
        assert_eq!(shown[0].title, "CHILD SAFETY ALERT");
        assert_eq!(shown[0].message, ALONE);
        assert_eq!(shown[0].event_key, alone_key());
        assert_eq!(dispatcher.history()[0].id, shown[0].id);
    }

    #[test]
    fn test_history_operations_through_dispatcher() {
        let (dispatcher, _) = dispatcher();
        let DispatchOutcome::Shown(id) = dispatcher.on_event(&event_at(ALONE, 0)) else {
            panic!("expected a notification");
        };

        assert!(dispatcher.disclose(id));
        assert_eq!(dispatcher.delete_disclosed(), 1);
        assert!(dispatcher.history().is_empty());
        assert!(!dispatcher.delete(id));
    }

    #[test]
    fn test_panicking_notifier_is_contained() {
        struct Exploding;
        impl Notifier for Exploding {
            fn notify(&self, notification: &Notification) {
                if !notification.message.is_empty() {
                    panic!("notification service unavailable");
                }
            }
        }

        let dispatcher = NotificationDispatcher::new(DispatcherSettings::default(), Arc::new(Exploding));

        assert!(matches!(dispatcher.on_event(&event_at(ALONE, 0)), DispatchOutcome::Shown(_)));
        // the lock is still usable afterwards
        assert_eq!(dispatcher.history().len(), 1);
    }

    #[test]
    fn test_metrics_are_updated() {
        let metrics = Arc::new(ClientMetrics::new());
        let dispatcher = NotificationDispatcher::new(
            DispatcherSettings::default(),
            Arc::new(RecordingNotifier::new()),
        )
        .with_metrics(metrics.clone());

        dispatcher.on_event(&event_at(ALONE, 0));
        dispatcher.on_event(&event_at(ALONE, 1));
        dispatcher.on_event(&event_at("", 2));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.notifications.shown, 1);
        assert_eq!(snapshot.notifications.suppressed, 1);
        assert_eq!(snapshot.notifications.malformed_events, 1);
    }
}
