//! Subscription registry: topic filters mapped to local handlers
//!
//! Filters are unique per registry. Subscribing an existing filter again
//! swaps its handler and QoS in place, keeping the original id and position.
//! Dispatch calls exact-filter handlers first, then wildcard handlers, each
//! group in registration order.

use crate::protocol::{matches, topics::has_wildcards, validate_topic_filter, Publish, QoS, TopicError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
}

impl InboundEvent {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
            qos,
            dup: false,
            retain: false,
        }
    }

    pub fn from_publish(publish: &Publish, received_at: DateTime<Utc>) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            received_at,
            qos: publish.qos,
            dup: publish.dup,
            retain: publish.retain,
        }
    }

    /// Override the receive timestamp
    pub fn at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }
}

/// Callback invoked for every inbound event whose topic matches
///
/// Handlers run on the dispatch task, never on the socket worker.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &InboundEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&InboundEvent) + Send + Sync,
{
    fn handle(&self, event: &InboundEvent) {
        self(event)
    }
}

/// Registry-assigned subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One registry entry
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub filter: String,
    pub qos: QoS,
    /// Registration order, persisted so restarts replay in the same order
    pub seq: u64,
    handler: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`SubscriptionRegistry::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub id: SubscriptionId,
    pub seq: u64,
    /// An entry for the same filter existed and was updated in place
    pub replaced: bool,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
    next_id: u64,
    next_seq: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `filter`, or replace the handler already there
    pub fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscribeOutcome, TopicError> {
        validate_topic_filter(filter)?;

        if let Some(entry) = self.entries.iter_mut().find(|e| e.filter == filter) {
            entry.qos = qos;
            entry.handler = handler;
            debug!(filter, id = %entry.id, "Replaced subscription handler");
            return Ok(SubscribeOutcome {
                id: entry.id,
                seq: entry.seq,
                replaced: true,
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(self.insert(filter, qos, handler, seq))
    }

    /// Re-create a persisted entry at its original position
    pub fn restore(
        &mut self,
        filter: &str,
        qos: QoS,
        seq: u64,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscribeOutcome, TopicError> {
        validate_topic_filter(filter)?;
        if let Some(existing) = self.entries.iter().find(|e| e.filter == filter) {
            return Ok(SubscribeOutcome {
                id: existing.id,
                seq: existing.seq,
                replaced: true,
            });
        }

        self.next_seq = self.next_seq.max(seq + 1);
        let outcome = self.insert(filter, qos, handler, seq);
        self.entries.sort_by_key(|e| e.seq);
        Ok(outcome)
    }

    fn insert(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn EventHandler>,
        seq: u64,
    ) -> SubscribeOutcome {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push(Subscription {
            id,
            filter: filter.to_string(),
            qos,
            seq,
            handler,
        });
        SubscribeOutcome {
            id,
            seq,
            replaced: false,
        }
    }

    /// Remove an entry, returning it
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Subscription> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index))
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn find_by_filter(&self, filter: &str) -> Option<&Subscription> {
        self.entries.iter().find(|e| e.filter == filter)
    }

    /// Filters and QoS in registration order, as replayed after reconnect
    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.entries
            .iter()
            .map(|e| (e.filter.clone(), e.qos))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handlers matching `topic`: exact filters first, then wildcards
    pub fn matching_handlers(&self, topic: &str) -> Vec<Arc<dyn EventHandler>> {
        let exact = self
            .entries
            .iter()
            .filter(|e| !has_wildcards(&e.filter) && e.filter == topic);
        let wildcard = self
            .entries
            .iter()
            .filter(|e| has_wildcards(&e.filter) && matches(&e.filter, topic));

        exact
            .chain(wildcard)
            .map(|e| Arc::clone(&e.handler))
            .collect()
    }

    /// Route `event` to every matching handler, returning how many ran
    ///
    /// A topic nobody subscribed to is a silent no-op.
    pub fn dispatch(&self, event: &InboundEvent) -> usize {
        invoke_handlers(&self.matching_handlers(&event.topic), event)
    }
}

/// Call each handler, containing panics so one bad handler cannot stop the rest
pub fn invoke_handlers(handlers: &[Arc<dyn EventHandler>], event: &InboundEvent) -> usize {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler.handle(event))).is_err() {
            error!(topic = %event.topic, "Event handler panicked");
        }
    }
    handlers.len()
}
