//! Delivery queue: outbound publishes and inbound QoS 2 bookkeeping
//!
//! Outbound messages move through `Queued -> Sent -> (QoS 2: Released) ->
//! Acked` and never backwards; an `Acked` message leaves the queue. QoS 1
//! and QoS 2 entries are written to the [`DeliveryStore`] so they survive a
//! restart. When the store fails the queue keeps running in memory and
//! reports the degradation once.
//!
//! The queue is plain data: the session worker calls it under the session
//! lock and turns the returned packets into socket writes.

pub mod store;

pub use store::{DeliveryStore, PersistenceError, StoredSubscription};

use crate::protocol::{Packet, Publish, QoS};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Outbound message lifecycle, ordered so that transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Waiting for a connection
    Queued,
    /// PUBLISH written, awaiting PUBACK (QoS 1) or PUBREC (QoS 2)
    Sent,
    /// PUBREC received and PUBREL sent, awaiting PUBCOMP
    Released,
    Acked,
}

/// An outbound message owned by the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// Absent for QoS 0
    pub packet_id: Option<u16>,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub state: DeliveryState,
    /// Number of transmissions so far
    pub attempts: u32,
    /// Enqueue order
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingMessage {
    /// Move to `next` if that is a forward transition
    pub fn advance(&mut self, next: DeliveryState) -> bool {
        if next > self.state {
            self.state = next;
            true
        } else {
            false
        }
    }

    fn to_publish(&self, dup: bool) -> Publish {
        Publish {
            dup: dup && self.qos != QoS::AtMostOnce,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id: self.packet_id,
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("Delivery queue is full ({capacity} messages pending)")]
    Full { capacity: usize },
    #[error("All packet identifiers are in use")]
    PacketIdsExhausted,
}

/// Queue limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_retries: u32,
    pub max_queued: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_queued: 1000,
        }
    }
}

/// Work produced when a session (re)starts
#[derive(Debug, Default)]
pub struct Resumption {
    /// Packets to write, in order
    pub packets: Vec<Packet>,
    /// Messages dropped after exhausting their retries
    pub failed: Vec<PendingMessage>,
    /// Released QoS 2 messages completed because the broker lost the session
    pub completed: Vec<PendingMessage>,
}

#[derive(Debug)]
pub struct DeliveryQueue {
    messages: BTreeMap<u64, PendingMessage>,
    by_packet_id: HashMap<u16, u64>,
    control_ids: HashSet<u16>,
    inbound_qos2: BTreeSet<u16>,
    next_packet_id: u16,
    next_seq: u64,
    limits: QueueLimits,
    store: Option<DeliveryStore>,
    /// Writes since the last hand-out of the store for syncing
    unsynced: bool,
    degradation: Option<String>,
}

impl DeliveryQueue {
    /// Memory-only queue
    pub fn in_memory(limits: QueueLimits) -> Self {
        Self {
            messages: BTreeMap::new(),
            by_packet_id: HashMap::new(),
            control_ids: HashSet::new(),
            inbound_qos2: BTreeSet::new(),
            next_packet_id: 1,
            next_seq: 1,
            limits,
            store: None,
            unsynced: false,
            degradation: None,
        }
    }

    /// Queue backed by `store`, reloading whatever it holds
    pub fn with_store(store: DeliveryStore, limits: QueueLimits) -> Result<Self, PersistenceError> {
        let mut queue = Self::in_memory(limits);

        for message in store.load_messages()? {
            let Some(packet_id) = message.packet_id else {
                continue;
            };
            queue.next_seq = queue.next_seq.max(message.seq + 1);
            queue.by_packet_id.insert(packet_id, message.seq);
            queue.messages.insert(message.seq, message);
        }
        queue.inbound_qos2 = store.load_inbound()?.into_iter().collect();
        queue.store = Some(store);

        debug!(
            restored = queue.messages.len(),
            inbound_qos2 = queue.inbound_qos2.len(),
            "Delivery queue restored"
        );
        Ok(queue)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// Snapshot of every pending message in enqueue order
    pub fn pending(&self) -> Vec<PendingMessage> {
        self.messages.values().cloned().collect()
    }

    pub fn get(&self, packet_id: u16) -> Option<&PendingMessage> {
        self.by_packet_id
            .get(&packet_id)
            .and_then(|seq| self.messages.get(seq))
    }

    pub fn inbound_qos2_ids(&self) -> Vec<u16> {
        self.inbound_qos2.iter().copied().collect()
    }

    /// Reason the store was dropped, reported once
    pub fn take_degradation(&mut self) -> Option<String> {
        self.degradation.take()
    }

    /// Store to flush if anything was written since the last call
    ///
    /// Lets the caller sync to disk after releasing whatever lock guards the
    /// queue.
    pub fn take_unsynced(&mut self) -> Option<DeliveryStore> {
        if std::mem::take(&mut self.unsynced) {
            self.store.clone()
        } else {
            None
        }
    }

    /// Flush pending writes on the calling thread
    pub fn sync_now(&mut self) {
        if std::mem::take(&mut self.unsynced) {
            self.persist(DeliveryStore::flush_now);
            self.unsynced = false;
        }
    }

    /// A flush of a handle from [`take_unsynced`](Self::take_unsynced) failed
    pub fn sync_failed(&mut self, error: PersistenceError) {
        if self.store.is_some() {
            self.degrade(error);
        }
    }

    fn persist<F>(&mut self, operation: F)
    where
        F: FnOnce(&DeliveryStore) -> Result<(), PersistenceError>,
    {
        let Some(store) = &self.store else {
            return;
        };
        match operation(store) {
            Ok(()) => self.unsynced = true,
            Err(e) => self.degrade(e),
        }
    }

    fn degrade(&mut self, error: PersistenceError) {
        let reason = error.to_string();
        warn!(error = %reason, "Delivery store failed, continuing in memory");
        self.store = None;
        self.unsynced = false;
        self.degradation = Some(reason);
    }

    fn id_in_use(&self, id: u16) -> bool {
        self.by_packet_id.contains_key(&id) || self.control_ids.contains(&id)
    }

    fn allocate_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
            if !self.id_in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Reserve an identifier for SUBSCRIBE or UNSUBSCRIBE
    pub fn reserve_control_id(&mut self) -> Option<u16> {
        let id = self.allocate_packet_id()?;
        self.control_ids.insert(id);
        Some(id)
    }

    pub fn release_control_id(&mut self, id: u16) -> bool {
        self.control_ids.remove(&id)
    }

    /// Add an outbound message in the `Queued` state
    pub fn enqueue(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<PendingMessage, EnqueueError> {
        if self.messages.len() >= self.limits.max_queued {
            return Err(EnqueueError::Full {
                capacity: self.limits.max_queued,
            });
        }

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(
                self.allocate_packet_id()
                    .ok_or(EnqueueError::PacketIdsExhausted)?,
            ),
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let message = PendingMessage {
            packet_id,
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            state: DeliveryState::Queued,
            attempts: 0,
            seq,
            enqueued_at: Utc::now(),
        };

        if let Some(id) = packet_id {
            self.by_packet_id.insert(id, seq);
        }
        self.messages.insert(seq, message.clone());
        self.persist(|store| store.save_message(&message));

        Ok(message)
    }

    fn remove(&mut self, seq: u64) -> Option<PendingMessage> {
        let message = self.messages.remove(&seq)?;
        if let Some(id) = message.packet_id {
            self.by_packet_id.remove(&id);
            self.persist(|store| store.remove_message(id));
        }
        Some(message)
    }

    /// Transmit every `Queued` message; QoS 0 messages leave the queue here
    pub fn take_queued(&mut self) -> Vec<Packet> {
        let queued: Vec<u64> = self
            .messages
            .values()
            .filter(|m| m.state == DeliveryState::Queued)
            .map(|m| m.seq)
            .collect();

        let mut packets = Vec::with_capacity(queued.len());
        for seq in queued {
            let Some(message) = self.messages.get_mut(&seq) else {
                continue;
            };
            message.attempts += 1;
            packets.push(Packet::Publish(message.to_publish(false)));

            if message.qos == QoS::AtMostOnce {
                self.remove(seq);
            } else {
                message.advance(DeliveryState::Sent);
                let snapshot = message.clone();
                self.persist(|store| store.save_message(&snapshot));
            }
        }
        packets
    }

    /// Prepare the queue for a freshly accepted CONNACK
    ///
    /// Unacknowledged messages are retransmitted in enqueue order: `Sent`
    /// ones as PUBLISH with DUP, `Released` ones as PUBREL. When the broker
    /// has no session, inbound QoS 2 state is dropped and `Released`
    /// messages are complete since the broker already owns them. Queued
    /// messages are not touched; call [`take_queued`](Self::take_queued)
    /// once the subscriptions are replayed.
    pub fn resume(&mut self, session_present: bool) -> Resumption {
        let mut resumption = Resumption::default();

        if !session_present {
            if !self.inbound_qos2.is_empty() {
                self.inbound_qos2.clear();
                self.persist(DeliveryStore::clear_inbound);
            }

            let released: Vec<u64> = self
                .messages
                .values()
                .filter(|m| m.state == DeliveryState::Released)
                .map(|m| m.seq)
                .collect();
            for seq in released {
                if let Some(mut message) = self.remove(seq) {
                    message.advance(DeliveryState::Acked);
                    resumption.completed.push(message);
                }
            }
        }

        let in_flight: Vec<u64> = self
            .messages
            .values()
            .filter(|m| matches!(m.state, DeliveryState::Sent | DeliveryState::Released))
            .map(|m| m.seq)
            .collect();

        for seq in in_flight {
            let Some(message) = self.messages.get_mut(&seq) else {
                continue;
            };

            if message.attempts > self.limits.max_retries {
                if let Some(failed) = self.remove(seq) {
                    warn!(
                        packet_id = ?failed.packet_id,
                        topic = %failed.topic,
                        attempts = failed.attempts,
                        "Giving up on outbound message"
                    );
                    resumption.failed.push(failed);
                }
                continue;
            }

            message.attempts += 1;
            let packet = match (message.state, message.packet_id) {
                (DeliveryState::Released, Some(id)) => Packet::PubRel(id),
                _ => Packet::Publish(message.to_publish(true)),
            };
            resumption.packets.push(packet);

            let snapshot = message.clone();
            self.persist(|store| store.save_message(&snapshot));
        }

        resumption
    }

    fn seq_for(&self, packet_id: u16, qos: QoS) -> Option<u64> {
        let seq = *self.by_packet_id.get(&packet_id)?;
        let message = self.messages.get(&seq)?;
        (message.qos == qos).then_some(seq)
    }

    /// PUBACK for a QoS 1 message: the message is complete
    pub fn on_puback(&mut self, packet_id: u16) -> Option<PendingMessage> {
        let seq = self.seq_for(packet_id, QoS::AtLeastOnce)?;
        let mut message = self.remove(seq)?;
        message.advance(DeliveryState::Acked);
        Some(message)
    }

    /// PUBREC for a QoS 2 message; the reply is always PUBREL
    ///
    /// A repeated PUBREC re-sends PUBREL without changing state.
    pub fn on_pubrec(&mut self, packet_id: u16) -> Packet {
        if let Some(seq) = self.seq_for(packet_id, QoS::ExactlyOnce) {
            if let Some(message) = self.messages.get_mut(&seq) {
                if message.advance(DeliveryState::Released) {
                    let snapshot = message.clone();
                    self.persist(|store| store.save_message(&snapshot));
                } else {
                    debug!(packet_id, "Duplicate PUBREC, re-sending PUBREL");
                }
            }
        } else {
            debug!(packet_id, "PUBREC for unknown packet id");
        }
        Packet::PubRel(packet_id)
    }

    /// PUBCOMP for a released QoS 2 message: the message is complete
    pub fn on_pubcomp(&mut self, packet_id: u16) -> Option<PendingMessage> {
        let seq = self.seq_for(packet_id, QoS::ExactlyOnce)?;
        if self.messages.get(&seq)?.state != DeliveryState::Released {
            return None;
        }
        let mut message = self.remove(seq)?;
        message.advance(DeliveryState::Acked);
        Some(message)
    }

    /// Inbound QoS 2 PUBLISH: returns whether it should be delivered
    ///
    /// A packet id already awaiting PUBREL is a redelivery and is only
    /// acknowledged again.
    pub fn on_inbound_qos2(&mut self, packet_id: u16) -> bool {
        if !self.inbound_qos2.insert(packet_id) {
            return false;
        }
        self.persist(|store| store.add_inbound(packet_id));
        true
    }

    /// Inbound PUBREL: the exchange is over
    pub fn on_pubrel(&mut self, packet_id: u16) -> bool {
        let known = self.inbound_qos2.remove(&packet_id);
        if known {
            self.persist(|store| store.remove_inbound(packet_id));
        }
        known
    }

    /// Record a subscription in the store
    pub fn persist_subscription(&mut self, subscription: StoredSubscription) {
        self.persist(|store| store.save_subscription(&subscription));
    }

    pub fn forget_subscription(&mut self, filter: &str) {
        self.persist(|store| store.remove_subscription(filter));
    }

    /// Subscriptions stored by a previous run, in registration order
    pub fn stored_subscriptions(&mut self) -> Vec<StoredSubscription> {
        let loaded = match &self.store {
            Some(store) => store.load_subscriptions(),
            None => return Vec::new(),
        };
        match loaded {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                let reason = e.to_string();
                warn!(error = %reason, "Failed to read stored subscriptions");
                self.store = None;
                self.degradation = Some(reason);
                Vec::new()
            }
        }
    }
}
