//! State guarded by the session mutex
//!
//! `SessionCore` keeps the connection state, the delivery queue and the
//! identifiers of in-flight SUBSCRIBE/UNSUBSCRIBE requests together so that
//! packet id allocation and state changes are serialized.

use crate::delivery::{DeliveryQueue, PendingMessage, StoredSubscription};
use crate::protocol::{Packet, QoS, Subscribe, Unsubscribe};
use crate::transport::ConnectionState;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// A SUBSCRIBE or UNSUBSCRIBE awaiting its acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Subscribe(String),
    Unsubscribe(String),
}

/// Everything the worker must write after a CONNACK, in order
#[derive(Debug, Default)]
pub struct SessionStart {
    pub packets: Vec<Packet>,
    pub failed: Vec<PendingMessage>,
    pub completed: Vec<PendingMessage>,
}

#[derive(Debug)]
pub struct SessionCore {
    pub(crate) state: ConnectionState,
    /// A link is open and the session replay has been computed
    pub(crate) link_up: bool,
    pub(crate) queue: DeliveryQueue,
    outbox: VecDeque<Packet>,
    pending_control: HashMap<u16, ControlRequest>,
}

impl SessionCore {
    pub fn new(queue: DeliveryQueue) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            link_up: false,
            queue,
            outbox: VecDeque::new(),
            pending_control: HashMap::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn link_up(&self) -> bool {
        self.link_up
    }

    /// Build the replay for a fresh CONNACK
    ///
    /// Order: one SUBSCRIBE per registry entry in registration order,
    /// retransmissions of unacknowledged messages, UNSUBSCRIBEs the broker
    /// never confirmed, then every queued publish.
    pub fn begin_session(
        &mut self,
        filters: Vec<(String, QoS)>,
        session_present: bool,
    ) -> SessionStart {
        let mut start = SessionStart::default();

        let mut unsubscribes = Vec::new();
        for (id, request) in std::mem::take(&mut self.pending_control) {
            match request {
                ControlRequest::Subscribe(_) => {
                    self.queue.release_control_id(id);
                }
                ControlRequest::Unsubscribe(filter) => unsubscribes.push((id, filter)),
            }
        }
        unsubscribes.sort_by_key(|(id, _)| *id);

        for (filter, qos) in filters {
            if let Some(packet) = self.subscribe_packet(filter, qos) {
                start.packets.push(packet);
            }
        }

        let resumption = self.queue.resume(session_present);
        start.packets.extend(resumption.packets);
        start.failed = resumption.failed;
        start.completed = resumption.completed;

        for (id, filter) in unsubscribes {
            start.packets.push(Packet::Unsubscribe(Unsubscribe {
                packet_id: id,
                filters: vec![filter.clone()],
            }));
            self.pending_control
                .insert(id, ControlRequest::Unsubscribe(filter));
        }

        start.packets.extend(self.queue.take_queued());

        self.outbox.clear();
        self.link_up = true;
        start
    }

    /// The link is gone; anything not yet written waits for the next session
    pub fn end_session(&mut self) {
        self.link_up = false;
        self.outbox.clear();
    }

    fn subscribe_packet(&mut self, filter: String, qos: QoS) -> Option<Packet> {
        let Some(id) = self.queue.reserve_control_id() else {
            warn!(filter = %filter, "No packet id available for SUBSCRIBE");
            return None;
        };
        self.pending_control
            .insert(id, ControlRequest::Subscribe(filter.clone()));
        Some(Packet::Subscribe(Subscribe {
            packet_id: id,
            filters: vec![(filter, qos)],
        }))
    }

    /// Queue a SUBSCRIBE if a link is up; otherwise the next replay covers it
    pub fn request_subscribe(&mut self, filter: &str, qos: QoS) -> bool {
        if !self.link_up {
            return false;
        }
        match self.subscribe_packet(filter.to_string(), qos) {
            Some(packet) => {
                self.outbox.push_back(packet);
                true
            }
            None => false,
        }
    }

    /// Queue an UNSUBSCRIBE if a link is up
    pub fn request_unsubscribe(&mut self, filter: &str) -> bool {
        if !self.link_up {
            return false;
        }
        let Some(id) = self.queue.reserve_control_id() else {
            warn!(filter, "No packet id available for UNSUBSCRIBE");
            return false;
        };
        self.pending_control
            .insert(id, ControlRequest::Unsubscribe(filter.to_string()));
        self.outbox.push_back(Packet::Unsubscribe(Unsubscribe {
            packet_id: id,
            filters: vec![filter.to_string()],
        }));
        true
    }

    /// SUBACK or UNSUBACK received
    pub fn complete_control(&mut self, packet_id: u16) -> Option<ControlRequest> {
        let request = self.pending_control.remove(&packet_id)?;
        self.queue.release_control_id(packet_id);
        Some(request)
    }

    /// Packets waiting to be written: control requests first, then queued publishes
    pub fn outgoing(&mut self) -> Vec<Packet> {
        if !self.link_up {
            return Vec::new();
        }
        let mut packets: Vec<Packet> = self.outbox.drain(..).collect();
        packets.extend(self.queue.take_queued());
        packets
    }

    pub fn persist_subscription(&mut self, filter: &str, qos: QoS, seq: u64) {
        self.queue.persist_subscription(StoredSubscription {
            filter: filter.to_string(),
            qos,
            seq,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::QueueLimits;
    use bytes::Bytes;

    fn core() -> SessionCore {
        SessionCore::new(DeliveryQueue::in_memory(QueueLimits::default()))
    }

    fn filters() -> Vec<(String, QoS)> {
        vec![
            ("iot/notifications".to_string(), QoS::AtLeastOnce),
            ("home/+/door".to_string(), QoS::AtMostOnce),
        ]
    }

    #[test]
    fn test_begin_session_order() {
        let mut core = core();
        core.queue
            .enqueue("a", Bytes::from_static(b"sent"), QoS::AtLeastOnce, false)
            .unwrap();
        core.queue.take_queued();
        core.queue
            .enqueue("b", Bytes::from_static(b"queued"), QoS::AtLeastOnce, false)
            .unwrap();

        let start = core.begin_session(filters(), true);

        assert_eq!(start.packets.len(), 4);
        match (&start.packets[0], &start.packets[1]) {
            (Packet::Subscribe(first), Packet::Subscribe(second)) => {
                assert_eq!(first.filters[0].0, "iot/notifications");
                assert_eq!(second.filters[0].0, "home/+/door");
            }
            other => panic!("expected two SUBSCRIBEs, got {other:?}"),
        }
        match (&start.packets[2], &start.packets[3]) {
            (Packet::Publish(retry), Packet::Publish(fresh)) => {
                assert!(retry.dup);
                assert_eq!(retry.topic, "a");
                assert!(!fresh.dup);
                assert_eq!(fresh.topic, "b");
            }
            other => panic!("expected two PUBLISHes, got {other:?}"),
        }
        assert!(core.link_up());
    }

    #[test]
    fn test_control_requests_need_a_link() {
        let mut core = core();

        assert!(!core.request_subscribe("a/b", QoS::AtLeastOnce));
        assert!(!core.request_unsubscribe("a/b"));
        assert!(core.outgoing().is_empty());

        core.begin_session(Vec::new(), false);
        assert!(core.request_subscribe("a/b", QoS::AtLeastOnce));

        let packets = core.outgoing();
        let Packet::Subscribe(subscribe) = &packets[0] else {
            panic!("expected SUBSCRIBE");
        };
        assert_eq!(
            core.complete_control(subscribe.packet_id),
            Some(ControlRequest::Subscribe("a/b".to_string()))
        );
        assert_eq!(core.complete_control(subscribe.packet_id), None);
    }

    #[test]
    fn test_unconfirmed_unsubscribe_is_resent() {
        let mut core = core();
        core.begin_session(Vec::new(), false);
        core.request_unsubscribe("old/topic");
        core.outgoing();
        core.end_session();

        let start = core.begin_session(Vec::new(), true);

        assert_eq!(start.packets.len(), 1);
        assert!(matches!(
            &start.packets[0],
            Packet::Unsubscribe(u) if u.filters == vec!["old/topic".to_string()]
        ));
    }

    #[test]
    fn test_end_session_drops_unsent_control_packets() {
        let mut core = core();
        core.begin_session(Vec::new(), false);
        core.request_subscribe("a/b", QoS::AtLeastOnce);

        core.end_session();

        assert!(!core.link_up());
        assert!(core.outgoing().is_empty());
    }
}
