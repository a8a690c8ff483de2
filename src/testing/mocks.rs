//! Mock implementations for testing
//!
//! [`MockConnector`] stands in for the broker: it scripts CONNACK outcomes,
//! records every packet the client writes and acknowledges publishes,
//! subscriptions and pings the way a well-behaved broker would. Each
//! acknowledgement kind can be switched off to hold a flow mid-way.

use crate::notifications::{Notification, Notifier};
use crate::protocol::{Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, SUBACK_FAILURE};
use crate::transport::{ConnectionParams, Connected, Connector, Link, TransportError};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted answer to one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept { session_present: bool },
    /// CONNACK with a non-zero return code
    Refuse(ConnectReturnCode),
    /// Socket-level failure before CONNACK
    Fail,
    /// Never answers; only a timeout or shutdown ends the attempt
    Hang,
}

struct LinkHandle {
    to_client: mpsc::UnboundedSender<Packet>,
    closed: Arc<AtomicBool>,
}

struct BrokerState {
    script: Mutex<VecDeque<ConnectOutcome>>,
    connects: Mutex<Vec<Connect>>,
    sent: Mutex<Vec<Packet>>,
    current: Mutex<Option<LinkHandle>>,
    rejected_filters: Mutex<HashSet<String>>,
    session_present: AtomicBool,
    ack_publishes: AtomicBool,
    complete_releases: AtomicBool,
    answer_pings: AtomicBool,
    changed: Notify,
}

impl BrokerState {
    fn reply(&self, packet: Packet) {
        if let Some(handle) = lock(&self.current).as_ref() {
            let _ = handle.to_client.send(packet);
        }
    }

    fn auto_reply(&self, packet: &Packet) {
        let reply = match packet {
            Packet::Publish(Publish {
                qos: QoS::AtLeastOnce,
                packet_id: Some(id),
                ..
            }) if self.ack_publishes.load(Ordering::SeqCst) => Some(Packet::PubAck(*id)),
            Packet::Publish(Publish {
                qos: QoS::ExactlyOnce,
                packet_id: Some(id),
                ..
            }) if self.ack_publishes.load(Ordering::SeqCst) => Some(Packet::PubRec(*id)),
            Packet::PubRel(id) if self.complete_releases.load(Ordering::SeqCst) => {
                Some(Packet::PubComp(*id))
            }
            Packet::Subscribe(subscribe) => {
                let rejected = lock(&self.rejected_filters);
                Some(Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes: subscribe
                        .filters
                        .iter()
                        .map(|(filter, qos)| {
                            if rejected.contains(filter) {
                                SUBACK_FAILURE
                            } else {
                                u8::from(*qos)
                            }
                        })
                        .collect(),
                }))
            }
            Packet::Unsubscribe(unsubscribe) => Some(Packet::UnsubAck(unsubscribe.packet_id)),
            Packet::PingReq if self.answer_pings.load(Ordering::SeqCst) => Some(Packet::PingResp),
            _ => None,
        };
        if let Some(reply) = reply {
            self.reply(reply);
        }
    }
}

/// In-process broker double implementing [`Connector`]
///
/// Clones share the same broker, so a test keeps one handle while the client
/// owns another.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<BrokerState>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                script: Mutex::new(VecDeque::new()),
                connects: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                current: Mutex::new(None),
                rejected_filters: Mutex::new(HashSet::new()),
                session_present: AtomicBool::new(false),
                ack_publishes: AtomicBool::new(true),
                complete_releases: AtomicBool::new(true),
                answer_pings: AtomicBool::new(true),
                changed: Notify::new(),
            }),
        }
    }

    /// Outcomes for the next connect attempts, in order
    ///
    /// Once the script runs out every attempt is accepted.
    pub fn script<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = ConnectOutcome>,
    {
        lock(&self.state.script).extend(outcomes);
    }

    /// Session-present flag used when no scripted outcome is left
    pub fn set_session_present(&self, present: bool) {
        self.state.session_present.store(present, Ordering::SeqCst);
    }

    /// PUBACK/PUBREC for client publishes
    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.ack_publishes.store(enabled, Ordering::SeqCst);
    }

    /// PUBCOMP for client PUBRELs
    pub fn set_complete_releases(&self, enabled: bool) {
        self.state.complete_releases.store(enabled, Ordering::SeqCst);
    }

    pub fn set_answer_pings(&self, enabled: bool) {
        self.state.answer_pings.store(enabled, Ordering::SeqCst);
    }

    /// SUBACK this filter with the failure code
    pub fn reject_filter(&self, filter: &str) {
        lock(&self.state.rejected_filters).insert(filter.to_string());
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state.connects).len()
    }

    /// CONNECT packets seen so far
    pub fn connects(&self) -> Vec<Connect> {
        lock(&self.state.connects).clone()
    }

    /// Every packet the client wrote, across all links
    pub fn sent(&self) -> Vec<Packet> {
        lock(&self.state.sent).clone()
    }

    pub fn sent_publishes(&self) -> Vec<Publish> {
        lock(&self.state.sent)
            .iter()
            .filter_map(|packet| match packet {
                Packet::Publish(publish) => Some(publish.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        lock(&self.state.sent).clear();
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state.current)
            .as_ref()
            .is_some_and(|handle| !handle.closed.load(Ordering::SeqCst))
    }

    /// Deliver a packet to the client over the current link
    pub fn inject(&self, packet: Packet) -> bool {
        match lock(&self.state.current).as_ref() {
            Some(handle) => handle.to_client.send(packet).is_ok(),
            None => false,
        }
    }

    /// Sever the current link as if the network went away
    pub fn drop_connection(&self) {
        if let Some(handle) = lock(&self.state.current).take() {
            handle.closed.store(true, Ordering::SeqCst);
        }
        self.state.changed.notify_waiters();
    }

    /// Wait until the packets written so far satisfy `predicate`
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(&[Packet]) -> bool,
    {
        self.wait_until(|| predicate(&lock(&self.state.sent)), timeout)
            .await
    }

    /// Wait until at least `count` connect attempts were made
    pub async fn wait_for_connects(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(|| self.connect_count() >= count, timeout)
            .await
    }

    async fn wait_until<F>(&self, condition: F, timeout: Duration) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.state.changed.notified();
            if condition() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return condition();
            }
        }
    }
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector")
            .field("connects", &self.connect_count())
            .field("sent", &lock(&self.state.sent).len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Connected, TransportError> {
        lock(&self.state.connects).push(params.connect_packet());
        self.state.changed.notify_waiters();

        let outcome = lock(&self.state.script).pop_front().unwrap_or(ConnectOutcome::Accept {
            session_present: self.state.session_present.load(Ordering::SeqCst),
        });

        match outcome {
            ConnectOutcome::Accept { session_present } => {
                let (to_client, from_broker) = mpsc::unbounded_channel();
                let closed = Arc::new(AtomicBool::new(false));
                let previous = lock(&self.state.current).replace(LinkHandle {
                    to_client,
                    closed: Arc::clone(&closed),
                });
                if let Some(previous) = previous {
                    previous.closed.store(true, Ordering::SeqCst);
                }

                Ok(Connected {
                    link: Box::new(MockLink {
                        state: Arc::clone(&self.state),
                        inbox: from_broker,
                        closed,
                    }),
                    session_present,
                })
            }
            ConnectOutcome::Refuse(code) => Err(TransportError::Refused(code)),
            ConnectOutcome::Fail => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock broker unreachable",
            ))),
            ConnectOutcome::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Closed)
            }
        }
    }
}

/// Client side of a mock connection
pub struct MockLink {
    state: Arc<BrokerState>,
    inbox: mpsc::UnboundedReceiver<Packet>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Link for MockLink {
    async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        lock(&self.state.sent).push(packet.clone());
        self.state.auto_reply(packet);
        self.state.changed.notify_waiters();
        Ok(())
    }

    async fn receive(&mut self) -> Result<Packet, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.inbox.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.inbox.close();
        Ok(())
    }
}

/// Notifier that keeps everything it was asked to show
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    shown: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        lock(&self.shown).len()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.shown).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        lock(&self.shown).push(notification.clone());
    }
}
