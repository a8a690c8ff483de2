//! The background worker that owns the broker link
//!
//! One task connects, replays the session, pumps packets and reconnects
//! with backoff until shutdown. A second task runs subscription handlers so
//! a slow handler never delays keep-alive traffic.

use super::{ClientEvent, ClientShared};
use crate::protocol::{Packet, ProtocolError, Publish, QoS};
use crate::subscriptions::{invoke_handlers, InboundEvent};
use crate::transport::mqtt::{
    jitter_sample, ConnectionEvent, HealthMonitor, KeepAlive, KeepAliveAction,
    ReconnectionDecision,
};
use crate::transport::{connection_params, Connected, ConnectionParams, Link, TransportError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// How a connected link ended
enum LinkEnd {
    Stopped,
    Lost(TransportError),
}

enum ConnectResult {
    Connected(Connected, ConnectionParams),
    Failed(TransportError),
    Stopped,
}

/// Connect, serve and reconnect until shutdown or an auth refusal
pub(crate) async fn run_session(
    shared: Arc<ClientShared>,
    mut shutdown_rx: watch::Receiver<bool>,
    dispatch_tx: mpsc::UnboundedSender<InboundEvent>,
) {
    let client_id = shared.client_id.clone();
    let reconnect = shared.config.reconnect.clone();
    let mut attempts: u32 = 0;

    info!(
        client_id = %client_id,
        broker = %crate::error::sanitize_error_message(&shared.config.broker.url),
        "Session worker started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        shared.transition(ConnectionEvent::ConnectStarted).await;

        let error = match connect_once(&shared, &mut shutdown_rx).await {
            ConnectResult::Stopped => break,
            ConnectResult::Failed(e) => {
                shared.metrics.connection_failed();
                e
            }
            ConnectResult::Connected(connected, params) => {
                attempts = 0;
                let mut driver = LinkDriver::new(&shared, connected, &params, &dispatch_tx);
                let end = driver.run(&mut shutdown_rx).await;
                shared.core.lock().await.end_session();
                match end {
                    LinkEnd::Stopped => break,
                    LinkEnd::Lost(e) => {
                        shared.metrics.connection_lost();
                        e
                    }
                }
            }
        };

        HealthMonitor::log_connection_loss(&error, &client_id);

        let decision = HealthMonitor::should_attempt_reconnection(
            attempts,
            &reconnect,
            *shutdown_rx.borrow(),
            Some(&error),
            jitter_sample(),
        );
        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                attempts = attempt;
                shared.metrics.reconnect_scheduled();
                shared
                    .transition(ConnectionEvent::ReconnectionScheduled(attempt))
                    .await;
                debug!(client_id = %client_id, attempt, delay_ms, "Waiting before reconnect");
                if !interruptible_sleep(&mut shutdown_rx, delay_ms).await {
                    break;
                }
            }
            ReconnectionDecision::AbortShutdownRequested => break,
            ReconnectionDecision::AbortAuthRejected(reason) => {
                let reason = crate::error::sanitize_error_message(&reason);
                shared.metrics.auth_rejected();
                shared.record_auth_failure(&reason);
                shared
                    .transition(ConnectionEvent::AuthRejected(reason.clone()))
                    .await;
                shared.emit(ClientEvent::AuthRejected { reason });
                info!(client_id = %client_id, "Session worker stopped after auth rejection");
                return;
            }
        }
    }

    shared.transition(ConnectionEvent::Stopped).await;
    info!(client_id = %client_id, "Session worker stopped");
}

async fn connect_once(
    shared: &ClientShared,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ConnectResult {
    let params = match connection_params(&shared.client_id, &shared.config.broker) {
        Ok(params) => params,
        Err(e) => return ConnectResult::Failed(e),
    };

    shared.metrics.connection_attempt();
    let started = Instant::now();
    let timeout = params.connect_timeout;
    let span = crate::mqtt_span!(client_id = %shared.client_id, broker = %params.broker);
    let attempt = tokio::time::timeout(timeout, shared.connector.connect(&params)).instrument(span);

    tokio::select! {
        result = attempt => match result {
            Ok(Ok(connected)) => {
                shared.metrics.connection_established(started.elapsed());
                debug!(
                    client_id = %shared.client_id,
                    session_present = connected.session_present,
                    "Broker accepted connection"
                );
                ConnectResult::Connected(connected, params)
            }
            Ok(Err(e)) => ConnectResult::Failed(e),
            Err(_) => ConnectResult::Failed(TransportError::TimedOut(timeout)),
        },
        _ = wait_for_shutdown(shutdown_rx) => ConnectResult::Stopped,
    }
}

/// Resolves once shutdown is requested or the client handle is gone
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
pub(crate) async fn interruptible_sleep(
    shutdown_rx: &mut watch::Receiver<bool>,
    delay_ms: u64,
) -> bool {
    tokio::select! {
        _ = wait_for_shutdown(shutdown_rx) => {
            info!("Shutdown signal received during reconnection delay, stopping");
            false
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Drives one connected link
struct LinkDriver<'a> {
    shared: &'a ClientShared,
    link: Box<dyn Link>,
    session_present: bool,
    keep_alive: KeepAlive,
    send_timeout: Duration,
    dispatch_tx: &'a mpsc::UnboundedSender<InboundEvent>,
}

impl<'a> LinkDriver<'a> {
    fn new(
        shared: &'a ClientShared,
        connected: Connected,
        params: &ConnectionParams,
        dispatch_tx: &'a mpsc::UnboundedSender<InboundEvent>,
    ) -> Self {
        Self {
            shared,
            link: connected.link,
            session_present: connected.session_present,
            keep_alive: KeepAlive::new(params.keep_alive, Instant::now()),
            send_timeout: params.send_timeout(),
            dispatch_tx,
        }
    }

    async fn run(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> LinkEnd {
        match self.serve(shutdown_rx).await {
            Ok(()) => {
                if let Err(e) = self.send(&Packet::Disconnect).await {
                    debug!(error = %e, "DISCONNECT not delivered");
                }
                let _ = self.link.close().await;
                LinkEnd::Stopped
            }
            Err(e) => {
                let _ = self.link.close().await;
                LinkEnd::Lost(e)
            }
        }
    }

    /// Replay the session, then pump packets until shutdown (Ok) or loss (Err)
    async fn serve(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<(), TransportError> {
        let (start, unsynced) = {
            let filters = self.shared.registry_filters();
            let mut core = self.shared.core.lock().await;
            let start = core.begin_session(filters, self.session_present);
            (start, self.shared.settle_store(&mut core))
        };
        self.shared.sync_store(unsynced).await;
        self.shared.report_resumption(start.failed, start.completed);

        for packet in &start.packets {
            self.send(packet).await?;
        }
        self.shared.transition(ConnectionEvent::SessionReady).await;

        loop {
            let deadline = self.keep_alive.next_deadline();

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                received = self.link.receive() => {
                    self.handle_packet(received?).await?;
                }
                _ = self.shared.outbound.notified() => {
                    self.flush().await?;
                }
                _ = sleep_until_deadline(deadline) => {
                    match self.keep_alive.poll(Instant::now()) {
                        KeepAliveAction::SendPing => {
                            self.send(&Packet::PingReq).await?;
                            self.keep_alive.on_ping_sent(Instant::now());
                        }
                        KeepAliveAction::TimedOut => {
                            return Err(TransportError::KeepAliveTimeout(
                                self.keep_alive.response_timeout(),
                            ));
                        }
                        KeepAliveAction::Idle => {}
                    }
                }
            }
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let result = match tokio::time::timeout(self.send_timeout, self.link.send(packet)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::TimedOut(self.send_timeout)),
        };

        if let Packet::Publish(publish) = packet {
            match &result {
                Ok(()) if !publish.dup => self.shared.metrics.message_published(),
                Ok(()) => {}
                Err(_) => self.shared.metrics.publish_failed(),
            }
        }
        result?;

        self.keep_alive.on_send(Instant::now());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let (packets, unsynced) = {
            let mut core = self.shared.core.lock().await;
            let packets = core.outgoing();
            (packets, self.shared.settle_store(&mut core))
        };
        self.shared.sync_store(unsynced).await;
        for packet in &packets {
            self.send(packet).await?;
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), TransportError> {
        self.keep_alive.on_receive(Instant::now());
        match packet {
            Packet::Publish(publish) => self.on_publish(publish).await,
            Packet::PubAck(id) => {
                let shared = self.shared;
                async move {
                    let unsynced = {
                        let mut core = shared.core.lock().await;
                        if core.queue.on_puback(id).is_none() {
                            debug!("PUBACK for unknown packet id");
                        }
                        shared.settle_store(&mut core)
                    };
                    shared.sync_store(unsynced).await;
                }
                .instrument(crate::delivery_span!(packet_id = id, kind = "puback"))
                .await;
                Ok(())
            }
            Packet::PubRec(id) => {
                let (reply, unsynced) = {
                    let mut core = self.shared.core.lock().await;
                    let reply = core.queue.on_pubrec(id);
                    (reply, self.shared.settle_store(&mut core))
                };
                self.shared.sync_store(unsynced).await;
                self.send(&reply).await
            }
            Packet::PubComp(id) => {
                let shared = self.shared;
                async move {
                    let unsynced = {
                        let mut core = shared.core.lock().await;
                        if core.queue.on_pubcomp(id).is_none() {
                            debug!("PUBCOMP for unknown packet id");
                        }
                        shared.settle_store(&mut core)
                    };
                    shared.sync_store(unsynced).await;
                }
                .instrument(crate::delivery_span!(packet_id = id, kind = "pubcomp"))
                .await;
                Ok(())
            }
            Packet::PubRel(id) => {
                let unsynced = {
                    let mut core = self.shared.core.lock().await;
                    if !core.queue.on_pubrel(id) {
                        debug!(packet_id = id, "PUBREL for unknown packet id");
                    }
                    self.shared.settle_store(&mut core)
                };
                self.shared.sync_store(unsynced).await;
                self.send(&Packet::PubComp(id)).await
            }
            Packet::SubAck(suback) => {
                let request = self.shared.core.lock().await.complete_control(suback.packet_id);
                if let Some(super::state::ControlRequest::Subscribe(filter)) = request {
                    if suback.has_failures() {
                        warn!(filter = %filter, "Broker rejected subscription");
                        self.shared
                            .emit(ClientEvent::SubscriptionRejected { filter });
                    } else {
                        debug!(filter = %filter, "Subscription confirmed");
                    }
                }
                Ok(())
            }
            Packet::UnsubAck(id) => {
                self.shared.core.lock().await.complete_control(id);
                Ok(())
            }
            Packet::PingResp => {
                self.keep_alive.on_ping_response(Instant::now());
                self.shared.metrics.ping_response();
                Ok(())
            }
            other => Err(TransportError::Protocol(ProtocolError::MalformedPacket(
                format!("unexpected {} from broker", other.name()),
            ))),
        }
    }

    async fn on_publish(&mut self, publish: Publish) -> Result<(), TransportError> {
        self.shared.metrics.message_received();
        let event = InboundEvent::from_publish(&publish, Utc::now());

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                self.deliver(event);
                Ok(())
            }
            (QoS::AtLeastOnce, Some(id)) => {
                self.deliver(event);
                self.send(&Packet::PubAck(id)).await
            }
            (QoS::ExactlyOnce, Some(id)) => {
                let (fresh, unsynced) = {
                    let mut core = self.shared.core.lock().await;
                    let fresh = core.queue.on_inbound_qos2(id);
                    (fresh, self.shared.settle_store(&mut core))
                };
                self.shared.sync_store(unsynced).await;
                if fresh {
                    self.deliver(event);
                } else {
                    debug!(packet_id = id, topic = %publish.topic, "Redelivered QoS 2 message not dispatched again");
                    self.shared.metrics.duplicate_suppressed();
                }
                self.send(&Packet::PubRec(id)).await
            }
            (qos, None) => Err(TransportError::Protocol(ProtocolError::MalformedPacket(
                format!("QoS {} PUBLISH without packet id", u8::from(qos)),
            ))),
        }
    }

    fn deliver(&self, event: InboundEvent) {
        if self.dispatch_tx.send(event).is_err() {
            warn!("Dispatch task is gone, dropping inbound event");
        }
    }
}

/// Route inbound events to matching handlers until the worker goes away
pub(crate) async fn run_dispatch(
    shared: Arc<ClientShared>,
    mut events: mpsc::UnboundedReceiver<InboundEvent>,
) {
    while let Some(event) = events.recv().await {
        let handlers = shared.matching_handlers(&event.topic);
        if handlers.is_empty() {
            debug!(topic = %event.topic, "No subscription matches inbound topic");
            continue;
        }
        invoke_handlers(&handlers, &event);
    }
    debug!("Dispatch task finished");
}
