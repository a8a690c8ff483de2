//! QoS 1/2 delivery across reconnects and process restarts

mod test_helpers;

use bytes::Bytes;
use safewatch::protocol::{Packet, Publish};
use safewatch::{ClientEvent, DeliveryState, InboundEvent, QoS};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_helpers::{eventually, mock_client, persistent_config, test_config, WAIT};

fn publishes_for(packets: &[Packet], packet_id: u16) -> Vec<Publish> {
    packets
        .iter()
        .filter_map(|packet| match packet {
            Packet::Publish(p) if p.packet_id == Some(packet_id) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

fn count(packets: &[Packet], wanted: &Packet) -> usize {
    packets.iter().filter(|p| *p == wanted).count()
}

#[tokio::test]
async fn test_offline_publish_is_sent_after_connect() {
    let (client, connector, _) = mock_client(test_config());

    let message = client
        .publish("iot/ack", "seen", QoS::AtLeastOnce)
        .await
        .unwrap();
    let id = message.packet_id.unwrap();
    assert_eq!(message.state, DeliveryState::Queued);

    client.start().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();

    assert!(
        connector
            .wait_for(|sent| publishes_for(sent, id).len() == 1, WAIT)
            .await
    );
    let mut pending_cleared = false;
    for _ in 0..200 {
        if client.pending_messages().await.is_empty() {
            pending_cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(pending_cleared);
    assert_eq!(client.metrics().delivery.messages_published, 1);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_subscriptions_precede_queued_publishes() {
    let (client, connector, _) = mock_client(test_config());
    client.publish("iot/ack", "early", QoS::AtMostOnce).await.unwrap();

    client.start().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();

    assert!(
        connector
            .wait_for(|sent| sent.iter().any(|p| matches!(p, Packet::Publish(_))), WAIT)
            .await
    );
    let sent = connector.sent();
    let first_subscribe = sent
        .iter()
        .position(|p| matches!(p, Packet::Subscribe(_)))
        .unwrap();
    let first_publish = sent
        .iter()
        .position(|p| matches!(p, Packet::Publish(_)))
        .unwrap();
    assert!(first_subscribe < first_publish);

    // QoS 0 is fire and forget
    assert!(client.pending_messages().await.is_empty());

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_unacknowledged_qos1_is_resent_with_dup() {
    let (client, connector, _) = mock_client(test_config());
    connector.set_auto_ack(false);
    connector.set_session_present(true);

    client.start().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();
    let id = client
        .publish("home/door", "open", QoS::AtLeastOnce)
        .await
        .unwrap()
        .packet_id
        .unwrap();
    assert!(
        connector
            .wait_for(|sent| publishes_for(sent, id).len() == 1, WAIT)
            .await
    );

    connector.set_auto_ack(true);
    connector.drop_connection();

    assert!(
        connector
            .wait_for(|sent| publishes_for(sent, id).len() == 2, WAIT)
            .await
    );
    let attempts = publishes_for(&connector.sent(), id);
    assert!(!attempts[0].dup);
    assert!(attempts[1].dup);
    assert_eq!(attempts[1].payload, Bytes::from_static(b"open"));

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_qos2_outbound_resumes_with_pubrel() {
    let (client, connector, _) = mock_client(test_config());
    connector.set_complete_releases(false);
    connector.set_session_present(true);

    client.start().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();
    let id = client
        .publish("home/plug", "off", QoS::ExactlyOnce)
        .await
        .unwrap()
        .packet_id
        .unwrap();

    assert!(
        connector
            .wait_for(|sent| count(sent, &Packet::PubRel(id)) == 1, WAIT)
            .await
    );
    assert_eq!(client.pending_messages().await[0].state, DeliveryState::Released);

    connector.set_complete_releases(true);
    connector.drop_connection();

    assert!(
        connector
            .wait_for(|sent| count(sent, &Packet::PubRel(id)) == 2, WAIT)
            .await
    );
    // after PUBREC the message itself is never sent again
    assert_eq!(publishes_for(&connector.sent(), id).len(), 1);

    let mut completed = false;
    for _ in 0..200 {
        if client.pending_messages().await.is_empty() {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(completed);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_qos2_inbound_is_delivered_once() {
    let (client, connector, _) = mock_client(test_config());
    connector.set_session_present(true);
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    client
        .subscribe(
            "home/+/motion",
            QoS::ExactlyOnce,
            Arc::new(move |_: &InboundEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    client.start().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();

    let publish = Publish::with_id("home/hall/motion", "detected", QoS::ExactlyOnce, 9);
    assert!(connector.inject(Packet::Publish(publish.clone())));
    assert!(
        connector
            .wait_for(|sent| count(sent, &Packet::PubRec(9)) == 1, WAIT)
            .await
    );

    // broker lost our PUBREC and retries over a new connection
    connector.drop_connection();
    assert!(connector.wait_for_connects(2, WAIT).await);
    client.wait_until_connected(WAIT).await.unwrap();

    let mut retry = publish;
    retry.dup = true;
    assert!(connector.inject(Packet::Publish(retry)));
    assert!(
        connector
            .wait_for(|sent| count(sent, &Packet::PubRec(9)) == 2, WAIT)
            .await
    );

    assert!(connector.inject(Packet::PubRel(9)));
    assert!(
        connector
            .wait_for(|sent| sent.contains(&Packet::PubComp(9)), WAIT)
            .await
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(client.metrics().delivery.duplicates_suppressed, 1);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_message_gives_up_after_max_retries() {
    let mut config = test_config();
    config.delivery.max_retries = 1;
    let (client, connector, _) = mock_client(config);
    connector.set_auto_ack(false);
    connector.set_session_present(true);
    let mut events = client.events();

    client.start().await.unwrap();
    client.wait_until_connected(WAIT).await.unwrap();
    let id = client
        .publish("home/door", "open", QoS::AtLeastOnce)
        .await
        .unwrap()
        .packet_id
        .unwrap();

    for attempt in 1..=2 {
        assert!(
            connector
                .wait_for(|sent| publishes_for(sent, id).len() == attempt, WAIT)
                .await
        );
        connector.drop_connection();
        assert!(connector.wait_for_connects(attempt + 1, WAIT).await);
    }

    let failed = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(ClientEvent::DeliveryFailed {
                packet_id,
                topic,
                attempts,
            }) = events.recv().await
            {
                return (packet_id, topic, attempts);
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(failed, (Some(id), "home/door".to_string(), 2));
    assert!(eventually(|| client.metrics().delivery.delivery_failures == 1).await);
    assert!(client.pending_messages().await.is_empty());

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();

    let (first_id, second_id) = {
        let (client, _, _) = mock_client(persistent_config(dir.path()));
        let first = client
            .publish("home/door", "open", QoS::AtLeastOnce)
            .await
            .unwrap();
        let second = client
            .publish("home/plug", "off", QoS::ExactlyOnce)
            .await
            .unwrap();
        assert!(!client.metrics().delivery.persistence_degraded);
        (first.packet_id.unwrap(), second.packet_id.unwrap())
    };

    {
        let (client, connector, _) = mock_client(persistent_config(dir.path()));
        let pending = client.pending_messages().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].topic, "home/door");
        assert_eq!(pending[1].topic, "home/plug");

        client.start().await.unwrap();
        client.wait_until_connected(WAIT).await.unwrap();
        assert!(
            connector
                .wait_for(
                    |sent| {
                        publishes_for(sent, first_id).len() == 1
                            && sent.contains(&Packet::PubRel(second_id))
                    },
                    WAIT
                )
                .await
        );

        let mut drained = false;
        for _ in 0..200 {
            if client.pending_messages().await.is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(drained);
        client.stop().await.unwrap();
    }

    let (client, _, _) = mock_client(persistent_config(dir.path()));
    assert!(client.pending_messages().await.is_empty());
}
