mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, connected, supervisor, EXCHANGE, QUEUE, ROUTING_KEY};
use resilient_rmq::rabbitmq::memory::{ConfirmBehavior, MemoryBroker};
use resilient_rmq::rabbitmq::message::CONTENT_TYPE_JSON;
use resilient_rmq::rabbitmq::{BrokerError, PublishOutcome, Publisher, Publishing};
use serde::Serialize;
use tokio::time::{sleep, Instant};

fn hello() -> Publishing {
    Publishing::new("abc", "text/plain", b"hello".to_vec())
}

#[tokio::test(start_paused = true)]
async fn confirmed_publish_while_connected() {
    let broker = MemoryBroker::new();
    let supervisor = connected(&broker, config()).await;
    let publisher = Publisher::new(supervisor.clone());

    let started = Instant::now();
    let outcome = publisher
        .publish(&hello(), EXCHANGE, ROUTING_KEY, started + Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(outcome, PublishOutcome::Confirmed);
    assert!(started.elapsed() < Duration::from_millis(100));

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].routed);
    assert_eq!(published[0].publishing.message_id, "abc");
    assert_eq!(published[0].publishing.body, b"hello");
    assert_eq!(broker.queue_depth(QUEUE), 1);

    publisher.close().await.unwrap();
    supervisor.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unbound_routing_key_is_unroutable() {
    let broker = MemoryBroker::new();
    let supervisor = connected(&broker, config()).await;
    let publisher = Publisher::new(supervisor.clone());

    let result = publisher
        .publish(&hello(), EXCHANGE, "nowhere", Instant::now() + Duration::from_secs(5))
        .await;

    match result {
        Err(BrokerError::Unroutable {
            exchange,
            routing_key,
        }) => {
            assert_eq!(exchange, EXCHANGE);
            assert_eq!(routing_key, "nowhere");
        }
        other => panic!("expected Unroutable, got {:?}", other),
    }
    // Not retried internally.
    assert_eq!(broker.published().len(), 1);
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn publish_blocks_while_disconnected_until_connected() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let supervisor = supervisor(&broker, config());
    supervisor.connect().unwrap();
    let publisher = Arc::new(Publisher::new(supervisor.clone()));

    let started = Instant::now();
    let task = tokio::spawn({
        let publisher = publisher.clone();
        async move {
            publisher
                .publish(&hello(), EXCHANGE, ROUTING_KEY, started + Duration::from_secs(5))
                .await
        }
    });

    sleep(Duration::from_secs(1)).await;
    assert!(!task.is_finished());
    assert!(broker.published().is_empty());

    broker.set_available(true);
    let outcome = task.await.unwrap().unwrap();

    assert_eq!(outcome, PublishOutcome::Confirmed);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn publish_fails_with_not_connected_at_the_deadline() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let supervisor = supervisor(&broker, config());
    supervisor.connect().unwrap();
    let publisher = Publisher::new(supervisor.clone());

    let started = Instant::now();
    let result = publisher
        .publish(&hello(), EXCHANGE, ROUTING_KEY, started + Duration::from_secs(1))
        .await;

    assert!(matches!(result, Err(BrokerError::NotConnected)));
    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert!(broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_confirm_is_a_soft_success() {
    let broker = MemoryBroker::new();
    broker.set_confirm_behavior(ConfirmBehavior::Silent);
    let supervisor = connected(&broker, config()).await;
    let publisher = Publisher::new(supervisor.clone());

    let started = Instant::now();
    let outcome = publisher
        .publish(&hello(), EXCHANGE, ROUTING_KEY, started + Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(outcome, PublishOutcome::Unconfirmed);
    assert_eq!(started.elapsed(), Duration::from_millis(100));
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn strict_confirms_surface_the_timeout() {
    let broker = MemoryBroker::new();
    broker.set_confirm_behavior(ConfirmBehavior::Silent);
    let supervisor = connected(&broker, config().with_strict_confirms(true)).await;
    let publisher = Publisher::new(supervisor.clone());

    let result = publisher
        .publish(&hello(), EXCHANGE, ROUTING_KEY, Instant::now() + Duration::from_secs(5))
        .await;

    assert!(matches!(result, Err(BrokerError::ConfirmTimeout)));
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn nacked_publish_is_sent_again() {
    let broker = MemoryBroker::new();
    broker.set_confirm_behavior(ConfirmBehavior::Nack);
    let supervisor = connected(&broker, config()).await;
    let publisher = Arc::new(Publisher::new(supervisor.clone()));

    let task = tokio::spawn({
        let publisher = publisher.clone();
        async move {
            publisher
                .publish(&hello(), EXCHANGE, ROUTING_KEY, Instant::now() + Duration::from_secs(5))
                .await
        }
    });

    sleep(Duration::from_millis(700)).await;
    broker.set_confirm_behavior(ConfirmBehavior::Ack);

    assert_eq!(task.await.unwrap().unwrap(), PublishOutcome::Confirmed);
    let published = broker.published();
    assert!(published.len() >= 2);
    assert!(published.iter().all(|p| p.publishing.message_id == "abc"));
}

#[tokio::test(start_paused = true)]
async fn nacks_until_the_deadline_report_nacked() {
    let broker = MemoryBroker::new();
    broker.set_confirm_behavior(ConfirmBehavior::Nack);
    let supervisor = connected(&broker, config()).await;
    let publisher = Publisher::new(supervisor.clone());

    let result = publisher
        .publish(&hello(), EXCHANGE, ROUTING_KEY, Instant::now() + Duration::from_secs(1))
        .await;

    assert!(matches!(result, Err(BrokerError::Nacked)));
}

#[tokio::test(start_paused = true)]
async fn publish_rides_out_a_dropped_connection() {
    let broker = MemoryBroker::new();
    let supervisor = connected(&broker, config()).await;
    let publisher = Publisher::new(supervisor.clone());

    publisher
        .publish(&hello(), EXCHANGE, ROUTING_KEY, Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();

    // The publisher still holds a channel on the dead connection.
    broker.drop_connections();

    let second = Publishing::text("def", "again");
    let outcome = publisher
        .publish(&second, EXCHANGE, ROUTING_KEY, Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(outcome, PublishOutcome::Confirmed);
    assert_eq!(broker.dial_attempts(), 2);
    let routed: Vec<String> = broker
        .published()
        .into_iter()
        .filter(|p| p.routed)
        .map(|p| p.publishing.message_id)
        .collect();
    assert_eq!(routed, vec!["abc".to_string(), "def".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_publishes_each_get_their_own_outcome() {
    let broker = MemoryBroker::new();
    let supervisor = connected(&broker, config()).await;
    let publisher = Arc::new(Publisher::new(supervisor.clone()));

    let mut tasks = Vec::new();
    for i in 0..12 {
        let publisher = publisher.clone();
        let routing_key = if i % 3 == 0 { "nowhere" } else { ROUTING_KEY };
        tasks.push(tokio::spawn(async move {
            let publishing = Publishing::text(format!("m-{}", i), "payload");
            let result = publisher
                .publish(&publishing, EXCHANGE, routing_key, Instant::now() + Duration::from_secs(5))
                .await;
            (i, routing_key, result)
        }));
    }

    for task in tasks {
        let (i, routing_key, result) = task.await.unwrap();
        if i % 3 == 0 {
            match result {
                Err(BrokerError::Unroutable {
                    routing_key: returned,
                    ..
                }) => assert_eq!(returned, routing_key),
                other => panic!("m-{} expected Unroutable, got {:?}", i, other),
            }
        } else {
            assert_eq!(result.unwrap(), PublishOutcome::Confirmed, "m-{}", i);
        }
    }

    // Every call went out once, over one shared channel.
    let published = broker.published();
    assert_eq!(published.len(), 12);
    for message in &published {
        let index: usize = message.publishing.message_id[2..].parse().unwrap();
        assert_eq!(message.routed, index % 3 != 0);
    }
    assert_eq!(broker.open_channels(), 1);
    assert_eq!(broker.queue_depth(QUEUE), 8);
}

#[derive(Serialize)]
struct UploadRequest {
    image_id: String,
    width: u32,
}

#[tokio::test(start_paused = true)]
async fn json_payloads_carry_content_type_and_fresh_ids() {
    let broker = MemoryBroker::new();
    let supervisor = connected(&broker, config()).await;
    let publisher = Publisher::new(supervisor.clone());

    let request = UploadRequest {
        image_id: "img-42".to_string(),
        width: 640,
    };
    let first = Publishing::json(&request).unwrap();
    let second = Publishing::json(&request).unwrap();
    assert_ne!(first.message_id, second.message_id);

    publisher
        .publish(&first, EXCHANGE, ROUTING_KEY, Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published[0].publishing.content_type, CONTENT_TYPE_JSON);
    let body: serde_json::Value = serde_json::from_slice(&published[0].publishing.body).unwrap();
    assert_eq!(body["image_id"], "img-42");
}
