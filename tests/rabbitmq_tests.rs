//! Tests against a live RabbitMQ broker configured through `RABBITMQ_*`
//! variables. Run with `cargo test -- --ignored`.

use std::time::Duration;

use dbkit::adapters::rabbitmq::{ConsumeOptions, ExchangeKind, RabbitMq};
use rstest::rstest;
use tokio::sync::mpsc;
use uuid::Uuid;

#[rstest]
#[tokio::test]
#[ignore = "requires a RabbitMQ broker"]
async fn test_send_message_reaches_consumer() {
    let broker = RabbitMq::from_env().await.expect("Failed to connect");
    let exchange = format!("dbkit.test.{}", Uuid::new_v4());
    let (sender, mut receiver) = mpsc::unbounded_channel::<String>();

    let consumption = broker
        .receive_message(
            &ConsumeOptions::new(&exchange, ExchangeKind::Fanout).with_auto_ack(false),
            move |message| {
                let _ = sender.send(message.payload_text().into_owned());
                Ok(())
            },
        )
        .await
        .unwrap();

    broker
        .send_message(&exchange, "", b"ping", ExchangeKind::Fanout)
        .await
        .unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(payload, "ping");
    consumption.cancel().await;
    broker.close().await;
}

#[rstest]
#[tokio::test]
#[ignore = "requires a RabbitMQ broker"]
async fn test_declare_and_bind_returns_generated_name() {
    let broker = RabbitMq::from_env().await.expect("Failed to connect");
    let exchange = format!("dbkit.test.{}", Uuid::new_v4());
    broker
        .declare_exchange(&exchange, ExchangeKind::Direct, false)
        .await
        .unwrap();

    let queue = broker
        .declare_and_bind_queue("", &exchange, "key", true)
        .await
        .unwrap();

    assert!(queue.starts_with("amq.gen-"));
    broker.close().await;
}
