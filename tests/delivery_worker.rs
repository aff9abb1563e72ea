//! Delivery worker behavior: link gating, bounded publish retry and the
//! idle keep-alive request.

mod common;

use std::time::Duration;

use common::{record, test_config, MockTransport};
use pumpgate::config::BrokerConfig;
use pumpgate::link::{LinkContext, LinkState, TopicSet};
use pumpgate::pipeline::deliver::DeliveryWorker;
use pumpgate::pipeline::{build_queues, IngestControl};
use tokio::sync::watch;
use tokio::time::timeout;

fn connected_state() -> LinkState {
    LinkState::Connected(LinkContext {
        company: "acme".to_string(),
        request_code: 1,
        topics: TopicSet::derive("acme", &BrokerConfig::default(), "disp01"),
    })
}

#[tokio::test]
async fn publishes_on_third_attempt_then_moves_on() {
    let cfg = test_config("./ignored");
    let queues = build_queues(&cfg.pipeline);
    let transport = MockTransport::connected();
    transport.script_publishes(&[Err("net down"), Err("net down"), Ok(())]);
    let (state_tx, state_rx) = watch::channel(connected_state());

    let mut worker = DeliveryWorker::new(
        queues.delivery_rx,
        transport.clone(),
        state_rx,
        queues.control_tx.clone(),
        &cfg,
    );
    let handle = tokio::spawn(async move { worker.run().await });

    queues.delivery_tx.send(record(1)).await.expect("enqueue");
    queues.delivery_tx.send(record(2)).await.expect("enqueue");
    drop(queues.delivery_tx);

    timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker drains queue")
        .expect("join")
        .expect("clean exit");

    // Record 1 lands on attempt three, record 2 immediately after.
    let published = transport.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].0, "acme/txn/disp01");
    let first: serde_json::Value =
        serde_json::from_slice(&published[0].1).expect("payload is json");
    assert_eq!(first["record"]["sequence"], 1);
    assert_eq!(first["device"], "disp01");
    let second: serde_json::Value =
        serde_json::from_slice(&published[1].1).expect("payload is json");
    assert_eq!(second["record"]["sequence"], 2);

    drop(state_tx);
}

#[tokio::test]
async fn exhausted_retries_drop_the_record() {
    let cfg = test_config("./ignored");
    let queues = build_queues(&cfg.pipeline);
    let transport = MockTransport::connected();
    // Three failures for record 1; record 2 then succeeds.
    transport.script_publishes(&[Err("x"), Err("x"), Err("x")]);
    let (_state_tx, state_rx) = watch::channel(connected_state());

    let mut worker = DeliveryWorker::new(
        queues.delivery_rx,
        transport.clone(),
        state_rx,
        queues.control_tx.clone(),
        &cfg,
    );
    let handle = tokio::spawn(async move { worker.run().await });

    queues.delivery_tx.send(record(1)).await.expect("enqueue");
    queues.delivery_tx.send(record(2)).await.expect("enqueue");
    drop(queues.delivery_tx);

    timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker drains queue")
        .expect("join")
        .expect("clean exit");

    let published = transport.published();
    assert_eq!(published.len(), 1, "record 1 dropped after 3 attempts");
    let payload: serde_json::Value =
        serde_json::from_slice(&published[0].1).expect("payload is json");
    assert_eq!(payload["record"]["sequence"], 2);
}

#[tokio::test]
async fn no_dequeue_while_disconnected() {
    let cfg = test_config("./ignored");
    let queues = build_queues(&cfg.pipeline);
    let transport = MockTransport::connected();
    let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

    let mut worker = DeliveryWorker::new(
        queues.delivery_rx,
        transport.clone(),
        state_rx,
        queues.control_tx.clone(),
        &cfg,
    );
    let handle = tokio::spawn(async move { worker.run().await });

    queues.delivery_tx.send(record(5)).await.expect("enqueue");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        transport.published().is_empty(),
        "suspended worker must not publish"
    );

    // Resuming the link releases the queued record.
    state_tx.send(connected_state()).expect("state update");
    drop(queues.delivery_tx);
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker resumes")
        .expect("join")
        .expect("clean exit");
    assert_eq!(transport.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_window_requests_serial_keepalive() {
    let mut cfg = test_config("./ignored");
    cfg.pipeline.idle_keepalive_secs = 300;
    let queues = build_queues(&cfg.pipeline);
    let transport = MockTransport::connected();
    let (_state_tx, state_rx) = watch::channel(connected_state());
    let mut control_rx = queues.control_rx;

    let mut worker = DeliveryWorker::new(
        queues.delivery_rx,
        transport,
        state_rx,
        queues.control_tx.clone(),
        &cfg,
    );
    let handle = tokio::spawn(async move { worker.run().await });

    // Paused time fast-forwards through the five idle minutes.
    let control = timeout(Duration::from_secs(400), control_rx.recv())
        .await
        .expect("keep-alive within idle window")
        .expect("control message");
    assert!(matches!(control, IngestControl::KeepAlive));

    handle.abort();
}
