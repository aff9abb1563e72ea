//! Connectivity state machine: walk to `Connected`, topic subscription,
//! suspension on broker loss, and restart escalation after exhausted WiFi
//! retry cycles.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_config, FakeRestart, MockTransport, StubApi};
use pumpgate::link::{ConnectivityWorker, LinkError, LinkState, NetLink};
use pumpgate::pipeline::build_queues;
use tokio::sync::watch;
use tokio::time::timeout;

/// Association attempts scripted as a pass/fail sequence; an exhausted
/// script keeps returning its last value.
struct ScriptedNet {
    outcomes: Vec<bool>,
}

impl ScriptedNet {
    fn new(outcomes: &[bool]) -> Self {
        Self {
            outcomes: outcomes.to_vec(),
        }
    }
}

impl NetLink for ScriptedNet {
    async fn associate(&mut self) -> Result<(), LinkError> {
        let up = if self.outcomes.len() > 1 {
            self.outcomes.remove(0)
        } else {
            self.outcomes.first().copied().unwrap_or(false)
        };
        if up {
            Ok(())
        } else {
            Err(LinkError::WifiDown("scripted".to_string()))
        }
    }
}

async fn wait_for<F: Fn(&LinkState) -> bool>(
    state_rx: &mut watch::Receiver<LinkState>,
    predicate: F,
) {
    timeout(Duration::from_secs(5), async {
        loop {
            if predicate(&state_rx.borrow()) {
                return;
            }
            state_rx.changed().await.expect("state channel open");
        }
    })
    .await
    .expect("state reached in time");
}

#[tokio::test]
async fn walks_to_connected_and_back_on_broker_loss() {
    let cfg = test_config("./ignored");
    let queues = build_queues(&cfg.pipeline);
    let transport = MockTransport::connected();
    let api = StubApi::new("acme", vec![]);
    let restart = Arc::new(FakeRestart::default());
    let (state_tx, mut state_rx) = watch::channel(LinkState::Disconnected);
    let (broker_tx, broker_rx) = watch::channel(true);

    // WiFi comes up on the second attempt.
    let mut worker = ConnectivityWorker::new(
        ScriptedNet::new(&[false, true]),
        api,
        transport.clone(),
        state_tx,
        broker_rx,
        queues.control_tx.clone(),
        restart.clone(),
        &cfg,
    );
    let handle = tokio::spawn(async move { worker.run().await });

    wait_for(&mut state_rx, |s| {
        matches!(s, LinkState::Connected(ctx) if ctx.company == "acme")
    })
    .await;

    // All four control topics subscribed, scoped by company and device.
    let subscribed = transport.subscribed();
    assert!(subscribed.contains(&"acme/restart/disp01".to_string()));
    assert!(subscribed.contains(&"acme/err/disp01".to_string()));
    assert!(subscribed.contains(&"acme/shift/disp01".to_string()));
    assert!(subscribed.contains(&"acme/mode/disp01".to_string()));

    // Broker drop suspends delivery and restarts the walk.
    broker_tx.send(false).expect("broker flag");
    wait_for(&mut state_rx, |s| !matches!(s, LinkState::Connected(_))).await;

    assert_eq!(restart.count(), 0);
    handle.abort();
}

#[tokio::test]
async fn exhausted_wifi_cycles_trigger_restart() {
    let mut cfg = test_config("./ignored");
    cfg.link.wifi_retry_limit = 2;
    cfg.link.max_retry_cycles = 3;
    let queues = build_queues(&cfg.pipeline);
    let transport = MockTransport::connected();
    let api = StubApi::new("acme", vec![]);
    let restart = Arc::new(FakeRestart::default());
    let (state_tx, _state_rx) = watch::channel(LinkState::Disconnected);
    let (_broker_tx, broker_rx) = watch::channel(false);

    let mut worker = ConnectivityWorker::new(
        ScriptedNet::new(&[false]),
        api,
        transport,
        state_tx,
        broker_rx,
        queues.control_tx.clone(),
        restart.clone(),
        &cfg,
    );
    let handle = tokio::spawn(async move { worker.run().await });

    timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker gives up in time")
        .expect("join")
        .expect("clean exit");
    assert_eq!(restart.count(), 1);
}

#[tokio::test]
async fn clock_sync_control_sent_on_connect() {
    let cfg = test_config("./ignored");
    let queues = build_queues(&cfg.pipeline);
    let mut control_rx = queues.control_rx;
    let transport = MockTransport::connected();
    let api = StubApi::new("acme", vec![]);
    let restart = Arc::new(FakeRestart::default());
    let (state_tx, _state_rx) = watch::channel(LinkState::Disconnected);
    let (_broker_tx, broker_rx) = watch::channel(true);

    let mut worker = ConnectivityWorker::new(
        ScriptedNet::new(&[true]),
        api,
        transport,
        state_tx,
        broker_rx,
        queues.control_tx.clone(),
        restart,
        &cfg,
    );
    let handle = tokio::spawn(async move { worker.run().await });

    let control = timeout(Duration::from_secs(5), control_rx.recv())
        .await
        .expect("control message")
        .expect("channel open");
    assert!(matches!(
        control,
        pumpgate::pipeline::IngestControl::SetClock(_)
    ));
    handle.abort();
}
