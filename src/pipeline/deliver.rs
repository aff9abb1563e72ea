//! Delivery worker: drains the delivery queue and publishes records.
//!
//! Runs only while the link state machine reports `Connected` and the broker
//! session is up — otherwise it parks without dequeueing, so records stay
//! queued for when connectivity returns. Each record gets a bounded number
//! of publish attempts with a fixed backoff; exhaustion drops the record
//! (at-least-once past the in-memory queue, never more than best-effort
//! beyond it).
//!
//! When nothing has been dequeued for the configured idle window the worker
//! asks the ingestion side for a keep-alive startup poll of the serial link,
//! the cheapest way to notice a silently wedged controller. The idle clock
//! resets on every successful dequeue, whatever the publish outcome.

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration, Instant};

use crate::config::Config;
use crate::link::LinkState;
use crate::metrics;
use crate::pipeline::IngestControl;
use crate::protocol::TransactionRecord;
use crate::transport::BrokerTransport;

pub struct DeliveryWorker<T: BrokerTransport> {
    rx: mpsc::Receiver<TransactionRecord>,
    transport: T,
    state_rx: watch::Receiver<LinkState>,
    control_tx: mpsc::Sender<IngestControl>,
    device_topic: String,
    publish_attempts: u32,
    publish_backoff: Duration,
    dequeue_wait: Duration,
    idle_keepalive: Duration,
    last_dequeue: Instant,
}

impl<T: BrokerTransport> DeliveryWorker<T> {
    pub fn new(
        rx: mpsc::Receiver<TransactionRecord>,
        transport: T,
        state_rx: watch::Receiver<LinkState>,
        control_tx: mpsc::Sender<IngestControl>,
        config: &Config,
    ) -> Self {
        Self {
            rx,
            transport,
            state_rx,
            control_tx,
            device_topic: config.gateway.device_topic.clone(),
            publish_attempts: config.pipeline.publish_attempts,
            publish_backoff: Duration::from_millis(config.pipeline.publish_backoff_ms),
            dequeue_wait: Duration::from_millis(config.pipeline.dequeue_wait_ms),
            idle_keepalive: Duration::from_secs(config.pipeline.idle_keepalive_secs),
            last_dequeue: Instant::now(),
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let topic = {
                let state = self.state_rx.borrow();
                state.context().map(|ctx| ctx.topics.txn.clone())
            };
            let topic = match topic {
                Some(t) if self.transport.is_connected() => t,
                _ => {
                    // Suspended: no dequeue, records remain queued.
                    let mut state_rx = self.state_rx.clone();
                    tokio::select! {
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                        _ = sleep(self.dequeue_wait) => {}
                    }
                    self.keepalive_if_idle();
                    continue;
                }
            };

            match timeout(self.dequeue_wait, self.rx.recv()).await {
                Ok(Some(record)) => {
                    // Idle accounting keys off the dequeue, not the publish.
                    self.last_dequeue = Instant::now();
                    self.publish_with_retry(&topic, record).await;
                }
                Ok(None) => return Ok(()),
                Err(_) => self.keepalive_if_idle(),
            }
        }
    }

    async fn publish_with_retry(&mut self, topic: &str, record: TransactionRecord) {
        let payload = serde_json::json!({
            "device": self.device_topic,
            "published_at": Utc::now().to_rfc3339(),
            "record": &record,
        });
        let bytes = payload.to_string();
        for attempt in 1..=self.publish_attempts {
            match self.transport.publish(topic, bytes.as_bytes()).await {
                Ok(()) => {
                    debug!(
                        "record seq={} published on {} (attempt {})",
                        record.sequence, topic, attempt
                    );
                    metrics::inc_records_published();
                    return;
                }
                Err(e) => {
                    warn!(
                        "Publish attempt {}/{} failed for seq={}: {}",
                        attempt, self.publish_attempts, record.sequence, e
                    );
                    metrics::inc_publish_retries();
                    if attempt < self.publish_attempts {
                        sleep(self.publish_backoff).await;
                    }
                }
            }
        }
        warn!(
            "Dropping record seq={} after {} publish attempts",
            record.sequence, self.publish_attempts
        );
        metrics::inc_records_dropped_publish();
    }

    fn keepalive_if_idle(&mut self) {
        if self.last_dequeue.elapsed() < self.idle_keepalive {
            return;
        }
        debug!("delivery idle past threshold; requesting serial keep-alive");
        if self.control_tx.try_send(IngestControl::KeepAlive).is_err() {
            warn!("Keep-alive request dropped; ingestion control queue full");
        }
        self.last_dequeue = Instant::now();
    }
}
