//! Loss-recovery worker: turns broker gap notifications into replay work.
//!
//! The back office notices sequence gaps in what it received and publishes a
//! loss query on our error topic. This worker validates that the
//! notification is really for this device, asks the gap-detection API which
//! sequence counters are missing, and enqueues each one for the ingestion
//! worker to re-request over the serial bus. Recovery is not re-triggered
//! while a prior one is still draining, and every failure along the way
//! degrades to a log line — lost records are worth one best-effort pass,
//! not a crash.
//!
//! The restart, shift and mode-change control topics land here too; restart
//! is the only one with teeth.

use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::api::{GatewayApi, LossQuery};
use crate::link::{LinkContext, LinkState, RestartHandle};
use crate::logutil::escape_log;
use crate::metrics;
use crate::pipeline::LossEntry;
use crate::transport::InboundMessage;

pub struct RecoveryWorker<A: GatewayApi> {
    inbound_rx: mpsc::Receiver<InboundMessage>,
    state_rx: watch::Receiver<LinkState>,
    loss_tx: mpsc::Sender<LossEntry>,
    api: A,
    nozzle_id: u32,
    restart: Arc<dyn RestartHandle>,
}

impl<A: GatewayApi> RecoveryWorker<A> {
    pub fn new(
        inbound_rx: mpsc::Receiver<InboundMessage>,
        state_rx: watch::Receiver<LinkState>,
        loss_tx: mpsc::Sender<LossEntry>,
        api: A,
        nozzle_id: u32,
        restart: Arc<dyn RestartHandle>,
    ) -> Self {
        Self {
            inbound_rx,
            state_rx,
            loss_tx,
            api,
            nozzle_id,
            restart,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        while let Some(message) = self.inbound_rx.recv().await {
            let ctx = match self.state_rx.borrow().context() {
                Some(ctx) => ctx.clone(),
                // Messages can race a disconnect; without topic context
                // there is nothing to match them against.
                None => continue,
            };
            self.dispatch(message, &ctx).await;
        }
        Ok(())
    }

    async fn dispatch(&mut self, message: InboundMessage, ctx: &LinkContext) {
        let topic = message.topic.as_str();
        if topic == ctx.topics.restart {
            self.restart.restart("restart requested via broker");
        } else if topic == ctx.topics.error {
            self.handle_gap(&message.payload).await;
        } else if topic == ctx.topics.shift {
            info!("Shift change notification received");
        } else if topic == ctx.topics.mode {
            info!("Mode change notification received");
        } else {
            debug!("Unrouted control message on {}", escape_log(topic));
        }
    }

    async fn handle_gap(&mut self, payload: &[u8]) {
        let query: LossQuery = match serde_json::from_slice(payload) {
            Ok(q) => q,
            Err(e) => {
                warn!("Gap notification unparseable: {}", e);
                return;
            }
        };
        if query.idvoi != self.nozzle_id {
            warn!(
                "Gap notification for nozzle {} ignored (ours is {})",
                query.idvoi, self.nozzle_id
            );
            return;
        }
        // A non-empty loss queue means a prior recovery is still in flight;
        // re-querying now would double-enqueue the same ids.
        if self.loss_tx.capacity() != self.loss_tx.max_capacity() {
            debug!("Recovery already in flight; gap notification skipped");
            return;
        }
        metrics::inc_loss_queries();
        let missing = self.api.query_missing(&query).await;
        info!(
            "Loss query returned {} missing record(s) for nozzle {}",
            missing.len(),
            query.idvoi
        );
        for log_id in missing {
            let entry = LossEntry {
                log_id,
                request_code: query.request_code,
            };
            match self.loss_tx.try_send(entry) {
                Ok(()) => metrics::inc_loss_entries_enqueued(),
                Err(e) => warn!("Loss queue rejected id {}: {}", log_id, e),
            }
        }
    }
}
