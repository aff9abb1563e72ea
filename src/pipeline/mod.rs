//! # Acquisition / Delivery Pipeline
//!
//! The pipeline decouples serial ingestion from broker delivery with two
//! bounded queues:
//!
//! - **Delivery Queue** — validated [`TransactionRecord`]s, produced by the
//!   ingestion worker, drained FIFO by the delivery worker.
//! - **Loss Queue** — record ids to re-request from the controller, produced
//!   by the recovery worker, drained opportunistically by the ingestion
//!   worker.
//!
//! Producers never block: a full queue rejects the push and the caller drops
//! (and counts) the item. Replayed records re-enter through the normal
//! validated path, so downstream they are indistinguishable from freshly
//! polled ones — which also means delivery order across polled and replayed
//! records is not guaranteed.
//!
//! Workers are fixed and long-lived; one-shot work arrives as messages, not
//! as freshly spawned tasks.

pub mod deliver;
pub mod ingest;
pub mod recovery;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::mpsc;

use crate::config::PipelineConfig;
use crate::protocol::TransactionRecord;

/// One id that must be re-requested from the pump controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossEntry {
    pub log_id: i32,
    pub request_code: u32,
}

/// Side-channel requests serviced by the ingestion worker, which is the sole
/// owner of the serial bus.
#[derive(Debug, Clone)]
pub enum IngestControl {
    /// Poll the controller with a startup frame to prove the link is alive.
    KeepAlive,
    /// Push the given clock into the controller.
    SetClock(DateTime<Utc>),
}

/// All channel endpoints wired between the pipeline workers.
pub struct Queues {
    pub delivery_tx: mpsc::Sender<TransactionRecord>,
    pub delivery_rx: mpsc::Receiver<TransactionRecord>,
    pub loss_tx: mpsc::Sender<LossEntry>,
    pub loss_rx: mpsc::Receiver<LossEntry>,
    pub control_tx: mpsc::Sender<IngestControl>,
    pub control_rx: mpsc::Receiver<IngestControl>,
}

/// Build the bounded queues from configured depths.
pub fn build_queues(cfg: &PipelineConfig) -> Queues {
    let (delivery_tx, delivery_rx) = mpsc::channel(cfg.delivery_queue_depth);
    let (loss_tx, loss_rx) = mpsc::channel(cfg.loss_queue_depth);
    let (control_tx, control_rx) = mpsc::channel(4);
    Queues {
        delivery_tx,
        delivery_rx,
        loss_tx,
        loss_rx,
        control_tx,
        control_rx,
    }
}

/// Hardware acknowledgment pulse fired for every accepted record.
///
/// Fire-and-forget; not part of correctness. The pump cashier display uses
/// it as a "record received" blink.
pub trait AckPulse: Send + Sync {
    fn pulse(&self);
}

/// Drives a GPIO value file with a fixed pair of pulses.
///
/// With no configured GPIO path the pulse degrades to a debug log line,
/// which is what bench setups run with.
pub struct GpioAck {
    path: Option<PathBuf>,
}

impl GpioAck {
    pub fn new(path: Option<&str>) -> Self {
        Self {
            path: path.map(PathBuf::from),
        }
    }
}

impl AckPulse for GpioAck {
    fn pulse(&self) {
        let Some(path) = self.path.clone() else {
            debug!("ack pulse (no GPIO configured)");
            return;
        };
        tokio::spawn(async move {
            for _ in 0..2 {
                let _ = tokio::fs::write(&path, "1").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = tokio::fs::write(&path, "0").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_respect_configured_depths() {
        let cfg = PipelineConfig {
            delivery_queue_depth: 2,
            loss_queue_depth: 1,
            ..PipelineConfig::default()
        };
        let q = build_queues(&cfg);
        assert_eq!(q.delivery_tx.max_capacity(), 2);
        assert_eq!(q.loss_tx.max_capacity(), 1);
    }

    #[tokio::test]
    async fn full_loss_queue_rejects_push() {
        let cfg = PipelineConfig {
            loss_queue_depth: 1,
            ..PipelineConfig::default()
        };
        let q = build_queues(&cfg);
        let entry = LossEntry {
            log_id: 5,
            request_code: 1,
        };
        q.loss_tx.try_send(entry).unwrap();
        assert!(q.loss_tx.try_send(entry).is_err());
    }
}
