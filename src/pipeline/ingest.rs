//! Ingestion worker: sole owner of the serial bus.
//!
//! Each poll cycle it first services side-channel requests (keep-alive,
//! clock sync), then — on every other cycle, to bound bus contention —
//! drains one loss-queue entry by issuing a read-by-position replay, and
//! finally reads whatever the controller pushed on its own. Validated
//! records are persisted to the ring store, handed to the delivery queue and
//! acknowledged with a hardware pulse; malformed frames are discarded
//! silently and the loop moves on. No byte is ever replayed within this
//! worker.

use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{sleep, Duration};

use crate::config::Config;
use crate::metrics;
use crate::pipeline::{AckPulse, IngestControl, LossEntry};
use crate::protocol::{self, RecordScanner, TransactionRecord};
use crate::serial::SerialBus;
use crate::store::RingStore;

pub struct IngestionWorker {
    bus: Box<dyn SerialBus>,
    scanner: RecordScanner,
    store: Arc<RingStore>,
    delivery_tx: mpsc::Sender<TransactionRecord>,
    loss_rx: mpsc::Receiver<LossEntry>,
    control_rx: mpsc::Receiver<IngestControl>,
    ack: Arc<dyn AckPulse>,
    device_id: u8,
    settle_delay: Duration,
    cycle_delay: Duration,
    cycle: u64,
    rejected_seen: u64,
}

impl IngestionWorker {
    pub fn new(
        bus: Box<dyn SerialBus>,
        store: Arc<RingStore>,
        delivery_tx: mpsc::Sender<TransactionRecord>,
        loss_rx: mpsc::Receiver<LossEntry>,
        control_rx: mpsc::Receiver<IngestControl>,
        ack: Arc<dyn AckPulse>,
        config: &Config,
    ) -> Self {
        Self {
            bus,
            scanner: RecordScanner::new(),
            store,
            delivery_tx,
            loss_rx,
            control_rx,
            ack,
            device_id: config.gateway.device_id,
            settle_delay: Duration::from_millis(config.serial.settle_delay_ms),
            cycle_delay: Duration::from_millis(config.serial.cycle_delay_ms),
            cycle: 0,
            rejected_seen: 0,
        }
    }

    /// Announce ourselves to the controller once at startup.
    pub fn announce(&mut self) -> Result<()> {
        self.bus.write_frame(protocol::build_startup().as_bytes())
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.delivery_tx.is_closed() {
                debug!("delivery queue closed; ingestion worker stopping");
                return Ok(());
            }
            self.cycle = self.cycle.wrapping_add(1);

            while let Ok(control) = self.control_rx.try_recv() {
                self.handle_control(control).await?;
            }

            // Loss replay competes with live polling for the bus; only look
            // at the queue every other cycle.
            if self.cycle % 2 == 0 {
                if let Ok(entry) = self.loss_rx.try_recv() {
                    self.replay(entry).await?;
                }
            }

            self.drain_bus()?;
            self.accept_scanned().await;

            // Yield to the other workers and keep the watchdog fed.
            sleep(self.cycle_delay).await;
        }
    }

    async fn handle_control(&mut self, control: IngestControl) -> Result<()> {
        match control {
            IngestControl::KeepAlive => {
                debug!("issuing keep-alive startup poll");
                self.bus.write_frame(protocol::build_startup().as_bytes())?;
                metrics::inc_keepalives_sent();
            }
            IngestControl::SetClock(when) => {
                let frame = protocol::build_set_time(self.device_id, when);
                self.bus.write_frame(frame.as_bytes())?;
            }
        }
        sleep(self.settle_delay).await;
        Ok(())
    }

    /// Re-request one lost record from the controller.
    async fn replay(&mut self, entry: LossEntry) -> Result<()> {
        let position = match u16::try_from(entry.log_id)
            .ok()
            .map(protocol::build_read_by_position)
        {
            Some(Ok(frame)) => frame,
            _ => {
                warn!(
                    "Loss entry id {} outside controller position range; skipped",
                    entry.log_id
                );
                return Ok(());
            }
        };
        debug!(
            "replaying record at position {} (request_code={})",
            entry.log_id, entry.request_code
        );
        self.bus.write_frame(position.as_bytes())?;
        metrics::inc_records_replayed();
        // Controller turnaround time before its response shows up.
        sleep(self.settle_delay).await;
        self.drain_bus()?;
        Ok(())
    }

    /// Pull every buffered byte off the bus into the frame scanner.
    fn drain_bus(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        loop {
            let n = self.bus.read_available(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            self.scanner.push(&buf[..n]);
            if n < buf.len() {
                return Ok(());
            }
        }
    }

    /// Route every validated record into the pipeline.
    async fn accept_scanned(&mut self) {
        while let Some(record) = self.scanner.next_record() {
            self.accept(record).await;
        }
        let rejected = self.scanner.rejected();
        if rejected > self.rejected_seen {
            metrics::add_frames_rejected(rejected - self.rejected_seen);
            self.rejected_seen = rejected;
        }
    }

    async fn accept(&mut self, record: TransactionRecord) {
        // Persist before handing off for delivery; a store hiccup is logged
        // and the record still travels, but never the other way round.
        match self.store.append(&record).await {
            Ok(id) => debug!("record seq={} persisted as id={}", record.sequence, id),
            Err(e) => {
                warn!("Persist failed for record seq={}: {}", record.sequence, e);
                metrics::inc_store_append_errors();
            }
        }
        match self.delivery_tx.try_send(record) {
            Ok(()) => metrics::inc_records_ingested(),
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    "Delivery queue full; dropping record seq={}",
                    dropped.sequence
                );
                metrics::inc_records_dropped_queue_full();
            }
            Err(TrySendError::Closed(_)) => return,
        }
        // Receipt blink for the forecourt hardware; fire-and-forget.
        self.ack.pulse();
    }
}
