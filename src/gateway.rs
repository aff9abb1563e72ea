//! Gateway orchestrator: builds every component from config and runs the
//! fixed worker pool until shutdown or restart.
//!
//! Wiring, leaf-first: the ring store and serial link come up first (a store
//! that cannot mount even after reformat is fatal — there is no point
//! acquiring records we cannot hold), then the broker transport and queues,
//! then the four long-lived workers:
//!
//! - ingestion (owns the serial bus)
//! - delivery (owns the delivery queue consumer end)
//! - recovery (owns the inbound control stream)
//! - connectivity (owns the link state machine)

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::watch;

use crate::api::DirectoryClient;
use crate::config::Config;
use crate::link::{ConnectivityWorker, LinkState, ProcessRestart, RestartHandle, SysfsNetLink};
use crate::metrics;
use crate::pipeline::{self, GpioAck};
use crate::pipeline::deliver::DeliveryWorker;
use crate::pipeline::ingest::IngestionWorker;
use crate::pipeline::recovery::RecoveryWorker;
use crate::serial::SerialLink;
use crate::store::{RestartCounter, RingStore};
use crate::transport::MqttTransport;

pub struct Gateway;

impl Gateway {
    /// Bring the pipeline up and run until Ctrl-C.
    ///
    /// The only other exits are the restart escalations inside the workers,
    /// which leave through the process boundary rather than this function.
    pub async fn run(config: Config, port_override: Option<String>) -> Result<()> {
        let restarts = RestartCounter::new(config.restart_counter_path());
        let boot_count = restarts.increment().await;
        info!("Gateway boot #{}", boot_count);

        let (store, boot_id) = RingStore::open(config.txn_log_path(), config.store.capacity)
            .await
            .context("mounting transaction log")?;
        let store = Arc::new(store);
        info!("Transaction log resumes at id {}", boot_id);

        let port = port_override.unwrap_or_else(|| config.serial.port.clone());
        let bus = SerialLink::open(&port, config.serial.baud_rate)?;

        let (transport, inbound_rx, broker_connected_rx) = MqttTransport::start(&config.broker);
        let api = DirectoryClient::new(&config.api)?;
        let queues = pipeline::build_queues(&config.pipeline);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let restart: Arc<dyn RestartHandle> =
            Arc::new(ProcessRestart::new(&config.restart_counter_path()));
        let ack = Arc::new(GpioAck::new(config.gateway.ack_gpio_path.as_deref()));

        let mut ingestion = IngestionWorker::new(
            Box::new(bus),
            store.clone(),
            queues.delivery_tx.clone(),
            queues.loss_rx,
            queues.control_rx,
            ack,
            &config,
        );
        ingestion.announce().context("startup announce")?;

        let mut delivery = DeliveryWorker::new(
            queues.delivery_rx,
            transport.clone(),
            state_rx.clone(),
            queues.control_tx.clone(),
            &config,
        );

        let mut recovery = RecoveryWorker::new(
            inbound_rx,
            state_rx,
            queues.loss_tx,
            api.clone(),
            config.gateway.nozzle_id,
            restart.clone(),
        );

        let mut connectivity = ConnectivityWorker::new(
            SysfsNetLink::new(&config.link.interface),
            api,
            transport,
            state_tx,
            broker_connected_rx,
            queues.control_tx,
            restart,
            &config,
        );

        tokio::spawn(async move {
            if let Err(e) = ingestion.run().await {
                error!("Ingestion worker failed: {:#}", e);
            }
        });
        tokio::spawn(async move {
            if let Err(e) = delivery.run().await {
                error!("Delivery worker failed: {:#}", e);
            }
        });
        tokio::spawn(async move {
            if let Err(e) = recovery.run().await {
                error!("Recovery worker failed: {:#}", e);
            }
        });
        tokio::spawn(async move {
            if let Err(e) = connectivity.run().await {
                error!("Connectivity worker failed: {:#}", e);
            }
        });
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            tick.tick().await;
            loop {
                tick.tick().await;
                let m = metrics::snapshot();
                info!(
                    "stats: ingested={} published={} replayed={} rejected={} \
                     dropped_queue={} dropped_publish={} keepalives={}",
                    m.records_ingested,
                    m.records_published,
                    m.records_replayed,
                    m.frames_rejected,
                    m.records_dropped_queue_full,
                    m.records_dropped_publish,
                    m.keepalives_sent
                );
            }
        });
        info!("Pipeline workers running");

        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
        Ok(())
    }
}
