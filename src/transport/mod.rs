//! # Broker Transport
//!
//! Publish/subscribe access to the remote message broker. The gateway
//! publishes JSON-encoded transaction records and listens on a small set of
//! control topics (restart, gap notification, shift, mode-change).
//!
//! [`BrokerTransport`] is the seam between the pipeline and MQTT: production
//! uses [`MqttTransport`] over `rumqttc`, tests script a mock. Delivery is
//! at-least-once past the in-memory queue — a publish that exhausts its
//! bounded retries is dropped, never persisted for later.
//!
//! The rumqttc event loop runs as its own task. It maintains a `connected`
//! watch flag consumed by the connectivity state machine and routes inbound
//! publishes onto a bounded channel consumed by the loss-recovery worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::BrokerConfig;
use crate::logutil::escape_log;

/// Depth of the inbound control-message channel.
const INBOUND_DEPTH: usize = 16;

/// Errors surfaced by the messaging transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}

/// One message received from a subscribed control topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Minimal broker surface the pipeline workers need.
///
/// Clonable so the delivery worker and the connectivity worker can share one
/// underlying session.
#[allow(async_fn_in_trait)]
pub trait BrokerTransport: Clone + Send + 'static {
    /// Current session state as last reported by the event loop.
    fn is_connected(&self) -> bool;

    /// Publish one payload. A single attempt; retry policy lives with the
    /// caller.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to a control topic.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// Production MQTT transport over `rumqttc`.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Build the client and spawn the event loop task.
    ///
    /// Returns the transport handle, the inbound control-message stream, and
    /// a watch of the session state for the connectivity worker. The session
    /// itself comes up (and reconnects) in the background; publishing before
    /// the first ConnAck fails with [`TransportError::NotConnected`].
    pub fn start(
        cfg: &BrokerConfig,
    ) -> (Self, mpsc::Receiver<InboundMessage>, watch::Receiver<bool>) {
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let connected = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
        let (connected_tx, connected_rx) = watch::channel(false);

        let flag = connected.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("broker session established");
                        flag.store(true, Ordering::SeqCst);
                        let _ = connected_tx.send(true);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if inbound_tx.try_send(msg).is_err() {
                            warn!(
                                "Inbound control queue full; dropping message on {}",
                                escape_log(&publish.topic)
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if flag.swap(false, Ordering::SeqCst) {
                            warn!("Broker connection lost: {}", e);
                        }
                        let _ = connected_tx.send(false);
                        // rumqttc reconnects on the next poll; pace it.
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
                if inbound_tx.is_closed() {
                    return;
                }
            }
        });

        (Self { client, connected }, inbound_rx, connected_rx)
    }
}

impl BrokerTransport for MqttTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))
    }
}
