//! # Connectivity State Machine
//!
//! Owns the WiFi/broker connection lifecycle and decides which half of the
//! pipeline runs. The machine walks four states:
//!
//! ```text
//! Disconnected -> WifiConnecting -> WifiConnectedBrokerConnecting -> Connected
//!       ^                                                               |
//!       +------------------- broker/link loss --------------------------+
//! ```
//!
//! The reconnect worker and the delivery worker are a mutual-exclusion
//! toggle: while the state is anything but `Connected` the delivery worker
//! skips dequeueing and the reconnect worker drives retries; on `Connected`
//! the reconnect worker parks on the broker-session watch and delivery
//! resumes. At most one of the two makes progress at a time.
//!
//! WiFi retries are bounded per cycle; 20 consecutive exhausted cycles
//! escalate to the only recovery primitive this class of device has — a full
//! restart, counted in the persisted restart counter.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration};

use crate::api::{DeviceSettings, GatewayApi};
use crate::config::{BrokerConfig, Config, LinkConfig};
use crate::pipeline::IngestControl;
use crate::transport::BrokerTransport;

/// Errors raised by link management.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("wifi association failed: {0}")]
    WifiDown(String),

    #[error("broker session unavailable")]
    BrokerDown,
}

/// Topic strings derived from the company identity, the configured suffixes
/// and the device topic: `{company}{suffix}{device_topic}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub txn: String,
    pub error: String,
    pub restart: String,
    pub shift: String,
    pub mode: String,
}

impl TopicSet {
    pub fn derive(company: &str, broker: &BrokerConfig, device_topic: &str) -> Self {
        let join = |suffix: &str| format!("{}{}{}", company, suffix, device_topic);
        Self {
            txn: join(&broker.txn_suffix),
            error: join(&broker.error_suffix),
            restart: join(&broker.restart_suffix),
            shift: join(&broker.shift_suffix),
            mode: join(&broker.mode_suffix),
        }
    }
}

/// Everything resolved on the way to `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkContext {
    pub company: String,
    pub request_code: u32,
    pub topics: TopicSet,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    WifiConnecting,
    WifiConnectedBrokerConnecting,
    Connected(LinkContext),
}

impl LinkState {
    pub fn context(&self) -> Option<&LinkContext> {
        match self {
            LinkState::Connected(ctx) => Some(ctx),
            _ => None,
        }
    }
}

/// One WiFi association attempt.
#[allow(async_fn_in_trait)]
pub trait NetLink: Send + 'static {
    async fn associate(&mut self) -> Result<(), LinkError>;
}

/// Association check against the kernel's view of the interface.
pub struct SysfsNetLink {
    operstate: PathBuf,
    interface: String,
}

impl SysfsNetLink {
    pub fn new(interface: &str) -> Self {
        Self {
            operstate: PathBuf::from(format!("/sys/class/net/{}/operstate", interface)),
            interface: interface.to_string(),
        }
    }
}

impl NetLink for SysfsNetLink {
    async fn associate(&mut self) -> Result<(), LinkError> {
        match tokio::fs::read_to_string(&self.operstate).await {
            Ok(state) if state.trim() == "up" => Ok(()),
            Ok(state) => Err(LinkError::WifiDown(format!(
                "{} operstate is {}",
                self.interface,
                state.trim()
            ))),
            Err(e) => Err(LinkError::WifiDown(format!("{}: {}", self.interface, e))),
        }
    }
}

/// Escalation to a full device restart.
///
/// There is no finer recovery primitive: structural failures end here.
pub trait RestartHandle: Send + Sync {
    fn restart(&self, reason: &str);
}

/// Persists the restart counter and exits; the supervisor relaunches us.
pub struct ProcessRestart {
    counter_path: String,
}

impl ProcessRestart {
    pub fn new(counter_path: &str) -> Self {
        Self {
            counter_path: counter_path.to_string(),
        }
    }
}

impl RestartHandle for ProcessRestart {
    fn restart(&self, reason: &str) {
        let count = std::fs::read_to_string(&self.counter_path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0)
            + 1;
        if let Err(e) = std::fs::write(&self.counter_path, count.to_string()) {
            warn!("Failed to persist restart counter: {}", e);
        }
        warn!("Device restart #{}: {}", count, reason);
        std::process::exit(10);
    }
}

/// Reconnect worker driving the state machine.
pub struct ConnectivityWorker<N: NetLink, A: GatewayApi, B: BrokerTransport> {
    net: N,
    api: A,
    transport: B,
    state_tx: watch::Sender<LinkState>,
    broker_connected_rx: watch::Receiver<bool>,
    control_tx: mpsc::Sender<IngestControl>,
    restart: std::sync::Arc<dyn RestartHandle>,
    link_cfg: LinkConfig,
    broker_cfg: BrokerConfig,
    device_topic: String,
}

impl<N: NetLink, A: GatewayApi, B: BrokerTransport> ConnectivityWorker<N, A, B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        net: N,
        api: A,
        transport: B,
        state_tx: watch::Sender<LinkState>,
        broker_connected_rx: watch::Receiver<bool>,
        control_tx: mpsc::Sender<IngestControl>,
        restart: std::sync::Arc<dyn RestartHandle>,
        config: &Config,
    ) -> Self {
        Self {
            net,
            api,
            transport,
            state_tx,
            broker_connected_rx,
            control_tx,
            restart,
            link_cfg: config.link.clone(),
            broker_cfg: config.broker.clone(),
            device_topic: config.gateway.device_topic.clone(),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut exhausted_cycles = 0u32;
        loop {
            if self.state_tx.is_closed() {
                return Ok(());
            }
            self.state_tx.send_replace(LinkState::WifiConnecting);
            if !self.associate_with_retries().await {
                exhausted_cycles += 1;
                warn!(
                    "WiFi retry cycle exhausted ({}/{})",
                    exhausted_cycles, self.link_cfg.max_retry_cycles
                );
                if exhausted_cycles >= self.link_cfg.max_retry_cycles {
                    self.restart.restart("wifi association retries exhausted");
                    return Ok(());
                }
                self.state_tx.send_replace(LinkState::Disconnected);
                continue;
            }
            exhausted_cycles = 0;

            let (settings, company) = match self.resolve_identity().await {
                Some(resolved) => resolved,
                None => {
                    self.state_tx.send_replace(LinkState::Disconnected);
                    sleep(Duration::from_millis(self.link_cfg.broker_retry_delay_ms)).await;
                    continue;
                }
            };
            let topics = TopicSet::derive(&company, &self.broker_cfg, &self.device_topic);
            self.state_tx
                .send_replace(LinkState::WifiConnectedBrokerConnecting);

            if self.await_broker_session().await.is_err() {
                // Watch closed: the transport is gone, nothing left to drive.
                return Ok(());
            }
            for topic in [&topics.restart, &topics.error, &topics.shift, &topics.mode] {
                if let Err(e) = self.transport.subscribe(topic).await {
                    warn!("Subscribe to {} failed: {}", topic, e);
                }
            }
            if settings.clock_sync {
                let _ = self
                    .control_tx
                    .try_send(IngestControl::SetClock(Utc::now()));
            }
            let ctx = LinkContext {
                company,
                request_code: settings.request_code,
                topics,
            };
            info!("Link up; delivery resumed on topic {}", ctx.topics.txn);
            self.state_tx.send_replace(LinkState::Connected(ctx));

            // Suspended until the broker session drops.
            loop {
                if self.broker_connected_rx.changed().await.is_err() {
                    return Ok(());
                }
                if !*self.broker_connected_rx.borrow() {
                    break;
                }
            }
            warn!("Broker session lost; delivery suspended");
            self.state_tx.send_replace(LinkState::Disconnected);
        }
    }

    /// One bounded cycle of WiFi association attempts.
    async fn associate_with_retries(&mut self) -> bool {
        for attempt in 1..=self.link_cfg.wifi_retry_limit {
            match self.net.associate().await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        "WiFi association attempt {}/{} failed: {}",
                        attempt, self.link_cfg.wifi_retry_limit, e
                    );
                    sleep(Duration::from_millis(self.link_cfg.wifi_retry_delay_ms)).await;
                }
            }
        }
        false
    }

    async fn resolve_identity(&self) -> Option<(DeviceSettings, String)> {
        let settings = match self.api.fetch_settings(&self.device_topic).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Settings lookup failed: {:#}", e);
                return None;
            }
        };
        match self.api.fetch_company(&self.device_topic).await {
            Ok(company) => Some((settings, company)),
            Err(e) => {
                warn!("Company lookup failed: {:#}", e);
                None
            }
        }
    }

    /// Wait for the broker session flag, re-checking at a fixed delay.
    async fn await_broker_session(&mut self) -> Result<(), LinkError> {
        let retry = Duration::from_millis(self.link_cfg.broker_retry_delay_ms);
        loop {
            if *self.broker_connected_rx.borrow() {
                return Ok(());
            }
            match timeout(retry, self.broker_connected_rx.changed()).await {
                Ok(Err(_)) => return Err(LinkError::BrokerDown),
                Ok(Ok(())) | Err(_) => {
                    if !*self.broker_connected_rx.borrow() {
                        warn!("Broker connect pending; retrying");
                    }
                }
            }
        }
    }
}
