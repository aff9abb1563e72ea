//! Test utilities & fixtures shared by the integration tests.
//!
//! Mocks live here so every test exercises the real workers against scripted
//! collaborators: a shareable in-memory serial bus, a scripted broker
//! transport, a canned directory API and a restart handle that records
//! instead of exiting.

#![allow(dead_code)] // Each test binary uses a subset of these helpers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use pumpgate::api::{DeviceSettings, GatewayApi, LossQuery};
use pumpgate::config::Config;
use pumpgate::link::RestartHandle;
use pumpgate::pipeline::AckPulse;
use pumpgate::protocol::TransactionRecord;
use pumpgate::serial::{MemoryBus, SerialBus};
use pumpgate::transport::{BrokerTransport, TransportError};

/// Config tuned for fast test loops.
pub fn test_config(data_dir: &str) -> Config {
    let mut cfg = Config::default();
    cfg.gateway.data_dir = data_dir.to_string();
    cfg.serial.settle_delay_ms = 1;
    cfg.serial.cycle_delay_ms = 1;
    cfg.pipeline.publish_backoff_ms = 1;
    cfg.pipeline.dequeue_wait_ms = 20;
    cfg.link.wifi_retry_delay_ms = 1;
    cfg.link.broker_retry_delay_ms = 5;
    cfg
}

/// A valid 32-byte record frame with recognizable field values.
pub fn record_frame(sequence: u32) -> [u8; 32] {
    TransactionRecord::encode(1, 7, sequence * 100, 1899, sequence * 10, sequence)
}

pub fn record(sequence: u32) -> TransactionRecord {
    TransactionRecord::decode(&record_frame(sequence)).expect("valid frame")
}

/// Clonable wrapper so tests keep a handle on the bus a worker owns.
#[derive(Clone, Default)]
pub struct SharedBus(pub Arc<Mutex<MemoryBus>>);

impl SharedBus {
    pub fn new(bus: MemoryBus) -> Self {
        Self(Arc::new(Mutex::new(bus)))
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.0.lock().expect("bus lock").written.clone()
    }

    pub fn feed(&self, data: &[u8]) {
        self.0.lock().expect("bus lock").feed(data);
    }
}

impl SerialBus for SharedBus {
    fn bytes_available(&mut self) -> anyhow::Result<usize> {
        self.0.lock().expect("bus lock").bytes_available()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        self.0.lock().expect("bus lock").read_available(buf)
    }

    fn write_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        self.0.lock().expect("bus lock").write_frame(frame)
    }
}

struct MockTransportState {
    /// Scripted outcomes for successive publishes; empty = succeed.
    script: VecDeque<Result<(), String>>,
    published: Vec<(String, Vec<u8>)>,
    subscribed: Vec<String>,
    connected: bool,
}

/// Broker transport with a scripted publish outcome sequence.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    pub fn connected() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockTransportState {
                script: VecDeque::new(),
                published: Vec::new(),
                subscribed: Vec::new(),
                connected: true,
            })),
        }
    }

    /// Queue publish outcomes; once exhausted every publish succeeds.
    pub fn script_publishes(&self, outcomes: &[Result<(), &str>]) {
        let mut state = self.state.lock().expect("transport lock");
        state.script = outcomes
            .iter()
            .map(|o| o.map_err(|e| e.to_string()))
            .collect();
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().expect("transport lock").connected = connected;
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().expect("transport lock").published.clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().expect("transport lock").subscribed.clone()
    }
}

impl BrokerTransport for MockTransport {
    fn is_connected(&self) -> bool {
        self.state.lock().expect("transport lock").connected
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("transport lock");
        match state.script.pop_front() {
            Some(Err(e)) => Err(TransportError::PublishFailed(e)),
            _ => {
                state.published.push((topic.to_string(), payload.to_vec()));
                Ok(())
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.state
            .lock()
            .expect("transport lock")
            .subscribed
            .push(topic.to_string());
        Ok(())
    }
}

/// Directory API returning canned answers.
#[derive(Clone)]
pub struct StubApi {
    pub company: String,
    pub missing: Arc<Mutex<Vec<i32>>>,
    pub queries: Arc<Mutex<Vec<LossQuery>>>,
}

impl StubApi {
    pub fn new(company: &str, missing: Vec<i32>) -> Self {
        Self {
            company: company.to_string(),
            missing: Arc::new(Mutex::new(missing)),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().expect("queries lock").len()
    }
}

impl GatewayApi for StubApi {
    async fn fetch_settings(&self, _device_topic: &str) -> anyhow::Result<DeviceSettings> {
        Ok(DeviceSettings::default())
    }

    async fn fetch_company(&self, _device_topic: &str) -> anyhow::Result<String> {
        Ok(self.company.clone())
    }

    async fn query_missing(&self, query: &LossQuery) -> Vec<i32> {
        self.queries
            .lock()
            .expect("queries lock")
            .push(query.clone());
        self.missing.lock().expect("missing lock").clone()
    }
}

/// Restart handle that records reasons instead of exiting.
#[derive(Default)]
pub struct FakeRestart {
    pub reasons: Mutex<Vec<String>>,
}

impl FakeRestart {
    pub fn count(&self) -> usize {
        self.reasons.lock().expect("reasons lock").len()
    }
}

impl RestartHandle for FakeRestart {
    fn restart(&self, reason: &str) {
        self.reasons
            .lock()
            .expect("reasons lock")
            .push(reason.to_string());
    }
}

/// Ack pulse that counts firings.
#[derive(Default)]
pub struct CountingAck {
    pub fired: std::sync::atomic::AtomicUsize,
}

impl AckPulse for CountingAck {
    fn pulse(&self) {
        self.fired
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
