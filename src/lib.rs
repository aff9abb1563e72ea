//! # Pumpgate - Fuel-Dispenser Telemetry Gateway
//!
//! Pumpgate is firmware for a forecourt telemetry gateway. It polls a pump
//! controller over a serial link, persists every transaction in a circular
//! flash-style log, and forwards records to a remote message broker —
//! recovering any records the back office reports as lost in transit.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌──────────────┐  delivery queue  ┌──────────────┐
//! │  Pump        │──────────▶│  Ingestion    │─────────────────▶│  Delivery    │
//! │  Controller  │◀──────────│  Worker       │                  │  Worker      │
//! └──────────────┘  replays  └──────┬───────┘                  └──────┬───────┘
//!                                    │ persist                        │ publish
//!                             ┌──────▼───────┐                 ┌──────▼───────┐
//!                             │  Ring Store  │                 │  MQTT Broker │
//!                             └──────────────┘                 └──────┬───────┘
//!                                    ▲        loss queue              │ gap
//!                             ┌──────┴───────────────────────────────▼──────┐
//!                             │              Recovery Worker               │
//!                             └────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`protocol`] - wire frames, checksums and transaction record decode
//! - [`store`] - circular transaction log and restart counter
//! - [`serial`] - serial bus ownership and the `serialport` link
//! - [`transport`] - broker publish/subscribe over rumqttc
//! - [`pipeline`] - bounded queues and the ingestion/delivery/recovery workers
//! - [`link`] - connectivity state machine and reconnect worker
//! - [`api`] - settings, company and loss-query HTTP collaborators
//! - [`config`] - TOML configuration
//! - [`gateway`] - orchestrator wiring it all together
//!
//! ## Delivery guarantees
//!
//! At-least-once with bounded retry and drop-on-exhaustion past the
//! in-memory queue; the ring store is bounded capacity, oldest-wins. The
//! serial bus is a trusted local link with no authentication layer.

pub mod api;
pub mod config;
pub mod gateway;
pub mod link;
pub mod logutil;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod serial;
pub mod store;
pub mod transport;
