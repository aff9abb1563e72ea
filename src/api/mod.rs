//! # Remote API Collaborators
//!
//! Thin HTTP wrappers around the back-office endpoints the gateway consumes:
//! device settings, company identity (topic scoping), and the gap-detection
//! loss query. These are opaque request/response calls — no business logic
//! lives here, and every failure degrades to a logged retry or an empty
//! result by policy.

use anyhow::{Context, Result};
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ApiConfig;

/// Settings resolved for this device at connect time.
///
/// Kept deliberately small; the gateway only consumes the fields that affect
/// the pipeline. Unknown fields from the endpoint are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSettings {
    /// Request code echoed into loss queries.
    #[serde(default = "default_request_code")]
    pub request_code: u32,
    /// Whether to push a set-time frame to the controller after connecting.
    #[serde(default = "default_clock_sync")]
    pub clock_sync: bool,
}

fn default_request_code() -> u32 {
    1
}
fn default_clock_sync() -> bool {
    true
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            request_code: default_request_code(),
            clock_sync: default_clock_sync(),
        }
    }
}

/// Gap-detection query sent when a loss notification arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LossQuery {
    /// Device nozzle identity; must match ours or the notification is ignored.
    pub idvoi: u32,
    /// Query date, `YYYY-MM-DD`.
    pub today: String,
    pub request_code: u32,
    pub company: String,
}

impl LossQuery {
    pub fn new(idvoi: u32, request_code: u32, company: &str) -> Self {
        Self {
            idvoi,
            today: Utc::now().format("%Y-%m-%d").to_string(),
            request_code,
            company: company.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MissingEntry {
    contador: i32,
}

#[derive(Debug, Deserialize)]
struct CompanyResponse {
    company: String,
}

/// Remote lookups consumed by the connectivity and recovery workers.
#[allow(async_fn_in_trait)]
pub trait GatewayApi: Clone + Send + 'static {
    async fn fetch_settings(&self, device_topic: &str) -> Result<DeviceSettings>;

    async fn fetch_company(&self, device_topic: &str) -> Result<String>;

    /// Missing sequence counters for a gap notification. Network or parse
    /// failure yields zero entries, never an error — recovery is best-effort.
    async fn query_missing(&self, query: &LossQuery) -> Vec<i32>;
}

/// Production client over `reqwest`.
#[derive(Clone)]
pub struct DirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    pub fn new(cfg: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl GatewayApi for DirectoryClient {
    async fn fetch_settings(&self, device_topic: &str) -> Result<DeviceSettings> {
        let url = format!("{}/settings/{}", self.base_url, device_topic);
        let settings = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("settings lookup at {}", url))?
            .json::<DeviceSettings>()
            .await
            .context("settings response body")?;
        Ok(settings)
    }

    async fn fetch_company(&self, device_topic: &str) -> Result<String> {
        let url = format!("{}/company/{}", self.base_url, device_topic);
        let company = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("company lookup at {}", url))?
            .json::<CompanyResponse>()
            .await
            .context("company response body")?;
        Ok(company.company)
    }

    async fn query_missing(&self, query: &LossQuery) -> Vec<i32> {
        let url = format!("{}/loss", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(query)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        let entries: Vec<MissingEntry> = match response {
            Ok(r) => match r.json().await {
                Ok(list) => list,
                Err(e) => {
                    warn!("Loss query response unparseable: {}", e);
                    return Vec::new();
                }
            },
            Err(e) => {
                warn!("Loss query failed: {}", e);
                return Vec::new();
            }
        };
        entries.into_iter().map(|e| e.contador).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_query_serializes_expected_fields() {
        let q = LossQuery {
            idvoi: 204,
            today: "2026-08-30".to_string(),
            request_code: 7,
            company: "acme".to_string(),
        };
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["idvoi"], 204);
        assert_eq!(json["today"], "2026-08-30");
        assert_eq!(json["request_code"], 7);
        assert_eq!(json["company"], "acme");
    }

    #[test]
    fn missing_entries_parse_counter_field() {
        let body = r#"[{"contador": 101, "extra": true}, {"contador": 104}]"#;
        let entries: Vec<MissingEntry> = serde_json::from_str(body).unwrap();
        let ids: Vec<i32> = entries.into_iter().map(|e| e.contador).collect();
        assert_eq!(ids, vec![101, 104]);
    }

    #[test]
    fn settings_tolerate_sparse_body() {
        let s: DeviceSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.request_code, 1);
        assert!(s.clock_sync);
    }
}
