#![forbid(unsafe_code)]

//! Router API backend: polls the DHCP lease table and reports every active
//! lease as a sighting. Leases carry no RF data.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use efferve_kernel_contracts::observation::{CanonicalObservation, DeviceAddress, SourceId};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{SourceError, SourceExit};
use crate::shutdown::ShutdownSignal;

pub const LEASES_PATH: &str = "/api/dhcpv4/leases/search_lease";
pub const API_POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, PartialEq, Eq)]
pub struct ApiPollConfig {
    pub source_id: SourceId,
    /// Always `https://`, no trailing slash.
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl fmt::Debug for ApiPollConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiPollConfig")
            .field("source_id", &self.source_id)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ApiPollConfig {
    pub fn new(
        source_id: SourceId,
        base_url: &str,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source_id,
            base_url: normalize_base_url(base_url),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            poll_interval,
            request_timeout: API_POLL_REQUEST_TIMEOUT,
        }
    }

    pub fn leases_url(&self) -> String {
        format!("{}{}", self.base_url, LEASES_PATH)
    }
}

/// The lease API is HTTPS-only; plain `http://` input is upgraded.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("https://{rest}")
    } else if trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

#[derive(Debug, Deserialize)]
struct LeaseSearchResponse {
    #[serde(default)]
    rows: Vec<Value>,
}

/// Rows that are inactive, lack an address, or fail validation are dropped
/// one by one; only an unparseable body is an error.
pub fn parse_lease_rows(
    body: &str,
    source_id: &SourceId,
    now: DateTime<Utc>,
) -> Result<Vec<CanonicalObservation>, serde_json::Error> {
    let response: LeaseSearchResponse = serde_json::from_str(body)?;
    let mut out = Vec::with_capacity(response.rows.len());
    for row in &response.rows {
        let Some(mac) = row
            .get("mac")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
        else {
            continue;
        };
        let state = row.get("state").and_then(Value::as_str).unwrap_or("");
        if !(state.is_empty() || state == "active") {
            continue;
        }
        let hostname = row
            .get("hostname")
            .and_then(Value::as_str)
            .map(str::to_string);
        let parsed = DeviceAddress::parse(mac).and_then(|address| {
            CanonicalObservation::v1(address, now, None, None, hostname, None, source_id.clone())
        });
        match parsed {
            Ok(obs) => out.push(obs),
            Err(err) => {
                debug!(source_id = %source_id, mac, error = %err, "dropping malformed lease row")
            }
        }
    }
    Ok(out)
}

fn fetch_lease_page(config: &ApiPollConfig) -> Result<String, String> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(config.request_timeout)
        .timeout_read(config.request_timeout)
        .build();
    let credentials = STANDARD.encode(format!("{}:{}", config.api_key, config.api_secret));
    match agent
        .get(&config.leases_url())
        .set("accept", "application/json")
        .set("authorization", &format!("Basic {credentials}"))
        .call()
    {
        Ok(resp) => resp
            .into_string()
            .map_err(|err| format!("lease response read failed: {err}")),
        Err(ureq::Error::Status(code, _)) => {
            Err(format!("lease query failed with http status {code}"))
        }
        Err(ureq::Error::Transport(err)) => Err(format!("lease query transport error: {err}")),
    }
}

#[derive(Debug)]
pub struct ApiPollSource {
    config: ApiPollConfig,
}

impl ApiPollSource {
    pub fn new(config: ApiPollConfig) -> Self {
        Self { config }
    }

    pub async fn produce(
        self,
        mut shutdown: ShutdownSignal,
        out: mpsc::Sender<CanonicalObservation>,
    ) -> Result<SourceExit, SourceError> {
        let id = self.config.source_id.clone();
        info!(source_id = %id, url = %self.config.base_url, "polling lease api");
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(SourceExit::Cancelled),
                _ = ticker.tick() => {}
            }
            let config = self.config.clone();
            let fetch = tokio::task::spawn_blocking(move || fetch_lease_page(&config));
            let body = tokio::select! {
                _ = shutdown.cancelled() => return Ok(SourceExit::Cancelled),
                joined = fetch => joined
                    .map_err(|err| SourceError::unavailable(&id, err))?
                    .map_err(|reason| SourceError::unavailable(&id, reason))?,
            };
            let rows = parse_lease_rows(&body, &id, Utc::now()).map_err(|err| {
                SourceError::unavailable(&id, format!("lease response is not json: {err}"))
            })?;
            for obs in rows {
                if out.send(obs).await.is_err() {
                    return Ok(SourceExit::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn id() -> SourceId {
        SourceId::new("api_poll:router").unwrap()
    }

    #[test]
    fn base_url_is_upgraded_to_https() {
        assert_eq!(normalize_base_url("http://10.0.0.1/"), "https://10.0.0.1");
        assert_eq!(normalize_base_url("https://fw.lan"), "https://fw.lan");
        assert_eq!(normalize_base_url(" fw.lan// "), "https://fw.lan");
    }

    #[test]
    fn only_active_rows_with_addresses_are_emitted() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let body = r#"{"rows":[
            {"mac":"aa:bb:cc:11:22:33","hostname":"phone","state":"active"},
            {"mac":"00:11:22:33:44:55","hostname":"","state":""},
            {"mac":"00:11:22:33:44:66","state":"expired"},
            {"hostname":"ghost","state":"active"},
            {"mac":"","state":"active"},
            {"mac":"not-a-mac","state":"active"}
        ],"total":6}"#;
        let obs = parse_lease_rows(body, &id(), now).unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].device_address.as_str(), "AA:BB:CC:11:22:33");
        assert_eq!(obs[0].hostname.as_deref(), Some("phone"));
        assert_eq!(obs[0].signal_strength, None);
        assert_eq!(obs[1].hostname, None);
        assert!(obs.iter().all(|o| o.timestamp == now && o.source_id == id()));
    }

    #[test]
    fn non_json_body_is_an_error() {
        assert!(parse_lease_rows("<html>login</html>", &id(), Utc::now()).is_err());
        assert!(parse_lease_rows("{}", &id(), Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn debug_output_hides_secret() {
        let cfg = ApiPollConfig::new(id(), "fw.lan", "key", "hunter2", Duration::from_secs(30));
        assert!(!format!("{cfg:?}").contains("hunter2"));
        assert_eq!(cfg.leases_url(), "https://fw.lan/api/dhcpv4/leases/search_lease");
    }
}
