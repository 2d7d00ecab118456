#![forbid(unsafe_code)]

//! Environment-driven configuration. Numeric knobs fall back to their
//! defaults when unset or out of range; structural mistakes are errors.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use efferve_engines::classifier::ClassifierConfig;
use efferve_engines::presence::PresenceDetectorConfig;
use efferve_kernel_contracts::observation::SourceId;
use efferve_kernel_contracts::{ContractViolation, Validate};
use tracing::warn;

use crate::dispatcher::{DispatcherConfig, RetryPolicy};
use crate::source::capture::{is_valid_interface_name, is_valid_ssh_target_part};
use crate::source::{
    ApiPollConfig, RadioMonitorConfig, RemoteCaptureConfig, SourceKind, SourceSpec,
    SyntheticConfig,
};
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("EFFERVE_SOURCES: unknown backend {0:?}")]
    UnknownSource(String),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

#[derive(Debug, Clone)]
pub struct EfferveConfig {
    pub sources: Vec<SourceSpec>,
    pub detector: PresenceDetectorConfig,
    pub classifier: ClassifierConfig,
    pub supervisor: SupervisorConfig,
    pub dispatcher: DispatcherConfig,
    pub seed_path: Option<PathBuf>,
}

impl EfferveConfig {
    pub fn mvp_v1() -> Self {
        Self {
            sources: Vec::new(),
            detector: PresenceDetectorConfig::mvp_v1(),
            classifier: ClassifierConfig::mvp_v1(),
            supervisor: SupervisorConfig::mvp_v1(),
            dispatcher: DispatcherConfig::mvp_v1(),
            seed_path: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` over an arbitrary key lookup.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(get);

        let grace = Duration::from_secs(env.num("EFFERVE_PRESENCE_GRACE_SECS", 1..=86_400, 180));
        let sweep = env
            .text("EFFERVE_SWEEP_INTERVAL_SECS")
            .map(|raw| {
                raw.parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .ok_or_else(|| ConfigError::Invalid {
                        key: "EFFERVE_SWEEP_INTERVAL_SECS",
                        reason: format!("not a positive number of seconds: {raw:?}"),
                    })
            })
            .transpose()?
            .unwrap_or(grace / 2);
        if sweep > grace / 2 {
            return Err(ConfigError::Invalid {
                key: "EFFERVE_SWEEP_INTERVAL_SECS",
                reason: format!(
                    "sweep interval {}s exceeds half the grace period ({}s)",
                    sweep.as_secs_f64(),
                    grace.as_secs_f64()
                ),
            });
        }
        let detector = PresenceDetectorConfig {
            grace_period: grace,
            sweep_interval: sweep,
        };
        detector.validate()?;

        let classifier = ClassifierConfig {
            window_days: env.num("EFFERVE_CLASSIFY_WINDOW_DAYS", 1..=90, 14),
            resident_min_days: env.num("EFFERVE_CLASSIFY_RESIDENT_DAYS", 1..=90, 10),
            frequent_min_days: env.num("EFFERVE_CLASSIFY_FREQUENT_DAYS", 1..=90, 3),
            strong_signal_dbm: env.num("EFFERVE_CLASSIFY_STRONG_SIGNAL_DBM", -120.0..=-1.0, -65.0),
            randomized_as_passerby: env.flag("EFFERVE_CLASSIFY_RANDOMIZED_PASSERBY", false),
        };
        classifier.validate()?;

        let supervisor = SupervisorConfig {
            backoff_base: Duration::from_millis(env.num("EFFERVE_SOURCE_BACKOFF_BASE_MS", 10..=60_000, 1_000)),
            backoff_max: Duration::from_millis(env.num("EFFERVE_SOURCE_BACKOFF_MAX_MS", 100..=3_600_000, 60_000)),
            max_retries: env.num("EFFERVE_SOURCE_MAX_RETRIES", 0..=1_000, 5),
            drain_timeout: Duration::from_millis(env.num("EFFERVE_SHUTDOWN_DRAIN_MS", 100..=120_000, 5_000)),
        };

        let dispatcher = DispatcherConfig {
            concurrency: env.num("EFFERVE_DISPATCH_CONCURRENCY", 1..=64, 4),
            queue_capacity: env.num("EFFERVE_DISPATCH_QUEUE", 1..=65_536, 256),
            request_timeout: Duration::from_millis(env.num("EFFERVE_DISPATCH_TIMEOUT_MS", 100..=120_000, 10_000)),
            retry: RetryPolicy {
                max_attempts: env.num("EFFERVE_DISPATCH_MAX_ATTEMPTS", 1..=10, 1),
                ..RetryPolicy::none()
            },
            dry_run: env.flag("EFFERVE_DISPATCH_DRY_RUN", false),
        };

        let sources = parse_sources(&env)?;

        Ok(Self {
            sources,
            detector,
            classifier,
            supervisor,
            dispatcher,
            seed_path: env.text("EFFERVE_SEED_PATH").map(PathBuf::from),
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn text(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn num<T>(&self, key: &str, range: std::ops::RangeInclusive<T>, default: T) -> T
    where
        T: FromStr + PartialOrd,
    {
        self.text(key)
            .and_then(|v| v.parse::<T>().ok())
            .filter(|v| range.contains(v))
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.text(key) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"),
            None => default,
        }
    }
}

fn source_id(kind: SourceKind, instance: &str) -> Result<SourceId, ConfigError> {
    Ok(SourceId::new(format!("{}:{}", kind.as_str(), instance))?)
}

fn parse_sources<F>(env: &Lookup<F>) -> Result<Vec<SourceSpec>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = env
        .text("EFFERVE_SOURCES")
        .unwrap_or_else(|| SourceKind::Synthetic.as_str().to_string());
    let mut specs = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let kind = SourceKind::parse(name).ok_or_else(|| ConfigError::UnknownSource(name.to_string()))?;
        if specs.iter().any(|s: &SourceSpec| s.kind() == kind) {
            continue;
        }
        match build_source(kind, env)? {
            Some(spec) => specs.push(spec),
            None => warn!(backend = kind.as_str(), "backend selected but not configured, skipping"),
        }
    }
    Ok(specs)
}

fn build_source<F>(kind: SourceKind, env: &Lookup<F>) -> Result<Option<SourceSpec>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match kind {
        SourceKind::ApiPoll => {
            let (Some(url), Some(key), Some(secret)) = (
                env.text("EFFERVE_API_POLL_URL"),
                env.text("EFFERVE_API_POLL_KEY"),
                env.text("EFFERVE_API_POLL_SECRET"),
            ) else {
                return Ok(None);
            };
            let poll = Duration::from_secs(env.num("EFFERVE_POLL_INTERVAL_SECS", 5..=3_600, 30));
            let config = ApiPollConfig::new(source_id(kind, "router")?, &url, key, secret, poll);
            url::Url::parse(&config.base_url).map_err(|err| ConfigError::Invalid {
                key: "EFFERVE_API_POLL_URL",
                reason: err.to_string(),
            })?;
            Ok(Some(SourceSpec::ApiPoll(config)))
        }
        SourceKind::RemoteCapture => {
            let Some(host) = env.text("EFFERVE_REMOTE_HOST") else {
                return Ok(None);
            };
            let user = env.text("EFFERVE_REMOTE_USER").unwrap_or_else(|| "root".to_string());
            for (key, value) in [("EFFERVE_REMOTE_HOST", &host), ("EFFERVE_REMOTE_USER", &user)] {
                if !is_valid_ssh_target_part(value) {
                    return Err(ConfigError::Invalid {
                        key,
                        reason: format!("unsafe ssh target {value:?}"),
                    });
                }
            }
            let wifi_interface = interface(env, "EFFERVE_REMOTE_WIFI_IFACE", "wlan0")?;
            let monitor_interface = interface(env, "EFFERVE_REMOTE_MONITOR_IFACE", "wlan0mon")?;
            Ok(Some(SourceSpec::RemoteCapture(RemoteCaptureConfig {
                source_id: source_id(kind, &host)?,
                host,
                user,
                port: env.num("EFFERVE_REMOTE_PORT", 1..=65_535, 22),
                wifi_interface,
                monitor_interface,
            })))
        }
        SourceKind::RadioMonitor => {
            if env.text("EFFERVE_MONITOR_IFACE").is_none() {
                return Ok(None);
            }
            let interface = interface(env, "EFFERVE_MONITOR_IFACE", "")?;
            Ok(Some(SourceSpec::RadioMonitor(RadioMonitorConfig {
                source_id: source_id(kind, &interface)?,
                interface,
            })))
        }
        SourceKind::Synthetic => {
            let tick = Duration::from_millis(env.num("EFFERVE_SYNTHETIC_TICK_MS", 100..=600_000, 5_000));
            Ok(Some(SourceSpec::Synthetic(SyntheticConfig::generator(
                source_id(kind, "household")?,
                tick,
            ))))
        }
    }
}

fn interface<F>(env: &Lookup<F>, key: &'static str, default: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let name = env.text(key).unwrap_or_else(|| default.to_string());
    if !is_valid_interface_name(&name) {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("invalid interface name {name:?}"),
        });
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(pairs: &[(&str, &str)]) -> Result<EfferveConfig, ConfigError> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EfferveConfig::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn defaults_select_synthetic_only() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.sources.len(), 1);
        assert_eq!(cfg.sources[0].kind(), SourceKind::Synthetic);
        assert_eq!(cfg.detector.grace_period, Duration::from_secs(180));
        assert_eq!(cfg.detector.sweep_interval, Duration::from_secs(90));
        assert_eq!(cfg.classifier, ClassifierConfig::mvp_v1());
        assert_eq!(cfg.dispatcher.concurrency, 4);
        assert_eq!(cfg.dispatcher.retry.max_attempts, 1);
        assert!(!cfg.dispatcher.dry_run);
    }

    #[test]
    fn out_of_range_numbers_fall_back() {
        let cfg = config(&[
            ("EFFERVE_DISPATCH_CONCURRENCY", "0"),
            ("EFFERVE_CLASSIFY_WINDOW_DAYS", "abc"),
        ])
        .unwrap();
        assert_eq!(cfg.dispatcher.concurrency, 4);
        assert_eq!(cfg.classifier.window_days, 14);
    }

    #[test]
    fn sweep_longer_than_half_grace_is_rejected() {
        let err = config(&[
            ("EFFERVE_PRESENCE_GRACE_SECS", "900"),
            ("EFFERVE_SWEEP_INTERVAL_SECS", "451"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EFFERVE_SWEEP_INTERVAL_SECS", .. }));
        let ok = config(&[
            ("EFFERVE_PRESENCE_GRACE_SECS", "900"),
            ("EFFERVE_SWEEP_INTERVAL_SECS", "450"),
        ])
        .unwrap();
        assert_eq!(ok.detector.sweep_interval, Duration::from_secs(450));
    }

    #[test]
    fn unconfigured_backends_are_skipped() {
        let cfg = config(&[("EFFERVE_SOURCES", "api_poll,radio_monitor")]).unwrap();
        assert!(cfg.sources.is_empty());
    }

    #[test]
    fn unknown_backend_is_an_error() {
        assert_eq!(
            config(&[("EFFERVE_SOURCES", "synthetic,ruckus")]).unwrap_err(),
            ConfigError::UnknownSource("ruckus".to_string())
        );
    }

    #[test]
    fn api_poll_url_is_upgraded() {
        let cfg = config(&[
            ("EFFERVE_SOURCES", "api_poll"),
            ("EFFERVE_API_POLL_URL", "http://192.168.1.1"),
            ("EFFERVE_API_POLL_KEY", "k"),
            ("EFFERVE_API_POLL_SECRET", "s"),
        ])
        .unwrap();
        let SourceSpec::ApiPoll(api) = &cfg.sources[0] else {
            panic!("expected api_poll");
        };
        assert_eq!(api.base_url, "https://192.168.1.1");
        assert_eq!(api.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn injection_in_interface_names_is_rejected() {
        let err = config(&[
            ("EFFERVE_SOURCES", "remote_capture"),
            ("EFFERVE_REMOTE_HOST", "192.168.8.1"),
            ("EFFERVE_REMOTE_MONITOR_IFACE", "mon0;rm -rf /"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EFFERVE_REMOTE_MONITOR_IFACE", .. }));

        let err = config(&[("EFFERVE_SOURCES", "radio_monitor"), ("EFFERVE_MONITOR_IFACE", "$(id)")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn remote_capture_defaults() {
        let cfg = config(&[("EFFERVE_SOURCES", "remote_capture"), ("EFFERVE_REMOTE_HOST", "192.168.8.1")]).unwrap();
        let SourceSpec::RemoteCapture(rc) = &cfg.sources[0] else {
            panic!("expected remote_capture");
        };
        assert_eq!(rc.user, "root");
        assert_eq!(rc.port, 22);
        assert_eq!(rc.wifi_interface, "wlan0");
        assert_eq!(rc.monitor_interface, "wlan0mon");
        assert_eq!(rc.source_id.as_str(), "remote_capture:192.168.8.1");
    }
}
