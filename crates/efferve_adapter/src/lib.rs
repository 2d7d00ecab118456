#![forbid(unsafe_code)]

//! Process-level runtime: environment configuration, seed loading, the
//! running presence pipeline and the reports served over HTTP.

use std::fs;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use efferve_engines::outbound::SystemResolver;
use efferve_kernel_contracts::alert::AlertRule;
use efferve_kernel_contracts::observation::DeviceAddress;
use efferve_kernel_contracts::persona::{Person, PersonId};
use efferve_os::clock::Clock;
use efferve_os::config::EfferveConfig;
use efferve_os::dispatcher::WebhookSenderRuntime;
use efferve_os::persons::PersonPresence;
use efferve_os::pipeline::{start_pipeline, PipelineHandle, PipelineStatus, ShutdownSummary};
use efferve_os::rules::{create_rule, RuleValidationError};
use efferve_os::supervisor::SourceHealthState;
use efferve_storage::store::MemoryPresenceStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber filtered by `EFFERVE_LOG` (default `info`).
/// Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("EFFERVE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedPerson {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub devices: Vec<DeviceAddress>,
}

/// Persons and alert rules loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub persons: Vec<SeedPerson>,
    #[serde(default)]
    pub rules: Vec<AlertRule>,
}

/// A seeded rule refused by outbound validation. Reported, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefusedRule {
    pub rule_id: String,
    pub violation_class: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub persons: usize,
    pub rules: usize,
    pub refused: Vec<RefusedRule>,
}

/// Structural problems (bad JSON, duplicate ids, unknown persons) fail the
/// whole seed; unsafe webhooks only refuse their rule.
pub fn load_seed(store: &MemoryPresenceStore, raw: &str) -> Result<SeedReport, String> {
    let seed: SeedFile = serde_json::from_str(raw).map_err(|e| format!("seed json invalid: {e}"))?;
    let mut report = SeedReport::default();
    for p in seed.persons {
        let id = PersonId::new(p.id).map_err(|e| format!("seed person id invalid: {e:?}"))?;
        let mut person = Person::v1(id, p.name).map_err(|e| format!("seed person invalid: {e:?}"))?;
        person.device_addresses.extend(p.devices);
        store
            .insert_person_row(person)
            .map_err(|e| format!("seed person rejected: {e}"))?;
        report.persons += 1;
    }
    for rule in seed.rules {
        match create_rule(store, rule) {
            Ok(_) => report.rules += 1,
            Err(RuleValidationError::Unsafe { rule_id, violation }) => {
                report.refused.push(RefusedRule {
                    rule_id: rule_id.to_string(),
                    violation_class: violation.class().to_string(),
                    reason: violation.to_string(),
                });
            }
            Err(RuleValidationError::Storage(err)) => {
                return Err(format!("seed rule rejected: {err}"));
            }
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub degraded_sources: Vec<String>,
    pub disabled_rules: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatusRow {
    pub address: String,
    pub classification: &'static str,
    pub last_seen: DateTime<Utc>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub person_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterStatusResponse {
    pub pipeline: PipelineStatus,
    pub refused_rules: Vec<RefusedRule>,
    pub devices: Vec<DeviceStatusRow>,
    pub persons: Vec<PersonPresence>,
}

pub struct AdapterRuntime {
    store: Arc<MemoryPresenceStore>,
    pipeline: Mutex<Option<PipelineHandle>>,
    refused_rules: Vec<RefusedRule>,
}

impl AdapterRuntime {
    /// Seeds the store, then starts the pipeline. Must run inside a tokio
    /// runtime.
    pub fn start(
        config: &EfferveConfig,
        store: Arc<MemoryPresenceStore>,
        sender: WebhookSenderRuntime,
        clock: Clock,
        seed: Option<&str>,
    ) -> Result<Self, String> {
        let report = match seed {
            Some(raw) => load_seed(&store, raw)?,
            None => SeedReport::default(),
        };
        for refused in &report.refused {
            warn!(
                rule_id = %refused.rule_id,
                violation = %refused.violation_class,
                "seed rule refused"
            );
        }
        info!(persons = report.persons, rules = report.rules, "seed loaded");
        let pipeline = start_pipeline(config, store.clone(), sender, clock)
            .map_err(|e| format!("pipeline config invalid: {e:?}"))?;
        Ok(Self {
            store,
            pipeline: Mutex::new(Some(pipeline)),
            refused_rules: report.refused,
        })
    }

    pub fn default_from_env() -> Result<Self, String> {
        let config = EfferveConfig::from_env().map_err(|e| e.to_string())?;
        let seed = match &config.seed_path {
            Some(path) => Some(
                fs::read_to_string(path)
                    .map_err(|e| format!("seed file {} unreadable: {e}", path.display()))?,
            ),
            None => None,
        };
        let sender = WebhookSenderRuntime::from_config(&config.dispatcher, Arc::new(SystemResolver));
        if config.dispatcher.dry_run {
            info!("webhook dry run enabled; deliveries are recorded, not sent");
        }
        Self::start(
            &config,
            Arc::new(MemoryPresenceStore::new_in_memory()),
            sender,
            Clock::System,
            seed.as_deref(),
        )
    }

    pub fn store(&self) -> Arc<MemoryPresenceStore> {
        self.store.clone()
    }

    fn with_pipeline<T>(&self, f: impl FnOnce(&PipelineHandle) -> T) -> Result<T, String> {
        let guard = self
            .pipeline
            .lock()
            .map_err(|_| "adapter pipeline lock poisoned".to_string())?;
        guard
            .as_ref()
            .map(f)
            .ok_or_else(|| "pipeline stopped".to_string())
    }

    fn pipeline_status(&self) -> Result<PipelineStatus, String> {
        self.with_pipeline(|p| p.status())
    }

    pub fn health_report(&self) -> Result<AdapterHealthResponse, String> {
        let status = self.pipeline_status()?;
        let degraded_sources: Vec<String> = status
            .sources
            .iter()
            .filter(|s| s.state == SourceHealthState::Degraded)
            .map(|s| s.source_id.clone())
            .collect();
        let disabled_rules = status.disabled_rules.len() + self.refused_rules.len();
        let (status, outcome, reason) = if degraded_sources.is_empty() {
            ("ok", "HEALTHY", None)
        } else {
            (
                "degraded",
                "DEGRADED",
                Some(format!("sources degraded: {}", degraded_sources.join(","))),
            )
        };
        Ok(AdapterHealthResponse {
            status: status.to_string(),
            outcome: outcome.to_string(),
            reason,
            degraded_sources,
            disabled_rules,
        })
    }

    pub fn status_report(&self) -> Result<AdapterStatusResponse, String> {
        let (pipeline, persons) = self.with_pipeline(|p| (p.status(), p.present_persons()))?;
        let persons = persons.map_err(|e| e.to_string())?;
        let devices = self
            .store
            .device_rows()
            .map_err(|e| e.to_string())?
            .into_iter()
            .map(|d| DeviceStatusRow {
                address: d.address.to_string(),
                classification: d.classification.as_str(),
                last_seen: d.last_seen,
                hostname: d.hostname,
                vendor: d.vendor,
                person_id: d.associated_person.map(|p| p.to_string()),
            })
            .collect();
        Ok(AdapterStatusResponse {
            pipeline,
            refused_rules: self.refused_rules.clone(),
            devices,
            persons,
        })
    }

    /// Returns `None` if already shut down.
    pub async fn shutdown(&self) -> Option<ShutdownSummary> {
        let pipeline = self.pipeline.lock().ok().and_then(|mut p| p.take())?;
        Some(pipeline.shutdown().await)
    }
}
