#![forbid(unsafe_code)]

//! Ingestion supervisor: one consumption loop per configured source, with
//! bounded exponential backoff between instances and degradation once the
//! retry budget is spent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use efferve_kernel_contracts::observation::CanonicalObservation;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::registry::IngestSink;
use crate::shutdown::ShutdownSignal;
use crate::source::{SourceExit, SourceSpec};

pub const SOURCE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Restarts allowed after consecutive failures before a source is degraded.
    pub max_retries: u32,
    pub drain_timeout: Duration,
}

impl SupervisorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(60_000),
            max_retries: 5,
            drain_timeout: Duration::from_millis(5_000),
        }
    }

    /// Upper bound for the `attempt`-th retry (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Equal jitter: half the ceiling plus a random share of the other half.
    pub fn backoff_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        half + Duration::from_millis(rng.gen_range(0..=spread))
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealthState {
    Starting,
    Running,
    BackingOff,
    /// Retry budget exhausted; needs operator attention.
    Degraded,
    /// Stream ended on its own.
    Exhausted,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub kind: &'static str,
    pub state: SourceHealthState,
    pub restarts: u32,
    pub consecutive_failures: u32,
    pub observations: u64,
    pub last_error: Option<String>,
}

/// Shared view of every source's health, read by the status surface.
#[derive(Debug, Clone, Default)]
pub struct HealthBoard {
    inner: Arc<Mutex<BTreeMap<String, SourceHealth>>>,
}

impl HealthBoard {
    fn update(&self, source_id: &str, f: impl FnOnce(&mut SourceHealth)) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(h) = map.get_mut(source_id) {
                f(h);
            }
        }
    }

    fn register(&self, spec: &SourceSpec) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(
                spec.source_id().to_string(),
                SourceHealth {
                    source_id: spec.source_id().to_string(),
                    kind: spec.kind().as_str(),
                    state: SourceHealthState::Starting,
                    restarts: 0,
                    consecutive_failures: 0,
                    observations: 0,
                    last_error: None,
                },
            );
        }
    }

    pub fn snapshot(&self) -> Vec<SourceHealth> {
        self.inner
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, source_id: &str) -> Option<SourceHealth> {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(source_id).cloned())
    }

    pub fn degraded(&self) -> Vec<SourceHealth> {
        self.snapshot()
            .into_iter()
            .filter(|h| h.state == SourceHealthState::Degraded)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Loops still running when the drain window closed and were aborted.
    pub aborted: usize,
}

pub struct IngestionSupervisor {
    tasks: JoinSet<()>,
    health: HealthBoard,
    config: SupervisorConfig,
}

impl IngestionSupervisor {
    pub fn start(
        specs: Vec<SourceSpec>,
        config: SupervisorConfig,
        sink: IngestSink,
        shutdown: ShutdownSignal,
    ) -> Self {
        let health = HealthBoard::default();
        let mut tasks = JoinSet::new();
        for spec in specs {
            health.register(&spec);
            tasks.spawn(supervise_source(
                spec,
                config.clone(),
                sink.clone(),
                health.clone(),
                shutdown.clone(),
            ));
        }
        Self {
            tasks,
            health,
            config,
        }
    }

    pub fn health(&self) -> HealthBoard {
        self.health.clone()
    }

    /// Waits for the loops to observe cancellation, up to the drain window,
    /// then aborts whatever is left. Cancellation itself is the caller's.
    pub async fn drain(mut self) -> DrainOutcome {
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        let aborted = match drained {
            Ok(()) => 0,
            Err(_) => {
                let left = self.tasks.len();
                self.tasks.abort_all();
                while self.tasks.join_next().await.is_some() {}
                left
            }
        };
        if let Ok(mut map) = self.health.inner.lock() {
            for h in map.values_mut() {
                if matches!(
                    h.state,
                    SourceHealthState::Starting
                        | SourceHealthState::Running
                        | SourceHealthState::BackingOff
                ) {
                    h.state = SourceHealthState::Stopped;
                }
            }
        }
        if aborted > 0 {
            warn!(aborted, "source loops force-terminated after drain timeout");
        }
        DrainOutcome { aborted }
    }
}

async fn supervise_source(
    spec: SourceSpec,
    config: SupervisorConfig,
    sink: IngestSink,
    health: HealthBoard,
    mut shutdown: ShutdownSignal,
) {
    let id = spec.source_id().to_string();
    let mut failures: u32 = 0;
    let mut restarts: u32 = 0;
    loop {
        if shutdown.is_shutdown() {
            health.update(&id, |h| h.state = SourceHealthState::Stopped);
            return;
        }
        info!(source_id = %id, kind = spec.kind().as_str(), restarts, "source starting");
        health.update(&id, |h| h.state = SourceHealthState::Running);

        let (tx, mut rx) = mpsc::channel::<CanonicalObservation>(SOURCE_CHANNEL_CAPACITY);
        let produce = spec.build().produce(shutdown.clone(), tx);
        tokio::pin!(produce);
        let mut delivered: u64 = 0;
        let exit = loop {
            tokio::select! {
                exit = &mut produce => break Some(exit),
                Some(obs) = rx.recv() => {
                    if sink.ingest(obs).await.is_err() {
                        break None;
                    }
                    delivered += 1;
                    health.update(&id, |h| h.observations += 1);
                }
            }
        };
        let Some(exit) = exit else {
            health.update(&id, |h| h.state = SourceHealthState::Stopped);
            return;
        };
        while let Ok(obs) = rx.try_recv() {
            if sink.ingest(obs).await.is_err() {
                break;
            }
            delivered += 1;
            health.update(&id, |h| h.observations += 1);
        }
        if delivered > 0 {
            failures = 0;
        }

        match exit {
            Ok(SourceExit::Cancelled) => {
                info!(source_id = %id, "source stopped");
                health.update(&id, |h| h.state = SourceHealthState::Stopped);
                return;
            }
            Ok(SourceExit::Exhausted) => {
                info!(source_id = %id, "source stream ended");
                health.update(&id, |h| h.state = SourceHealthState::Exhausted);
                return;
            }
            Err(err) => {
                failures += 1;
                let reason = err.to_string();
                if failures > config.max_retries {
                    error!(source_id = %id, failures, error = %reason, "source degraded after exhausting retries");
                    health.update(&id, |h| {
                        h.state = SourceHealthState::Degraded;
                        h.consecutive_failures = failures;
                        h.last_error = Some(reason);
                    });
                    return;
                }
                let delay = config.backoff_delay(failures, &mut rand::thread_rng());
                warn!(
                    source_id = %id,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "source failed, backing off"
                );
                health.update(&id, |h| {
                    h.state = SourceHealthState::BackingOff;
                    h.consecutive_failures = failures;
                    h.last_error = Some(reason);
                });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => {
                        health.update(&id, |h| h.state = SourceHealthState::Stopped);
                        return;
                    }
                }
                restarts += 1;
                health.update(&id, |h| h.restarts = restarts);
            }
        }
    }
}
