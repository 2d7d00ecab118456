#![forbid(unsafe_code)]

//! Wires sources -> supervisor -> registry -> detector -> alert engine ->
//! dispatcher and owns the ordered shutdown of those stages.

use std::sync::Arc;
use std::time::Duration;

use efferve_engines::presence::PresenceDetector;
use efferve_kernel_contracts::ContractViolation;
use efferve_storage::repo::PresenceRepo;
use efferve_storage::store::StorageError;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerts::{AlertRuleEngine, DisabledRule};
use crate::clock::Clock;
use crate::config::EfferveConfig;
use crate::detector::{DetectorSnapshot, DetectorStatus, PresenceDetectorTask};
use crate::dispatcher::{DispatchStats, WebhookDispatcher, WebhookSenderRuntime};
use crate::persons::{present_persons, PersonPresence};
use crate::registry::{DeviceRegistry, IngestSink};
use crate::shutdown::{shutdown_channel, ShutdownTrigger};
use crate::supervisor::{HealthBoard, IngestionSupervisor, SourceHealth, SourceHealthState};

pub const SIGHTING_CHANNEL_CAPACITY: usize = 1024;
pub const TRANSITION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub sources: Vec<SourceHealth>,
    pub disabled_rules: Vec<DisabledRule>,
    pub dispatcher: DispatchStats,
    pub presence: DetectorSnapshot,
}

impl PipelineStatus {
    pub fn is_degraded(&self) -> bool {
        self.sources
            .iter()
            .any(|s| s.state == SourceHealthState::Degraded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub aborted_sources: usize,
    pub dispatch: DispatchStats,
}

pub struct PipelineHandle {
    trigger: ShutdownTrigger,
    supervisor: IngestionSupervisor,
    health: HealthBoard,
    repo: Arc<dyn PresenceRepo>,
    registry: Arc<DeviceRegistry>,
    engine: Arc<AlertRuleEngine>,
    dispatcher: Arc<WebhookDispatcher>,
    detector_status: DetectorStatus,
    detector_task: JoinHandle<()>,
    alerts_task: JoinHandle<()>,
    drain_timeout: Duration,
}

/// Starts every stage. Must be called inside a tokio runtime.
pub fn start_pipeline(
    config: &EfferveConfig,
    repo: Arc<dyn PresenceRepo>,
    sender: WebhookSenderRuntime,
    clock: Clock,
) -> Result<PipelineHandle, ContractViolation> {
    let detector = PresenceDetector::new(config.detector.clone())?;
    let (trigger, shutdown) = shutdown_channel();

    let (sighting_tx, sighting_rx) = mpsc::channel(SIGHTING_CHANNEL_CAPACITY);
    let (transition_tx, transition_rx) = mpsc::channel(TRANSITION_CHANNEL_CAPACITY);

    let dispatcher = Arc::new(WebhookDispatcher::start(&config.dispatcher, sender));
    let engine = Arc::new(AlertRuleEngine::new(repo.clone()));
    let alerts_task = tokio::spawn(engine.clone().run(transition_rx, dispatcher.clone()));

    let detector_status = DetectorStatus::default();
    let detector_task = tokio::spawn(
        PresenceDetectorTask {
            detector,
            repo: repo.clone(),
            clock,
            status: detector_status.clone(),
        }
        .run(sighting_rx, transition_tx, shutdown.clone()),
    );

    let registry = Arc::new(DeviceRegistry::new(repo.clone(), config.classifier.clone()));
    let sink = IngestSink::new(registry.clone(), sighting_tx);
    let supervisor = IngestionSupervisor::start(
        config.sources.clone(),
        config.supervisor.clone(),
        sink,
        shutdown,
    );
    info!(sources = config.sources.len(), "presence pipeline started");

    Ok(PipelineHandle {
        trigger,
        health: supervisor.health(),
        supervisor,
        repo,
        registry,
        engine,
        dispatcher,
        detector_status,
        detector_task,
        alerts_task,
        drain_timeout: config.supervisor.drain_timeout,
    })
}

impl PipelineHandle {
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            sources: self.health.snapshot(),
            disabled_rules: self.engine.disabled_rules(),
            dispatcher: self.dispatcher.stats(),
            presence: self.detector_status.snapshot(),
        }
    }

    pub fn health(&self) -> HealthBoard {
        self.health.clone()
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    /// Every known person with the devices the detector holds as present.
    pub fn present_persons(&self) -> Result<Vec<PersonPresence>, StorageError> {
        present_persons(self.repo.as_ref(), &self.detector_status.present_devices())
    }

    /// Cancels sources and the sweep, then drains each later stage in flow
    /// order so queued transitions still reach the dispatcher.
    pub async fn shutdown(self) -> ShutdownSummary {
        self.trigger.trigger();
        let drained = self.supervisor.drain().await;
        join_within("presence detector", self.detector_task, self.drain_timeout).await;
        join_within("alert engine", self.alerts_task, self.drain_timeout).await;
        let dispatch = self.dispatcher.shutdown(self.drain_timeout).await;
        info!(
            aborted_sources = drained.aborted,
            delivered = dispatch.delivered,
            "presence pipeline stopped"
        );
        ShutdownSummary {
            aborted_sources: drained.aborted,
            dispatch,
        }
    }
}

async fn join_within(stage: &'static str, mut task: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        warn!(stage, "stage did not stop within the drain window; aborting");
        task.abort();
    }
}
