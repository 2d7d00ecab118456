#![forbid(unsafe_code)]

//! Presence detector task: the only owner of per-device presence state.
//! Sightings and sweep ticks are handled on one task, so transitions for a
//! device are strictly ordered.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use efferve_engines::presence::PresenceDetector;
use efferve_kernel_contracts::observation::DeviceAddress;
use efferve_kernel_contracts::presence::{PresenceTransition, TransitionKind};
use efferve_storage::repo::PresenceRepo;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::clock::Clock;
use crate::registry::Sighting;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectorSnapshot {
    pub present_devices: usize,
    pub arrivals: u64,
    pub departures: u64,
}

#[derive(Debug, Default)]
struct DetectorView {
    counts: DetectorSnapshot,
    present: BTreeSet<DeviceAddress>,
}

/// Read side of the detector, updated on every confirmed transition.
#[derive(Debug, Clone, Default)]
pub struct DetectorStatus {
    inner: Arc<Mutex<DetectorView>>,
}

impl DetectorStatus {
    pub fn snapshot(&self) -> DetectorSnapshot {
        self.inner.lock().map(|v| v.counts).unwrap_or_default()
    }

    /// Devices the detector currently holds as present.
    pub fn present_devices(&self) -> BTreeSet<DeviceAddress> {
        self.inner
            .lock()
            .map(|v| v.present.clone())
            .unwrap_or_default()
    }

    fn record(&self, transition: &PresenceTransition, present: Vec<DeviceAddress>) {
        if let Ok(mut v) = self.inner.lock() {
            match transition.kind {
                TransitionKind::Arrive => v.counts.arrivals += 1,
                TransitionKind::Leave => v.counts.departures += 1,
            }
            v.present = present.into_iter().collect();
            v.counts.present_devices = v.present.len();
        }
    }
}

pub struct PresenceDetectorTask {
    pub detector: PresenceDetector,
    pub repo: Arc<dyn PresenceRepo>,
    pub clock: Clock,
    pub status: DetectorStatus,
}

impl PresenceDetectorTask {
    /// Runs until shutdown or until the sighting channel closes. Each
    /// confirmed transition is logged to the store and handed to
    /// `transitions` exactly once.
    pub async fn run(
        mut self,
        mut sightings: mpsc::Receiver<Sighting>,
        transitions: mpsc::Sender<PresenceTransition>,
        mut shutdown: ShutdownSignal,
    ) {
        let mut sweep = tokio::time::interval(self.detector.config().sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let emitted = tokio::select! {
                _ = shutdown.cancelled() => break,
                sighting = sightings.recv() => match sighting {
                    Some(s) => self
                        .detector
                        .observe(&s.device_address, s.seen_at, self.clock.now())
                        .into_iter()
                        .collect::<Vec<_>>(),
                    None => break,
                },
                _ = sweep.tick() => self.detector.sweep(self.clock.now()),
            };
            for transition in emitted {
                if !self.emit(transition, &transitions).await {
                    return;
                }
            }
        }
        let s = self.status.snapshot();
        info!(
            present = s.present_devices,
            arrivals = s.arrivals,
            departures = s.departures,
            "presence detector stopped"
        );
    }

    async fn emit(
        &mut self,
        transition: PresenceTransition,
        transitions: &mpsc::Sender<PresenceTransition>,
    ) -> bool {
        info!(
            address = %transition.device_address,
            event = transition.kind.as_str(),
            at = %transition.at,
            "presence transition"
        );
        if let Err(err) = self.repo.append_presence_log(&transition) {
            error!(address = %transition.device_address, error = %err, "presence log write failed");
        }
        self.status
            .record(&transition, self.detector.present_devices());
        transitions.send(transition).await.is_ok()
    }
}
