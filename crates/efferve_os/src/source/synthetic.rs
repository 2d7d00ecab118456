#![forbid(unsafe_code)]

//! Synthetic backend: a household simulator for development and a scripted
//! mode for deterministic tests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use efferve_kernel_contracts::observation::{CanonicalObservation, DeviceAddress, SourceId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{SourceError, SourceExit};
use crate::shutdown::ShutdownSignal;

const HOME_NETWORK: &str = "HomeNetwork";

// (address, hostname, base dBm)
const RESIDENT_DEVICES: [(&str, &str, i32); 3] = [
    ("AA:BB:CC:11:22:33", "Home-iPhone", -42),
    ("AA:BB:CC:44:55:66", "Living-Room-TV", -35),
    ("AA:BB:CC:77:88:99", "Work-Laptop", -50),
];
const VISITOR_DEVICES: [(&str, &str, i32); 2] = [
    ("DD:EE:FF:11:22:33", "Guest-Phone", -60),
    ("DD:EE:FF:44:55:66", "Neighbor-Tablet", -72),
];
const RANDOMIZED_ADDRESSES: [&str; 3] = ["FA:12:34:56:78:9A", "F2:AB:CD:EF:01:23", "FE:99:88:77:66:55"];
const VISITOR_PROBABILITY: f64 = 0.4;
const PASSERBY_PROBABILITY: f64 = 0.3;

/// What a scripted instance does after emitting its observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEnd {
    /// Stay alive until cancelled.
    Idle,
    Fail(String),
    /// End of stream.
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedRun {
    pub observations: Vec<CanonicalObservation>,
    pub then: ScriptEnd,
}

/// Queue of runs shared by every instance built from one `SourceSpec`; each new
/// instance takes the next run. With the queue empty an instance idles.
#[derive(Clone, Default)]
pub struct ScriptHandle {
    runs: Arc<Mutex<VecDeque<ScriptedRun>>>,
    started: Arc<Mutex<u32>>,
}

impl fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHandle")
            .field("instances_started", &self.instances_started())
            .finish()
    }
}

impl ScriptHandle {
    pub fn new(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        Self {
            runs: Arc::new(Mutex::new(runs.into_iter().collect())),
            started: Arc::new(Mutex::new(0)),
        }
    }

    pub fn push(&self, run: ScriptedRun) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push_back(run);
        }
    }

    pub fn instances_started(&self) -> u32 {
        self.started.lock().map(|n| *n).unwrap_or(0)
    }

    fn next_run(&self) -> Option<ScriptedRun> {
        if let Ok(mut n) = self.started.lock() {
            *n += 1;
        }
        self.runs.lock().ok().and_then(|mut runs| runs.pop_front())
    }
}

#[derive(Debug, Clone)]
pub enum SyntheticMode {
    Generator { tick: Duration, seed: Option<u64> },
    Scripted(ScriptHandle),
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub source_id: SourceId,
    pub mode: SyntheticMode,
}

impl SyntheticConfig {
    pub fn generator(source_id: SourceId, tick: Duration) -> Self {
        Self {
            source_id,
            mode: SyntheticMode::Generator { tick, seed: None },
        }
    }

    pub fn scripted(source_id: SourceId, script: ScriptHandle) -> Self {
        Self {
            source_id,
            mode: SyntheticMode::Scripted(script),
        }
    }
}

#[derive(Debug)]
pub struct SyntheticSource {
    config: SyntheticConfig,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    pub async fn produce(
        self,
        shutdown: ShutdownSignal,
        out: mpsc::Sender<CanonicalObservation>,
    ) -> Result<SourceExit, SourceError> {
        let SyntheticConfig { source_id, mode } = self.config;
        match mode {
            SyntheticMode::Generator { tick, seed } => {
                run_generator(source_id, tick, seed, shutdown, out).await
            }
            SyntheticMode::Scripted(script) => run_script(source_id, script, shutdown, out).await,
        }
    }
}

async fn run_script(
    source_id: SourceId,
    script: ScriptHandle,
    mut shutdown: ShutdownSignal,
    out: mpsc::Sender<CanonicalObservation>,
) -> Result<SourceExit, SourceError> {
    let run = script.next_run().unwrap_or(ScriptedRun {
        observations: Vec::new(),
        then: ScriptEnd::Idle,
    });
    for obs in run.observations {
        if shutdown.is_shutdown() || out.send(obs).await.is_err() {
            return Ok(SourceExit::Cancelled);
        }
    }
    match run.then {
        ScriptEnd::Idle => {
            shutdown.cancelled().await;
            Ok(SourceExit::Cancelled)
        }
        ScriptEnd::Fail(reason) => Err(SourceError::unavailable(&source_id, reason)),
        ScriptEnd::End => Ok(SourceExit::Exhausted),
    }
}

async fn run_generator(
    source_id: SourceId,
    tick: Duration,
    seed: Option<u64>,
    mut shutdown: ShutdownSignal,
    out: mpsc::Sender<CanonicalObservation>,
) -> Result<SourceExit, SourceError> {
    info!(source_id = %source_id, tick_ms = tick.as_millis() as u64, "starting synthetic source");
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(SourceExit::Cancelled),
            _ = ticker.tick() => {}
        }
        for obs in generate_tick(&source_id, &mut rng) {
            if out.send(obs).await.is_err() {
                return Ok(SourceExit::Cancelled);
            }
        }
    }
}

/// One tick of the simulated household: residents always, visitors
/// sometimes, and now and then a randomized passer-by with a weak signal.
pub fn generate_tick(source_id: &SourceId, rng: &mut impl Rng) -> Vec<CanonicalObservation> {
    let now = Utc::now();
    let mut readings: Vec<(&str, Option<&str>, i32, Option<&str>)> = Vec::new();
    for (address, hostname, base) in RESIDENT_DEVICES {
        readings.push((address, Some(hostname), base + rng.gen_range(-5..=5), Some(HOME_NETWORK)));
    }
    for (address, hostname, base) in VISITOR_DEVICES {
        if rng.gen_bool(VISITOR_PROBABILITY) {
            readings.push((address, Some(hostname), base + rng.gen_range(-8..=8), Some(HOME_NETWORK)));
        }
    }
    if rng.gen_bool(PASSERBY_PROBABILITY) {
        let address = RANDOMIZED_ADDRESSES[rng.gen_range(0..RANDOMIZED_ADDRESSES.len())];
        readings.push((address, None, rng.gen_range(-90..=-75), None));
    }

    let mut out = Vec::with_capacity(readings.len());
    for (address, hostname, signal, network) in readings {
        let parsed = DeviceAddress::parse(address).and_then(|address| {
            CanonicalObservation::v1(
                address,
                now,
                Some(signal),
                network.map(str::to_string),
                hostname.map(str::to_string),
                None,
                source_id.clone(),
            )
        });
        match parsed {
            Ok(obs) => out.push(obs),
            Err(err) => debug!(source_id = %source_id, error = %err, "dropping synthetic reading"),
        }
    }
    out
}
