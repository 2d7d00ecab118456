#![forbid(unsafe_code)]

//! Observation sources. Each configured backend instance is a `SourceSpec`;
//! every (re)start builds a fresh `ObservationSource` from it and drives it
//! until cancellation, end of stream or failure.

pub mod api_poll;
pub mod capture;
pub mod synthetic;

use std::fmt;

use efferve_kernel_contracts::observation::{CanonicalObservation, SourceId};
use tokio::sync::mpsc;

use crate::shutdown::ShutdownSignal;

pub use api_poll::ApiPollConfig;
pub use capture::{RadioMonitorConfig, RemoteCaptureConfig};
pub use synthetic::{ScriptEnd, ScriptHandle, ScriptedRun, SyntheticConfig, SyntheticMode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("source {source_id} unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },
}

impl SourceError {
    pub fn unavailable(source_id: &SourceId, reason: impl fmt::Display) -> Self {
        SourceError::Unavailable {
            source_id: source_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// How a source instance stopped without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceExit {
    Cancelled,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceKind {
    ApiPoll,
    RemoteCapture,
    RadioMonitor,
    Synthetic,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::ApiPoll => "api_poll",
            SourceKind::RemoteCapture => "remote_capture",
            SourceKind::RadioMonitor => "radio_monitor",
            SourceKind::Synthetic => "synthetic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "api_poll" => Some(SourceKind::ApiPoll),
            "remote_capture" => Some(SourceKind::RemoteCapture),
            "radio_monitor" => Some(SourceKind::RadioMonitor),
            "synthetic" => Some(SourceKind::Synthetic),
            _ => None,
        }
    }
}

/// Configuration of one backend instance.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    ApiPoll(ApiPollConfig),
    RemoteCapture(RemoteCaptureConfig),
    RadioMonitor(RadioMonitorConfig),
    Synthetic(SyntheticConfig),
}

impl SourceSpec {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceSpec::ApiPoll(_) => SourceKind::ApiPoll,
            SourceSpec::RemoteCapture(_) => SourceKind::RemoteCapture,
            SourceSpec::RadioMonitor(_) => SourceKind::RadioMonitor,
            SourceSpec::Synthetic(_) => SourceKind::Synthetic,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        match self {
            SourceSpec::ApiPoll(c) => &c.source_id,
            SourceSpec::RemoteCapture(c) => &c.source_id,
            SourceSpec::RadioMonitor(c) => &c.source_id,
            SourceSpec::Synthetic(c) => &c.source_id,
        }
    }

    /// Fresh, never-started instance. Instances are not restartable.
    pub fn build(&self) -> ObservationSource {
        match self {
            SourceSpec::ApiPoll(c) => ObservationSource::ApiPoll(api_poll::ApiPollSource::new(c.clone())),
            SourceSpec::RemoteCapture(c) => {
                ObservationSource::RemoteCapture(capture::RemoteCaptureSource::new(c.clone()))
            }
            SourceSpec::RadioMonitor(c) => {
                ObservationSource::RadioMonitor(capture::RadioMonitorSource::new(c.clone()))
            }
            SourceSpec::Synthetic(c) => ObservationSource::Synthetic(synthetic::SyntheticSource::new(c.clone())),
        }
    }
}

/// One running backend instance.
#[derive(Debug)]
pub enum ObservationSource {
    ApiPoll(api_poll::ApiPollSource),
    RemoteCapture(capture::RemoteCaptureSource),
    RadioMonitor(capture::RadioMonitorSource),
    Synthetic(synthetic::SyntheticSource),
}

impl ObservationSource {
    /// Pushes observations into `out` until cancelled, exhausted or failed.
    /// Malformed readings are dropped inside the source. A closed `out`
    /// counts as cancellation.
    pub async fn produce(
        self,
        shutdown: ShutdownSignal,
        out: mpsc::Sender<CanonicalObservation>,
    ) -> Result<SourceExit, SourceError> {
        match self {
            ObservationSource::ApiPoll(s) => s.produce(shutdown, out).await,
            ObservationSource::RemoteCapture(s) => s.produce(shutdown, out).await,
            ObservationSource::RadioMonitor(s) => s.produce(shutdown, out).await,
            ObservationSource::Synthetic(s) => s.produce(shutdown, out).await,
        }
    }
}
