#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::observation::DeviceAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub device_address: DeviceAddress,
    pub status: PresenceStatus,
    /// Time of the last confirmed transition; `None` while never observed.
    pub since: Option<DateTime<Utc>>,
}

impl PresenceState {
    pub fn initial(device_address: DeviceAddress) -> Self {
        Self {
            device_address,
            status: PresenceStatus::Absent,
            since: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Arrive,
    Leave,
}

impl TransitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionKind::Arrive => "arrive",
            TransitionKind::Leave => "leave",
        }
    }
}

/// Edge-triggered arrive/leave event for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceTransition {
    pub device_address: DeviceAddress,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
}
