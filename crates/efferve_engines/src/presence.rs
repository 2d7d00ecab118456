#![forbid(unsafe_code)]

//! Per-device arrive/leave hysteresis.
//!
//! Each tracked device is a two-state machine (`Absent` <-> `Present`) plus
//! the last time it was seen. Observations can only move a device to
//! `Present`; only a sweep can move it back to `Absent`, and only once the
//! silence exceeds the grace period.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use efferve_kernel_contracts::observation::DeviceAddress;
use efferve_kernel_contracts::presence::{
    PresenceState, PresenceStatus, PresenceTransition, TransitionKind,
};
use efferve_kernel_contracts::{ContractViolation, Validate};

pub const GRACE_PERIOD_MAX: StdDuration = StdDuration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceDetectorConfig {
    pub grace_period: StdDuration,
    pub sweep_interval: StdDuration,
}

impl PresenceDetectorConfig {
    pub fn mvp_v1() -> Self {
        Self::with_grace(StdDuration::from_secs(180))
    }

    /// Sweep interval defaults to half the grace period.
    pub fn with_grace(grace_period: StdDuration) -> Self {
        Self {
            grace_period,
            sweep_interval: grace_period / 2,
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_std(self.grace_period).unwrap_or_else(|_| Duration::days(1))
    }
}

impl Default for PresenceDetectorConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

impl Validate for PresenceDetectorConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.grace_period.is_zero() || self.grace_period > GRACE_PERIOD_MAX {
            return Err(ContractViolation::InvalidRange {
                field: "presence.grace_period_secs",
                min: 1.0,
                max: GRACE_PERIOD_MAX.as_secs_f64(),
                got: self.grace_period.as_secs_f64(),
            });
        }
        if self.sweep_interval.is_zero() || self.sweep_interval > self.grace_period / 2 {
            return Err(ContractViolation::InvalidValue {
                field: "presence.sweep_interval",
                reason: "must be non-zero and <= grace_period / 2",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedPresence {
    state: PresenceState,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PresenceDetector {
    config: PresenceDetectorConfig,
    tracked: BTreeMap<DeviceAddress, TrackedPresence>,
}

impl PresenceDetector {
    pub fn new(config: PresenceDetectorConfig) -> Result<Self, ContractViolation> {
        config.validate()?;
        Ok(Self {
            config,
            tracked: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &PresenceDetectorConfig {
        &self.config
    }

    /// Records a sighting at `seen_at`, evaluated at `now`. Emits `Arrive`
    /// only on the absent -> present edge. A sighting already older than
    /// the grace period refreshes last-seen without arriving.
    pub fn observe(
        &mut self,
        address: &DeviceAddress,
        seen_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<PresenceTransition> {
        let grace = self.config.grace();
        let entry = self
            .tracked
            .entry(address.clone())
            .or_insert_with(|| TrackedPresence {
                state: PresenceState::initial(address.clone()),
                last_seen: seen_at,
            });
        entry.last_seen = entry.last_seen.max(seen_at);

        if entry.state.status == PresenceStatus::Present {
            return None;
        }
        if now - entry.last_seen > grace {
            return None;
        }
        entry.state.status = PresenceStatus::Present;
        entry.state.since = Some(now);
        Some(PresenceTransition {
            device_address: address.clone(),
            kind: TransitionKind::Arrive,
            at: now,
        })
    }

    /// Marks every present device silent for longer than the grace period as absent.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<PresenceTransition> {
        let grace = self.config.grace();
        let mut out = Vec::new();
        for (address, entry) in self.tracked.iter_mut() {
            if entry.state.status != PresenceStatus::Present {
                continue;
            }
            if now - entry.last_seen > grace {
                entry.state.status = PresenceStatus::Absent;
                entry.state.since = Some(now);
                out.push(PresenceTransition {
                    device_address: address.clone(),
                    kind: TransitionKind::Leave,
                    at: now,
                });
            }
        }
        out
    }

    pub fn state(&self, address: &DeviceAddress) -> PresenceState {
        self.tracked
            .get(address)
            .map(|t| t.state.clone())
            .unwrap_or_else(|| PresenceState::initial(address.clone()))
    }

    pub fn last_seen(&self, address: &DeviceAddress) -> Option<DateTime<Utc>> {
        self.tracked.get(address).map(|t| t.last_seen)
    }

    pub fn present_devices(&self) -> Vec<DeviceAddress> {
        self.tracked
            .iter()
            .filter(|(_, t)| t.state.status == PresenceStatus::Present)
            .map(|(a, _)| a.clone())
            .collect()
    }
}
