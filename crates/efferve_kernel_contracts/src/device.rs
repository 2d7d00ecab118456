#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::observation::{CanonicalObservation, DeviceAddress, SourceId};
use crate::persona::PersonId;
use crate::{ContractViolation, Validate};

/// Smoothing factor of the recency-weighted signal average.
pub const SIGNAL_EWMA_ALPHA: f64 = 0.3;

/// Calendar days kept in the per-device day set; older days are pruned.
pub const MAX_TRACKED_DAYS: i64 = 90;

/// Household relevance of a device, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Passerby,
    FrequentVisitor,
    Resident,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Passerby => "passerby",
            Classification::FrequentVisitor => "frequent_visitor",
            Classification::Resident => "resident",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationStats {
    pub count: u64,
    /// Exponentially weighted signal in dBm; `None` until an RF reading arrives.
    pub weighted_signal: Option<f64>,
    /// UTC calendar days with at least one observation.
    pub observed_days: BTreeSet<NaiveDate>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub randomized_address: bool,
}

impl ObservationStats {
    pub fn from_first(obs: &CanonicalObservation) -> Self {
        let mut observed_days = BTreeSet::new();
        observed_days.insert(obs.timestamp.date_naive());
        Self {
            count: 1,
            weighted_signal: obs.signal_strength.map(f64::from),
            observed_days,
            first_seen: obs.timestamp,
            last_seen: obs.timestamp,
            randomized_address: obs.device_address.is_locally_administered(),
        }
    }

    pub fn record(&mut self, obs: &CanonicalObservation) {
        self.count = self.count.saturating_add(1);
        if let Some(signal) = obs.signal_strength.map(f64::from) {
            self.weighted_signal = Some(match self.weighted_signal {
                Some(prev) => SIGNAL_EWMA_ALPHA * signal + (1.0 - SIGNAL_EWMA_ALPHA) * prev,
                None => signal,
            });
        }
        self.first_seen = self.first_seen.min(obs.timestamp);
        self.last_seen = self.last_seen.max(obs.timestamp);
        self.observed_days.insert(obs.timestamp.date_naive());
        let horizon = self.last_seen.date_naive() - Duration::days(MAX_TRACKED_DAYS);
        self.observed_days.retain(|d| *d > horizon);
    }

    /// Distinct observed days in the `window_days` calendar days ending on `now`'s day.
    pub fn distinct_days_within(&self, now: DateTime<Utc>, window_days: u32) -> u32 {
        if window_days == 0 {
            return 0;
        }
        let today = now.date_naive();
        let start = today - Duration::days(i64::from(window_days) - 1);
        self.observed_days.range(start..=today).count() as u32
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.first_seen).max(Duration::zero())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub address: DeviceAddress,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub classification: Classification,
    pub stats: ObservationStats,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub network_name: Option<String>,
    pub associated_person: Option<PersonId>,
    pub last_source: SourceId,
}

impl Device {
    /// New devices start as `Passerby`; the registry reclassifies right after creation.
    pub fn from_first_observation(obs: &CanonicalObservation) -> Self {
        Self {
            address: obs.device_address.clone(),
            first_seen: obs.timestamp,
            last_seen: obs.timestamp,
            classification: Classification::Passerby,
            stats: ObservationStats::from_first(obs),
            hostname: obs.hostname.clone(),
            vendor: obs.vendor_hint.clone(),
            network_name: obs.network_name.clone(),
            associated_person: None,
            last_source: obs.source_id.clone(),
        }
    }

    pub fn apply_observation(&mut self, obs: &CanonicalObservation) {
        self.stats.record(obs);
        self.first_seen = self.stats.first_seen;
        self.last_seen = self.stats.last_seen;
        if obs.hostname.is_some() {
            self.hostname = obs.hostname.clone();
        }
        if obs.vendor_hint.is_some() {
            self.vendor = obs.vendor_hint.clone();
        }
        if obs.network_name.is_some() {
            self.network_name = obs.network_name.clone();
        }
        self.last_source = obs.source_id.clone();
    }
}

impl Validate for Device {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.last_seen < self.first_seen {
            return Err(ContractViolation::InvalidValue {
                field: "device.last_seen",
                reason: "must be >= first_seen",
            });
        }
        if self.stats.count == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "device.stats.count",
                reason: "must be > 0",
            });
        }
        if let Some(signal) = self.stats.weighted_signal {
            if !signal.is_finite() {
                return Err(ContractViolation::NotFinite {
                    field: "device.stats.weighted_signal",
                });
            }
        }
        Ok(())
    }
}
