#![forbid(unsafe_code)]

//! Household-relevance classification from a device's observation history.
//!
//! `classify` is a pure function of `ObservationStats` and the evaluation
//! time. Ambiguous inputs resolve toward the less privileged label.

use chrono::{DateTime, Duration, Utc};
use efferve_kernel_contracts::device::{Classification, ObservationStats};
use efferve_kernel_contracts::{ContractViolation, Validate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub window_days: u32,
    pub resident_min_days: u32,
    pub frequent_min_days: u32,
    /// Weighted signal must be strictly above this to count as strong.
    pub strong_signal_dbm: f64,
    /// Pin locally administered addresses to `Passerby`. Off by default since
    /// some fixed hardware ships with the U/L bit set.
    #[serde(default)]
    pub randomized_as_passerby: bool,
}

impl ClassifierConfig {
    pub fn mvp_v1() -> Self {
        Self {
            window_days: 14,
            resident_min_days: 10,
            frequent_min_days: 3,
            strong_signal_dbm: -65.0,
            randomized_as_passerby: false,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

impl Validate for ClassifierConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.window_days == 0 || self.window_days > 90 {
            return Err(ContractViolation::InvalidRange {
                field: "classifier.window_days",
                min: 1.0,
                max: 90.0,
                got: self.window_days as f64,
            });
        }
        if self.resident_min_days > self.window_days {
            return Err(ContractViolation::InvalidValue {
                field: "classifier.resident_min_days",
                reason: "must be <= window_days",
            });
        }
        if self.frequent_min_days == 0 || self.frequent_min_days > self.resident_min_days {
            return Err(ContractViolation::InvalidValue {
                field: "classifier.frequent_min_days",
                reason: "must be in 1..=resident_min_days",
            });
        }
        if !self.strong_signal_dbm.is_finite() {
            return Err(ContractViolation::NotFinite {
                field: "classifier.strong_signal_dbm",
            });
        }
        Ok(())
    }
}

/// Derived quantities the decision policy looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationEvidence {
    pub distinct_days: u32,
    pub weighted_signal: Option<f64>,
    pub age: Duration,
    pub randomized_address: bool,
}

pub fn evidence(
    stats: &ObservationStats,
    now: DateTime<Utc>,
    config: &ClassifierConfig,
) -> ClassificationEvidence {
    ClassificationEvidence {
        distinct_days: stats.distinct_days_within(now, config.window_days),
        weighted_signal: stats.weighted_signal,
        age: stats.age(now),
        randomized_address: stats.randomized_address,
    }
}

pub fn classify(
    stats: &ObservationStats,
    now: DateTime<Utc>,
    config: &ClassifierConfig,
) -> Classification {
    decide(&evidence(stats, now, config), config)
}

pub fn decide(ev: &ClassificationEvidence, config: &ClassifierConfig) -> Classification {
    if config.randomized_as_passerby && ev.randomized_address {
        return Classification::Passerby;
    }
    let strong = ev
        .weighted_signal
        .map(|s| s > config.strong_signal_dbm)
        .unwrap_or(false);
    if ev.distinct_days >= config.resident_min_days && strong {
        return Classification::Resident;
    }
    if ev.distinct_days >= config.frequent_min_days {
        return Classification::FrequentVisitor;
    }
    Classification::Passerby
}
