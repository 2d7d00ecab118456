#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{non_empty, validate_opt_text, validate_token};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const OBSERVATION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Weakest signal a receiver can plausibly report, in dBm.
pub const SIGNAL_DBM_MIN: i32 = -120;

pub const NETWORK_NAME_MAX_LEN: usize = 64;

/// Link-layer address of an observed device, normalised to `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Accepts colon, dash, Cisco-dotted and bare 12-hex forms in any case.
    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if cleaned.len() != 12 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ContractViolation::InvalidValue {
                field: "device_address",
                reason: "must be a 48-bit hex link-layer address",
            });
        }
        let octets: Vec<&str> = (0..12).step_by(2).map(|i| &cleaned[i..i + 2]).collect();
        Ok(Self(octets.join(":")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the U/L bit of the first octet is set, i.e. a randomised address.
    pub fn is_locally_administered(&self) -> bool {
        u8::from_str_radix(&self.0[0..2], 16)
            .map(|first| first & 0x02 != 0)
            .unwrap_or(false)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceAddress> for String {
    fn from(value: DeviceAddress) -> Self {
        value.0
    }
}

/// Identifies one configured backend instance (e.g. `api_poll:opnsense`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for SourceId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("source_id", &self.0, 64)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One sighting of one device by one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalObservation {
    pub schema_version: SchemaVersion,
    pub device_address: DeviceAddress,
    pub timestamp: DateTime<Utc>,
    pub signal_strength: Option<i32>,
    pub network_name: Option<String>,
    pub hostname: Option<String>,
    pub vendor_hint: Option<String>,
    pub source_id: SourceId,
}

impl CanonicalObservation {
    /// Builds a validated observation. A signal of `0` is the "no RF data"
    /// sentinel some backends report and is stored as `None`.
    pub fn v1(
        device_address: DeviceAddress,
        timestamp: DateTime<Utc>,
        signal_strength: Option<i32>,
        network_name: Option<String>,
        hostname: Option<String>,
        vendor_hint: Option<String>,
        source_id: SourceId,
    ) -> Result<Self, ContractViolation> {
        let o = Self {
            schema_version: OBSERVATION_CONTRACT_VERSION,
            device_address,
            timestamp,
            signal_strength: signal_strength.filter(|s| *s != 0),
            network_name: non_empty(network_name),
            hostname: non_empty(hostname),
            vendor_hint: non_empty(vendor_hint),
            source_id,
        };
        o.validate()?;
        Ok(o)
    }
}

impl Validate for CanonicalObservation {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != OBSERVATION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "canonical_observation.schema_version",
                reason: "must match OBSERVATION_CONTRACT_VERSION",
            });
        }
        if let Some(signal) = self.signal_strength {
            if !(SIGNAL_DBM_MIN..0).contains(&signal) {
                return Err(ContractViolation::InvalidRange {
                    field: "canonical_observation.signal_strength",
                    min: SIGNAL_DBM_MIN as f64,
                    max: -1.0,
                    got: signal as f64,
                });
            }
        }
        validate_opt_text(
            "canonical_observation.network_name",
            &self.network_name,
            NETWORK_NAME_MAX_LEN,
        )?;
        validate_opt_text("canonical_observation.hostname", &self.hostname, 255)?;
        validate_opt_text("canonical_observation.vendor_hint", &self.vendor_hint, 128)?;
        self.source_id.validate()
    }
}
