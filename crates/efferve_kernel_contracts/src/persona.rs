#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{validate_text, validate_token};
use crate::observation::DeviceAddress;
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersonId(String);

impl PersonId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PersonId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("person_id", &self.0, 64)
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    #[serde(default)]
    pub device_addresses: BTreeSet<DeviceAddress>,
}

impl Person {
    pub fn v1(id: PersonId, name: impl Into<String>) -> Result<Self, ContractViolation> {
        let p = Self {
            id,
            name: name.into().trim().to_string(),
            device_addresses: BTreeSet::new(),
        };
        p.validate()?;
        Ok(p)
    }
}

impl Validate for Person {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        validate_text("person.name", &self.name, 128)
    }
}
