#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use efferve_kernel_contracts::alert::{AlertRule, RuleId, RuleScope};
use efferve_kernel_contracts::device::{Classification, Device};
use efferve_kernel_contracts::observation::{CanonicalObservation, DeviceAddress};
use efferve_kernel_contracts::persona::{Person, PersonId};
use efferve_kernel_contracts::presence::{PresenceTransition, TransitionKind};
use efferve_kernel_contracts::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("{table}: no row for key {key}")]
    NotFound { table: &'static str, key: String },
    #[error("{table}: duplicate key {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table}: foreign key {key} does not exist")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("{table}: conflict on {key}: {reason}")]
    Conflict {
        table: &'static str,
        key: String,
        reason: &'static str,
    },
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
    #[error("store lock poisoned")]
    Poisoned,
}

/// One row of the append-only presence history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceLogRecord {
    pub seq: u64,
    pub device_address: DeviceAddress,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
    pub person_id: Option<PersonId>,
}

#[derive(Debug, Default)]
struct Tables {
    devices: BTreeMap<DeviceAddress, Device>,
    persons: BTreeMap<PersonId, Person>,
    // device_address -> owning person; a device belongs to at most one person.
    person_by_device: BTreeMap<DeviceAddress, PersonId>,
    rules: BTreeMap<RuleId, AlertRule>,
    presence_log: Vec<PresenceLogRecord>,
    next_presence_seq: u64,
}

/// In-memory relational store for devices, persons, alert rules and the
/// presence log. Every call runs under one table lock, so each row update
/// is atomic.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    tables: Mutex<Tables>,
}

impl MemoryPresenceStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn upsert_device_row(&self, obs: &CanonicalObservation) -> Result<Device, StorageError> {
        obs.validate()?;
        let mut t = self.tables()?;
        let owner = t.person_by_device.get(&obs.device_address).cloned();
        let device = t
            .devices
            .entry(obs.device_address.clone())
            .and_modify(|d| d.apply_observation(obs))
            .or_insert_with(|| Device::from_first_observation(obs));
        device.associated_person = owner;
        Ok(device.clone())
    }

    pub fn device_row(&self, address: &DeviceAddress) -> Result<Option<Device>, StorageError> {
        Ok(self.tables()?.devices.get(address).cloned())
    }

    pub fn device_rows(&self) -> Result<Vec<Device>, StorageError> {
        Ok(self.tables()?.devices.values().cloned().collect())
    }

    pub fn set_device_classification_row(
        &self,
        address: &DeviceAddress,
        classification: Classification,
    ) -> Result<Device, StorageError> {
        let mut t = self.tables()?;
        let device = t
            .devices
            .get_mut(address)
            .ok_or_else(|| StorageError::NotFound {
                table: "devices",
                key: address.to_string(),
            })?;
        device.classification = classification;
        Ok(device.clone())
    }

    pub fn insert_person_row(&self, person: Person) -> Result<(), StorageError> {
        person.validate()?;
        let mut t = self.tables()?;
        if t.persons.contains_key(&person.id) {
            return Err(StorageError::DuplicateKey {
                table: "persons",
                key: person.id.to_string(),
            });
        }
        if let Some(taken) = person
            .device_addresses
            .iter()
            .find(|a| t.person_by_device.contains_key(*a))
        {
            return Err(StorageError::Conflict {
                table: "person_devices",
                key: taken.to_string(),
                reason: "device already assigned to another person",
            });
        }
        for address in &person.device_addresses {
            t.person_by_device.insert(address.clone(), person.id.clone());
            if let Some(d) = t.devices.get_mut(address) {
                d.associated_person = Some(person.id.clone());
            }
        }
        t.persons.insert(person.id.clone(), person);
        Ok(())
    }

    pub fn person_row(&self, person_id: &PersonId) -> Result<Option<Person>, StorageError> {
        Ok(self.tables()?.persons.get(person_id).cloned())
    }

    pub fn person_rows(&self) -> Result<Vec<Person>, StorageError> {
        Ok(self.tables()?.persons.values().cloned().collect())
    }

    /// Assigning a device already owned by the same person is a no-op.
    pub fn assign_device_row(
        &self,
        person_id: &PersonId,
        address: &DeviceAddress,
    ) -> Result<Person, StorageError> {
        let mut t = self.tables()?;
        if !t.persons.contains_key(person_id) {
            return Err(StorageError::ForeignKeyViolation {
                table: "persons",
                key: person_id.to_string(),
            });
        }
        let current_owner = t.person_by_device.get(address).cloned();
        match current_owner {
            Some(owner) if owner == *person_id => {}
            Some(_) => {
                return Err(StorageError::Conflict {
                    table: "person_devices",
                    key: address.to_string(),
                    reason: "device already assigned to another person",
                })
            }
            None => {
                t.person_by_device.insert(address.clone(), person_id.clone());
                if let Some(d) = t.devices.get_mut(address) {
                    d.associated_person = Some(person_id.clone());
                }
            }
        }
        let person = t
            .persons
            .get_mut(person_id)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "persons",
                key: person_id.to_string(),
            })?;
        person.device_addresses.insert(address.clone());
        Ok(person.clone())
    }

    /// Returns false when the device was not assigned to this person.
    pub fn unassign_device_row(
        &self,
        person_id: &PersonId,
        address: &DeviceAddress,
    ) -> Result<bool, StorageError> {
        let mut t = self.tables()?;
        if t.person_by_device.get(address) != Some(person_id) {
            return Ok(false);
        }
        t.person_by_device.remove(address);
        if let Some(p) = t.persons.get_mut(person_id) {
            p.device_addresses.remove(address);
        }
        if let Some(d) = t.devices.get_mut(address) {
            d.associated_person = None;
        }
        Ok(true)
    }

    /// Removes the person and every device link. Returns false when the
    /// person does not exist. Refused while a rule is scoped to the person.
    pub fn delete_person_row(&self, person_id: &PersonId) -> Result<bool, StorageError> {
        let mut t = self.tables()?;
        if !t.persons.contains_key(person_id) {
            return Ok(false);
        }
        if let Some(rule) = t
            .rules
            .values()
            .find(|r| r.scope == RuleScope::Person(person_id.clone()))
        {
            return Err(StorageError::Conflict {
                table: "alert_rules",
                key: rule.id.to_string(),
                reason: "person is referenced by an alert rule",
            });
        }
        let Some(person) = t.persons.remove(person_id) else {
            return Ok(false);
        };
        for address in &person.device_addresses {
            t.person_by_device.remove(address);
            if let Some(d) = t.devices.get_mut(address) {
                d.associated_person = None;
            }
        }
        Ok(true)
    }

    pub fn person_row_for_device(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<Person>, StorageError> {
        let t = self.tables()?;
        Ok(t
            .person_by_device
            .get(address)
            .and_then(|id| t.persons.get(id))
            .cloned())
    }

    /// Contract-level checks only. Outbound safety of the webhook is the
    /// caller's concern.
    pub fn insert_rule_row(&self, rule: AlertRule) -> Result<(), StorageError> {
        rule.validate()?;
        let mut t = self.tables()?;
        if t.rules.contains_key(&rule.id) {
            return Err(StorageError::DuplicateKey {
                table: "alert_rules",
                key: rule.id.to_string(),
            });
        }
        if let RuleScope::Person(person_id) = &rule.scope {
            if !t.persons.contains_key(person_id) {
                return Err(StorageError::ForeignKeyViolation {
                    table: "persons",
                    key: person_id.to_string(),
                });
            }
        }
        t.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn rule_row(&self, rule_id: &RuleId) -> Result<Option<AlertRule>, StorageError> {
        Ok(self.tables()?.rules.get(rule_id).cloned())
    }

    pub fn rule_rows(&self) -> Result<Vec<AlertRule>, StorageError> {
        Ok(self.tables()?.rules.values().cloned().collect())
    }

    pub fn set_rule_enabled_row(
        &self,
        rule_id: &RuleId,
        enabled: bool,
    ) -> Result<AlertRule, StorageError> {
        let mut t = self.tables()?;
        let rule = t
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "alert_rules",
                key: rule_id.to_string(),
            })?;
        rule.enabled = enabled;
        Ok(rule.clone())
    }

    /// Replaces a stored rule wholesale. Same contract checks as insert.
    pub fn update_rule_row(&self, rule: AlertRule) -> Result<AlertRule, StorageError> {
        rule.validate()?;
        let mut t = self.tables()?;
        if !t.rules.contains_key(&rule.id) {
            return Err(StorageError::NotFound {
                table: "alert_rules",
                key: rule.id.to_string(),
            });
        }
        if let RuleScope::Person(person_id) = &rule.scope {
            if !t.persons.contains_key(person_id) {
                return Err(StorageError::ForeignKeyViolation {
                    table: "persons",
                    key: person_id.to_string(),
                });
            }
        }
        t.rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    pub fn delete_rule_row(&self, rule_id: &RuleId) -> Result<AlertRule, StorageError> {
        self.tables()?
            .rules
            .remove(rule_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "alert_rules",
                key: rule_id.to_string(),
            })
    }

    pub fn enabled_rule_rows(
        &self,
        trigger: TransitionKind,
        scope: &RuleScope,
    ) -> Result<Vec<AlertRule>, StorageError> {
        Ok(self
            .tables()?
            .rules
            .values()
            .filter(|r| r.enabled && r.trigger.fires_on(trigger) && r.scope == *scope)
            .cloned()
            .collect())
    }

    pub fn append_presence_log_row(
        &self,
        transition: &PresenceTransition,
    ) -> Result<PresenceLogRecord, StorageError> {
        let mut t = self.tables()?;
        t.next_presence_seq += 1;
        let row = PresenceLogRecord {
            seq: t.next_presence_seq,
            device_address: transition.device_address.clone(),
            kind: transition.kind,
            at: transition.at,
            person_id: t.person_by_device.get(&transition.device_address).cloned(),
        };
        t.presence_log.push(row.clone());
        Ok(row)
    }

    pub fn presence_log_rows(
        &self,
        address: Option<&DeviceAddress>,
        limit: usize,
    ) -> Result<Vec<PresenceLogRecord>, StorageError> {
        Ok(self
            .tables()?
            .presence_log
            .iter()
            .rev()
            .filter(|r| address.map(|a| r.device_address == *a).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }
}
