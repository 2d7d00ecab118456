#![forbid(unsafe_code)]

use efferve_kernel_contracts::alert::{AlertRule, RuleId, RuleScope};
use efferve_kernel_contracts::device::{Classification, Device};
use efferve_kernel_contracts::observation::{CanonicalObservation, DeviceAddress};
use efferve_kernel_contracts::persona::Person;
use efferve_kernel_contracts::presence::{PresenceTransition, TransitionKind};

use crate::store::{MemoryPresenceStore, PresenceLogRecord, StorageError};

/// Typed repository interface the presence pipeline depends on.
///
/// Methods take `&self` so one store can be shared across ingestion tasks;
/// implementations provide their own row-level atomicity.
pub trait PresenceRepo: Send + Sync {
    /// Creates the device on first sight, otherwise folds the observation
    /// into its stats. Returns the row as stored.
    fn upsert_device(&self, obs: &CanonicalObservation) -> Result<Device, StorageError>;

    fn get_device(&self, address: &DeviceAddress) -> Result<Option<Device>, StorageError>;

    fn set_classification(
        &self,
        address: &DeviceAddress,
        classification: Classification,
    ) -> Result<Device, StorageError>;

    /// Enabled rules with exactly this scope whose trigger fires on `trigger`.
    fn list_enabled_rules(
        &self,
        trigger: TransitionKind,
        scope: &RuleScope,
    ) -> Result<Vec<AlertRule>, StorageError>;

    fn get_rule(&self, rule_id: &RuleId) -> Result<Option<AlertRule>, StorageError>;

    fn resolve_person_for_device(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<Person>, StorageError>;

    fn list_persons(&self) -> Result<Vec<Person>, StorageError>;

    fn append_presence_log(
        &self,
        transition: &PresenceTransition,
    ) -> Result<PresenceLogRecord, StorageError>;

    /// Newest first, at most `limit` rows.
    fn presence_history(
        &self,
        address: Option<&DeviceAddress>,
        limit: usize,
    ) -> Result<Vec<PresenceLogRecord>, StorageError>;
}

impl PresenceRepo for MemoryPresenceStore {
    fn upsert_device(&self, obs: &CanonicalObservation) -> Result<Device, StorageError> {
        self.upsert_device_row(obs)
    }

    fn get_device(&self, address: &DeviceAddress) -> Result<Option<Device>, StorageError> {
        self.device_row(address)
    }

    fn set_classification(
        &self,
        address: &DeviceAddress,
        classification: Classification,
    ) -> Result<Device, StorageError> {
        self.set_device_classification_row(address, classification)
    }

    fn list_enabled_rules(
        &self,
        trigger: TransitionKind,
        scope: &RuleScope,
    ) -> Result<Vec<AlertRule>, StorageError> {
        self.enabled_rule_rows(trigger, scope)
    }

    fn get_rule(&self, rule_id: &RuleId) -> Result<Option<AlertRule>, StorageError> {
        self.rule_row(rule_id)
    }

    fn resolve_person_for_device(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<Person>, StorageError> {
        self.person_row_for_device(address)
    }

    fn list_persons(&self) -> Result<Vec<Person>, StorageError> {
        self.person_rows()
    }

    fn append_presence_log(
        &self,
        transition: &PresenceTransition,
    ) -> Result<PresenceLogRecord, StorageError> {
        self.append_presence_log_row(transition)
    }

    fn presence_history(
        &self,
        address: Option<&DeviceAddress>,
        limit: usize,
    ) -> Result<Vec<PresenceLogRecord>, StorageError> {
        self.presence_log_rows(address, limit)
    }
}
