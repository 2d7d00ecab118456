#![forbid(unsafe_code)]

//! Device registry: the single writer of device rows. Same-address upserts
//! are serialized through a sharded lock table so read-modify-write cycles
//! (upsert, classify, store label) never interleave for one device.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use efferve_engines::classifier::{classify, ClassifierConfig};
use efferve_kernel_contracts::device::{Classification, Device};
use efferve_kernel_contracts::observation::{CanonicalObservation, DeviceAddress};
use efferve_storage::repo::PresenceRepo;
use efferve_storage::store::StorageError;
use tokio::sync::mpsc;
use tracing::{debug, error};

pub const REGISTRY_LOCK_SHARDS: usize = 64;

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationChange {
    pub from: Classification,
    pub to: Classification,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryUpdate {
    pub device: Device,
    pub change: Option<ClassificationChange>,
}

pub struct DeviceRegistry {
    repo: Arc<dyn PresenceRepo>,
    classifier: ClassifierConfig,
    shards: Vec<Mutex<()>>,
}

impl DeviceRegistry {
    pub fn new(repo: Arc<dyn PresenceRepo>, classifier: ClassifierConfig) -> Self {
        Self {
            repo,
            classifier,
            shards: (0..REGISTRY_LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn classifier(&self) -> &ClassifierConfig {
        &self.classifier
    }

    fn lock_address(&self, address: &DeviceAddress) -> Result<MutexGuard<'_, ()>, StorageError> {
        let idx = (fnv1a64(address.as_str().as_bytes()) % self.shards.len() as u64) as usize;
        self.shards[idx].lock().map_err(|_| StorageError::Poisoned)
    }

    /// Folds the observation into the device row, then reclassifies as of
    /// the device's last sighting. The label is written only when it changes.
    pub fn upsert(&self, obs: &CanonicalObservation) -> Result<RegistryUpdate, StorageError> {
        let _serial = self.lock_address(&obs.device_address)?;
        let device = self.repo.upsert_device(obs)?;
        let as_of = device.last_seen;
        self.store_classification(device, as_of)
    }

    /// Re-runs the classifier against the stored stats at `now`. Live
    /// labels only move on sightings, through `upsert`.
    #[cfg(test)]
    fn reclassify(
        &self,
        address: &DeviceAddress,
        now: DateTime<Utc>,
    ) -> Result<Option<RegistryUpdate>, StorageError> {
        let _serial = self.lock_address(address)?;
        match self.repo.get_device(address)? {
            Some(device) => self.store_classification(device, now).map(Some),
            None => Ok(None),
        }
    }

    pub fn get(&self, address: &DeviceAddress) -> Result<Option<Device>, StorageError> {
        self.repo.get_device(address)
    }

    fn store_classification(
        &self,
        device: Device,
        now: DateTime<Utc>,
    ) -> Result<RegistryUpdate, StorageError> {
        let label = classify(&device.stats, now, &self.classifier);
        if label == device.classification {
            return Ok(RegistryUpdate {
                device,
                change: None,
            });
        }
        let from = device.classification;
        let device = self.repo.set_classification(&device.address, label)?;
        debug!(
            address = %device.address,
            from = from.as_str(),
            to = label.as_str(),
            "classification changed"
        );
        Ok(RegistryUpdate {
            device,
            change: Some(ClassificationChange { from, to: label }),
        })
    }
}

/// What the presence detector needs from one accepted observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub device_address: DeviceAddress,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("presence detector is no longer accepting sightings")]
    DetectorClosed,
}

/// Registry write followed by hand-off to the presence detector. Shared by
/// every source consumption loop.
#[derive(Clone)]
pub struct IngestSink {
    registry: Arc<DeviceRegistry>,
    sightings: mpsc::Sender<Sighting>,
}

impl IngestSink {
    pub fn new(registry: Arc<DeviceRegistry>, sightings: mpsc::Sender<Sighting>) -> Self {
        Self {
            registry,
            sightings,
        }
    }

    /// A store failure drops this observation only; other devices keep flowing.
    pub async fn ingest(&self, obs: CanonicalObservation) -> Result<(), IngestError> {
        if let Err(err) = self.registry.upsert(&obs) {
            error!(
                address = %obs.device_address,
                source_id = %obs.source_id,
                error = %err,
                "store error during ingestion"
            );
            return Ok(());
        }
        self.sightings
            .send(Sighting {
                device_address: obs.device_address,
                seen_at: obs.timestamp,
            })
            .await
            .map_err(|_| IngestError::DetectorClosed)
    }
}
