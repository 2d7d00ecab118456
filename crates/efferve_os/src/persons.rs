#![forbid(unsafe_code)]

//! Person management and the "who is home" view. A person is present when
//! any of their devices is present.

use std::collections::BTreeSet;

use efferve_kernel_contracts::observation::DeviceAddress;
use efferve_kernel_contracts::persona::{Person, PersonId};
use efferve_storage::repo::PresenceRepo;
use efferve_storage::store::{MemoryPresenceStore, StorageError};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonPresence {
    pub person_id: String,
    pub name: String,
    pub present_devices: Vec<DeviceAddress>,
    pub is_present: bool,
}

/// One row per known person, in id order.
pub fn present_persons(
    repo: &dyn PresenceRepo,
    present: &BTreeSet<DeviceAddress>,
) -> Result<Vec<PersonPresence>, StorageError> {
    Ok(repo
        .list_persons()?
        .into_iter()
        .map(|person| presence_of(person, present))
        .collect())
}

fn presence_of(person: Person, present: &BTreeSet<DeviceAddress>) -> PersonPresence {
    let present_devices: Vec<DeviceAddress> = person
        .device_addresses
        .iter()
        .filter(|a| present.contains(*a))
        .cloned()
        .collect();
    PersonPresence {
        person_id: person.id.to_string(),
        name: person.name,
        is_present: !present_devices.is_empty(),
        present_devices,
    }
}

/// Returns false when the person does not exist.
pub fn delete_person(store: &MemoryPresenceStore, person_id: &PersonId) -> Result<bool, StorageError> {
    let deleted = store.delete_person_row(person_id)?;
    if deleted {
        info!(person_id = %person_id, "person deleted");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> DeviceAddress {
        DeviceAddress::parse(s).unwrap()
    }

    fn person(id: &str, name: &str, devices: &[&str]) -> Person {
        let mut p = Person::v1(PersonId::new(id).unwrap(), name).unwrap();
        p.device_addresses.extend(devices.iter().map(|d| addr(d)));
        p
    }

    #[test]
    fn any_present_device_makes_the_person_present() {
        let store = MemoryPresenceStore::new_in_memory();
        store
            .insert_person_row(person("alice", "Alice", &["AA:BB:CC:11:22:33", "AA:BB:CC:11:22:44"]))
            .unwrap();
        store.insert_person_row(person("bob", "Bob", &["00:11:22:33:44:55"])).unwrap();
        store.insert_person_row(person("carol", "Carol", &[])).unwrap();

        let present: BTreeSet<_> = [addr("AA:BB:CC:11:22:44"), addr("08:00:27:AA:BB:CC")].into();
        let rows = present_persons(&store, &present).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].person_id, "alice");
        assert!(rows[0].is_present);
        assert_eq!(rows[0].present_devices, vec![addr("AA:BB:CC:11:22:44")]);
        assert!(!rows[1].is_present);
        assert!(!rows[2].is_present);
        assert!(rows[2].present_devices.is_empty());
    }

    #[test]
    fn deleted_person_leaves_the_view() {
        let store = MemoryPresenceStore::new_in_memory();
        store.insert_person_row(person("alice", "Alice", &["AA:BB:CC:11:22:33"])).unwrap();
        assert!(delete_person(&store, &PersonId::new("alice").unwrap()).unwrap());
        assert!(!delete_person(&store, &PersonId::new("alice").unwrap()).unwrap());

        let present: BTreeSet<_> = [addr("AA:BB:CC:11:22:33")].into();
        assert!(present_persons(&store, &present).unwrap().is_empty());
    }
}
