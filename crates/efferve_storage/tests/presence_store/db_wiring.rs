#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use efferve_kernel_contracts::alert::{AlertRule, RuleId, RuleScope, RuleTrigger};
use efferve_kernel_contracts::device::Classification;
use efferve_kernel_contracts::observation::{CanonicalObservation, DeviceAddress, SourceId};
use efferve_kernel_contracts::persona::{Person, PersonId};
use efferve_kernel_contracts::presence::{PresenceTransition, TransitionKind};
use efferve_storage::repo::PresenceRepo;
use efferve_storage::store::{MemoryPresenceStore, StorageError};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
}

fn addr(s: &str) -> DeviceAddress {
    DeviceAddress::parse(s).unwrap()
}

fn person_id(s: &str) -> PersonId {
    PersonId::new(s).unwrap()
}

fn obs(address: &str, at: DateTime<Utc>, signal: Option<i32>, hostname: Option<&str>) -> CanonicalObservation {
    CanonicalObservation::v1(
        addr(address),
        at,
        signal,
        None,
        hostname.map(str::to_string),
        None,
        SourceId::new("api_poll:router").unwrap(),
    )
    .unwrap()
}

fn rule(id: &str, scope: RuleScope, trigger: RuleTrigger) -> AlertRule {
    AlertRule {
        id: RuleId::new(id).unwrap(),
        name: None,
        scope,
        trigger,
        webhook_url: "https://hooks.example.com/presence".to_string(),
        enabled: true,
    }
}

#[test]
fn at_store_db_01_upsert_creates_then_updates() {
    let s = MemoryPresenceStore::new_in_memory();
    let first = s
        .upsert_device(&obs("aa:bb:cc:11:22:33", t0(), Some(-50), Some("phone")))
        .unwrap();
    assert_eq!(first.first_seen, t0());
    assert_eq!(first.last_seen, t0());
    assert_eq!(first.classification, Classification::Passerby);
    assert_eq!(first.stats.count, 1);

    let later = t0() + Duration::minutes(5);
    let second = s.upsert_device(&obs("AA:BB:CC:11:22:33", later, None, None)).unwrap();
    assert_eq!(second.first_seen, t0());
    assert_eq!(second.last_seen, later);
    assert_eq!(second.stats.count, 2);
    assert_eq!(second.hostname.as_deref(), Some("phone"));
    assert_eq!(second.stats.weighted_signal, Some(-50.0));

    let stored = s.get_device(&addr("AA:BB:CC:11:22:33")).unwrap().unwrap();
    assert_eq!(stored, second);
    assert!(s.get_device(&addr("00:11:22:33:44:55")).unwrap().is_none());
}

#[test]
fn at_store_db_02_classification_requires_existing_device() {
    let s = MemoryPresenceStore::new_in_memory();
    let missing = s.set_classification(&addr("00:11:22:33:44:55"), Classification::Resident);
    assert!(matches!(missing, Err(StorageError::NotFound { table: "devices", .. })));

    s.upsert_device(&obs("00:11:22:33:44:55", t0(), None, None)).unwrap();
    let d = s
        .set_classification(&addr("00:11:22:33:44:55"), Classification::FrequentVisitor)
        .unwrap();
    assert_eq!(d.classification, Classification::FrequentVisitor);
}

#[test]
fn at_store_db_03_person_assignment_is_idempotent_and_exclusive() {
    let s = MemoryPresenceStore::new_in_memory();
    s.insert_person_row(Person::v1(person_id("alice"), "Alice").unwrap()).unwrap();
    s.insert_person_row(Person::v1(person_id("bob"), "Bob").unwrap()).unwrap();
    let a = addr("AA:BB:CC:11:22:33");

    s.assign_device_row(&person_id("alice"), &a).unwrap();
    let again = s.assign_device_row(&person_id("alice"), &a).unwrap();
    assert_eq!(again.device_addresses.len(), 1);

    let clash = s.assign_device_row(&person_id("bob"), &a);
    assert!(matches!(clash, Err(StorageError::Conflict { .. })));

    let unknown = s.assign_device_row(&person_id("carol"), &a);
    assert!(matches!(unknown, Err(StorageError::ForeignKeyViolation { .. })));

    assert_eq!(
        s.resolve_person_for_device(&a).unwrap().map(|p| p.id),
        Some(person_id("alice"))
    );
    assert!(s.unassign_device_row(&person_id("alice"), &a).unwrap());
    assert!(!s.unassign_device_row(&person_id("alice"), &a).unwrap());
    assert!(s.resolve_person_for_device(&a).unwrap().is_none());
}

#[test]
fn at_store_db_04_device_row_tracks_owner() {
    let s = MemoryPresenceStore::new_in_memory();
    let mut alice = Person::v1(person_id("alice"), "Alice").unwrap();
    alice.device_addresses.insert(addr("AA:BB:CC:11:22:33"));
    s.insert_person_row(alice).unwrap();

    let d = s.upsert_device(&obs("AA:BB:CC:11:22:33", t0(), None, None)).unwrap();
    assert_eq!(d.associated_person, Some(person_id("alice")));

    s.unassign_device_row(&person_id("alice"), &addr("AA:BB:CC:11:22:33"))
        .unwrap();
    let d = s.get_device(&addr("AA:BB:CC:11:22:33")).unwrap().unwrap();
    assert_eq!(d.associated_person, None);
}

#[test]
fn at_store_db_05_enabled_rules_filtered_by_scope_and_trigger() {
    let s = MemoryPresenceStore::new_in_memory();
    s.insert_person_row(Person::v1(person_id("alice"), "Alice").unwrap()).unwrap();
    let a = addr("AA:BB:CC:11:22:33");
    s.insert_rule_row(rule("leave_dev", RuleScope::Device(a.clone()), RuleTrigger::Leave))
        .unwrap();
    s.insert_rule_row(rule("both_dev", RuleScope::Device(a.clone()), RuleTrigger::Both))
        .unwrap();
    s.insert_rule_row(rule("arrive_alice", RuleScope::Person(person_id("alice")), RuleTrigger::Arrive))
        .unwrap();
    s.insert_rule_row(rule("any", RuleScope::All, RuleTrigger::Both)).unwrap();

    let ids = |rules: Vec<AlertRule>| rules.into_iter().map(|r| r.id.to_string()).collect::<Vec<_>>();
    assert_eq!(
        ids(s.list_enabled_rules(TransitionKind::Leave, &RuleScope::Device(a.clone())).unwrap()),
        vec!["both_dev", "leave_dev"]
    );
    assert_eq!(
        ids(s.list_enabled_rules(TransitionKind::Arrive, &RuleScope::Device(a.clone())).unwrap()),
        vec!["both_dev"]
    );
    assert_eq!(
        ids(s.list_enabled_rules(TransitionKind::Arrive, &RuleScope::Person(person_id("alice"))).unwrap()),
        vec!["arrive_alice"]
    );

    s.set_rule_enabled_row(&RuleId::new("both_dev").unwrap(), false).unwrap();
    assert_eq!(
        ids(s.list_enabled_rules(TransitionKind::Leave, &RuleScope::Device(a)).unwrap()),
        vec!["leave_dev"]
    );
    assert_eq!(
        ids(s.list_enabled_rules(TransitionKind::Leave, &RuleScope::All).unwrap()),
        vec!["any"]
    );
}

#[test]
fn at_store_db_06_rule_rows_enforce_keys() {
    let s = MemoryPresenceStore::new_in_memory();
    let r = rule("r1", RuleScope::All, RuleTrigger::Both);
    s.insert_rule_row(r.clone()).unwrap();
    assert!(matches!(s.insert_rule_row(r), Err(StorageError::DuplicateKey { .. })));

    let orphan = rule("r2", RuleScope::Person(person_id("nobody")), RuleTrigger::Both);
    assert!(matches!(
        s.insert_rule_row(orphan),
        Err(StorageError::ForeignKeyViolation { .. })
    ));

    let mut blank = rule("r3", RuleScope::All, RuleTrigger::Both);
    blank.webhook_url = String::new();
    assert!(matches!(s.insert_rule_row(blank), Err(StorageError::ContractViolation(_))));

    s.delete_rule_row(&RuleId::new("r1").unwrap()).unwrap();
    assert!(s.rule_rows().unwrap().is_empty());
    assert!(matches!(
        s.delete_rule_row(&RuleId::new("r1").unwrap()),
        Err(StorageError::NotFound { .. })
    ));
}

#[test]
fn at_store_db_07_presence_log_newest_first() {
    let s = MemoryPresenceStore::new_in_memory();
    let a = addr("AA:BB:CC:11:22:33");
    let b = addr("00:11:22:33:44:55");
    for (i, (address, kind)) in [
        (&a, TransitionKind::Arrive),
        (&b, TransitionKind::Arrive),
        (&a, TransitionKind::Leave),
    ]
    .into_iter()
    .enumerate()
    {
        s.append_presence_log(&PresenceTransition {
            device_address: address.clone(),
            kind,
            at: t0() + Duration::minutes(i as i64),
        })
        .unwrap();
    }

    let all = s.presence_history(None, 10).unwrap();
    assert_eq!(all.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![3, 2, 1]);

    let only_a = s.presence_history(Some(&a), 10).unwrap();
    assert_eq!(only_a.len(), 2);
    assert_eq!(only_a[0].kind, TransitionKind::Leave);

    assert_eq!(s.presence_history(None, 1).unwrap().len(), 1);
}

#[test]
fn at_store_db_08_delete_person_drops_device_links() {
    let s = MemoryPresenceStore::new_in_memory();
    let mut alice = Person::v1(person_id("alice"), "Alice").unwrap();
    alice.device_addresses.insert(addr("AA:BB:CC:11:22:33"));
    s.insert_person_row(alice).unwrap();
    s.upsert_device(&obs("AA:BB:CC:11:22:33", t0(), None, None)).unwrap();

    let scoped = rule("alice_home", RuleScope::Person(person_id("alice")), RuleTrigger::Arrive);
    s.insert_rule_row(scoped).unwrap();
    assert!(matches!(
        s.delete_person_row(&person_id("alice")),
        Err(StorageError::Conflict { table: "alert_rules", .. })
    ));
    assert!(s.person_row(&person_id("alice")).unwrap().is_some());

    s.delete_rule_row(&RuleId::new("alice_home").unwrap()).unwrap();
    assert!(s.delete_person_row(&person_id("alice")).unwrap());
    assert!(!s.delete_person_row(&person_id("alice")).unwrap());
    assert!(s.list_persons().unwrap().is_empty());
    assert!(s.resolve_person_for_device(&addr("AA:BB:CC:11:22:33")).unwrap().is_none());
    let d = s.get_device(&addr("AA:BB:CC:11:22:33")).unwrap().unwrap();
    assert_eq!(d.associated_person, None);

    // The freed device can be claimed by someone else.
    s.insert_person_row(Person::v1(person_id("bob"), "Bob").unwrap()).unwrap();
    s.assign_device_row(&person_id("bob"), &addr("AA:BB:CC:11:22:33")).unwrap();
}

#[test]
fn at_store_db_09_update_rule_replaces_row() {
    let s = MemoryPresenceStore::new_in_memory();
    s.insert_rule_row(rule("r1", RuleScope::All, RuleTrigger::Both)).unwrap();

    let mut changed = rule("r1", RuleScope::Device(addr("AA:BB:CC:11:22:33")), RuleTrigger::Leave);
    changed.webhook_url = "https://hooks.example.com/other".to_string();
    s.update_rule_row(changed.clone()).unwrap();
    assert_eq!(s.get_rule(&RuleId::new("r1").unwrap()).unwrap(), Some(changed));

    let missing = rule("r9", RuleScope::All, RuleTrigger::Both);
    assert!(matches!(s.update_rule_row(missing), Err(StorageError::NotFound { .. })));
    let orphan = rule("r1", RuleScope::Person(person_id("nobody")), RuleTrigger::Both);
    assert!(matches!(
        s.update_rule_row(orphan),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}
