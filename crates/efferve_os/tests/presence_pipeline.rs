#![forbid(unsafe_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use efferve_engines::outbound::StaticResolver;
use efferve_engines::presence::PresenceDetectorConfig;
use efferve_kernel_contracts::alert::{AlertRule, RuleId, RuleScope, RuleTrigger};
use efferve_kernel_contracts::device::Classification;
use efferve_kernel_contracts::observation::{CanonicalObservation, DeviceAddress, SourceId};
use efferve_kernel_contracts::persona::{Person, PersonId};
use efferve_kernel_contracts::presence::TransitionKind;
use efferve_os::clock::Clock;
use efferve_os::config::EfferveConfig;
use efferve_os::dispatcher::{RecordingSender, WebhookSenderRuntime};
use efferve_os::pipeline::start_pipeline;
use efferve_os::rules::{create_rule, RuleValidationError};
use efferve_os::source::{ScriptEnd, ScriptHandle, ScriptedRun, SourceSpec, SyntheticConfig};
use efferve_storage::store::MemoryPresenceStore;

const HOOK_HOST: &str = "hooks.example.com";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 12, 7, 0, 0).unwrap()
}

fn phone() -> DeviceAddress {
    DeviceAddress::parse("AA:BB:CC:11:22:33").unwrap()
}

fn obs(address: &DeviceAddress, at: DateTime<Utc>) -> CanonicalObservation {
    CanonicalObservation::v1(
        address.clone(),
        at,
        Some(-42),
        Some("HomeNetwork".to_string()),
        Some("Home-iPhone".to_string()),
        Some("Apple".to_string()),
        SourceId::new("synthetic:test").unwrap(),
    )
    .unwrap()
}

fn rule(id: &str, scope: RuleScope, trigger: RuleTrigger, url: &str) -> AlertRule {
    AlertRule {
        id: RuleId::new(id).unwrap(),
        name: None,
        scope,
        trigger,
        webhook_url: url.to_string(),
        enabled: true,
    }
}

fn recording_sender() -> RecordingSender {
    let public: IpAddr = "93.184.216.34".parse().unwrap();
    RecordingSender::new(Arc::new(StaticResolver::new().with_host(HOOK_HOST, &[public])))
}

fn config_with_script(script: ScriptHandle, grace: Duration) -> EfferveConfig {
    let mut cfg = EfferveConfig::mvp_v1();
    cfg.sources = vec![SourceSpec::Synthetic(SyntheticConfig::scripted(
        SourceId::new("synthetic:test").unwrap(),
        script,
    ))];
    cfg.detector = PresenceDetectorConfig::with_grace(grace);
    cfg
}

fn today_then_idle() -> ScriptHandle {
    ScriptHandle::new([ScriptedRun {
        observations: vec![obs(&phone(), t0())],
        then: ScriptEnd::Idle,
    }])
}

/// Polls `cond` once per (paused) second.
async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..900 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    cond()
}

fn has_event(store: &MemoryPresenceStore, kind: TransitionKind) -> bool {
    store
        .presence_log_rows(Some(&phone()), 16)
        .map(|rows| rows.iter().any(|r| r.kind == kind))
        .unwrap_or(false)
}

#[tokio::test(start_paused = true)]
async fn at_pipeline_01_resident_leave_fires_exactly_one_webhook() {
    let store = Arc::new(MemoryPresenceStore::new_in_memory());
    for days_ago in 1..=11 {
        store
            .upsert_device_row(&obs(&phone(), t0() - chrono::Duration::days(days_ago)))
            .unwrap();
    }
    store
        .insert_rule_row(rule(
            "phone_leaves",
            RuleScope::Device(phone()),
            RuleTrigger::Leave,
            "https://hooks.example.com/presence",
        ))
        .unwrap();

    let clock = Clock::manual(t0());
    let rec = recording_sender();
    let handle = start_pipeline(
        &config_with_script(today_then_idle(), Duration::from_secs(15 * 60)),
        store.clone(),
        WebhookSenderRuntime::Recording(rec.clone()),
        clock.clone(),
    )
    .unwrap();

    assert!(wait_until(|| has_event(&store, TransitionKind::Arrive)).await);
    assert!(rec.deliveries().is_empty());

    clock.advance(chrono::Duration::minutes(20));
    assert!(wait_until(|| !rec.deliveries().is_empty()).await);
    // Further sweeps must not repeat the leave.
    tokio::time::sleep(Duration::from_secs(3_600)).await;

    let deliveries = rec.deliveries();
    assert_eq!(deliveries.len(), 1);
    let body: serde_json::Value = serde_json::from_str(&deliveries[0].body).unwrap();
    assert_eq!(body["event"], "leave");
    assert_eq!(body["device"]["address"], "AA:BB:CC:11:22:33");
    assert_eq!(body["device"]["hostname"], "Home-iPhone");
    assert_eq!(body["person"], serde_json::Value::Null);
    assert_eq!(body["timestamp"], "2026-04-12T07:20:00.000Z");
    assert_eq!(body["rule_id"], "phone_leaves");

    let device = handle.registry().get(&phone()).unwrap().unwrap();
    assert_eq!(device.classification, Classification::Resident);

    let status = handle.status();
    assert_eq!(status.presence.arrivals, 1);
    assert_eq!(status.presence.departures, 1);
    assert_eq!(status.presence.present_devices, 0);

    let summary = handle.shutdown().await;
    assert_eq!(summary.aborted_sources, 0);
    assert_eq!(summary.dispatch.delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn at_pipeline_02_metadata_webhook_never_dispatched() {
    let store = Arc::new(MemoryPresenceStore::new_in_memory());
    let metadata = rule("metadata", RuleScope::All, RuleTrigger::Both, "http://169.254.169.254/");
    assert!(matches!(
        create_rule(&store, metadata.clone()),
        Err(RuleValidationError::Unsafe { .. })
    ));
    // Same rule smuggled straight into the store still never fires.
    store.insert_rule_row(metadata).unwrap();

    let clock = Clock::manual(t0());
    let rec = recording_sender();
    let handle = start_pipeline(
        &config_with_script(today_then_idle(), Duration::from_secs(15 * 60)),
        store.clone(),
        WebhookSenderRuntime::Recording(rec.clone()),
        clock.clone(),
    )
    .unwrap();

    assert!(wait_until(|| !handle.status().disabled_rules.is_empty()).await);
    clock.advance(chrono::Duration::minutes(20));
    assert!(wait_until(|| has_event(&store, TransitionKind::Leave)).await);
    tokio::time::sleep(Duration::from_secs(60)).await;

    let status = handle.status();
    assert_eq!(status.disabled_rules.len(), 1);
    assert_eq!(status.disabled_rules[0].rule_id, "metadata");
    assert_eq!(status.disabled_rules[0].violation_class, "forbidden_address");
    assert_eq!(status.dispatcher.attempts, 0);
    assert_eq!(status.dispatcher.enqueued, 0);
    assert!(rec.deliveries().is_empty());

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn at_pipeline_03_person_scoped_arrive_carries_person() {
    let store = Arc::new(MemoryPresenceStore::new_in_memory());
    store
        .insert_person_row(Person::v1(PersonId::new("alice").unwrap(), "Alice").unwrap())
        .unwrap();
    store
        .assign_device_row(&PersonId::new("alice").unwrap(), &phone())
        .unwrap();
    create_rule(
        &store,
        rule(
            "alice_home",
            RuleScope::Person(PersonId::new("alice").unwrap()),
            RuleTrigger::Arrive,
            "https://hooks.example.com/alice",
        ),
    )
    .unwrap();
    create_rule(
        &store,
        rule("anyone_leaves", RuleScope::All, RuleTrigger::Leave, "https://hooks.example.com/all"),
    )
    .unwrap();

    let rec = recording_sender();
    let handle = start_pipeline(
        &config_with_script(today_then_idle(), Duration::from_secs(15 * 60)),
        store.clone(),
        WebhookSenderRuntime::Recording(rec.clone()),
        Clock::manual(t0()),
    )
    .unwrap();

    assert!(wait_until(|| !rec.deliveries().is_empty()).await);
    tokio::time::sleep(Duration::from_secs(60)).await;
    let deliveries = rec.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].url, "https://hooks.example.com/alice");
    let body: serde_json::Value = serde_json::from_str(&deliveries[0].body).unwrap();
    assert_eq!(body["event"], "arrive");
    assert_eq!(body["person"]["id"], "alice");
    assert_eq!(body["person"]["name"], "Alice");

    let history = store.presence_log_rows(Some(&phone()), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].person_id, Some(PersonId::new("alice").unwrap()));

    let home = handle.present_persons().unwrap();
    assert_eq!(home.len(), 1);
    assert_eq!(home[0].person_id, "alice");
    assert!(home[0].is_present);
    assert_eq!(home[0].present_devices, vec![phone()]);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn at_pipeline_04_sightings_within_grace_do_not_flap() {
    let store = Arc::new(MemoryPresenceStore::new_in_memory());
    create_rule(
        &store,
        rule("both", RuleScope::Device(phone()), RuleTrigger::Both, "https://hooks.example.com/both"),
    )
    .unwrap();
    let script = ScriptHandle::new([ScriptedRun {
        observations: (0..5)
            .map(|m| obs(&phone(), t0() - chrono::Duration::minutes(m)))
            .collect(),
        then: ScriptEnd::Idle,
    }]);

    let rec = recording_sender();
    let handle = start_pipeline(
        &config_with_script(script, Duration::from_secs(15 * 60)),
        store.clone(),
        WebhookSenderRuntime::Recording(rec.clone()),
        Clock::manual(t0()),
    )
    .unwrap();

    assert!(wait_until(|| !rec.deliveries().is_empty()).await);
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert_eq!(rec.deliveries().len(), 1);
    assert_eq!(store.presence_log_rows(None, 10).unwrap().len(), 1);

    handle.shutdown().await;
}
