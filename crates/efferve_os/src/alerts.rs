#![forbid(unsafe_code)]

//! Alert rule engine: resolves the scopes a transition touches, fetches the
//! enabled rules for them and turns every match into a dispatch job.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use efferve_engines::alert::{match_rules, RejectedRule};
use efferve_engines::outbound::validate_webhook_url;
use efferve_kernel_contracts::alert::{DispatchJob, RuleId, RuleScope};
use efferve_kernel_contracts::presence::PresenceTransition;
use efferve_storage::repo::PresenceRepo;
use efferve_storage::store::StorageError;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::dispatcher::WebhookDispatcher;

/// A rule refused for dispatch because its webhook failed outbound checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisabledRule {
    pub rule_id: String,
    pub violation_class: &'static str,
    pub reason: String,
}

pub struct AlertRuleEngine {
    repo: Arc<dyn PresenceRepo>,
    disabled: Mutex<BTreeMap<RuleId, DisabledRule>>,
}

impl AlertRuleEngine {
    pub fn new(repo: Arc<dyn PresenceRepo>) -> Self {
        Self {
            repo,
            disabled: Mutex::new(BTreeMap::new()),
        }
    }

    /// Store failures propagate; the transition produces no jobs then.
    pub fn evaluate(&self, transition: &PresenceTransition) -> Result<Vec<DispatchJob>, StorageError> {
        self.prune_disabled();
        let address = &transition.device_address;
        let device = self.repo.get_device(address)?;
        let person = self.repo.resolve_person_for_device(address)?;

        let mut candidates = self
            .repo
            .list_enabled_rules(transition.kind, &RuleScope::Device(address.clone()))?;
        if let Some(p) = &person {
            candidates.extend(
                self.repo
                    .list_enabled_rules(transition.kind, &RuleScope::Person(p.id.clone()))?,
            );
        }
        candidates.extend(self.repo.list_enabled_rules(transition.kind, &RuleScope::All)?);

        let outcome = match_rules(transition, device.as_ref(), person.as_ref(), &candidates);
        for rejected in outcome.rejected {
            self.record_rejection(rejected);
        }
        Ok(outcome.jobs)
    }

    fn record_rejection(&self, rejected: RejectedRule) {
        warn!(
            rule_id = %rejected.rule_id,
            violation = rejected.violation.class(),
            reason = %rejected.violation,
            "rule webhook failed outbound validation; not dispatching"
        );
        if let Ok(mut disabled) = self.disabled.lock() {
            disabled.insert(
                rejected.rule_id.clone(),
                DisabledRule {
                    rule_id: rejected.rule_id.to_string(),
                    violation_class: rejected.violation.class(),
                    reason: rejected.violation.to_string(),
                },
            );
        }
    }

    /// Drops entries whose rule was deleted, disabled, or now carries a
    /// webhook that passes validation. Entries survive store errors.
    fn prune_disabled(&self) {
        let Ok(mut disabled) = self.disabled.lock() else {
            return;
        };
        disabled.retain(|rule_id, _| match self.repo.get_rule(rule_id) {
            Ok(Some(rule)) => rule.enabled && validate_webhook_url(&rule.webhook_url).is_err(),
            Ok(None) => false,
            Err(_) => true,
        });
    }

    pub fn disabled_rules(&self) -> Vec<DisabledRule> {
        self.prune_disabled();
        self.disabled
            .lock()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Consumes transitions until the channel closes, queueing every job on
    /// the dispatcher. Queueing waits while the dispatcher queue is full.
    pub async fn run(
        self: Arc<Self>,
        mut transitions: mpsc::Receiver<PresenceTransition>,
        dispatcher: Arc<WebhookDispatcher>,
    ) {
        while let Some(transition) = transitions.recv().await {
            let jobs = match self.evaluate(&transition) {
                Ok(jobs) => jobs,
                Err(err) => {
                    error!(
                        address = %transition.device_address,
                        event = transition.kind.as_str(),
                        error = %err,
                        "store error while matching alert rules"
                    );
                    continue;
                }
            };
            for job in jobs {
                if dispatcher.submit(job).await.is_err() {
                    return;
                }
            }
        }
    }
}
