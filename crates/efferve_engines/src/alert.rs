#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use efferve_kernel_contracts::alert::{AlertRule, DispatchJob, RuleId, RuleScope, WebhookPayload};
use efferve_kernel_contracts::device::Device;
use efferve_kernel_contracts::persona::Person;
use efferve_kernel_contracts::presence::PresenceTransition;

use crate::outbound::{validate_webhook_url, OutboundViolation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRule {
    pub rule_id: RuleId,
    pub violation: OutboundViolation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMatchOutcome {
    pub jobs: Vec<DispatchJob>,
    pub rejected: Vec<RejectedRule>,
}

pub fn scope_matches(scope: &RuleScope, transition: &PresenceTransition, person: Option<&Person>) -> bool {
    match scope {
        RuleScope::All => true,
        RuleScope::Device(address) => *address == transition.device_address,
        RuleScope::Person(person_id) => person.map(|p| p.id == *person_id).unwrap_or(false),
    }
}

/// Builds one dispatch job per enabled, matching rule. Rules whose webhook
/// fails the static outbound checks are reported and never dispatched.
/// Duplicate rule ids in `candidates` fire once.
pub fn match_rules(
    transition: &PresenceTransition,
    device: Option<&Device>,
    person: Option<&Person>,
    candidates: &[AlertRule],
) -> RuleMatchOutcome {
    let mut out = RuleMatchOutcome::default();
    let mut seen = BTreeSet::new();
    for rule in candidates {
        if !seen.insert(rule.id.clone()) {
            continue;
        }
        if !rule.enabled
            || !rule.trigger.fires_on(transition.kind)
            || !scope_matches(&rule.scope, transition, person)
        {
            continue;
        }
        if let Err(violation) = validate_webhook_url(&rule.webhook_url) {
            out.rejected.push(RejectedRule {
                rule_id: rule.id.clone(),
                violation,
            });
            continue;
        }
        out.jobs.push(DispatchJob {
            rule_id: rule.id.clone(),
            webhook_url: rule.webhook_url.clone(),
            payload: WebhookPayload::for_transition(&rule.id, transition, device, person),
        });
    }
    out
}
