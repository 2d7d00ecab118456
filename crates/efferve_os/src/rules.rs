#![forbid(unsafe_code)]

//! Rule management. Webhook URLs are vetted before a rule is stored or
//! re-enabled, so an unsafe target never becomes an active rule.

use efferve_engines::outbound::{validate_webhook_url, OutboundViolation};
use efferve_kernel_contracts::alert::{AlertRule, RuleId};
use efferve_storage::store::{MemoryPresenceStore, StorageError};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleValidationError {
    #[error("rule {rule_id}: webhook refused: {violation}")]
    Unsafe {
        rule_id: RuleId,
        violation: OutboundViolation,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn vet(rule: &AlertRule) -> Result<(), RuleValidationError> {
    validate_webhook_url(&rule.webhook_url).map_err(|violation| {
        warn!(
            rule_id = %rule.id,
            violation = violation.class(),
            "refusing alert rule with unsafe webhook"
        );
        RuleValidationError::Unsafe {
            rule_id: rule.id.clone(),
            violation,
        }
    })?;
    Ok(())
}

pub fn create_rule(store: &MemoryPresenceStore, rule: AlertRule) -> Result<AlertRule, RuleValidationError> {
    vet(&rule)?;
    store.insert_rule_row(rule.clone())?;
    info!(rule_id = %rule.id, trigger = ?rule.trigger, "alert rule created");
    Ok(rule)
}

/// Enabling re-checks the webhook; disabling never fails validation.
pub fn set_rule_enabled(
    store: &MemoryPresenceStore,
    rule_id: &RuleId,
    enabled: bool,
) -> Result<AlertRule, RuleValidationError> {
    if enabled {
        let current = store.rule_row(rule_id)?.ok_or_else(|| StorageError::NotFound {
            table: "alert_rules",
            key: rule_id.to_string(),
        })?;
        vet(&current)?;
    }
    Ok(store.set_rule_enabled_row(rule_id, enabled)?)
}

/// Replaces trigger, scope, name or webhook. A changed webhook, or any
/// update to an enabled rule, is vetted again before it is stored.
pub fn update_rule(store: &MemoryPresenceStore, rule: AlertRule) -> Result<AlertRule, RuleValidationError> {
    let current = store.rule_row(&rule.id)?.ok_or_else(|| StorageError::NotFound {
        table: "alert_rules",
        key: rule.id.to_string(),
    })?;
    if rule.enabled || rule.webhook_url != current.webhook_url {
        vet(&rule)?;
    }
    let updated = store.update_rule_row(rule)?;
    info!(rule_id = %updated.id, trigger = ?updated.trigger, "alert rule updated");
    Ok(updated)
}

pub fn delete_rule(store: &MemoryPresenceStore, rule_id: &RuleId) -> Result<AlertRule, RuleValidationError> {
    Ok(store.delete_rule_row(rule_id)?)
}

pub fn list_rules(store: &MemoryPresenceStore) -> Result<Vec<AlertRule>, RuleValidationError> {
    Ok(store.rule_rows()?)
}
