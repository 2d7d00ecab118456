#![forbid(unsafe_code)]

use std::fmt;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::common::{validate_text, validate_token};
use crate::device::Device;
use crate::observation::DeviceAddress;
use crate::persona::{Person, PersonId};
use crate::presence::{PresenceTransition, TransitionKind};
use crate::{ContractViolation, Validate};

pub const WEBHOOK_URL_MAX_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for RuleId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("rule_id", &self.0, 64)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a rule listens to. `All` matches every device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Device(DeviceAddress),
    Person(PersonId),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTrigger {
    Arrive,
    Leave,
    Both,
}

impl RuleTrigger {
    pub fn fires_on(self, kind: TransitionKind) -> bool {
        matches!(
            (self, kind),
            (RuleTrigger::Both, _)
                | (RuleTrigger::Arrive, TransitionKind::Arrive)
                | (RuleTrigger::Leave, TransitionKind::Leave)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: RuleId,
    #[serde(default)]
    pub name: Option<String>,
    pub scope: RuleScope,
    pub trigger: RuleTrigger,
    pub webhook_url: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Validate for AlertRule {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        if let Some(name) = &self.name {
            validate_text("alert_rule.name", name, 128)?;
        }
        if let RuleScope::Person(person_id) = &self.scope {
            person_id.validate()?;
        }
        validate_token("alert_rule.webhook_url", &self.webhook_url, WEBHOOK_URL_MAX_LEN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDevice {
    pub address: String,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPerson {
    pub id: String,
    pub name: String,
}

/// JSON body POSTed to a rule's webhook. Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: TransitionKind,
    pub device: WebhookDevice,
    pub person: Option<WebhookPerson>,
    pub timestamp: String,
    pub rule_id: String,
}

impl WebhookPayload {
    pub fn for_transition(
        rule_id: &RuleId,
        transition: &PresenceTransition,
        device: Option<&Device>,
        person: Option<&Person>,
    ) -> Self {
        Self {
            event: transition.kind,
            device: WebhookDevice {
                address: transition.device_address.as_str().to_string(),
                hostname: device.and_then(|d| d.hostname.clone()),
                vendor: device.and_then(|d| d.vendor.clone()),
            },
            person: person.map(|p| WebhookPerson {
                id: p.id.as_str().to_string(),
                name: p.name.clone(),
            }),
            timestamp: transition.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            rule_id: rule_id.as_str().to_string(),
        }
    }
}

/// One queued webhook call for one matched rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchJob {
    pub rule_id: RuleId,
    pub webhook_url: String,
    pub payload: WebhookPayload,
}
