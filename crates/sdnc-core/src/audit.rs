//! Structured audit logging for controller state changes.
//!
//! Every administrative mutation of controller state (flow rules, QoS
//! policies, routes, switch lifecycle) produces an [`AuditRecord`] emitted on
//! the `audit` tracing target. Records serialize to a single JSON object so a
//! log shipper can forward them unchanged.
//!
//! | Outcome | Level |
//! |---------|-------|
//! | Success | info |
//! | InProgress | debug |
//! | Failure / Denied | warn |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// A flow rule, policy or route was created
    ResourceCreate,
    /// A flow rule was replaced in place
    ResourceModify,
    /// A flow rule, policy or route was deleted (explicitly or by expiry)
    ResourceDelete,
    /// Controller configuration was loaded or changed
    ConfigurationChange,
    /// Switch connect, disconnect and reconciliation
    SwitchLifecycle,
    /// Admission policy changes
    SecurityPolicy,
    /// Transport failures and inconsistencies
    ErrorCondition,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCategory::ResourceCreate => write!(f, "RESOURCE_CREATE"),
            AuditCategory::ResourceModify => write!(f, "RESOURCE_MODIFY"),
            AuditCategory::ResourceDelete => write!(f, "RESOURCE_DELETE"),
            AuditCategory::ConfigurationChange => write!(f, "CONFIGURATION_CHANGE"),
            AuditCategory::SwitchLifecycle => write!(f, "SWITCH_LIFECYCLE"),
            AuditCategory::SecurityPolicy => write!(f, "SECURITY_POLICY"),
            AuditCategory::ErrorCondition => write!(f, "ERROR_CONDITION"),
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
    Denied,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
            AuditOutcome::InProgress => write!(f, "in_progress"),
            AuditOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// One audit trail entry.
///
/// Built with the `with_*` methods and handed to [`audit_log!`](crate::audit_log).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// UTC time the record was created
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Component that generated the event (e.g. "FlowRuleManager")
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,

    /// Identifier of the affected object (rule handle, policy handle, switch id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    /// Kind of the affected object (e.g. "flow_rule", "qos_policy", "switch")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Creates a record stamped with the current time. The outcome starts as
    /// `InProgress` until set.
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Sets the error message and marks the outcome as `Failure`.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Emits an [`AuditRecord`] on the `audit` target at a level derived from its
/// outcome.
///
/// ```ignore
/// audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "FlowRuleManager", "add_rule")
///     .with_outcome(AuditOutcome::Success)
///     .with_object_id(handle.to_string())
///     .with_object_type("flow_rule"));
/// ```
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        let record = $record;
        match record.outcome {
            $crate::audit::AuditOutcome::Success => {
                tracing::info!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::InProgress => {
                tracing::debug!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::Failure | $crate::audit::AuditOutcome::Denied => {
                tracing::warn!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    error = record.error.as_deref().unwrap_or(""),
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
        }
    };
}

/// Error returned when a global tracing subscriber is already installed.
pub type LoggingInitError = tracing_subscriber::util::TryInitError;

/// Installs a JSON tracing subscriber. `RUST_LOG` overrides `log_level`.
///
/// Fails if a global subscriber is already set.
pub fn try_init_logging(log_level: &str) -> Result<(), LoggingInitError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .try_init()
}

/// Installs a human-readable tracing subscriber for development.
pub fn try_init_logging_pretty(log_level: &str) -> Result<(), LoggingInitError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .try_init()
}

/// Like [`try_init_logging`], ignoring an already-installed subscriber.
pub fn init_logging(log_level: &str) {
    if try_init_logging(log_level).is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Like [`try_init_logging_pretty`], ignoring an already-installed subscriber.
pub fn init_logging_pretty(log_level: &str) {
    if try_init_logging_pretty(log_level).is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_record_creation() {
        let record = AuditRecord::new(AuditCategory::ResourceCreate, "FlowRuleManager", "add_rule")
            .with_outcome(AuditOutcome::Success)
            .with_object_id("rule-7")
            .with_object_type("flow_rule");

        assert_eq!(record.category, AuditCategory::ResourceCreate);
        assert_eq!(record.source, "FlowRuleManager");
        assert_eq!(record.action, "add_rule");
        assert_eq!(record.outcome, AuditOutcome::Success);
        assert_eq!(record.object_id, Some("rule-7".to_string()));
        assert_eq!(record.object_type, Some("flow_rule".to_string()));
    }

    #[test]
    fn test_audit_record_with_error() {
        let record = AuditRecord::new(AuditCategory::ErrorCondition, "FlowRuleManager", "send")
            .with_error("transport timed out");

        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error.as_deref(), Some("transport timed out"));
    }

    #[test]
    fn test_audit_record_json_omits_empty_fields() {
        let record = AuditRecord::new(AuditCategory::SwitchLifecycle, "Controller", "reconcile")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({ "resent": 3 }));

        let json = record.to_json();
        assert!(json.contains("SWITCH_LIFECYCLE"));
        assert!(json.contains("\"resent\":3"));
        assert!(!json.contains("object_id"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_display() {
        assert_eq!(AuditCategory::ResourceDelete.to_string(), "RESOURCE_DELETE");
        assert_eq!(AuditOutcome::Denied.to_string(), "denied");
        assert_eq!(AuditOutcome::InProgress.to_string(), "in_progress");
    }
}
