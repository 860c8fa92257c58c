//! Core types for the tillwatch audit pipeline
//!
//! All types use camelCase JSON serialization for wire compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kind of data mutation an audit event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// An immutable record of a single data mutation
///
/// Created once by whatever collaborator performs the mutation, then never
/// changed — the append-only log is the prerequisite for trustworthy
/// auditing. `old_values`/`new_values` are free-form JSON snapshots of the
/// affected record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event identifier (aud-<uuid>)
    pub id: String,

    /// Table the mutation touched
    pub table_name: String,

    /// Primary key of the mutated record
    pub record_id: String,

    /// What kind of mutation this was
    pub operation: Operation,

    /// Snapshot of the record before the mutation, if captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_values: Option<Value>,

    /// Snapshot of the record after the mutation, if captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_values: Option<Value>,

    /// Id of the user who performed the mutation
    pub user_id: String,

    /// Email of the user who performed the mutation
    pub user_email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Session the mutation was performed under, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// When the mutation happened
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create a new event with auto-generated id and current timestamp
    pub fn new(
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        operation: Operation,
        user_id: impl Into<String>,
        user_email: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("aud-{}", uuid::Uuid::new_v4()),
            table_name: table_name.into(),
            record_id: record_id.into(),
            operation,
            old_values: None,
            new_values: None,
            user_id: user_id.into(),
            user_email: user_email.into(),
            ip_address: None,
            user_agent: None,
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the pre-mutation snapshot
    pub fn with_old_values(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    /// Attach the post-mutation snapshot
    pub fn with_new_values(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn with_session_id(mut self, session: impl Into<String>) -> Self {
        self.session_id = Some(session.into());
        self
    }

    /// Override the timestamp (backfill, tests)
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = at;
        self
    }
}

/// Fixed taxonomy of things a rule can watch for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    SuspiciousActivity,
    FailedLogin,
    UnusualPattern,
    DataBreach,
    PrivilegeEscalation,
    BulkOperation,
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuleType::SuspiciousActivity => "suspicious_activity",
            RuleType::FailedLogin => "failed_login",
            RuleType::UnusualPattern => "unusual_pattern",
            RuleType::DataBreach => "data_breach",
            RuleType::PrivilegeEscalation => "privilege_escalation",
            RuleType::BulkOperation => "bulk_operation",
        };
        write!(f, "{}", s)
    }
}

/// Alert severity, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Notification channel a rule can dispatch to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// In-process alert feed consumed by the UI
    Inline,
    Email,
    Webhook,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelKind::Inline => "inline",
            ChannelKind::Email => "email",
            ChannelKind::Webhook => "webhook",
        };
        write!(f, "{}", s)
    }
}

/// Conditions a rule evaluates against the recent-event window
///
/// All fields are optional; absent fields don't constrain matching.
/// `threshold` and `time_window_minutes` must be strictly positive when
/// present (enforced on rule create/update).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    /// Trailing window, in minutes, over which matching events are counted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window_minutes: Option<i64>,

    /// Minimum matching-event count that fires the rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,

    /// Substring matched against the serialized old/new value snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Only events touching one of these tables match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<String>>,

    /// Only events with one of these operations match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,

    /// Only events by users holding one of these roles match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_roles: Option<Vec<String>>,

    /// Only events outside business hours match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_hours_only: Option<bool>,
}

/// A configured alerting rule, evaluated continuously while enabled
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    /// Unique rule identifier (rule-<uuid>, or a well-known id for defaults)
    pub id: String,

    pub name: String,

    #[serde(rename = "type")]
    pub rule_type: RuleType,

    pub enabled: bool,

    pub conditions: RuleConditions,

    /// Severity stamped on alerts this rule produces
    pub severity: Severity,

    /// Channels notified when this rule fires
    #[serde(default)]
    pub notification_channels: Vec<ChannelKind>,
}

impl AlertRule {
    /// Create an enabled rule with auto-generated id and empty conditions
    pub fn new(name: impl Into<String>, rule_type: RuleType, severity: Severity) -> Self {
        Self {
            id: format!("rule-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            rule_type,
            enabled: true,
            conditions: RuleConditions::default(),
            severity,
            notification_channels: vec![ChannelKind::Inline],
        }
    }

    pub fn with_conditions(mut self, conditions: RuleConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_channels(mut self, channels: Vec<ChannelKind>) -> Self {
        self.notification_channels = channels;
        self
    }

    /// Check the positivity invariants on threshold and window
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::error::AuditError::Config(
                "Rule name cannot be empty".to_string(),
            ));
        }
        if let Some(t) = self.conditions.threshold {
            if t == 0 {
                return Err(crate::error::AuditError::Config(format!(
                    "Rule '{}': threshold must be >= 1",
                    self.name
                )));
            }
        }
        if let Some(w) = self.conditions.time_window_minutes {
            if w <= 0 {
                return Err(crate::error::AuditError::Config(format!(
                    "Rule '{}': timeWindowMinutes must be >= 1",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Partial update for an existing rule — absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub rule_type: Option<RuleType>,
    pub enabled: Option<bool>,
    pub conditions: Option<RuleConditions>,
    pub severity: Option<Severity>,
    pub notification_channels: Option<Vec<ChannelKind>>,
}

/// A derived, acknowledgeable notification that a rule's condition was met
///
/// Mutated only by acknowledgment; removed only by explicit dismissal.
/// `metadata` always carries the originating rule id under `ruleId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAlert {
    /// Unique alert identifier (alert-<uuid>)
    pub id: String,

    #[serde(rename = "type")]
    pub alert_type: RuleType,

    pub severity: Severity,

    pub title: String,

    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    pub timestamp: DateTime<Utc>,

    pub acknowledged: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,

    /// Free-form context: `ruleId`, matched condition values, `isTest`
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SecurityAlert {
    /// Create an unacknowledged alert derived from a rule
    pub fn from_rule(
        rule: &AlertRule,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let mut metadata = Map::new();
        metadata.insert("ruleId".to_string(), Value::String(rule.id.clone()));
        Self {
            id: format!("alert-{}", uuid::Uuid::new_v4()),
            alert_type: rule.rule_type,
            severity: rule.severity,
            title: title.into(),
            description: description.into(),
            user_id: None,
            user_email: None,
            table_name: None,
            operation: None,
            ip_address: None,
            timestamp: Utc::now(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            metadata,
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Id of the rule (or heuristic) that produced this alert
    pub fn rule_id(&self) -> Option<&str> {
        self.metadata.get("ruleId").and_then(Value::as_str)
    }

    /// Whether this is a synthetic alert from a rule test run
    pub fn is_test(&self) -> bool {
        self.metadata
            .get("isTest")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Caller identity for the admin-gated API surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub email: String,
    pub admin: bool,
}

impl Actor {
    pub fn admin(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            admin: true,
        }
    }

    pub fn user(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            admin: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = AuditEvent::new("products", "p-42", Operation::Update, "u-1", "ana@shop.test")
            .with_new_values(serde_json::json!({"price": 19.99}))
            .with_ip_address("10.0.0.8");

        assert!(event.id.starts_with("aud-"));
        assert_eq!(event.table_name, "products");
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.new_values.as_ref().unwrap()["price"], 19.99);
        assert!(event.old_values.is_none());
        assert_eq!(event.ip_address.as_deref(), Some("10.0.0.8"));
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = AuditEvent::new("sales", "s-9", Operation::Insert, "u-2", "bo@shop.test")
            .with_session_id("sess-77");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"tableName\":\"sales\""));
        assert!(json.contains("\"operation\":\"INSERT\""));
        assert!(json.contains("\"sessionId\":\"sess-77\""));
        // Absent optionals stay off the wire
        assert!(!json.contains("oldValues"));
        assert!(!json.contains("userAgent"));

        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, event.id);
        assert_eq!(parsed.operation, Operation::Insert);
        assert_eq!(parsed.timestamp, event.timestamp);
    }

    #[test]
    fn test_operation_display_matches_wire_form() {
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            let wire = serde_json::to_string(&op).unwrap();
            assert_eq!(wire, format!("\"{}\"", op));
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_rule_validation() {
        let mut rule = AlertRule::new("burst", RuleType::FailedLogin, Severity::High);
        rule.conditions.threshold = Some(5);
        rule.conditions.time_window_minutes = Some(15);
        assert!(rule.validate().is_ok());

        rule.conditions.threshold = Some(0);
        assert!(rule.validate().is_err());

        rule.conditions.threshold = Some(5);
        rule.conditions.time_window_minutes = Some(0);
        assert!(rule.validate().is_err());

        rule.name = "  ".to_string();
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_rule_serialization_uses_type_key() {
        let rule = AlertRule::new("bulk", RuleType::BulkOperation, Severity::Critical);
        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains("\"type\":\"bulk_operation\""));
        assert!(json.contains("\"severity\":\"critical\""));
        assert!(json.contains("\"notificationChannels\":[\"inline\"]"));

        let parsed: AlertRule = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.rule_type, RuleType::BulkOperation);
        assert!(parsed.enabled);
    }

    #[test]
    fn test_conditions_skip_absent_fields() {
        let conditions = RuleConditions {
            threshold: Some(10),
            time_window_minutes: Some(5),
            ..Default::default()
        };
        let json = serde_json::to_string(&conditions).unwrap();
        assert!(json.contains("\"threshold\":10"));
        assert!(!json.contains("pattern"));
        assert!(!json.contains("userRoles"));
        assert!(!json.contains("afterHoursOnly"));
    }

    #[test]
    fn test_alert_from_rule_carries_rule_id() {
        let rule = AlertRule::new("touch", RuleType::PrivilegeEscalation, Severity::Critical);
        let alert = SecurityAlert::from_rule(&rule, "Privilege change", "role table touched");

        assert!(alert.id.starts_with("alert-"));
        assert_eq!(alert.rule_id(), Some(rule.id.as_str()));
        assert_eq!(alert.severity, Severity::Critical);
        assert!(!alert.acknowledged);
        assert!(alert.acknowledged_by.is_none());
        assert!(!alert.is_test());
    }

    #[test]
    fn test_alert_test_flag() {
        let rule = AlertRule::new("t", RuleType::FailedLogin, Severity::High);
        let alert = SecurityAlert::from_rule(&rule, "t", "d")
            .with_metadata("isTest", Value::Bool(true));
        assert!(alert.is_test());
    }

    #[test]
    fn test_rule_patch_deserializes_partial_json() {
        let patch: RulePatch =
            serde_json::from_str(r#"{"enabled": false, "severity": "low"}"#).unwrap();
        assert_eq!(patch.enabled, Some(false));
        assert_eq!(patch.severity, Some(Severity::Low));
        assert!(patch.name.is_none());
        assert!(patch.conditions.is_none());
    }
}
