//! Rule evaluation engine
//!
//! Holds the rule set and runs evaluation passes: for every enabled rule,
//! count the events inside the rule's trailing window that pass its
//! conditions, and raise an alert when the count reaches the threshold.
//! Rules evaluate concurrently in a bounded pool; a failing rule is logged
//! and skipped for the tick, never aborting the others.

use crate::alerts::AlertManager;
use crate::config::PipelineConfig;
use crate::error::{AuditError, Result};
use crate::store::{EventFilter, EventStore};
use crate::types::{
    AlertRule, AuditEvent, ChannelKind, RuleConditions, RulePatch, RuleType, SecurityAlert,
    Severity,
};
use chrono::{DateTime, Duration, Timelike, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Window applied when a rule omits `timeWindowMinutes`
const DEFAULT_WINDOW_MINUTES: i64 = 60;

/// Threshold applied when a rule omits `threshold`
const DEFAULT_THRESHOLD: u64 = 1;

/// Resolves the roles a user holds, for rules with `userRoles` conditions
///
/// Audit events don't carry roles, so the engine asks this collaborator.
/// Without a directory configured, role conditions are skipped.
pub trait RoleDirectory: Send + Sync {
    fn roles_of(&self, user_id: &str) -> Vec<String>;
}

/// In-memory role directory
#[derive(Default)]
pub struct MemoryRoleDirectory {
    roles: HashMap<String, Vec<String>>,
}

impl MemoryRoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, user_id: impl Into<String>, role: impl Into<String>) -> Self {
        self.roles
            .entry(user_id.into())
            .or_default()
            .push(role.into());
        self
    }
}

impl RoleDirectory for MemoryRoleDirectory {
    fn roles_of(&self, user_id: &str) -> Vec<String> {
        self.roles.get(user_id).cloned().unwrap_or_default()
    }
}

/// The default rule set registered at construction
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            id: "rule-default-failed-login".to_string(),
            name: "Failed login burst".to_string(),
            rule_type: RuleType::FailedLogin,
            enabled: true,
            conditions: RuleConditions {
                time_window_minutes: Some(15),
                threshold: Some(5),
                tables: Some(vec!["login_attempts".to_string()]),
                operations: Some(vec![crate::types::Operation::Insert]),
                ..Default::default()
            },
            severity: Severity::High,
            notification_channels: vec![ChannelKind::Inline, ChannelKind::Email],
        },
        AlertRule {
            id: "rule-default-bulk-delete".to_string(),
            name: "Bulk delete burst".to_string(),
            rule_type: RuleType::BulkOperation,
            enabled: true,
            conditions: RuleConditions {
                time_window_minutes: Some(5),
                threshold: Some(10),
                operations: Some(vec![crate::types::Operation::Delete]),
                ..Default::default()
            },
            severity: Severity::Critical,
            notification_channels: vec![ChannelKind::Inline, ChannelKind::Email],
        },
        AlertRule {
            id: "rule-default-privilege-escalation".to_string(),
            name: "Privilege escalation touch".to_string(),
            rule_type: RuleType::PrivilegeEscalation,
            enabled: true,
            conditions: RuleConditions {
                time_window_minutes: Some(60),
                threshold: Some(1),
                tables: Some(vec![
                    "user_roles".to_string(),
                    "permissions".to_string(),
                ]),
                ..Default::default()
            },
            severity: Severity::Critical,
            notification_channels: vec![
                ChannelKind::Inline,
                ChannelKind::Email,
                ChannelKind::Webhook,
            ],
        },
        AlertRule {
            id: "rule-default-after-hours".to_string(),
            name: "After-hours burst".to_string(),
            rule_type: RuleType::UnusualPattern,
            enabled: true,
            conditions: RuleConditions {
                time_window_minutes: Some(60),
                threshold: Some(20),
                after_hours_only: Some(true),
                ..Default::default()
            },
            severity: Severity::Medium,
            notification_channels: vec![ChannelKind::Inline],
        },
    ]
}

/// Evaluates the rule set against the recent-event window
pub struct RuleEngine {
    store: Arc<dyn EventStore>,
    alerts: Arc<AlertManager>,
    rules: RwLock<HashMap<String, AlertRule>>,
    roles: Option<Arc<dyn RoleDirectory>>,
    config: PipelineConfig,
}

impl RuleEngine {
    /// Create an engine pre-loaded with the default rule set
    pub fn new(
        store: Arc<dyn EventStore>,
        alerts: Arc<AlertManager>,
        config: PipelineConfig,
    ) -> Self {
        let rules = default_rules()
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        Self {
            store,
            alerts,
            rules: RwLock::new(rules),
            roles: None,
            config,
        }
    }

    pub fn with_role_directory(mut self, roles: Arc<dyn RoleDirectory>) -> Self {
        self.roles = Some(roles);
        self
    }

    // ── Rule CRUD ────────────────────────────────────────────────

    pub async fn create_rule(&self, rule: AlertRule) -> Result<AlertRule> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        rules.insert(rule.id.clone(), rule.clone());
        tracing::info!(rule = %rule.id, name = %rule.name, "Rule created");
        Ok(rule)
    }

    pub async fn update_rule(&self, rule_id: &str, patch: RulePatch) -> Result<AlertRule> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(rule_id)
            .ok_or_else(|| AuditError::NotFound(format!("Rule not found: {}", rule_id)))?;

        let mut updated = rule.clone();
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(rule_type) = patch.rule_type {
            updated.rule_type = rule_type;
        }
        if let Some(enabled) = patch.enabled {
            updated.enabled = enabled;
        }
        if let Some(conditions) = patch.conditions {
            updated.conditions = conditions;
        }
        if let Some(severity) = patch.severity {
            updated.severity = severity;
        }
        if let Some(channels) = patch.notification_channels {
            updated.notification_channels = channels;
        }
        updated.validate()?;

        *rule = updated.clone();
        tracing::info!(rule = %rule_id, "Rule updated");
        Ok(updated)
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        let mut rules = self.rules.write().await;
        rules
            .remove(rule_id)
            .ok_or_else(|| AuditError::NotFound(format!("Rule not found: {}", rule_id)))?;
        tracing::info!(rule = %rule_id, "Rule deleted");
        Ok(())
    }

    pub async fn get_rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.rules.read().await.get(rule_id).cloned()
    }

    /// All rules, sorted by name for stable listings
    pub async fn list_rules(&self) -> Vec<AlertRule> {
        let mut rules: Vec<AlertRule> = self.rules.read().await.values().cloned().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<AlertRule> {
        self.update_rule(
            rule_id,
            RulePatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    // ── Evaluation ───────────────────────────────────────────────

    /// Evaluate every enabled rule against its window, returning the
    /// alerts raised this pass
    ///
    /// Rules run concurrently up to the configured pool size. Evaluation
    /// failures are isolated per rule: logged, skipped for this tick.
    pub async fn evaluate_all(&self, now: DateTime<Utc>) -> Vec<SecurityAlert> {
        let enabled: Vec<AlertRule> = {
            let rules = self.rules.read().await;
            rules.values().filter(|r| r.enabled).cloned().collect()
        };

        let results = stream::iter(enabled)
            .map(|rule| async move {
                let rule_id = rule.id.clone();
                (rule_id, self.evaluate_rule(&rule, now).await)
            })
            .buffer_unordered(self.config.evaluation_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut raised = Vec::new();
        for (rule_id, result) in results {
            match result {
                Ok(Some(alert)) => raised.push(alert),
                Ok(None) => {}
                Err(e) => {
                    let err = AuditError::RuleEvaluation {
                        rule_id: rule_id.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(rule = %rule_id, error = %err, "Rule evaluation skipped");
                }
            }
        }
        raised
    }

    /// Evaluate one rule; raises (and returns) an alert when its
    /// conditions are satisfied and no open alert covers the window
    async fn evaluate_rule(
        &self,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> Result<Option<SecurityAlert>> {
        let window_start = window_start(rule, now);
        let matched = self.matching_events(rule, window_start, now).await?;
        let threshold = rule.conditions.threshold.unwrap_or(DEFAULT_THRESHOLD);

        if (matched.len() as u64) < threshold {
            return Ok(None);
        }

        let alert = build_alert(rule, &matched, window_start);
        self.alerts
            .raise(alert, window_start, &rule.notification_channels)
            .await
    }

    /// Dry-run a rule: evaluates the live window but never persists or
    /// notifies — the returned alert is synthetic, tagged `isTest`
    pub async fn test_rule(&self, rule: &AlertRule, now: DateTime<Utc>) -> Result<SecurityAlert> {
        rule.validate()?;
        let window_start = window_start(rule, now);
        let matched = self.matching_events(rule, window_start, now).await?;
        let threshold = rule.conditions.threshold.unwrap_or(DEFAULT_THRESHOLD);

        let alert = build_alert(rule, &matched, window_start)
            .with_metadata("isTest", Value::Bool(true))
            .with_metadata(
                "wouldFire",
                Value::Bool(matched.len() as u64 >= threshold),
            );
        Ok(alert)
    }

    /// Fetch the rule's window from the store and keep the events passing
    /// its conditions
    async fn matching_events(
        &self,
        rule: &AlertRule,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>> {
        let filter = EventFilter {
            start_date: Some(window_start),
            end_date: Some(now),
            // Single-table conditions push down to the store; multi-table
            // lists filter in-engine below
            table_name: rule.conditions.tables.as_ref().and_then(|t| {
                if t.len() == 1 {
                    Some(t[0].clone())
                } else {
                    None
                }
            }),
            ..Default::default()
        };

        let page = tokio::time::timeout(
            self.config.query_timeout(),
            self.store
                .query(&filter, self.config.max_window_events, 0),
        )
        .await
        .map_err(|_| {
            AuditError::Timeout(format!(
                "window query for rule '{}' exceeded {:?}",
                rule.id,
                self.config.query_timeout()
            ))
        })??;

        Ok(page
            .events
            .into_iter()
            .filter(|e| self.event_matches(rule, e))
            .collect())
    }

    fn event_matches(&self, rule: &AlertRule, event: &AuditEvent) -> bool {
        let conditions = &rule.conditions;

        if let Some(ref tables) = conditions.tables {
            if !tables.iter().any(|t| t == &event.table_name) {
                return false;
            }
        }
        if let Some(ref operations) = conditions.operations {
            if !operations.contains(&event.operation) {
                return false;
            }
        }
        if conditions.after_hours_only == Some(true)
            && !self.config.stats.is_after_hours(event.timestamp.hour())
        {
            return false;
        }
        if let Some(ref pattern) = conditions.pattern {
            let in_values = |v: &Option<Value>| {
                v.as_ref()
                    .map(|v| v.to_string().contains(pattern.as_str()))
                    .unwrap_or(false)
            };
            if !in_values(&event.new_values) && !in_values(&event.old_values) {
                return false;
            }
        }
        if let Some(ref wanted) = conditions.user_roles {
            match &self.roles {
                Some(directory) => {
                    let held = directory.roles_of(&event.user_id);
                    if !wanted.iter().any(|r| held.contains(r)) {
                        return false;
                    }
                }
                None => {
                    tracing::debug!(
                        rule = %rule.id,
                        "userRoles condition skipped: no role directory configured"
                    );
                }
            }
        }
        true
    }
}

fn window_start(rule: &AlertRule, now: DateTime<Utc>) -> DateTime<Utc> {
    let minutes = rule
        .conditions
        .time_window_minutes
        .unwrap_or(DEFAULT_WINDOW_MINUTES);
    now - Duration::minutes(minutes)
}

/// Build the alert for a fired rule, folding in whatever context the
/// matched events agree on
fn build_alert(
    rule: &AlertRule,
    matched: &[AuditEvent],
    window_start: DateTime<Utc>,
) -> SecurityAlert {
    let minutes = rule
        .conditions
        .time_window_minutes
        .unwrap_or(DEFAULT_WINDOW_MINUTES);
    let description = format!(
        "{} matching events in the last {} minute(s) (threshold {})",
        matched.len(),
        minutes,
        rule.conditions.threshold.unwrap_or(DEFAULT_THRESHOLD),
    );

    let mut alert = SecurityAlert::from_rule(rule, rule.name.clone(), description)
        .with_metadata("matchedCount", Value::from(matched.len() as u64))
        .with_metadata("windowStart", Value::String(window_start.to_rfc3339()));

    // Context fields carry over only when unambiguous across the matches
    alert.user_id = unique_value(matched, |e| Some(e.user_id.clone()));
    alert.user_email = unique_value(matched, |e| Some(e.user_email.clone()));
    alert.table_name = unique_value(matched, |e| Some(e.table_name.clone()));
    alert.ip_address = unique_value(matched, |e| e.ip_address.clone());
    alert.operation = {
        let ops: Vec<_> = matched.iter().map(|e| e.operation).collect();
        match ops.split_first() {
            Some((first, rest)) if rest.iter().all(|o| o == first) => Some(*first),
            _ => None,
        }
    };
    alert
}

fn unique_value<F>(events: &[AuditEvent], extract: F) -> Option<String>
where
    F: Fn(&AuditEvent) -> Option<String>,
{
    let mut values = events.iter().filter_map(&extract);
    let first = values.next()?;
    if values.all(|v| v == first) {
        Some(first)
    } else {
        None
    }
}
