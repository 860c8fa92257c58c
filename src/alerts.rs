//! Alert lifecycle management
//!
//! The `AlertManager` owns the alert collection: it is the single writer,
//! so the dedupe check and insert are atomic, acknowledgment is monotonic,
//! and callers observe alerts in creation order. Subscribers receive
//! immutable snapshots over a broadcast channel — the "inline" channel.

use crate::error::{AuditError, Result};
use crate::notify::NotifierRegistry;
use crate::types::{ChannelKind, SecurityAlert};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Actor attributed on auto-acknowledged alerts
pub const SYSTEM_ACTOR: &str = "system";

/// Owns alert storage, acknowledgment state, and notification dispatch
pub struct AlertManager {
    alerts: Arc<RwLock<Vec<SecurityAlert>>>,
    notifiers: NotifierRegistry,

    /// Inline feed — every created alert is broadcast as a snapshot
    feed_tx: broadcast::Sender<SecurityAlert>,
}

impl AlertManager {
    pub fn new(notifiers: NotifierRegistry) -> Self {
        let (feed_tx, _) = broadcast::channel(256);
        Self {
            alerts: Arc::new(RwLock::new(Vec::new())),
            notifiers,
            feed_tx,
        }
    }

    /// Subscribe to the inline alert feed
    ///
    /// Receivers get an immutable snapshot of every alert at creation.
    /// Dropping the receiver unsubscribes deterministically.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityAlert> {
        self.feed_tx.subscribe()
    }

    /// Store a new alert unless an open one for the same rule already
    /// exists within the window, then dispatch notifications
    ///
    /// The dedupe check and insert run under one write lock, so two
    /// concurrent rule evaluations cannot double-fire. Returns `None`
    /// when the alert was suppressed as a duplicate.
    pub async fn raise(
        &self,
        alert: SecurityAlert,
        window_start: DateTime<Utc>,
        channels: &[ChannelKind],
    ) -> Result<Option<SecurityAlert>> {
        {
            let mut alerts = self.alerts.write().await;

            if let Some(rule_id) = alert.rule_id() {
                let open = alerts.iter().any(|a| {
                    !a.acknowledged
                        && a.rule_id() == Some(rule_id)
                        && a.timestamp >= window_start
                });
                if open {
                    tracing::debug!(
                        rule = %rule_id,
                        "Alert suppressed: open alert already covers this window"
                    );
                    return Ok(None);
                }
            }

            alerts.push(alert.clone());
        }

        tracing::info!(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            title = %alert.title,
            "Security alert created"
        );

        // Exactly once, at creation. Failures are logged, never retried
        // synchronously, and leave the stored alert untouched.
        let _ = self.feed_tx.send(alert.clone());
        for channel in channels {
            if *channel == ChannelKind::Inline {
                continue; // the broadcast above is the inline delivery
            }
            match self.notifiers.get(*channel) {
                Some(notifier) => {
                    if let Err(e) = notifier.deliver(&alert).await {
                        tracing::warn!(
                            alert_id = %alert.id,
                            channel = %channel,
                            error = %e,
                            "Alert notification failed"
                        );
                    }
                }
                None => {
                    tracing::debug!(
                        channel = %channel,
                        "No notifier registered for channel"
                    );
                }
            }
        }

        Ok(Some(alert))
    }

    /// Acknowledge an alert
    ///
    /// Idempotent: re-acknowledging returns the stored alert unchanged
    /// and does not touch `acknowledged_at`.
    pub async fn acknowledge(&self, alert_id: &str, by: &str) -> Result<SecurityAlert> {
        let mut alerts = self.alerts.write().await;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| AuditError::NotFound(format!("Alert not found: {}", alert_id)))?;

        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_by = Some(by.to_string());
            alert.acknowledged_at = Some(Utc::now());
            tracing::info!(alert_id = %alert_id, by = %by, "Alert acknowledged");
        }

        Ok(alert.clone())
    }

    /// Acknowledge every open alert, returning how many changed state
    pub async fn acknowledge_all(&self, by: &str) -> usize {
        let now = Utc::now();
        let mut alerts = self.alerts.write().await;
        let mut changed = 0;
        for alert in alerts.iter_mut().filter(|a| !a.acknowledged) {
            alert.acknowledged = true;
            alert.acknowledged_by = Some(by.to_string());
            alert.acknowledged_at = Some(now);
            changed += 1;
        }
        if changed > 0 {
            tracing::info!(count = changed, by = %by, "All open alerts acknowledged");
        }
        changed
    }

    /// Hard-remove an alert — for false positives only, distinct from
    /// acknowledgment
    pub async fn dismiss(&self, alert_id: &str) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        let before = alerts.len();
        alerts.retain(|a| a.id != alert_id);
        if alerts.len() == before {
            return Err(AuditError::NotFound(format!(
                "Alert not found: {}",
                alert_id
            )));
        }
        tracing::info!(alert_id = %alert_id, "Alert dismissed");
        Ok(())
    }

    /// All alerts, in creation order
    pub async fn list(&self) -> Vec<SecurityAlert> {
        self.alerts.read().await.clone()
    }

    pub async fn get(&self, alert_id: &str) -> Option<SecurityAlert> {
        self.alerts
            .read()
            .await
            .iter()
            .find(|a| a.id == alert_id)
            .cloned()
    }

    pub async fn unacknowledged_count(&self) -> usize {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| !a.acknowledged)
            .count()
    }

    /// Acknowledge alerts created before `cutoff` that are still open,
    /// attributed to the system actor
    ///
    /// The caller computes the cutoff before this reads the list, so a
    /// sweep can never acknowledge an alert created by the same tick.
    pub async fn auto_acknowledge(&self, cutoff: DateTime<Utc>) -> usize {
        let now = Utc::now();
        let mut alerts = self.alerts.write().await;
        let mut swept = 0;
        for alert in alerts
            .iter_mut()
            .filter(|a| !a.acknowledged && a.timestamp < cutoff)
        {
            alert.acknowledged = true;
            alert.acknowledged_by = Some(SYSTEM_ACTOR.to_string());
            alert.acknowledged_at = Some(now);
            swept += 1;
        }
        if swept > 0 {
            tracing::info!(count = swept, cutoff = %cutoff, "Stale alerts auto-acknowledged");
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertRule, RuleType, Severity};
    use chrono::Duration;

    fn manager() -> AlertManager {
        AlertManager::new(NotifierRegistry::new())
    }

    fn rule() -> AlertRule {
        let mut r = AlertRule::new("burst", RuleType::FailedLogin, Severity::High);
        r.conditions.time_window_minutes = Some(15);
        r.conditions.threshold = Some(5);
        r
    }

    fn alert_for(rule: &AlertRule) -> SecurityAlert {
        SecurityAlert::from_rule(rule, "Failed login burst", "threshold crossed")
    }

    #[tokio::test]
    async fn test_raise_and_list_in_creation_order() {
        let mgr = manager();
        let r1 = rule();
        let mut r2 = rule();
        r2.id = "rule-other".to_string();

        let window = Utc::now() - Duration::minutes(15);
        let a1 = mgr.raise(alert_for(&r1), window, &[]).await.unwrap().unwrap();
        let a2 = mgr.raise(alert_for(&r2), window, &[]).await.unwrap().unwrap();

        let listed = mgr.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a1.id);
        assert_eq!(listed[1].id, a2.id);
        assert_eq!(mgr.unacknowledged_count().await, 2);
    }

    #[tokio::test]
    async fn test_raise_dedupes_open_alert_within_window() {
        let mgr = manager();
        let r = rule();
        let window = Utc::now() - Duration::minutes(15);

        let first = mgr.raise(alert_for(&r), window, &[]).await.unwrap();
        assert!(first.is_some());

        let second = mgr.raise(alert_for(&r), window, &[]).await.unwrap();
        assert!(second.is_none());
        assert_eq!(mgr.unacknowledged_count().await, 1);
    }

    #[tokio::test]
    async fn test_raise_refires_after_acknowledgment() {
        let mgr = manager();
        let r = rule();
        let window = Utc::now() - Duration::minutes(15);

        let first = mgr.raise(alert_for(&r), window, &[]).await.unwrap().unwrap();
        mgr.acknowledge(&first.id, "admin").await.unwrap();

        let second = mgr.raise(alert_for(&r), window, &[]).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let mgr = manager();
        let r = rule();
        let a = mgr
            .raise(alert_for(&r), Utc::now(), &[])
            .await
            .unwrap()
            .unwrap();

        let once = mgr.acknowledge(&a.id, "admin").await.unwrap();
        assert!(once.acknowledged);
        assert_eq!(once.acknowledged_by.as_deref(), Some("admin"));
        let first_at = once.acknowledged_at.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let twice = mgr.acknowledge(&a.id, "someone-else").await.unwrap();
        assert_eq!(twice.acknowledged_at.unwrap(), first_at);
        assert_eq!(twice.acknowledged_by.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_alert_errors() {
        let mgr = manager();
        let err = mgr.acknowledge("alert-missing", "admin").await.unwrap_err();
        assert!(matches!(err, AuditError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_dismiss_removes_alert() {
        let mgr = manager();
        let r = rule();
        let a = mgr
            .raise(alert_for(&r), Utc::now(), &[])
            .await
            .unwrap()
            .unwrap();

        mgr.dismiss(&a.id).await.unwrap();
        assert!(mgr.list().await.is_empty());
        assert!(matches!(
            mgr.dismiss(&a.id).await.unwrap_err(),
            AuditError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_auto_acknowledge_respects_cutoff() {
        let mgr = manager();
        let r = rule();
        let window = Utc::now() - Duration::hours(3);

        let mut stale = alert_for(&r);
        stale.timestamp = Utc::now() - Duration::minutes(90);
        mgr.raise(stale, window, &[]).await.unwrap().unwrap();

        let mut other = rule();
        other.id = "rule-fresh".to_string();
        let fresh = mgr
            .raise(alert_for(&other), window, &[])
            .await
            .unwrap()
            .unwrap();

        let cutoff = Utc::now() - Duration::minutes(60);
        let swept = mgr.auto_acknowledge(cutoff).await;
        assert_eq!(swept, 1);

        let listed = mgr.list().await;
        let stale_now = listed.iter().find(|a| a.id != fresh.id).unwrap();
        assert!(stale_now.acknowledged);
        assert_eq!(stale_now.acknowledged_by.as_deref(), Some(SYSTEM_ACTOR));
        assert!(!listed.iter().find(|a| a.id == fresh.id).unwrap().acknowledged);
    }

    #[tokio::test]
    async fn test_subscribers_receive_snapshots() {
        let mgr = manager();
        let mut feed = mgr.subscribe();
        let r = rule();

        let a = mgr
            .raise(alert_for(&r), Utc::now(), &[ChannelKind::Inline])
            .await
            .unwrap()
            .unwrap();

        let snapshot = feed.recv().await.unwrap();
        assert_eq!(snapshot.id, a.id);
        assert!(!snapshot.acknowledged);
    }

    #[tokio::test]
    async fn test_failed_channel_never_blocks_persistence() {
        use crate::notify::MemoryNotifier;
        use std::sync::Arc;

        let mut registry = NotifierRegistry::new();
        registry.register(Arc::new(MemoryNotifier::failing(ChannelKind::Webhook)));
        let mgr = AlertManager::new(registry);

        let r = rule();
        let raised = mgr
            .raise(alert_for(&r), Utc::now(), &[ChannelKind::Webhook])
            .await
            .unwrap();
        assert!(raised.is_some());
        assert_eq!(mgr.unacknowledged_count().await, 1);
    }

    #[tokio::test]
    async fn test_acknowledge_all() {
        let mgr = manager();
        for i in 0..3 {
            let mut r = rule();
            r.id = format!("rule-{}", i);
            mgr.raise(alert_for(&r), Utc::now(), &[]).await.unwrap();
        }

        assert_eq!(mgr.acknowledge_all("admin").await, 3);
        assert_eq!(mgr.unacknowledged_count().await, 0);
        // Second sweep is a no-op
        assert_eq!(mgr.acknowledge_all("admin").await, 0);
    }
}
