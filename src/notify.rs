//! Notification channel dispatch
//!
//! A `Notifier` per channel kind, registered with the alert manager.
//! Dispatch happens exactly once per alert, at creation time; a failing
//! channel is logged and never blocks alert persistence.

use crate::error::Result;
use crate::types::{ChannelKind, SecurityAlert};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for alert delivery transports
///
/// Implementations deliver an immutable alert snapshot to one channel.
/// Email and webhook transports live with the deployment; the in-tree
/// notifiers cover the inline feed, development logging, and tests.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert to this channel
    async fn deliver(&self, alert: &SecurityAlert) -> Result<()>;

    /// Which channel this notifier serves
    fn channel(&self) -> ChannelKind;
}

/// Channel registry used by the alert manager at dispatch time
#[derive(Default)]
pub struct NotifierRegistry {
    notifiers: HashMap<ChannelKind, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notifier, replacing any previous one for its channel
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(notifier.channel(), notifier);
    }

    pub fn get(&self, channel: ChannelKind) -> Option<Arc<dyn Notifier>> {
        self.notifiers.get(&channel).cloned()
    }
}

/// Notifier that logs deliveries via tracing
///
/// Stands in for email/webhook transports during development.
pub struct LogNotifier {
    channel: ChannelKind,
}

impl LogNotifier {
    pub fn new(channel: ChannelKind) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, alert: &SecurityAlert) -> Result<()> {
        tracing::info!(
            alert_id = %alert.id,
            channel = %self.channel,
            severity = %alert.severity,
            title = %alert.title,
            "Alert notification"
        );
        Ok(())
    }

    fn channel(&self) -> ChannelKind {
        self.channel
    }
}

/// Notifier that records deliveries in memory, for tests
pub struct MemoryNotifier {
    channel: ChannelKind,
    delivered: Arc<RwLock<Vec<SecurityAlert>>>,

    /// When true, every delivery fails — used to exercise dispatch-failure
    /// isolation
    fail: bool,
}

impl MemoryNotifier {
    pub fn new(channel: ChannelKind) -> Self {
        Self {
            channel,
            delivered: Arc::new(RwLock::new(Vec::new())),
            fail: false,
        }
    }

    /// A notifier whose deliveries always fail
    pub fn failing(channel: ChannelKind) -> Self {
        Self {
            fail: true,
            ..Self::new(channel)
        }
    }

    pub async fn deliveries(&self) -> Vec<SecurityAlert> {
        self.delivered.read().await.clone()
    }

    pub async fn delivery_count(&self) -> usize {
        self.delivered.read().await.len()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn deliver(&self, alert: &SecurityAlert) -> Result<()> {
        if self.fail {
            return Err(crate::error::AuditError::NotificationDispatch {
                channel: self.channel.to_string(),
                reason: "simulated delivery failure".to_string(),
            });
        }
        self.delivered.write().await.push(alert.clone());
        Ok(())
    }

    fn channel(&self) -> ChannelKind {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertRule, RuleType, Severity};

    fn alert() -> SecurityAlert {
        let rule = AlertRule::new("burst", RuleType::FailedLogin, Severity::High);
        SecurityAlert::from_rule(&rule, "Failed login burst", "6 failures in 10m")
    }

    #[tokio::test]
    async fn test_memory_notifier_records_deliveries() {
        let notifier = MemoryNotifier::new(ChannelKind::Email);
        notifier.deliver(&alert()).await.unwrap();
        notifier.deliver(&alert()).await.unwrap();
        assert_eq!(notifier.delivery_count().await, 2);
    }

    #[tokio::test]
    async fn test_failing_notifier_errors_and_records_nothing() {
        let notifier = MemoryNotifier::failing(ChannelKind::Webhook);
        let err = notifier.deliver(&alert()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::AuditError::NotificationDispatch { .. }
        ));
        assert_eq!(notifier.delivery_count().await, 0);
    }

    #[test]
    fn test_registry_replaces_per_channel() {
        let mut registry = NotifierRegistry::new();
        registry.register(Arc::new(LogNotifier::new(ChannelKind::Email)));
        registry.register(Arc::new(MemoryNotifier::new(ChannelKind::Email)));
        assert!(registry.get(ChannelKind::Email).is_some());
        assert!(registry.get(ChannelKind::Webhook).is_none());
    }
}
