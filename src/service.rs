//! The assembled audit pipeline
//!
//! `AuditPipeline` wires the store, rule engine, alert manager, stats
//! aggregator, and query façade together, and owns the background loops:
//! the periodic evaluation tick, the auto-acknowledge sweep, and the
//! stream subscriber. It is explicitly constructed and dependency-injected
//! — never a process-wide singleton — so multiple independent instances
//! can coexist (and be tested) in one process.

use crate::alerts::AlertManager;
use crate::config::PipelineConfig;
use crate::error::{AuditError, Result};
use crate::notify::NotifierRegistry;
use crate::query::QueryFacade;
use crate::rules::{RoleDirectory, RuleEngine};
use crate::stats::StatsAggregator;
use crate::store::EventStore;
use crate::subscriber::StreamSubscriber;
use crate::types::{Actor, AlertRule, AuditEvent, RulePatch, SecurityAlert};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Builder for an `AuditPipeline`
pub struct PipelineBuilder {
    store: Arc<dyn EventStore>,
    config: PipelineConfig,
    notifiers: NotifierRegistry,
    roles: Option<Arc<dyn RoleDirectory>>,
}

impl PipelineBuilder {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            config: PipelineConfig::default(),
            notifiers: NotifierRegistry::new(),
            roles: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn notifiers(mut self, notifiers: NotifierRegistry) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn role_directory(mut self, roles: Arc<dyn RoleDirectory>) -> Self {
        self.roles = Some(roles);
        self
    }

    pub fn build(self) -> AuditPipeline {
        let alerts = Arc::new(AlertManager::new(self.notifiers));
        let mut engine = RuleEngine::new(
            self.store.clone(),
            alerts.clone(),
            self.config.clone(),
        );
        if let Some(roles) = self.roles {
            engine = engine.with_role_directory(roles);
        }
        let engine = Arc::new(engine);
        let stats = Arc::new(StatsAggregator::new(
            self.store.clone(),
            alerts.clone(),
            self.config.clone(),
        ));
        let query = QueryFacade::new(self.store.clone(), stats.clone(), self.config.clone());

        AuditPipeline {
            store: self.store,
            alerts,
            engine,
            stats,
            query,
            config: self.config,
            running: Arc::new(RwLock::new(false)),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// The audit trail & security alerting engine, fully assembled
pub struct AuditPipeline {
    store: Arc<dyn EventStore>,
    alerts: Arc<AlertManager>,
    engine: Arc<RuleEngine>,
    stats: Arc<StatsAggregator>,
    query: QueryFacade,
    config: PipelineConfig,
    running: Arc<RwLock<bool>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AuditPipeline {
    pub fn builder(store: Arc<dyn EventStore>) -> PipelineBuilder {
        PipelineBuilder::new(store)
    }

    /// Spawn the evaluation tick, auto-acknowledge sweep, and stream
    /// subscriber. Idempotent: starting a running pipeline is a no-op.
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Periodic evaluation tick
        let engine = self.engine.clone();
        let tick_interval = self.config.evaluation_interval();
        let mut tick_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = interval(tick_interval);
            loop {
                tokio::select! {
                    _ = tick_shutdown.changed() => {
                        if *tick_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        engine.evaluate_all(Utc::now()).await;
                    }
                }
            }
        }));

        // Auto-acknowledge sweep. The cutoff is computed before the alert
        // list is read, so a sweep never acknowledges alerts created by
        // the tick it overlaps with.
        let alerts = self.alerts.clone();
        let sweep_interval = self.config.sweep_interval();
        let after_mins = self.config.auto_acknowledge_after_mins;
        let mut sweep_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = sweep_shutdown.changed() => {
                        if *sweep_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        let cutoff = Utc::now() - Duration::minutes(after_mins);
                        alerts.auto_acknowledge(cutoff).await;
                    }
                }
            }
        }));

        // Change-feed bridge (or polling fallback)
        let subscriber = StreamSubscriber::new(
            self.store.clone(),
            self.engine.clone(),
            self.config.clone(),
        );
        tasks.push(tokio::spawn(subscriber.run(shutdown_rx)));

        *self.shutdown.lock().await = Some(shutdown_tx);
        *self.tasks.lock().await = tasks;
        tracing::info!(store = %self.store.name(), "Audit pipeline started");
    }

    /// Signal the background loops and wait for them to finish
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }

        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        tracing::info!("Audit pipeline stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    // ── Ingestion API ────────────────────────────────────────────

    /// Durably record an audit event
    pub async fn ingest(&self, event: AuditEvent) -> Result<AuditEvent> {
        self.store
            .append(&event)
            .await
            .map_err(|e| AuditError::Ingestion(e.to_string()))?;
        Ok(event)
    }

    /// Record an audit event without ever failing the caller
    ///
    /// The mutating business operation that produced the event must not
    /// be aborted by audit problems; failures are logged and swallowed.
    pub async fn record(&self, event: AuditEvent) -> Option<AuditEvent> {
        match self.ingest(event).await {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::error!(error = %e, "Audit event dropped");
                None
            }
        }
    }

    /// Run an evaluation pass now, outside the periodic cadence
    ///
    /// Cancel-safe: dropping the returned future mid-flight leaves no
    /// partial alerts, since the only persistence point is the alert
    /// manager's atomic insert.
    pub async fn refresh(&self) -> Vec<SecurityAlert> {
        self.engine.evaluate_all(Utc::now()).await
    }

    // ── Alerting API (admin-gated) ───────────────────────────────

    pub async fn list_alerts(&self, actor: &Actor) -> Result<Vec<SecurityAlert>> {
        self.require_admin(actor, "list alerts")?;
        Ok(self.alerts.list().await)
    }

    pub async fn acknowledge(
        &self,
        actor: &Actor,
        alert_id: &str,
    ) -> Result<SecurityAlert> {
        self.require_admin(actor, "acknowledge alerts")?;
        self.alerts.acknowledge(alert_id, &actor.email).await
    }

    pub async fn acknowledge_all(&self, actor: &Actor) -> Result<usize> {
        self.require_admin(actor, "acknowledge alerts")?;
        Ok(self.alerts.acknowledge_all(&actor.email).await)
    }

    pub async fn dismiss(&self, actor: &Actor, alert_id: &str) -> Result<()> {
        self.require_admin(actor, "dismiss alerts")?;
        self.alerts.dismiss(alert_id).await
    }

    /// Open-alert count for UI badges; intentionally ungated
    pub async fn unacknowledged_count(&self) -> usize {
        self.alerts.unacknowledged_count().await
    }

    /// Subscribe to immutable snapshots of newly created alerts
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<SecurityAlert> {
        self.alerts.subscribe()
    }

    pub async fn create_rule(&self, actor: &Actor, rule: AlertRule) -> Result<AlertRule> {
        self.require_admin(actor, "manage rules")?;
        self.engine.create_rule(rule).await
    }

    pub async fn update_rule(
        &self,
        actor: &Actor,
        rule_id: &str,
        patch: RulePatch,
    ) -> Result<AlertRule> {
        self.require_admin(actor, "manage rules")?;
        self.engine.update_rule(rule_id, patch).await
    }

    pub async fn delete_rule(&self, actor: &Actor, rule_id: &str) -> Result<()> {
        self.require_admin(actor, "manage rules")?;
        self.engine.delete_rule(rule_id).await
    }

    pub async fn list_rules(&self, actor: &Actor) -> Result<Vec<AlertRule>> {
        self.require_admin(actor, "list rules")?;
        Ok(self.engine.list_rules().await)
    }

    pub async fn test_rule(&self, actor: &Actor, rule: &AlertRule) -> Result<SecurityAlert> {
        self.require_admin(actor, "test rules")?;
        self.engine.test_rule(rule, Utc::now()).await
    }

    // ── Component access ─────────────────────────────────────────

    pub fn query(&self) -> &QueryFacade {
        &self.query
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn store(&self) -> &dyn EventStore {
        self.store.as_ref()
    }

    fn require_admin(&self, actor: &Actor, action: &str) -> Result<()> {
        if actor.admin {
            Ok(())
        } else {
            Err(AuditError::AccessDenied(format!(
                "{} ({}) may not {}",
                actor.email, actor.id, action
            )))
        }
    }
}
