//! Stream subscriber — bridges the store's change feed into the rule engine
//!
//! Prefers the push feed when the store exposes one; otherwise polls on the
//! evaluation cadence. The feed is at-least-once, so re-delivered events are
//! deduplicated by id within a bounded retention window.

use crate::config::PipelineConfig;
use crate::rules::RuleEngine;
use crate::store::EventStore;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::interval;

/// Bounded set of recently seen event ids
///
/// Insertion order is retained so the oldest id is evicted at capacity.
pub struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an id; returns false when it was already seen
    pub fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Forwards new audit events to the rule engine's trigger function
pub struct StreamSubscriber {
    store: Arc<dyn EventStore>,
    engine: Arc<RuleEngine>,
    config: PipelineConfig,
    seen: SeenIds,
}

impl StreamSubscriber {
    pub fn new(
        store: Arc<dyn EventStore>,
        engine: Arc<RuleEngine>,
        config: PipelineConfig,
    ) -> Self {
        let seen = SeenIds::new(config.dedupe_retention);
        Self {
            store,
            engine,
            config,
            seen,
        }
    }

    /// Consume the feed (or poll) until the shutdown signal flips
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        match self.store.feed() {
            Some(feed) => {
                tracing::info!(store = %self.store.name(), "Stream subscriber following push feed");
                self.run_feed(feed, shutdown).await;
            }
            None => {
                tracing::info!(
                    store = %self.store.name(),
                    interval_secs = self.config.evaluation_interval_secs,
                    "No push feed available, stream subscriber polling"
                );
                self.run_polling(shutdown).await;
            }
        }
        tracing::info!("Stream subscriber stopped");
    }

    async fn run_feed(
        &mut self,
        mut feed: broadcast::Receiver<crate::types::AuditEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                received = feed.recv() => match received {
                    Ok(event) => {
                        if !self.seen.insert(&event.id) {
                            tracing::debug!(event_id = %event.id, "Duplicate feed delivery dropped");
                            continue;
                        }
                        tracing::debug!(event_id = %event.id, "Feed event triggers evaluation");
                        self.engine.evaluate_all(Utc::now()).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Change feed lagged, continuing from current position");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn run_polling(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.config.evaluation_interval());

        // First poll is a catch-up pass over whatever the store already
        // holds; later polls only react to events newer than the last one
        let mut last_poll: Option<chrono::DateTime<Utc>> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    let now = Utc::now();
                    let fresh = match last_poll {
                        None => 1,
                        // On failure last_poll stays put, so the next
                        // healthy poll still covers the missed interval
                        Some(since) => match self.store.count_since(None, None, since).await {
                            Ok(n) => n,
                            Err(e) => {
                                tracing::warn!(error = %e, "Poll against store failed");
                                continue;
                            }
                        },
                    };
                    if fresh > 0 {
                        tracing::debug!(fresh, "Poll triggers evaluation");
                        self.engine.evaluate_all(now).await;
                    }
                    last_poll = Some(now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertManager;
    use crate::notify::NotifierRegistry;
    use crate::store::MemoryEventStore;
    use crate::types::{AuditEvent, Operation};

    #[test]
    fn test_seen_ids_dedupe() {
        let mut seen = SeenIds::new(10);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_seen_ids_evict_oldest_at_capacity() {
        let mut seen = SeenIds::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c")); // evicts "a"
        assert_eq!(seen.len(), 2);
        assert!(seen.insert("a")); // forgotten, accepted again
        assert!(!seen.insert("c"));
    }

    fn pipeline_parts(
        store: Arc<MemoryEventStore>,
    ) -> (Arc<RuleEngine>, Arc<AlertManager>, PipelineConfig) {
        let config = PipelineConfig {
            evaluation_interval_secs: 1,
            ..Default::default()
        };
        let alerts = Arc::new(AlertManager::new(NotifierRegistry::new()));
        let engine = Arc::new(RuleEngine::new(
            store,
            alerts.clone(),
            config.clone(),
        ));
        (engine, alerts, config)
    }

    fn login_failure() -> AuditEvent {
        AuditEvent::new(
            "login_attempts",
            format!("att-{}", uuid::Uuid::new_v4()),
            Operation::Insert,
            "u-1",
            "u-1@shop.test",
        )
    }

    #[tokio::test]
    async fn test_feed_delivery_triggers_evaluation() {
        let store = Arc::new(MemoryEventStore::default());
        let (engine, alerts, config) = pipeline_parts(store.clone());

        let subscriber = StreamSubscriber::new(store.clone(), engine, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(subscriber.run(shutdown_rx));

        // Let the subscriber attach to the feed before events are sent
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        for _ in 0..6 {
            store.append(&login_failure()).await.unwrap();
        }

        // The sixth delivery crosses the default failed-login threshold
        let mut waited = 0;
        while alerts.unacknowledged_count().await == 0 && waited < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(alerts.unacknowledged_count().await, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// Pollable store whose `count_since` fails once when armed
    struct FlakyCountStore {
        inner: MemoryEventStore,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl FlakyCountStore {
        fn new() -> Self {
            Self {
                inner: MemoryEventStore::without_feed(),
                fail_next: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn arm_failure(&self) {
            self.fail_next
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl EventStore for FlakyCountStore {
        async fn append(&self, event: &AuditEvent) -> crate::error::Result<String> {
            self.inner.append(event).await
        }

        async fn query(
            &self,
            filter: &crate::store::EventFilter,
            limit: usize,
            offset: usize,
        ) -> crate::error::Result<crate::store::EventPage> {
            self.inner.query(filter, limit, offset).await
        }

        async fn count_since(
            &self,
            table: Option<&str>,
            op: Option<Operation>,
            since: chrono::DateTime<Utc>,
        ) -> crate::error::Result<u64> {
            if self
                .fail_next
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(crate::error::AuditError::Query(
                    "transient backend error".to_string(),
                ));
            }
            self.inner.count_since(table, op, since).await
        }

        fn feed(&self) -> Option<broadcast::Receiver<AuditEvent>> {
            None
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_polling_recovers_events_behind_a_failed_poll() {
        let store = Arc::new(FlakyCountStore::new());
        let config = PipelineConfig {
            evaluation_interval_secs: 1,
            ..Default::default()
        };
        let alerts = Arc::new(AlertManager::new(NotifierRegistry::new()));
        let engine = Arc::new(RuleEngine::new(
            store.clone(),
            alerts.clone(),
            config.clone(),
        ));

        let subscriber = StreamSubscriber::new(store.clone(), engine, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(subscriber.run(shutdown_rx));

        // Let the catch-up poll pass over the empty store first
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // A burst lands, and the very next count against the store fails
        for _ in 0..6 {
            store.append(&login_failure()).await.unwrap();
        }
        store.arm_failure();

        // The poll after the failure must still cover the missed interval
        let mut waited = 0;
        while alerts.unacknowledged_count().await == 0 && waited < 500 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(alerts.unacknowledged_count().await, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_fallback_triggers_evaluation() {
        let store = Arc::new(MemoryEventStore::without_feed());
        let (engine, alerts, config) = pipeline_parts(store.clone());

        for _ in 0..6 {
            store.append(&login_failure()).await.unwrap();
        }

        let subscriber = StreamSubscriber::new(store.clone(), engine, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(subscriber.run(shutdown_rx));

        let mut waited = 0;
        while alerts.unacknowledged_count().await == 0 && waited < 300 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(alerts.unacknowledged_count().await, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
