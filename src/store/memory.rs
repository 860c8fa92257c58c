//! In-memory event store for testing and single-process use
//!
//! Append-only `Vec` behind an `RwLock`, plus a broadcast change feed so
//! subscribers see new events without polling. Events are lost on drop.

use crate::error::Result;
use crate::store::{EventFilter, EventPage, EventStore};
use crate::types::{AuditEvent, Operation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Configuration for the in-memory store
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Capacity of the change-feed broadcast channel
    pub feed_capacity: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self { feed_capacity: 256 }
    }
}

/// Append-only in-memory audit log with a push change feed
pub struct MemoryEventStore {
    events: Arc<RwLock<Vec<AuditEvent>>>,
    feed_tx: broadcast::Sender<AuditEvent>,

    /// When false, `feed()` reports no push feed — used to exercise the
    /// polling fallback in tests
    feed_enabled: bool,
}

impl MemoryEventStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        let (feed_tx, _) = broadcast::channel(config.feed_capacity);
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            feed_tx,
            feed_enabled: true,
        }
    }

    /// A store that exposes no push feed, forcing consumers to poll
    pub fn without_feed() -> Self {
        let mut store = Self::default();
        store.feed_enabled = false;
        store
    }

    /// Total number of stored events
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &AuditEvent) -> Result<String> {
        {
            let mut events = self.events.write().await;
            events.push(event.clone());
        }

        // No subscribers is fine — the send just drops
        let _ = self.feed_tx.send(event.clone());

        tracing::debug!(
            event_id = %event.id,
            table = %event.table_name,
            operation = %event.operation,
            "Audit event appended"
        );

        Ok(event.id.clone())
    }

    async fn query(
        &self,
        filter: &EventFilter,
        limit: usize,
        offset: usize,
    ) -> Result<EventPage> {
        let events = self.events.read().await;

        // Newest first, matching how the durable collaborator indexes on
        // timestamp descending
        let matched: Vec<&AuditEvent> = events
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .collect();

        let total_count = matched.len();
        let page: Vec<AuditEvent> = matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();

        Ok(EventPage {
            events: page,
            total_count,
            limit,
            offset,
        })
    }

    async fn count_since(
        &self,
        table_name: Option<&str>,
        operation: Option<Operation>,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let events = self.events.read().await;
        let count = events
            .iter()
            .filter(|e| {
                e.timestamp >= since
                    && table_name.map_or(true, |t| e.table_name == t)
                    && operation.map_or(true, |op| e.operation == op)
            })
            .count();
        Ok(count as u64)
    }

    fn feed(&self) -> Option<broadcast::Receiver<AuditEvent>> {
        if self.feed_enabled {
            Some(self.feed_tx.subscribe())
        } else {
            None
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(table: &str, op: Operation) -> AuditEvent {
        AuditEvent::new(table, "r-1", op, "u-1", "ana@shop.test")
    }

    #[tokio::test]
    async fn test_append_and_query() {
        let store = MemoryEventStore::default();
        let e = event("products", Operation::Insert);
        let id = store.append(&e).await.unwrap();
        assert_eq!(id, e.id);

        let page = store
            .query(&EventFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.events[0].id, e.id);
    }

    #[tokio::test]
    async fn test_query_newest_first_with_pagination() {
        let store = MemoryEventStore::default();
        let base = Utc::now();
        for i in 0..5 {
            let e = event("sales", Operation::Insert)
                .with_timestamp(base + Duration::seconds(i));
            store.append(&e).await.unwrap();
        }

        let first = store.query(&EventFilter::default(), 2, 0).await.unwrap();
        assert_eq!(first.total_count, 5);
        assert_eq!(first.events.len(), 2);
        assert!(first.has_more());
        assert!(first.events[0].timestamp > first.events[1].timestamp);

        let last = store.query(&EventFilter::default(), 2, 4).await.unwrap();
        assert_eq!(last.events.len(), 1);
        assert!(!last.has_more());
    }

    #[tokio::test]
    async fn test_count_since_narrowing() {
        let store = MemoryEventStore::default();
        let now = Utc::now();
        store
            .append(&event("products", Operation::Delete).with_timestamp(now))
            .await
            .unwrap();
        store
            .append(&event("products", Operation::Insert).with_timestamp(now))
            .await
            .unwrap();
        store
            .append(
                &event("sales", Operation::Delete)
                    .with_timestamp(now - Duration::minutes(10)),
            )
            .await
            .unwrap();

        let since = now - Duration::minutes(5);
        assert_eq!(store.count_since(None, None, since).await.unwrap(), 2);
        assert_eq!(
            store
                .count_since(Some("products"), Some(Operation::Delete), since)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .count_since(Some("sales"), None, since)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_feed_delivers_appended_events() {
        let store = MemoryEventStore::default();
        let mut feed = store.feed().unwrap();

        let e = event("clients", Operation::Update);
        store.append(&e).await.unwrap();

        let received = feed.recv().await.unwrap();
        assert_eq!(received.id, e.id);
    }

    #[tokio::test]
    async fn test_without_feed_reports_none() {
        let store = MemoryEventStore::without_feed();
        assert!(store.feed().is_none());

        // Appends still work
        store.append(&event("products", Operation::Insert)).await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
