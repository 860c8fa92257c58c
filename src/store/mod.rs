//! Event store gateway — the seam to the durable audit log
//!
//! All durable backends (SQL, document store, in-memory, etc.) implement
//! `EventStore` to provide a uniform append/query/count API. The engine
//! only ever talks to this trait; the in-memory store ships in-tree, a
//! durable backend is a collaborator concern.

use crate::error::Result;
use crate::types::{AuditEvent, Operation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub mod memory;

pub use memory::MemoryEventStore;

/// Filters for querying the audit log
///
/// Exact match on table/operation/user/ip/session, inclusive date-range
/// bounds, and a free-text `search` applied to table name, record id,
/// user email, and serialized value snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Inclusive lower bound on the event timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    /// Inclusive upper bound on the event timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl EventFilter {
    /// Filter on a trailing time range only
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start_date: Some(start),
            ..Default::default()
        }
    }

    /// Whether an event passes this filter
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref table) = self.table_name {
            if &event.table_name != table {
                return false;
            }
        }
        if let Some(op) = self.operation {
            if event.operation != op {
                return false;
            }
        }
        if let Some(ref user) = self.user_id {
            if &event.user_id != user {
                return false;
            }
        }
        if let Some(start) = self.start_date {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if event.timestamp > end {
                return false;
            }
        }
        if let Some(ref ip) = self.ip_address {
            if event.ip_address.as_deref() != Some(ip.as_str()) {
                return false;
            }
        }
        if let Some(ref session) = self.session_id {
            if event.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }
        if let Some(ref needle) = self.search {
            let needle = needle.to_lowercase();
            let in_values = |v: &Option<serde_json::Value>| {
                v.as_ref()
                    .map(|v| v.to_string().to_lowercase().contains(&needle))
                    .unwrap_or(false)
            };
            let hit = event.table_name.to_lowercase().contains(&needle)
                || event.record_id.to_lowercase().contains(&needle)
                || event.user_email.to_lowercase().contains(&needle)
                || in_values(&event.old_values)
                || in_values(&event.new_values);
            if !hit {
                return false;
            }
        }
        true
    }
}

/// One page of an offset-paginated query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<AuditEvent>,

    /// Total matches across all pages for this filter
    pub total_count: usize,

    pub limit: usize,

    pub offset: usize,
}

impl EventPage {
    /// Whether another page exists past this one
    pub fn has_more(&self) -> bool {
        self.offset + self.limit < self.total_count
    }
}

/// Core trait for audit log backends
///
/// The log is append-only: `append` is the only write, and no operation
/// mutates or removes a stored event.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably record an event, returning its id
    async fn append(&self, event: &AuditEvent) -> Result<String>;

    /// Fetch one page of events matching the filter, newest first
    async fn query(
        &self,
        filter: &EventFilter,
        limit: usize,
        offset: usize,
    ) -> Result<EventPage>;

    /// Count events since a point in time, optionally narrowed by table
    /// and operation
    async fn count_since(
        &self,
        table_name: Option<&str>,
        operation: Option<Operation>,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Push-based change feed of newly appended events, if the backend
    /// exposes one
    ///
    /// Returns `None` for backends without a feed; consumers fall back
    /// to polling. Delivery is at-least-once.
    fn feed(&self) -> Option<broadcast::Receiver<AuditEvent>>;

    /// Backend name (e.g., "memory", "postgres")
    fn name(&self) -> &str;
}
