//! Query façade — filtered/paginated log reads and CSV/JSON export
//!
//! Everything here is admin-gated: audit data never leaks to ordinary
//! callers, and the error taxonomy keeps "access denied" distinct from
//! internal failures.

use crate::config::PipelineConfig;
use crate::error::{AuditError, Result};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::store::{EventFilter, EventStore};
use crate::types::{Actor, AuditEvent};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Export encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
}

/// One page of audit log results
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub logs: Vec<AuditEvent>,
    pub total_count: usize,
}

/// A rendered export, ready for download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Export {
    /// `audit-logs-<ISO date>.<ext>`
    pub filename: String,
    pub content: String,
}

/// Read-side API over the event store and stats aggregator
pub struct QueryFacade {
    store: Arc<dyn EventStore>,
    stats: Arc<StatsAggregator>,
    config: PipelineConfig,
}

impl QueryFacade {
    pub fn new(
        store: Arc<dyn EventStore>,
        stats: Arc<StatsAggregator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            stats,
            config,
        }
    }

    /// Paginated, filtered log listing; `limit` is capped at the
    /// configured maximum. A zero limit yields an empty page with the
    /// total count intact.
    pub async fn query_logs(
        &self,
        actor: &Actor,
        filter: &EventFilter,
        limit: usize,
        offset: usize,
    ) -> Result<LogPage> {
        require_admin(actor, "query audit logs")?;
        let limit = limit.min(self.config.max_query_limit);

        let page = tokio::time::timeout(
            self.config.query_timeout(),
            self.store.query(filter, limit, offset),
        )
        .await
        .map_err(|_| {
            AuditError::Timeout(format!(
                "log query exceeded {:?}",
                self.config.query_timeout()
            ))
        })??;

        Ok(LogPage {
            total_count: page.total_count,
            logs: page.events,
        })
    }

    /// Activity statistics and risk metrics for the filtered range
    pub async fn stats(&self, actor: &Actor, filter: &EventFilter) -> Result<StatsSnapshot> {
        require_admin(actor, "read audit statistics")?;
        self.stats.compute_stats(filter).await
    }

    /// Render every matching event as CSV or JSON
    pub async fn export(
        &self,
        actor: &Actor,
        filter: &EventFilter,
        format: ExportFormat,
    ) -> Result<Export> {
        require_admin(actor, "export audit logs")?;
        let events = self.stats.collect_events(filter).await?;

        let (content, ext) = match format {
            ExportFormat::Csv => (render_csv(&events), "csv"),
            ExportFormat::Json => (serde_json::to_string_pretty(&events)?, "json"),
        };

        Ok(Export {
            filename: format!("audit-logs-{}.{}", Utc::now().format("%Y-%m-%d"), ext),
            content,
        })
    }
}

fn require_admin(actor: &Actor, action: &str) -> Result<()> {
    if actor.admin {
        Ok(())
    } else {
        Err(AuditError::AccessDenied(format!(
            "{} ({}) may not {}",
            actor.email, actor.id, action
        )))
    }
}

/// CSV column order for exports
pub const CSV_HEADER: &str = "id,tableName,recordId,operation,userId,userEmail,ipAddress,userAgent,sessionId,timestamp,oldValues,newValues";

/// Render events as CSV: every field quoted, embedded quotes doubled
pub fn render_csv(events: &[AuditEvent]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for event in events {
        let values = |v: &Option<serde_json::Value>| {
            v.as_ref().map(|v| v.to_string()).unwrap_or_default()
        };
        let fields = [
            event.id.clone(),
            event.table_name.clone(),
            event.record_id.clone(),
            event.operation.to_string(),
            event.user_id.clone(),
            event.user_email.clone(),
            event.ip_address.clone().unwrap_or_default(),
            event.user_agent.clone().unwrap_or_default(),
            event.session_id.clone().unwrap_or_default(),
            event.timestamp.to_rfc3339(),
            values(&event.old_values),
            values(&event.new_values),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_quote(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}
