//! Statistics aggregation over the audit log
//!
//! Folds a time range of events into bucketed counters and a composite
//! risk score in a single O(n) pass. Nothing here is persisted — snapshots
//! are computed on demand; a materialized view would only buy latency.

use crate::alerts::AlertManager;
use crate::config::{PipelineConfig, StatsConfig};
use crate::error::{AuditError, Result};
use crate::store::{EventFilter, EventStore};
use crate::types::{AuditEvent, Operation, Severity};
use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Risk label attached to a time bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One fixed-width time bucket of activity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    /// Inclusive start of the bucket
    pub start: DateTime<Utc>,

    pub count: u64,

    pub risk_level: RiskLevel,
}

/// Per-user activity counter, labeled with the user's email when present
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivity {
    pub user_email: String,
    pub count: u64,
}

/// Components feeding the composite risk score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskBreakdown {
    /// Share of events that were DELETEs, 0.0–1.0
    pub delete_ratio: f64,

    /// Share of events outside business hours, 0.0–1.0
    pub after_hours_ratio: f64,

    /// Unacknowledged high/critical alerts stamped within the range
    pub unacknowledged_alerts: u64,
}

/// Read-model of audit activity over a caller-supplied range
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total: u64,

    pub by_operation: HashMap<Operation, u64>,

    pub by_table: HashMap<String, u64>,

    /// Keyed by user id
    pub by_user: HashMap<String, UserActivity>,

    /// Hour-aligned buckets spanning the range
    pub hourly: Vec<TimeBucket>,

    /// Day-aligned buckets spanning the range
    pub daily: Vec<TimeBucket>,

    /// Weighted composite, clamped to 0–100
    pub risk_score: f64,

    pub risk: RiskBreakdown,
}

/// Computes `StatsSnapshot`s against the event store
///
/// Store calls carry the configured timeout and never hang the caller.
pub struct StatsAggregator {
    store: Arc<dyn EventStore>,
    alerts: Arc<AlertManager>,
    config: PipelineConfig,
}

impl StatsAggregator {
    pub fn new(
        store: Arc<dyn EventStore>,
        alerts: Arc<AlertManager>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            alerts,
            config,
        }
    }

    /// Fetch every event matching the filter (paged, bounded by
    /// `max_window_events`) and fold it into a snapshot
    pub async fn compute_stats(&self, filter: &EventFilter) -> Result<StatsSnapshot> {
        let events = self.collect_events(filter).await?;

        let range = resolve_range(filter, &events);
        let unacknowledged = self
            .alerts
            .list()
            .await
            .into_iter()
            .filter(|a| {
                !a.acknowledged
                    && a.severity >= Severity::High
                    && a.timestamp >= range.0
                    && a.timestamp <= range.1
            })
            .count() as u64;

        Ok(fold_stats(&events, range, unacknowledged, &self.config.stats))
    }

    /// Page through the store until the filter is exhausted or the cap hit
    ///
    /// Also used by the export path, which needs every matching event.
    pub async fn collect_events(&self, filter: &EventFilter) -> Result<Vec<AuditEvent>> {
        let page_size = self.config.max_query_limit.max(1);
        let mut events = Vec::new();
        let mut offset = 0;

        loop {
            let page = tokio::time::timeout(
                self.config.query_timeout(),
                self.store.query(filter, page_size, offset),
            )
            .await
            .map_err(|_| {
                AuditError::Timeout(format!(
                    "stats query against '{}' store exceeded {:?}",
                    self.store.name(),
                    self.config.query_timeout()
                ))
            })??;

            let more = page.has_more();
            events.extend(page.events);

            if !more || events.len() >= self.config.max_window_events {
                if events.len() > self.config.max_window_events {
                    events.truncate(self.config.max_window_events);
                }
                break;
            }
            offset += page_size;
        }

        Ok(events)
    }
}

/// Range the snapshot spans: explicit filter bounds, with an open end
/// extending to now and an open start falling back to the oldest observed
/// event (or the trailing day when the range is empty)
fn resolve_range(
    filter: &EventFilter,
    events: &[AuditEvent],
) -> (DateTime<Utc>, DateTime<Utc>) {
    let observed_min = events.iter().map(|e| e.timestamp).min();
    let end = filter.end_date.unwrap_or_else(Utc::now);
    let start = filter
        .start_date
        .or(observed_min)
        .unwrap_or_else(|| end - Duration::days(1));
    (start, end.max(start))
}

/// Single-pass fold of events into the snapshot
pub fn fold_stats(
    events: &[AuditEvent],
    range: (DateTime<Utc>, DateTime<Utc>),
    unacknowledged_alerts: u64,
    config: &StatsConfig,
) -> StatsSnapshot {
    let (start, end) = range;
    let (hour_floor, hourly_len) =
        bucket_layout(start, end, Duration::hours(1), config.max_buckets);
    let (day_floor, daily_len) =
        bucket_layout(start, end, Duration::days(1), config.max_buckets);
    let mut hourly_counts = vec![0u64; hourly_len];
    let mut daily_counts = vec![0u64; daily_len];

    let mut by_operation: HashMap<Operation, u64> = HashMap::new();
    let mut by_table: HashMap<String, u64> = HashMap::new();
    let mut by_user: HashMap<String, UserActivity> = HashMap::new();
    let mut deletes = 0u64;
    let mut after_hours = 0u64;

    for event in events {
        *by_operation.entry(event.operation).or_insert(0) += 1;
        *by_table.entry(event.table_name.clone()).or_insert(0) += 1;
        by_user
            .entry(event.user_id.clone())
            .or_insert_with(|| UserActivity {
                user_email: event.user_email.clone(),
                count: 0,
            })
            .count += 1;

        if event.operation == Operation::Delete {
            deletes += 1;
        }
        if config.is_after_hours(event.timestamp.hour()) {
            after_hours += 1;
        }

        if let Some(i) = bucket_index(hour_floor, event.timestamp, Duration::hours(1), hourly_len)
        {
            hourly_counts[i] += 1;
        }
        if let Some(i) = bucket_index(day_floor, event.timestamp, Duration::days(1), daily_len) {
            daily_counts[i] += 1;
        }
    }

    let total = events.len() as u64;
    let delete_ratio = ratio(deletes, total);
    let after_hours_ratio = ratio(after_hours, total);

    let score = delete_ratio * config.delete_ratio_weight
        + after_hours_ratio * config.after_hours_weight
        + (unacknowledged_alerts as f64 * config.alert_weight).min(config.alert_weight_cap);

    StatsSnapshot {
        total,
        by_operation,
        by_table,
        by_user,
        hourly: build_buckets(hour_floor, Duration::hours(1), hourly_counts, config),
        daily: build_buckets(day_floor, Duration::days(1), daily_counts, config),
        risk_score: score.clamp(0.0, 100.0),
        risk: RiskBreakdown {
            delete_ratio,
            after_hours_ratio,
            unacknowledged_alerts,
        },
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Width-aligned floor and bucket count for the range
///
/// Ranges wider than `max_buckets` buckets keep the most recent buckets;
/// events before the raised floor simply don't land in any bucket (the
/// counters and ratios still see them).
fn bucket_layout(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    width: Duration,
    max_buckets: usize,
) -> (DateTime<Utc>, usize) {
    let floor = start.duration_trunc(width).unwrap_or(start);
    let len = bucket_count(floor, end, width);
    let cap = max_buckets.max(1);
    if len <= cap {
        return (floor, len);
    }
    (floor + width * (len - cap) as i32, cap)
}

fn bucket_count(floor: DateTime<Utc>, end: DateTime<Utc>, width: Duration) -> usize {
    if end < floor {
        return 0;
    }
    let spans = (end - floor).num_milliseconds() / width.num_milliseconds();
    (spans + 1) as usize
}

fn bucket_index(
    floor: DateTime<Utc>,
    at: DateTime<Utc>,
    width: Duration,
    len: usize,
) -> Option<usize> {
    if at < floor {
        return None;
    }
    let i = ((at - floor).num_milliseconds() / width.num_milliseconds()) as usize;
    (i < len).then_some(i)
}

fn build_buckets(
    floor: DateTime<Utc>,
    width: Duration,
    counts: Vec<u64>,
    config: &StatsConfig,
) -> Vec<TimeBucket> {
    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| TimeBucket {
            start: floor + width * i as i32,
            count,
            risk_level: if count > config.bucket_high_threshold {
                RiskLevel::High
            } else if count > config.bucket_medium_threshold {
                RiskLevel::Medium
            } else {
                RiskLevel::Low
            },
        })
        .collect()
}
