//! Tunable pipeline configuration
//!
//! The defaults mirror the values the system shipped with; every threshold
//! here is deployment configuration, not business law.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the audit pipeline's background loops and query limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Cadence of the periodic rule-evaluation tick, in seconds
    pub evaluation_interval_secs: u64,

    /// Cadence of the auto-acknowledge sweep, in seconds
    pub sweep_interval_secs: u64,

    /// Unacknowledged alerts older than this many minutes are acknowledged
    /// by the system actor
    pub auto_acknowledge_after_mins: i64,

    /// Timeout applied to store calls made by the aggregator and façade,
    /// in seconds
    pub query_timeout_secs: u64,

    /// Hard cap on the page size of log queries
    pub max_query_limit: usize,

    /// Upper bound on events fetched for a single rule-window evaluation
    pub max_window_events: usize,

    /// How many rules evaluate concurrently during a pass
    pub evaluation_concurrency: usize,

    /// How many recently seen event ids the stream subscriber retains for
    /// at-least-once dedupe
    pub dedupe_retention: usize,

    pub stats: StatsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 30,
            sweep_interval_secs: 60,
            auto_acknowledge_after_mins: 60,
            query_timeout_secs: 10,
            max_query_limit: 100,
            max_window_events: 5_000,
            evaluation_concurrency: 4,
            dedupe_retention: 1_024,
            stats: StatsConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Thresholds and weights for statistics and the composite risk score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsConfig {
    /// Bucket count above which a time bucket is labeled high risk
    pub bucket_high_threshold: u64,

    /// Bucket count above which a time bucket is labeled medium risk
    pub bucket_medium_threshold: u64,

    /// Start of business hours (inclusive), local hour 0-23
    pub business_hours_start: u32,

    /// End of business hours (exclusive), local hour 0-23
    pub business_hours_end: u32,

    /// Weight of the DELETE-operation ratio in the risk score
    pub delete_ratio_weight: f64,

    /// Weight of the after-hours activity ratio in the risk score
    pub after_hours_weight: f64,

    /// Score points per unacknowledged high/critical alert in range
    pub alert_weight: f64,

    /// Cap on the alert contribution to the risk score
    pub alert_weight_cap: f64,

    /// Hard cap on the hourly/daily bucket count in a snapshot; ranges
    /// wider than this keep their most recent buckets
    pub max_buckets: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            bucket_high_threshold: 150,
            bucket_medium_threshold: 80,
            business_hours_start: 8,
            business_hours_end: 18,
            delete_ratio_weight: 40.0,
            after_hours_weight: 30.0,
            alert_weight: 10.0,
            alert_weight_cap: 30.0,
            max_buckets: 1_000,
        }
    }
}

impl StatsConfig {
    /// Whether the given local hour falls outside business hours
    pub fn is_after_hours(&self, hour: u32) -> bool {
        hour < self.business_hours_start || hour >= self.business_hours_end
    }
}
