//! # tillwatch
//!
//! Audit trail and security alerting engine for retail point-of-sale
//! systems.
//!
//! ## Overview
//!
//! `tillwatch` ingests change-events from arbitrary tables, aggregates them
//! into time-bucketed statistics, evaluates configurable threshold/pattern
//! rules against a sliding window of recent events, and manages the
//! lifecycle of the resulting security alerts — creation, acknowledgment,
//! auto-expiry, and multi-channel notification. Durable storage is a
//! pluggable collaborator behind the `EventStore` trait.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tillwatch::{AuditEvent, AuditPipeline, MemoryEventStore, Operation};
//!
//! # async fn example() {
//! let store = Arc::new(MemoryEventStore::default());
//! let pipeline = AuditPipeline::builder(store).build();
//! pipeline.start().await;
//!
//! // Record a mutation performed elsewhere in the system
//! pipeline
//!     .record(
//!         AuditEvent::new("products", "p-42", Operation::Update, "u-1", "ana@shop.example")
//!             .with_new_values(serde_json::json!({"price": 19.99})),
//!     )
//!     .await;
//!
//! println!("open alerts: {}", pipeline.unacknowledged_count().await);
//! pipeline.stop().await;
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **EventStore** trait — the seam to the durable audit log
//! - **RuleEngine** — windowed threshold/pattern evaluation over recent events
//! - **AlertManager** — alert lifecycle, dedupe, notification dispatch
//! - **StatsAggregator** — bucketed activity counts and the composite risk score
//! - **StreamSubscriber** — change-feed bridge with polling fallback
//! - **QueryFacade** — paginated log queries and CSV/JSON export
//! - **AuditPipeline** — dependency-injected assembly with `start()`/`stop()`

pub mod alerts;
pub mod config;
pub mod error;
pub mod notify;
pub mod query;
pub mod rules;
pub mod service;
pub mod stats;
pub mod store;
pub mod subscriber;
pub mod types;

// Re-export core types
pub use alerts::{AlertManager, SYSTEM_ACTOR};
pub use config::{PipelineConfig, StatsConfig};
pub use error::{AuditError, Result};
pub use notify::{LogNotifier, MemoryNotifier, Notifier, NotifierRegistry};
pub use query::{Export, ExportFormat, LogPage, QueryFacade};
pub use rules::{default_rules, MemoryRoleDirectory, RoleDirectory, RuleEngine};
pub use service::{AuditPipeline, PipelineBuilder};
pub use stats::{RiskBreakdown, RiskLevel, StatsAggregator, StatsSnapshot, TimeBucket};
pub use store::{EventFilter, EventPage, EventStore, MemoryEventStore};
pub use subscriber::StreamSubscriber;
pub use types::{
    Actor, AlertRule, AuditEvent, ChannelKind, Operation, RuleConditions, RulePatch,
    RuleType, SecurityAlert, Severity,
};
