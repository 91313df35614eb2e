//! nodestore-core: Embedded control-plane store for a fleet-managed 5G core node
//!
//! The store keeps the node's configuration (operator identity, data networks,
//! policies, subscribers, routes) and its time-series telemetry in a single
//! SQLite database. Configuration arrives as a desired-state document from the
//! fleet manager and is reconciled into local rows in one transaction.
//!
//! # Architecture
//!
//! ```text
//! Fleet desired state → Reconciler → Store (SQLite, WAL)
//!                                       ↑
//! Protocol layer → BufferedTelemetryWriter
//!                                       ↓
//!                  UsageAggregator / RetentionManager
//! ```
//!
//! # Modules
//!
//! - `storage`: database handle, schema bootstrap, default seeding
//! - `entities`: configuration rows and their CRUD statements
//! - `desired`: fleet desired-state document
//! - `sync`: generic desired-vs-current diff
//! - `remap`: fleet ID to local ID translation
//! - `resolver`: natural-key lookups
//! - `reconcile`: transactional reconciliation pass
//! - `telemetry`: telemetry record types
//! - `logs`: radio, network, subscriber and audit log tables
//! - `flow`: flow reports and their statistics
//! - `usage`: per-day usage counters and aggregate queries
//! - `retention`: per-category retention policies and purges
//! - `writer`: bounded asynchronous telemetry writer
//! - `query`: pagination and filter helpers
//! - `timestamp`: storage timestamp format and epoch days
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `metrics`: named counters
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod desired;
pub mod entities;
pub mod error;
pub mod flow;
pub mod logging;
pub mod logs;
pub mod metrics;
pub mod query;
pub mod reconcile;
pub mod remap;
pub mod resolver;
pub mod retention;
pub mod schema;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod timestamp;
pub mod usage;
pub mod writer;

pub use config::StoreConfig;
pub use desired::DesiredState;
pub use error::{Error, Result};
pub use metrics::MetricRegistry;
pub use query::{DayRange, Page, Paged, TimeRange};
pub use reconcile::{ReconcileReport, Reconciler};
pub use retention::{RetentionCategory, RetentionManager};
pub use storage::Store;
pub use usage::UsageAggregator;
pub use writer::{BufferedTelemetryWriter, TelemetrySink};
