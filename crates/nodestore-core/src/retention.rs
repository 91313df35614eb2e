//! Per-category data retention.
//!
//! Each category has a retention window in days, stored in
//! `retention_policies` or falling back to a built-in default. A purge deletes
//! rows whose key is strictly older than `now - days`; a row exactly at the
//! cutoff is kept.
//!
//! # Category keys
//!
//! | Category     | Table             | Key column   |
//! |--------------|-------------------|--------------|
//! | `audit`      | `audit_logs`      | `timestamp`  |
//! | `radio`      | `radio_events`    | `timestamp`  |
//! | `network`    | `network_logs`    | `timestamp`  |
//! | `subscriber` | `subscriber_logs` | `timestamp`  |
//! | `flow`       | `flow_reports`    | `end_time`   |
//! | `usage`      | `daily_usage`     | `epoch_day`  |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::error::{Error, Result};
use crate::metrics::{MetricRegistry, names};
use crate::schema;
use crate::storage::Store;
use crate::timestamp::{days_since_epoch, to_storage};

/// A class of time-series data with its own retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionCategory {
    Audit,
    Radio,
    Network,
    Subscriber,
    Flow,
    Usage,
}

impl RetentionCategory {
    pub const ALL: [Self; 6] = [
        Self::Audit,
        Self::Radio,
        Self::Network,
        Self::Subscriber,
        Self::Flow,
        Self::Usage,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audit => "audit",
            Self::Radio => "radio",
            Self::Network => "network",
            Self::Subscriber => "subscriber",
            Self::Flow => "flow",
            Self::Usage => "usage",
        }
    }

    /// Days kept when no policy row exists.
    #[must_use]
    pub fn default_days(self) -> u32 {
        match self {
            Self::Usage => 365,
            _ => 7,
        }
    }

    fn table(self) -> &'static str {
        match self {
            Self::Audit => schema::AUDIT_LOGS,
            Self::Radio => schema::RADIO_EVENTS,
            Self::Network => schema::NETWORK_LOGS,
            Self::Subscriber => schema::SUBSCRIBER_LOGS,
            Self::Flow => schema::FLOW_REPORTS,
            Self::Usage => schema::DAILY_USAGE,
        }
    }

    fn purge_sql(self) -> &'static str {
        match self {
            Self::Audit => "DELETE FROM audit_logs WHERE timestamp < ?1",
            Self::Radio => "DELETE FROM radio_events WHERE timestamp < ?1",
            Self::Network => "DELETE FROM network_logs WHERE timestamp < ?1",
            Self::Subscriber => "DELETE FROM subscriber_logs WHERE timestamp < ?1",
            Self::Flow => "DELETE FROM flow_reports WHERE end_time < ?1",
            Self::Usage => "DELETE FROM daily_usage WHERE epoch_day < ?1",
        }
    }
}

impl fmt::Display for RetentionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown retention category {s:?}")))
    }
}

fn validate_days(days: u32) -> Result<()> {
    if days == 0 {
        return Err(Error::Validation(
            "retention days must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Stored retention days, or the category default.
pub fn retention_days(conn: &Connection, category: RetentionCategory) -> Result<u32> {
    let stored: Option<i64> = conn
        .prepare_cached("SELECT retention_days FROM retention_policies WHERE category = ?1")
        .and_then(|mut stmt| {
            stmt.query_row(params![category.as_str()], |row| row.get(0))
                .optional()
        })
        .map_err(Error::query(schema::RETENTION_POLICIES))?;
    Ok(stored
        .and_then(|d| u32::try_from(d).ok())
        .unwrap_or_else(|| category.default_days()))
}

pub fn set_retention_days(conn: &Connection, category: RetentionCategory, days: u32) -> Result<()> {
    validate_days(days)?;
    conn.prepare_cached(
        "INSERT INTO retention_policies (category, retention_days) VALUES (?1, ?2)
         ON CONFLICT(category) DO UPDATE SET retention_days = excluded.retention_days",
    )
    .and_then(|mut stmt| stmt.execute(params![category.as_str(), days]))
    .map_err(|source| Error::Write {
        table: schema::RETENTION_POLICIES,
        source,
    })?;
    Ok(())
}

/// Whether a policy row exists for `category`.
pub fn is_initialized(conn: &Connection, category: RetentionCategory) -> Result<bool> {
    conn.prepare_cached("SELECT 1 FROM retention_policies WHERE category = ?1")
        .and_then(|mut stmt| stmt.exists(params![category.as_str()]))
        .map_err(Error::query(schema::RETENTION_POLICIES))
}

/// Seed default rows for categories that have none. Returns how many were
/// added.
pub fn initialize_defaults(conn: &Connection) -> Result<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO retention_policies (category, retention_days) VALUES (?1, ?2)
             ON CONFLICT(category) DO NOTHING",
        )
        .map_err(|source| Error::Write {
            table: schema::RETENTION_POLICIES,
            source,
        })?;
    let mut seeded = 0;
    for category in RetentionCategory::ALL {
        seeded += stmt
            .execute(params![category.as_str(), category.default_days()])
            .map_err(|source| Error::Write {
                table: schema::RETENTION_POLICIES,
                source,
            })?;
    }
    Ok(seeded)
}

/// Delete rows of `category` older than `now - days`.
pub fn purge_category_at(
    conn: &Connection,
    category: RetentionCategory,
    days: u32,
    now: DateTime<Utc>,
) -> Result<usize> {
    validate_days(days)?;
    let cutoff = now - TimeDelta::days(i64::from(days));
    let write_err = |source| Error::Write {
        table: category.table(),
        source,
    };
    let deleted = match category {
        RetentionCategory::Usage => conn
            .execute(category.purge_sql(), params![days_since_epoch(cutoff)])
            .map_err(write_err)?,
        _ => conn
            .execute(category.purge_sql(), params![to_storage(cutoff)])
            .map_err(write_err)?,
    };
    if deleted > 0 {
        debug!(category = %category, days, deleted, "purged expired rows");
    }
    Ok(deleted)
}

/// Rows removed from one category by a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPurge {
    pub category: RetentionCategory,
    pub days: u32,
    pub deleted: usize,
}

/// Outcome of a full sweep over every category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub purges: Vec<CategoryPurge>,
}

impl RetentionReport {
    #[must_use]
    pub fn total_deleted(&self) -> usize {
        self.purges.iter().map(|p| p.deleted).sum()
    }

    #[must_use]
    pub fn deleted(&self, category: RetentionCategory) -> usize {
        self.purges
            .iter()
            .find(|p| p.category == category)
            .map_or(0, |p| p.deleted)
    }
}

/// Reads and writes retention policies and purges expired data.
pub struct RetentionManager {
    store: Arc<Store>,
    metrics: Arc<MetricRegistry>,
    sweep_interval: Duration,
}

impl RetentionManager {
    /// Manager with the default sweep interval.
    #[must_use]
    pub fn new(store: Arc<Store>, metrics: Arc<MetricRegistry>) -> Self {
        Self::from_config(store, &RetentionConfig::default(), metrics)
    }

    #[must_use]
    pub fn from_config(
        store: Arc<Store>,
        config: &RetentionConfig,
        metrics: Arc<MetricRegistry>,
    ) -> Self {
        Self {
            store,
            metrics,
            sweep_interval: config.sweep_interval(),
        }
    }

    /// Period of the background loop started by
    /// [`spawn_retention_loop`](Self::spawn_retention_loop).
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn get_retention_policy(&self, category: RetentionCategory) -> Result<u32> {
        self.store
            .with_conn(|conn| retention_days(conn, category))
    }

    pub fn set_retention_policy(&self, category: RetentionCategory, days: u32) -> Result<()> {
        self.store
            .with_conn(|conn| set_retention_days(conn, category, days))?;
        info!(category = %category, days, "retention policy updated");
        Ok(())
    }

    pub fn is_retention_policy_initialized(&self, category: RetentionCategory) -> Result<bool> {
        self.store
            .with_conn(|conn| is_initialized(conn, category))
    }

    /// Delete rows of `category` older than `days` days. Safe to repeat.
    pub fn delete_old(&self, category: RetentionCategory, days: u32) -> Result<usize> {
        self.delete_old_at(category, days, Utc::now())
    }

    pub fn delete_old_at(
        &self,
        category: RetentionCategory,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let deleted = self
            .store
            .with_conn(|conn| purge_category_at(conn, category, days, now))?;
        self.metrics
            .add_counter(names::RETENTION_ROWS_DELETED, deleted as u64);
        Ok(deleted)
    }

    /// Purge every category with its configured window.
    pub fn sweep(&self) -> Result<RetentionReport> {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let report = self.store.with_conn(|conn| {
            let mut report = RetentionReport::default();
            for category in RetentionCategory::ALL {
                let days = retention_days(conn, category)?;
                let deleted = purge_category_at(conn, category, days, now)?;
                report.purges.push(CategoryPurge {
                    category,
                    days,
                    deleted,
                });
            }
            Ok(report)
        })?;
        let total = report.total_deleted();
        self.metrics
            .add_counter(names::RETENTION_ROWS_DELETED, total as u64);
        if total > 0 {
            info!(deleted = total, "retention sweep complete");
        }
        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every [`sweep_interval`](Self::sweep_interval)
    /// until `shutdown` flips to `true` or its sender is dropped. The first
    /// sweep runs immediately.
    pub fn spawn_retention_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            debug!(interval_secs = self.sweep_interval.as_secs(), "retention loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let manager = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || manager.sweep()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(error = %e, "retention sweep failed"),
                            Err(e) => warn!(error = %e, "retention sweep task panicked"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("retention loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
