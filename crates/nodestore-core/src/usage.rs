//! Time-bucketed usage aggregation.
//!
//! Usage is kept per (epoch day, IMSI). Increments are upserts that add to the
//! stored counters, so repeated or concurrent reports for the same bucket
//! accumulate. The epoch day is computed once, when usage is recorded, and is
//! never derived again from a stored timestamp.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::flow::{FlowReportFilter, FlowReportStats, flow_report_stats};
use crate::metrics::{MetricRegistry, names};
use crate::query::{DayRange, Page, Paged, collect_rows, count_rows, stored_counter};
use crate::schema;
use crate::storage::Store;
use crate::timestamp::days_since_epoch;

/// One (day, subscriber) bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub epoch_day: i64,
    pub imsi: String,
    pub bytes_uplink: u64,
    pub bytes_downlink: u64,
}

impl DailyUsage {
    /// Bucket usage observed at `at`.
    #[must_use]
    pub fn at(at: DateTime<Utc>, imsi: impl Into<String>, bytes_uplink: u64, bytes_downlink: u64) -> Self {
        Self {
            epoch_day: days_since_epoch(at),
            imsi: imsi.into(),
            bytes_uplink,
            bytes_downlink,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePerDay {
    pub epoch_day: i64,
    pub bytes_uplink: u64,
    pub bytes_downlink: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePerSubscriber {
    pub imsi: String,
    pub bytes_uplink: u64,
    pub bytes_downlink: u64,
}

impl UsagePerSubscriber {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.bytes_uplink.saturating_add(self.bytes_downlink)
    }
}

const USAGE_WHERE: &str = " WHERE epoch_day BETWEEN ?1 AND ?2 AND (?3 IS NULL OR imsi = ?3)";

pub fn increment_daily_usage(conn: &Connection, usage: &DailyUsage) -> Result<()> {
    let up = stored_counter(usage.bytes_uplink, "bytes_uplink")?;
    let down = stored_counter(usage.bytes_downlink, "bytes_downlink")?;
    conn.prepare_cached(
        "INSERT INTO daily_usage (epoch_day, imsi, bytes_uplink, bytes_downlink)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(epoch_day, imsi) DO UPDATE SET
            bytes_uplink = bytes_uplink + excluded.bytes_uplink,
            bytes_downlink = bytes_downlink + excluded.bytes_downlink",
    )
    .and_then(|mut stmt| stmt.execute(params![usage.epoch_day, usage.imsi, up, down]))
    .map_err(|source| Error::Write {
        table: schema::DAILY_USAGE,
        source,
    })?;
    Ok(())
}

pub fn usage_per_day(conn: &Connection, range: DayRange, imsi: Option<&str>) -> Result<Vec<UsagePerDay>> {
    collect_rows(
        conn,
        schema::DAILY_USAGE,
        &format!(
            "SELECT epoch_day, SUM(bytes_uplink), SUM(bytes_downlink) FROM daily_usage{USAGE_WHERE}
             GROUP BY epoch_day ORDER BY epoch_day ASC"
        ),
        params![range.start, range.end, imsi],
        |row| {
            Ok(UsagePerDay {
                epoch_day: row.get(0)?,
                bytes_uplink: row.get::<_, i64>(1)? as u64,
                bytes_downlink: row.get::<_, i64>(2)? as u64,
            })
        },
    )
}

pub fn usage_per_subscriber(
    conn: &Connection,
    range: DayRange,
    imsi: Option<&str>,
) -> Result<Vec<UsagePerSubscriber>> {
    collect_rows(
        conn,
        schema::DAILY_USAGE,
        &format!(
            "SELECT imsi, SUM(bytes_uplink) AS up, SUM(bytes_downlink) AS down FROM daily_usage{USAGE_WHERE}
             GROUP BY imsi ORDER BY up + down DESC, imsi ASC"
        ),
        params![range.start, range.end, imsi],
        |row| {
            Ok(UsagePerSubscriber {
                imsi: row.get(0)?,
                bytes_uplink: row.get::<_, i64>(1)? as u64,
                bytes_downlink: row.get::<_, i64>(2)? as u64,
            })
        },
    )
}

fn daily_usage_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyUsage> {
    Ok(DailyUsage {
        epoch_day: row.get(0)?,
        imsi: row.get(1)?,
        bytes_uplink: row.get::<_, i64>(2)? as u64,
        bytes_downlink: row.get::<_, i64>(3)? as u64,
    })
}

pub fn list_daily_usage(
    conn: &Connection,
    range: DayRange,
    imsi: Option<&str>,
    page: Page,
) -> Result<Paged<DailyUsage>> {
    let total = count_rows(
        conn,
        schema::DAILY_USAGE,
        &format!("SELECT COUNT(*) FROM daily_usage{USAGE_WHERE}"),
        params![range.start, range.end, imsi],
    )?;
    let items = collect_rows(
        conn,
        schema::DAILY_USAGE,
        &format!(
            "SELECT epoch_day, imsi, bytes_uplink, bytes_downlink FROM daily_usage{USAGE_WHERE}
             ORDER BY epoch_day DESC, imsi ASC LIMIT ?4 OFFSET ?5"
        ),
        params![range.start, range.end, imsi, page.limit(), page.offset()],
        daily_usage_from_row,
    )?;
    Ok(Paged { items, total })
}

pub fn clear_daily_usage(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM daily_usage", [])
        .map_err(|source| Error::Write {
            table: schema::DAILY_USAGE,
            source,
        })
}

/// Answers usage and flow aggregate queries and records usage increments.
pub struct UsageAggregator {
    store: Arc<Store>,
    metrics: Arc<MetricRegistry>,
}

impl UsageAggregator {
    #[must_use]
    pub fn new(store: Arc<Store>, metrics: Arc<MetricRegistry>) -> Self {
        Self { store, metrics }
    }

    /// Add `usage` to its bucket, creating the bucket on first use.
    pub fn increment_daily_usage(&self, usage: &DailyUsage) -> Result<()> {
        self.store
            .with_conn(|conn| increment_daily_usage(conn, usage))?;
        self.metrics.increment_counter(names::USAGE_INCREMENTS);
        debug!(
            imsi = %usage.imsi,
            epoch_day = usage.epoch_day,
            bytes_uplink = usage.bytes_uplink,
            bytes_downlink = usage.bytes_downlink,
            "usage incremented"
        );
        Ok(())
    }

    /// Sums per day, ascending by day.
    pub fn usage_per_day(&self, range: DayRange, imsi: Option<&str>) -> Result<Vec<UsagePerDay>> {
        self.store.with_conn(|conn| usage_per_day(conn, range, imsi))
    }

    /// Sums per subscriber, descending by total bytes.
    pub fn usage_per_subscriber(
        &self,
        range: DayRange,
        imsi: Option<&str>,
    ) -> Result<Vec<UsagePerSubscriber>> {
        self.store
            .with_conn(|conn| usage_per_subscriber(conn, range, imsi))
    }

    pub fn list_daily_usage(
        &self,
        range: DayRange,
        imsi: Option<&str>,
        page: Page,
    ) -> Result<Paged<DailyUsage>> {
        self.store
            .with_conn(|conn| list_daily_usage(conn, range, imsi, page))
    }

    /// Raw buckets for the last `days` days including today, as reported
    /// upstream to the fleet.
    pub fn recent_usage(&self, days: u32) -> Result<Vec<DailyUsage>> {
        self.recent_usage_at(days, Utc::now())
    }

    pub fn recent_usage_at(&self, days: u32, now: DateTime<Utc>) -> Result<Vec<DailyUsage>> {
        if days == 0 {
            return Err(Error::Validation("days must be at least 1".to_string()));
        }
        let start = now - Duration::days(i64::from(days) - 1);
        let range = DayRange::from_instants(start, now)?;
        self.store.with_conn(|conn| {
            collect_rows(
                conn,
                schema::DAILY_USAGE,
                &format!(
                    "SELECT epoch_day, imsi, bytes_uplink, bytes_downlink FROM daily_usage{USAGE_WHERE}
                     ORDER BY epoch_day ASC, imsi ASC"
                ),
                params![range.start, range.end, None::<String>],
                daily_usage_from_row,
            )
        })
    }

    /// Drop every bucket. The only operation that lowers a counter.
    pub fn clear_daily_usage(&self) -> Result<usize> {
        self.store.with_conn(clear_daily_usage)
    }

    pub fn flow_report_stats(&self, filter: &FlowReportFilter) -> Result<FlowReportStats> {
        self.store
            .with_conn(|conn| flow_report_stats(conn, filter))
    }
}
