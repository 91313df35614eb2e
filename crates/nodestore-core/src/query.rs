//! Pagination and filter helpers shared by every listing query.
//!
//! Listing statements are static SQL using the `(?N IS NULL OR col = ?N)`
//! pattern, so an absent filter binds `NULL` and the same prepared statement
//! serves every filter combination.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Params};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::timestamp;

/// A 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    page: u32,
    per_page: u32,
}

impl Page {
    pub const DEFAULT_PER_PAGE: u32 = 25;

    /// Both `page` and `per_page` must be at least 1.
    pub fn new(page: u32, per_page: u32) -> Result<Self> {
        if page == 0 {
            return Err(Error::Validation("page must be at least 1".to_string()));
        }
        if per_page == 0 {
            return Err(Error::Validation("per_page must be at least 1".to_string()));
        }
        Ok(Self { page, per_page })
    }

    #[must_use]
    pub fn first(per_page: u32) -> Self {
        Self {
            page: 1,
            per_page: per_page.max(1),
        }
    }

    #[must_use]
    pub fn page(&self) -> u32 {
        self.page
    }

    #[must_use]
    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    pub(crate) fn limit(&self) -> i64 {
        i64::from(self.per_page)
    }

    pub(crate) fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.per_page)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(Self::DEFAULT_PER_PAGE)
    }
}

/// One page of results plus the total matching row count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Paged<T> {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// Optional inclusive time bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    #[must_use]
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    #[must_use]
    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    /// Storage-form bounds, ready to bind.
    pub(crate) fn bounds(&self) -> Result<(Option<String>, Option<String>)> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(Error::Validation(format!(
                    "time range start {from} is after end {to}"
                )));
            }
        }
        Ok((
            self.from.map(timestamp::to_storage),
            self.to.map(timestamp::to_storage),
        ))
    }
}

/// Inclusive epoch-day bounds for usage queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRange {
    pub start: i64,
    pub end: i64,
}

impl DayRange {
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(Error::Validation(format!(
                "day range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Range covering the UTC calendar days of two instants.
    pub fn from_instants(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        Self::new(
            timestamp::days_since_epoch(from),
            timestamp::days_since_epoch(to),
        )
    }

    #[must_use]
    pub fn single(day: i64) -> Self {
        Self {
            start: day,
            end: day,
        }
    }
}

/// Convert an unsigned counter to its stored form, rejecting values past
/// `i64::MAX`.
pub(crate) fn stored_counter(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::Validation(format!("{field} {value} exceeds storage range")))
}

pub(crate) fn count_rows<P: Params>(
    conn: &Connection,
    table: &'static str,
    sql: &str,
    params: P,
) -> Result<u64> {
    let total: i64 = conn
        .prepare_cached(sql)
        .and_then(|mut stmt| stmt.query_row(params, |row| row.get(0)))
        .map_err(Error::query(table))?;
    Ok(total as u64)
}

pub(crate) fn collect_rows<T, P, F>(
    conn: &Connection,
    table: &'static str,
    sql: &str,
    params: P,
    map: F,
) -> Result<Vec<T>>
where
    P: Params,
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare_cached(sql).map_err(Error::query(table))?;
    let rows = stmt.query_map(params, map).map_err(Error::query(table))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::query(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn page_rejects_zero() {
        assert!(Page::new(0, 10).is_err());
        assert!(Page::new(1, 0).is_err());
        let page = Page::new(3, 20).unwrap();
        assert_eq!(page.offset(), 40);
        assert_eq!(page.limit(), 20);
    }

    #[test]
    fn first_page_clamps_per_page() {
        let page = Page::first(0);
        assert_eq!(page.per_page(), 1);
        assert_eq!(page.offset(), 0);
    }

    #[test]
    fn reversed_time_range_rejected() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(TimeRange::between(a, b).bounds().is_err());
        let (from, to) = TimeRange::between(b, a).bounds().unwrap();
        assert_eq!(from.as_deref(), Some("2026-01-01T00:00:00.000Z"));
        assert_eq!(to.as_deref(), Some("2026-01-02T00:00:00.000Z"));
        assert_eq!(TimeRange::default().bounds().unwrap(), (None, None));
    }

    #[test]
    fn day_range_from_instants() {
        let from = Utc.with_ymd_and_hms(1970, 1, 3, 23, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(1970, 1, 5, 1, 0, 0).unwrap();
        assert_eq!(
            DayRange::from_instants(from, to).unwrap(),
            DayRange { start: 2, end: 4 }
        );
        assert!(DayRange::new(5, 4).is_err());
    }

    #[test]
    fn optional_filter_pattern_binds_null() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, proto TEXT);
             INSERT INTO t (proto) VALUES ('ngap'), ('nas'), ('ngap');",
        )
        .unwrap();
        let sql = "SELECT COUNT(*) FROM t WHERE (?1 IS NULL OR proto = ?1)";
        assert_eq!(count_rows(&conn, "t", sql, [None::<String>]).unwrap(), 3);
        assert_eq!(count_rows(&conn, "t", sql, [Some("ngap")]).unwrap(), 2);
        let ids = collect_rows(
            &conn,
            "t",
            "SELECT id FROM t WHERE (?1 IS NULL OR proto = ?1) ORDER BY id DESC",
            [Some("ngap")],
            |row| row.get::<_, i64>(0),
        )
        .unwrap();
        assert_eq!(ids, vec![3, 1]);
    }
}
