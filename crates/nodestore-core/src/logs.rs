//! Append-only log tables: radio events, network logs, subscriber logs and
//! audit logs.

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::{Page, Paged, TimeRange, collect_rows, count_rows};
use crate::schema;
use crate::storage::Store;
use crate::telemetry::{AuditEntry, ProtocolEvent, Recorded, SubscriberLogEntry};
use crate::timestamp;

// =============================================================================
// Radio events / network logs
// =============================================================================

/// The two tables sharing the [`ProtocolEvent`] layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolLog {
    Radio,
    Network,
}

struct ProtocolSql {
    table: &'static str,
    insert: &'static str,
    list: &'static str,
    count: &'static str,
    get: &'static str,
    clear: &'static str,
}

macro_rules! protocol_sql {
    ($table:literal) => {
        ProtocolSql {
            table: $table,
            insert: concat!(
                "INSERT INTO ", $table,
                " (timestamp, protocol, message_type, direction, local_address, remote_address, raw, details)",
                " VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            list: concat!(
                "SELECT id, timestamp, protocol, message_type, direction, local_address, remote_address, raw, details",
                " FROM ", $table,
                " WHERE (?1 IS NULL OR protocol = ?1)",
                " AND (?2 IS NULL OR direction = ?2)",
                " AND (?3 IS NULL OR message_type = ?3)",
                " AND (?4 IS NULL OR timestamp >= ?4)",
                " AND (?5 IS NULL OR timestamp <= ?5)",
                " ORDER BY id DESC LIMIT ?6 OFFSET ?7"
            ),
            count: concat!(
                "SELECT COUNT(*) FROM ", $table,
                " WHERE (?1 IS NULL OR protocol = ?1)",
                " AND (?2 IS NULL OR direction = ?2)",
                " AND (?3 IS NULL OR message_type = ?3)",
                " AND (?4 IS NULL OR timestamp >= ?4)",
                " AND (?5 IS NULL OR timestamp <= ?5)"
            ),
            get: concat!(
                "SELECT id, timestamp, protocol, message_type, direction, local_address, remote_address, raw, details",
                " FROM ", $table, " WHERE id = ?1"
            ),
            clear: concat!("DELETE FROM ", $table),
        }
    };
}

const RADIO_SQL: ProtocolSql = protocol_sql!("radio_events");
const NETWORK_SQL: ProtocolSql = protocol_sql!("network_logs");

impl ProtocolLog {
    fn sql(self) -> &'static ProtocolSql {
        match self {
            Self::Radio => &RADIO_SQL,
            Self::Network => &NETWORK_SQL,
        }
    }

    #[must_use]
    pub fn table(self) -> &'static str {
        self.sql().table
    }
}

/// Exact-match filters for protocol event listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEventFilter {
    pub protocol: Option<String>,
    pub direction: Option<String>,
    pub message_type: Option<String>,
    pub time: TimeRange,
}

fn protocol_event_from_row(row: &Row<'_>) -> rusqlite::Result<Recorded<ProtocolEvent>> {
    Ok(Recorded {
        id: row.get(0)?,
        record: ProtocolEvent {
            timestamp: row.get(1)?,
            protocol: row.get(2)?,
            message_type: row.get(3)?,
            direction: row.get(4)?,
            local_address: row.get(5)?,
            remote_address: row.get(6)?,
            raw: row.get(7)?,
            details: row.get(8)?,
        },
    })
}

pub fn insert_protocol_event(conn: &Connection, log: ProtocolLog, event: &ProtocolEvent) -> Result<i64> {
    let sql = log.sql();
    let ts = timestamp::normalize(&event.timestamp)?;
    conn.prepare_cached(sql.insert)
        .and_then(|mut stmt| {
            stmt.insert(params![
                ts,
                event.protocol,
                event.message_type,
                event.direction,
                event.local_address,
                event.remote_address,
                event.raw,
                event.details,
            ])
        })
        .map_err(|source| Error::Write {
            table: sql.table,
            source,
        })
}

pub fn list_protocol_events(
    conn: &Connection,
    log: ProtocolLog,
    filter: &ProtocolEventFilter,
    page: Page,
) -> Result<Paged<Recorded<ProtocolEvent>>> {
    let sql = log.sql();
    let (from, to) = filter.time.bounds()?;
    let total = count_rows(
        conn,
        sql.table,
        sql.count,
        params![filter.protocol, filter.direction, filter.message_type, from, to],
    )?;
    let items = collect_rows(
        conn,
        sql.table,
        sql.list,
        params![
            filter.protocol,
            filter.direction,
            filter.message_type,
            from,
            to,
            page.limit(),
            page.offset(),
        ],
        protocol_event_from_row,
    )?;
    Ok(Paged { items, total })
}

pub fn get_protocol_event(conn: &Connection, log: ProtocolLog, id: i64) -> Result<Recorded<ProtocolEvent>> {
    let sql = log.sql();
    conn.prepare_cached(sql.get)
        .and_then(|mut stmt| stmt.query_row([id], protocol_event_from_row).optional())
        .map_err(Error::query(sql.table))?
        .ok_or_else(|| Error::NotFound {
            entity: sql.table,
            key: id.to_string(),
        })
}

pub fn clear_protocol_events(conn: &Connection, log: ProtocolLog) -> Result<usize> {
    let sql = log.sql();
    conn.execute(sql.clear, []).map_err(|source| Error::Write {
        table: sql.table,
        source,
    })
}

// =============================================================================
// Subscriber logs
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberLogFilter {
    pub imsi: Option<String>,
    pub level: Option<String>,
    pub time: TimeRange,
}

const SUBSCRIBER_LOG_WHERE: &str = " WHERE (?1 IS NULL OR imsi = ?1)
    AND (?2 IS NULL OR level = ?2)
    AND (?3 IS NULL OR timestamp >= ?3)
    AND (?4 IS NULL OR timestamp <= ?4)";

fn subscriber_log_from_row(row: &Row<'_>) -> rusqlite::Result<Recorded<SubscriberLogEntry>> {
    Ok(Recorded {
        id: row.get(0)?,
        record: SubscriberLogEntry {
            timestamp: row.get(1)?,
            level: row.get(2)?,
            imsi: row.get(3)?,
            event: row.get(4)?,
            details: row.get(5)?,
        },
    })
}

pub fn insert_subscriber_log(conn: &Connection, entry: &SubscriberLogEntry) -> Result<i64> {
    let ts = timestamp::normalize(&entry.timestamp)?;
    conn.prepare_cached(
        "INSERT INTO subscriber_logs (timestamp, level, imsi, event, details)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .and_then(|mut stmt| {
        stmt.insert(params![ts, entry.level, entry.imsi, entry.event, entry.details])
    })
    .map_err(|source| Error::Write {
        table: schema::SUBSCRIBER_LOGS,
        source,
    })
}

pub fn list_subscriber_logs(
    conn: &Connection,
    filter: &SubscriberLogFilter,
    page: Page,
) -> Result<Paged<Recorded<SubscriberLogEntry>>> {
    let (from, to) = filter.time.bounds()?;
    let total = count_rows(
        conn,
        schema::SUBSCRIBER_LOGS,
        &format!("SELECT COUNT(*) FROM subscriber_logs{SUBSCRIBER_LOG_WHERE}"),
        params![filter.imsi, filter.level, from, to],
    )?;
    let items = collect_rows(
        conn,
        schema::SUBSCRIBER_LOGS,
        &format!(
            "SELECT id, timestamp, level, imsi, event, details FROM subscriber_logs{SUBSCRIBER_LOG_WHERE}
             ORDER BY id DESC LIMIT ?5 OFFSET ?6"
        ),
        params![filter.imsi, filter.level, from, to, page.limit(), page.offset()],
        subscriber_log_from_row,
    )?;
    Ok(Paged { items, total })
}

pub fn get_subscriber_log(conn: &Connection, id: i64) -> Result<Recorded<SubscriberLogEntry>> {
    conn.prepare_cached(
        "SELECT id, timestamp, level, imsi, event, details FROM subscriber_logs WHERE id = ?1",
    )
    .and_then(|mut stmt| stmt.query_row([id], subscriber_log_from_row).optional())
    .map_err(Error::query(schema::SUBSCRIBER_LOGS))?
    .ok_or_else(|| Error::NotFound {
        entity: schema::SUBSCRIBER_LOGS,
        key: id.to_string(),
    })
}

pub fn clear_subscriber_logs(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM subscriber_logs", [])
        .map_err(|source| Error::Write {
            table: schema::SUBSCRIBER_LOGS,
            source,
        })
}

// =============================================================================
// Audit logs
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogFilter {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub time: TimeRange,
}

const AUDIT_LOG_WHERE: &str = " WHERE (?1 IS NULL OR actor = ?1)
    AND (?2 IS NULL OR action = ?2)
    AND (?3 IS NULL OR timestamp >= ?3)
    AND (?4 IS NULL OR timestamp <= ?4)";

fn audit_entry_from_row(row: &Row<'_>) -> rusqlite::Result<Recorded<AuditEntry>> {
    Ok(Recorded {
        id: row.get(0)?,
        record: AuditEntry {
            timestamp: row.get(1)?,
            level: row.get(2)?,
            actor: row.get(3)?,
            action: row.get(4)?,
            ip: row.get(5)?,
            details: row.get(6)?,
        },
    })
}

pub fn insert_audit_entry(conn: &Connection, entry: &AuditEntry) -> Result<i64> {
    let ts = timestamp::normalize(&entry.timestamp)?;
    conn.prepare_cached(
        "INSERT INTO audit_logs (timestamp, level, actor, action, ip, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .and_then(|mut stmt| {
        stmt.insert(params![
            ts,
            entry.level,
            entry.actor,
            entry.action,
            entry.ip,
            entry.details
        ])
    })
    .map_err(|source| Error::Write {
        table: schema::AUDIT_LOGS,
        source,
    })
}

pub fn list_audit_logs(
    conn: &Connection,
    filter: &AuditLogFilter,
    page: Page,
) -> Result<Paged<Recorded<AuditEntry>>> {
    let (from, to) = filter.time.bounds()?;
    let total = count_rows(
        conn,
        schema::AUDIT_LOGS,
        &format!("SELECT COUNT(*) FROM audit_logs{AUDIT_LOG_WHERE}"),
        params![filter.actor, filter.action, from, to],
    )?;
    let items = collect_rows(
        conn,
        schema::AUDIT_LOGS,
        &format!(
            "SELECT id, timestamp, level, actor, action, ip, details FROM audit_logs{AUDIT_LOG_WHERE}
             ORDER BY id DESC LIMIT ?5 OFFSET ?6"
        ),
        params![filter.actor, filter.action, from, to, page.limit(), page.offset()],
        audit_entry_from_row,
    )?;
    Ok(Paged { items, total })
}

pub fn get_audit_entry(conn: &Connection, id: i64) -> Result<Recorded<AuditEntry>> {
    conn.prepare_cached(
        "SELECT id, timestamp, level, actor, action, ip, details FROM audit_logs WHERE id = ?1",
    )
    .and_then(|mut stmt| stmt.query_row([id], audit_entry_from_row).optional())
    .map_err(Error::query(schema::AUDIT_LOGS))?
    .ok_or_else(|| Error::NotFound {
        entity: schema::AUDIT_LOGS,
        key: id.to_string(),
    })
}

pub fn clear_audit_logs(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM audit_logs", [])
        .map_err(|source| Error::Write {
            table: schema::AUDIT_LOGS,
            source,
        })
}

// =============================================================================
// Store API
// =============================================================================

impl Store {
    pub fn insert_protocol_event(&self, log: ProtocolLog, event: &ProtocolEvent) -> Result<i64> {
        self.with_conn(|conn| insert_protocol_event(conn, log, event))
    }

    pub fn list_protocol_events(
        &self,
        log: ProtocolLog,
        filter: &ProtocolEventFilter,
        page: Page,
    ) -> Result<Paged<Recorded<ProtocolEvent>>> {
        self.with_conn(|conn| list_protocol_events(conn, log, filter, page))
    }

    pub fn protocol_event(&self, log: ProtocolLog, id: i64) -> Result<Recorded<ProtocolEvent>> {
        self.with_conn(|conn| get_protocol_event(conn, log, id))
    }

    pub fn clear_protocol_events(&self, log: ProtocolLog) -> Result<usize> {
        self.with_conn(|conn| clear_protocol_events(conn, log))
    }

    pub fn insert_subscriber_log(&self, entry: &SubscriberLogEntry) -> Result<i64> {
        self.with_conn(|conn| insert_subscriber_log(conn, entry))
    }

    pub fn list_subscriber_logs(
        &self,
        filter: &SubscriberLogFilter,
        page: Page,
    ) -> Result<Paged<Recorded<SubscriberLogEntry>>> {
        self.with_conn(|conn| list_subscriber_logs(conn, filter, page))
    }

    pub fn subscriber_log(&self, id: i64) -> Result<Recorded<SubscriberLogEntry>> {
        self.with_conn(|conn| get_subscriber_log(conn, id))
    }

    pub fn clear_subscriber_logs(&self) -> Result<usize> {
        self.with_conn(clear_subscriber_logs)
    }

    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64> {
        self.with_conn(|conn| insert_audit_entry(conn, entry))
    }

    pub fn list_audit_logs(
        &self,
        filter: &AuditLogFilter,
        page: Page,
    ) -> Result<Paged<Recorded<AuditEntry>>> {
        self.with_conn(|conn| list_audit_logs(conn, filter, page))
    }

    pub fn audit_entry(&self, id: i64) -> Result<Recorded<AuditEntry>> {
        self.with_conn(|conn| get_audit_entry(conn, id))
    }

    pub fn clear_audit_logs(&self) -> Result<usize> {
        self.with_conn(clear_audit_logs)
    }
}
