//! Flow reports and their frequency statistics.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::{Page, Paged, TimeRange, collect_rows, count_rows, stored_counter};
use crate::schema;
use crate::storage::Store;
use crate::telemetry::{FlowReportEntry, Recorded};
use crate::timestamp;

/// Cap on the per-address breakdowns in [`FlowReportStats`].
pub const TOP_ADDRESSES: i64 = 10;

/// Optional exact-match filters. Both ends of `time` bound `end_time`,
/// inclusive, so a flow is listed under the window it finished in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowReportFilter {
    pub subscriber_id: Option<String>,
    pub protocol: Option<u8>,
    pub source_ip: Option<String>,
    pub destination_ip: Option<String>,
    pub time: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolCount {
    pub protocol: u8,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressCount {
    pub ip: String,
    pub count: u64,
}

/// Frequency breakdowns, each ordered by descending count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowReportStats {
    pub protocols: Vec<ProtocolCount>,
    pub top_sources: Vec<AddressCount>,
    pub top_destinations: Vec<AddressCount>,
}

const FLOW_COLUMNS: &str = "SELECT id, subscriber_id, source_ip, destination_ip, source_port, destination_port,
    protocol, packets, bytes, start_time, end_time FROM flow_reports";

const FLOW_WHERE: &str = " WHERE (?1 IS NULL OR subscriber_id = ?1)
    AND (?2 IS NULL OR protocol = ?2)
    AND (?3 IS NULL OR source_ip = ?3)
    AND (?4 IS NULL OR destination_ip = ?4)
    AND (?5 IS NULL OR end_time >= ?5)
    AND (?6 IS NULL OR end_time <= ?6)";

fn flow_from_row(row: &Row<'_>) -> rusqlite::Result<Recorded<FlowReportEntry>> {
    Ok(Recorded {
        id: row.get(0)?,
        record: FlowReportEntry {
            subscriber_id: row.get(1)?,
            source_ip: row.get(2)?,
            destination_ip: row.get(3)?,
            source_port: row.get(4)?,
            destination_port: row.get(5)?,
            protocol: row.get(6)?,
            packets: row.get::<_, i64>(7)? as u64,
            bytes: row.get::<_, i64>(8)? as u64,
            start_time: row.get(9)?,
            end_time: row.get(10)?,
        },
    })
}

pub fn insert_flow_report(conn: &Connection, entry: &FlowReportEntry) -> Result<i64> {
    let start = timestamp::normalize(&entry.start_time)?;
    let end = timestamp::normalize(&entry.end_time)?;
    let packets = stored_counter(entry.packets, "packets")?;
    let bytes = stored_counter(entry.bytes, "bytes")?;
    conn.prepare_cached(
        "INSERT INTO flow_reports (subscriber_id, source_ip, destination_ip, source_port,
            destination_port, protocol, packets, bytes, start_time, end_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .and_then(|mut stmt| {
        stmt.insert(params![
            entry.subscriber_id,
            entry.source_ip,
            entry.destination_ip,
            entry.source_port,
            entry.destination_port,
            entry.protocol,
            packets,
            bytes,
            start,
            end,
        ])
    })
    .map_err(|source| Error::Write {
        table: schema::FLOW_REPORTS,
        source,
    })
}

pub fn list_flow_reports(
    conn: &Connection,
    filter: &FlowReportFilter,
    page: Page,
) -> Result<Paged<Recorded<FlowReportEntry>>> {
    let (from, to) = filter.time.bounds()?;
    let total = count_rows(
        conn,
        schema::FLOW_REPORTS,
        &format!("SELECT COUNT(*) FROM flow_reports{FLOW_WHERE}"),
        params![
            filter.subscriber_id,
            filter.protocol,
            filter.source_ip,
            filter.destination_ip,
            from,
            to
        ],
    )?;
    let items = collect_rows(
        conn,
        schema::FLOW_REPORTS,
        &format!("{FLOW_COLUMNS}{FLOW_WHERE} ORDER BY id DESC LIMIT ?7 OFFSET ?8"),
        params![
            filter.subscriber_id,
            filter.protocol,
            filter.source_ip,
            filter.destination_ip,
            from,
            to,
            page.limit(),
            page.offset(),
        ],
        flow_from_row,
    )?;
    Ok(Paged { items, total })
}

pub fn get_flow_report(conn: &Connection, id: i64) -> Result<Recorded<FlowReportEntry>> {
    conn.prepare_cached(&format!("{FLOW_COLUMNS} WHERE id = ?1"))
        .and_then(|mut stmt| stmt.query_row([id], flow_from_row).optional())
        .map_err(Error::query(schema::FLOW_REPORTS))?
        .ok_or_else(|| Error::NotFound {
            entity: schema::FLOW_REPORTS,
            key: id.to_string(),
        })
}

/// Flows that ended on the UTC calendar day containing `day`, oldest first.
pub fn flow_reports_by_day(
    conn: &Connection,
    day: DateTime<Utc>,
) -> Result<Vec<Recorded<FlowReportEntry>>> {
    let epoch_day = timestamp::days_since_epoch(day);
    let bounds = timestamp::epoch_day_start(epoch_day)
        .zip(timestamp::epoch_day_start(epoch_day + 1))
        .ok_or_else(|| Error::Validation(format!("day {day} out of range")))?;
    collect_rows(
        conn,
        schema::FLOW_REPORTS,
        &format!("{FLOW_COLUMNS} WHERE end_time >= ?1 AND end_time < ?2 ORDER BY end_time ASC, id ASC"),
        params![
            timestamp::to_storage(bounds.0),
            timestamp::to_storage(bounds.1)
        ],
        flow_from_row,
    )
}

/// Every flow of one subscriber, oldest first.
pub fn flow_reports_by_subscriber(
    conn: &Connection,
    imsi: &str,
) -> Result<Vec<Recorded<FlowReportEntry>>> {
    collect_rows(
        conn,
        schema::FLOW_REPORTS,
        &format!("{FLOW_COLUMNS} WHERE subscriber_id = ?1 ORDER BY end_time ASC, id ASC"),
        [imsi],
        flow_from_row,
    )
}

pub fn clear_flow_reports(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM flow_reports", [])
        .map_err(|source| Error::Write {
            table: schema::FLOW_REPORTS,
            source,
        })
}

/// Protocol counts plus the top source and destination addresses.
pub fn flow_report_stats(conn: &Connection, filter: &FlowReportFilter) -> Result<FlowReportStats> {
    let (from, to) = filter.time.bounds()?;
    let protocols = collect_rows(
        conn,
        schema::FLOW_REPORTS,
        &format!(
            "SELECT protocol, COUNT(*) AS n FROM flow_reports{FLOW_WHERE}
             GROUP BY protocol ORDER BY n DESC, protocol ASC"
        ),
        params![
            filter.subscriber_id,
            filter.protocol,
            filter.source_ip,
            filter.destination_ip,
            from,
            to
        ],
        |row| {
            Ok(ProtocolCount {
                protocol: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        },
    )?;
    let top = |column_sql: &str| {
        collect_rows(
            conn,
            schema::FLOW_REPORTS,
            column_sql,
            params![
                filter.subscriber_id,
                filter.protocol,
                filter.source_ip,
                filter.destination_ip,
                from,
                to,
                TOP_ADDRESSES
            ],
            |row| {
                Ok(AddressCount {
                    ip: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            },
        )
    };
    let top_sources = top(&format!(
        "SELECT source_ip, COUNT(*) AS n FROM flow_reports{FLOW_WHERE}
         GROUP BY source_ip ORDER BY n DESC, source_ip ASC LIMIT ?7"
    ))?;
    let top_destinations = top(&format!(
        "SELECT destination_ip, COUNT(*) AS n FROM flow_reports{FLOW_WHERE}
         GROUP BY destination_ip ORDER BY n DESC, destination_ip ASC LIMIT ?7"
    ))?;
    Ok(FlowReportStats {
        protocols,
        top_sources,
        top_destinations,
    })
}

impl Store {
    pub fn insert_flow_report(&self, entry: &FlowReportEntry) -> Result<i64> {
        self.with_conn(|conn| insert_flow_report(conn, entry))
    }

    pub fn list_flow_reports(
        &self,
        filter: &FlowReportFilter,
        page: Page,
    ) -> Result<Paged<Recorded<FlowReportEntry>>> {
        self.with_conn(|conn| list_flow_reports(conn, filter, page))
    }

    pub fn flow_report(&self, id: i64) -> Result<Recorded<FlowReportEntry>> {
        self.with_conn(|conn| get_flow_report(conn, id))
    }

    pub fn flow_reports_by_day(&self, day: DateTime<Utc>) -> Result<Vec<Recorded<FlowReportEntry>>> {
        self.with_conn(|conn| flow_reports_by_day(conn, day))
    }

    pub fn flow_reports_by_subscriber(&self, imsi: &str) -> Result<Vec<Recorded<FlowReportEntry>>> {
        self.with_conn(|conn| flow_reports_by_subscriber(conn, imsi))
    }

    pub fn clear_flow_reports(&self) -> Result<usize> {
        self.with_conn(clear_flow_reports)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entities::tests::key32;
    use crate::entities::{DataNetwork, INITIAL_SEQUENCE_NUMBER, Policy, Subscriber};
    use chrono::TimeZone;

    /// Store with a policy and the given subscribers, for FK-bound tables.
    pub(crate) fn store_with_subscribers(imsis: &[&str]) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let dn = DataNetwork {
                    id: 0,
                    name: "internet".into(),
                    ip_pool: "10.45.0.0/22".into(),
                    dns: "8.8.8.8".into(),
                    mtu: 1400,
                }
                .insert(conn)?;
                let policy = Policy {
                    id: 0,
                    name: "default".into(),
                    bitrate_uplink: "200 Mbps".into(),
                    bitrate_downlink: "200 Mbps".into(),
                    var5qi: 9,
                    arp: 1,
                    data_network_id: dn,
                }
                .insert(conn)?;
                for imsi in imsis {
                    Subscriber {
                        id: 0,
                        imsi: (*imsi).to_string(),
                        ip_address: None,
                        sequence_number: INITIAL_SEQUENCE_NUMBER.into(),
                        permanent_key: key32('1'),
                        opc: key32('2'),
                        policy_id: policy,
                    }
                    .insert(conn)?;
                }
                Ok(())
            })
            .unwrap();
        store
    }

    pub(crate) fn flow(imsi: &str, src: &str, dst: &str, protocol: u8, end: &str) -> FlowReportEntry {
        FlowReportEntry {
            subscriber_id: imsi.into(),
            source_ip: src.into(),
            destination_ip: dst.into(),
            source_port: 40000,
            destination_port: 443,
            protocol,
            packets: 10,
            bytes: 1500,
            start_time: "2026-10-15T00:00:00Z".into(),
            end_time: end.into(),
        }
    }

    const A: &str = "001010100007487";
    const B: &str = "001010100007488";

    #[test]
    fn unknown_subscriber_rejected_by_foreign_key() {
        let store = store_with_subscribers(&[A]);
        let err = store
            .insert_flow_report(&flow("999990000000001", "10.45.0.2", "1.1.1.1", 6, "2026-10-15T01:00:00Z"))
            .unwrap_err();
        assert!(matches!(err, Error::Write { .. }));
    }

    #[test]
    fn stats_order_by_frequency() {
        let store = store_with_subscribers(&[A, B]);
        for (imsi, dst, proto) in [
            (A, "1.1.1.1", 6),
            (A, "1.1.1.1", 6),
            (A, "8.8.8.8", 17),
            (B, "1.1.1.1", 6),
            (B, "9.9.9.9", 1),
        ] {
            store
                .insert_flow_report(&flow(imsi, "10.45.0.2", dst, proto, "2026-10-15T01:00:00Z"))
                .unwrap();
        }
        let stats = store
            .with_conn(|conn| flow_report_stats(conn, &FlowReportFilter::default()))
            .unwrap();
        assert_eq!(stats.protocols[0], ProtocolCount { protocol: 6, count: 3 });
        assert_eq!(stats.protocols.len(), 3);
        assert_eq!(stats.top_destinations[0].ip, "1.1.1.1");
        assert_eq!(stats.top_destinations[0].count, 3);
        assert_eq!(stats.top_sources.len(), 1);

        let only_b = FlowReportFilter {
            subscriber_id: Some(B.into()),
            ..Default::default()
        };
        let stats = store.with_conn(|conn| flow_report_stats(conn, &only_b)).unwrap();
        assert_eq!(stats.protocols.len(), 2);
        assert!(stats.protocols.iter().all(|p| p.count == 1));
    }

    #[test]
    fn top_addresses_capped() {
        let store = store_with_subscribers(&[A]);
        for i in 0..15 {
            store
                .insert_flow_report(&flow(A, "10.45.0.2", &format!("192.0.2.{i}"), 6, "2026-10-15T01:00:00Z"))
                .unwrap();
        }
        let stats = store
            .with_conn(|conn| flow_report_stats(conn, &FlowReportFilter::default()))
            .unwrap();
        assert_eq!(stats.top_destinations.len(), 10);
    }

    #[test]
    fn by_day_and_by_subscriber_order_by_end_time() {
        let store = store_with_subscribers(&[A, B]);
        store
            .insert_flow_report(&flow(A, "10.45.0.2", "1.1.1.1", 6, "2026-10-15T05:00:00Z"))
            .unwrap();
        store
            .insert_flow_report(&flow(A, "10.45.0.2", "1.1.1.1", 6, "2026-10-15T02:00:00Z"))
            .unwrap();
        store
            .insert_flow_report(&flow(B, "10.45.0.3", "1.1.1.1", 6, "2026-10-16T00:00:00Z"))
            .unwrap();

        let day = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
        let flows = store.flow_reports_by_day(day).unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].record.end_time, "2026-10-15T02:00:00.000Z");

        let flows = store.flow_reports_by_subscriber(A).unwrap();
        assert_eq!(flows.len(), 2);
        assert!(flows[0].record.end_time < flows[1].record.end_time);
    }

    #[test]
    fn time_window_matches_on_end_time() {
        let store = store_with_subscribers(&[A]);
        let mut long_flow = flow(A, "10.45.0.2", "1.1.1.1", 6, "2026-10-15T01:00:00Z");
        long_flow.start_time = "2026-10-15T00:00:00Z".into();
        store.insert_flow_report(&long_flow).unwrap();
        store
            .insert_flow_report(&flow(A, "10.45.0.2", "8.8.8.8", 17, "2026-10-15T03:00:00Z"))
            .unwrap();

        let window = FlowReportFilter {
            time: TimeRange::between(
                Utc.with_ymd_and_hms(2026, 10, 15, 0, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 10, 15, 2, 0, 0).unwrap(),
            ),
            ..Default::default()
        };
        let page = store.list_flow_reports(&window, Page::default()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].record.destination_ip, "1.1.1.1");

        let stats = store.with_conn(|conn| flow_report_stats(conn, &window)).unwrap();
        assert_eq!(stats.protocols, vec![ProtocolCount { protocol: 6, count: 1 }]);
    }

    #[test]
    fn oversized_counters_rejected() {
        let store = store_with_subscribers(&[A]);
        let mut huge = flow(A, "10.45.0.2", "1.1.1.1", 6, "2026-10-15T01:00:00Z");
        huge.bytes = u64::MAX;
        let err = store.insert_flow_report(&huge).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.list_flow_reports(&FlowReportFilter::default(), Page::default()).unwrap().total, 0);
    }

    #[test]
    fn list_filters_and_gets() {
        let store = store_with_subscribers(&[A]);
        let id = store
            .insert_flow_report(&flow(A, "10.45.0.2", "1.1.1.1", 17, "2026-10-15T05:00:00Z"))
            .unwrap();
        store
            .insert_flow_report(&flow(A, "10.45.0.2", "1.1.1.1", 6, "2026-10-15T05:00:00Z"))
            .unwrap();
        let filter = FlowReportFilter {
            protocol: Some(17),
            ..Default::default()
        };
        let page = store.list_flow_reports(&filter, Page::default()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, id);
        assert_eq!(store.flow_report(id).unwrap().record.bytes, 1500);
        assert_eq!(store.clear_flow_reports().unwrap(), 2);
    }
}
