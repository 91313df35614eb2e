//! Configuration entities and their row-level SQL.
//!
//! Surrogate `id` fields are local to this database. A value built from a
//! desired-state snapshot carries `id = 0` until it is inserted.

use std::fmt;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::collect_rows;
use crate::schema;

/// Sequence number given to subscribers created by reconciliation.
pub const INITIAL_SEQUENCE_NUMBER: &str = "000000000000";

// =============================================================================
// Operator
// =============================================================================

/// The operator identity singleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub mcc: String,
    pub mnc: String,
    pub operator_code: String,
    pub supported_tacs: Vec<String>,
    pub sst: i32,
    pub sd: Option<Vec<u8>>,
    pub home_network_private_key: String,
}

impl Operator {
    pub fn load(conn: &Connection) -> Result<Option<Self>> {
        let row = conn
            .prepare_cached(
                "SELECT mcc, mnc, operator_code, supported_tacs, sst, sd, home_network_private_key
                 FROM operator WHERE id = 1",
            )
            .and_then(|mut stmt| {
                stmt.query_row([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i32>(4)?,
                        row.get::<_, Option<Vec<u8>>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })
                .optional()
            })
            .map_err(Error::query(schema::OPERATOR))?;

        let Some((mcc, mnc, operator_code, tacs, sst, sd, home_network_private_key)) = row else {
            return Ok(None);
        };
        Ok(Some(Self {
            mcc,
            mnc,
            operator_code,
            supported_tacs: serde_json::from_str(&tacs)?,
            sst,
            sd,
            home_network_private_key,
        }))
    }

    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        let tacs = serde_json::to_string(&self.supported_tacs)?;
        conn.prepare_cached(
            "INSERT INTO operator (id, mcc, mnc, operator_code, supported_tacs, sst, sd, home_network_private_key)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                mcc = excluded.mcc,
                mnc = excluded.mnc,
                operator_code = excluded.operator_code,
                supported_tacs = excluded.supported_tacs,
                sst = excluded.sst,
                sd = excluded.sd,
                home_network_private_key = excluded.home_network_private_key",
        )
        .and_then(|mut stmt| {
            stmt.execute(params![
                self.mcc,
                self.mnc,
                self.operator_code,
                tacs,
                self.sst,
                self.sd,
                self.home_network_private_key,
            ])
        })
        .map_err(|source| Error::Write {
            table: schema::OPERATOR,
            source,
        })?;
        Ok(())
    }
}

// =============================================================================
// Interface settings singletons
// =============================================================================

/// NAT enabled flag; `None` when the row has never been written.
pub fn load_nat_enabled(conn: &Connection) -> Result<Option<bool>> {
    conn.query_row("SELECT enabled FROM nat_settings", [], |row| row.get(0))
        .optional()
        .map_err(Error::query(schema::NAT_SETTINGS))
}

pub fn upsert_nat_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO nat_settings (singleton, enabled) VALUES (TRUE, ?1)
         ON CONFLICT(singleton) DO UPDATE SET enabled = excluded.enabled",
        [enabled],
    )
    .map_err(|source| Error::Write {
        table: schema::NAT_SETTINGS,
        source,
    })?;
    Ok(())
}

/// N3 external address; `None` when the row has never been written.
pub fn load_n3_external_address(conn: &Connection) -> Result<Option<String>> {
    conn.query_row("SELECT external_address FROM n3_settings", [], |row| {
        row.get(0)
    })
    .optional()
    .map_err(Error::query(schema::N3_SETTINGS))
}

pub fn upsert_n3_external_address(conn: &Connection, address: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO n3_settings (singleton, external_address) VALUES (TRUE, ?1)
         ON CONFLICT(singleton) DO UPDATE SET external_address = excluded.external_address",
        [address],
    )
    .map_err(|source| Error::Write {
        table: schema::N3_SETTINGS,
        source,
    })?;
    Ok(())
}

// =============================================================================
// Data networks
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNetwork {
    pub id: i64,
    pub name: String,
    pub ip_pool: String,
    pub dns: String,
    pub mtu: i32,
}

const DATA_NETWORK_COLUMNS: &str = "SELECT id, name, ip_pool, dns, mtu FROM data_networks";

impl DataNetwork {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            ip_pool: row.get(2)?,
            dns: row.get(3)?,
            mtu: row.get(4)?,
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>> {
        collect_rows(
            conn,
            schema::DATA_NETWORKS,
            &format!("{DATA_NETWORK_COLUMNS} ORDER BY id"),
            [],
            Self::from_row,
        )
    }

    pub fn by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        conn.prepare_cached(&format!("{DATA_NETWORK_COLUMNS} WHERE name = ?1"))
            .and_then(|mut stmt| stmt.query_row([name], Self::from_row).optional())
            .map_err(Error::query(schema::DATA_NETWORKS))
    }

    pub fn insert(&self, conn: &Connection) -> Result<i64> {
        conn.prepare_cached(
            "INSERT INTO data_networks (name, ip_pool, dns, mtu) VALUES (?1, ?2, ?3, ?4)",
        )
        .and_then(|mut stmt| stmt.insert(params![self.name, self.ip_pool, self.dns, self.mtu]))
        .map_err(Error::write(schema::DATA_NETWORKS, &self.name))
    }

    pub fn update(&self, conn: &Connection, id: i64) -> Result<()> {
        conn.prepare_cached(
            "UPDATE data_networks SET ip_pool = ?1, dns = ?2, mtu = ?3 WHERE id = ?4",
        )
        .and_then(|mut stmt| stmt.execute(params![self.ip_pool, self.dns, self.mtu, id]))
        .map_err(Error::write(schema::DATA_NETWORKS, &self.name))?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM data_networks WHERE id = ?1", [id])
            .map_err(|source| Error::Write {
                table: schema::DATA_NETWORKS,
                source,
            })?;
        Ok(())
    }
}

// =============================================================================
// Policies
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: i64,
    pub name: String,
    pub bitrate_uplink: String,
    pub bitrate_downlink: String,
    pub var5qi: i32,
    pub arp: i32,
    pub data_network_id: i64,
}

const POLICY_COLUMNS: &str = "SELECT id, name, bitrate_uplink, bitrate_downlink, var5qi, arp, data_network_id FROM policies";

impl Policy {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            bitrate_uplink: row.get(2)?,
            bitrate_downlink: row.get(3)?,
            var5qi: row.get(4)?,
            arp: row.get(5)?,
            data_network_id: row.get(6)?,
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>> {
        collect_rows(
            conn,
            schema::POLICIES,
            &format!("{POLICY_COLUMNS} ORDER BY id"),
            [],
            Self::from_row,
        )
    }

    pub fn by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        conn.prepare_cached(&format!("{POLICY_COLUMNS} WHERE name = ?1"))
            .and_then(|mut stmt| stmt.query_row([name], Self::from_row).optional())
            .map_err(Error::query(schema::POLICIES))
    }

    pub fn insert(&self, conn: &Connection) -> Result<i64> {
        conn.prepare_cached(
            "INSERT INTO policies (name, bitrate_uplink, bitrate_downlink, var5qi, arp, data_network_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .and_then(|mut stmt| {
            stmt.insert(params![
                self.name,
                self.bitrate_uplink,
                self.bitrate_downlink,
                self.var5qi,
                self.arp,
                self.data_network_id,
            ])
        })
        .map_err(Error::write(schema::POLICIES, &self.name))
    }

    pub fn update(&self, conn: &Connection, id: i64) -> Result<()> {
        conn.prepare_cached(
            "UPDATE policies SET bitrate_uplink = ?1, bitrate_downlink = ?2, var5qi = ?3,
                arp = ?4, data_network_id = ?5
             WHERE id = ?6",
        )
        .and_then(|mut stmt| {
            stmt.execute(params![
                self.bitrate_uplink,
                self.bitrate_downlink,
                self.var5qi,
                self.arp,
                self.data_network_id,
                id,
            ])
        })
        .map_err(Error::write(schema::POLICIES, &self.name))?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM policies WHERE id = ?1", [id])
            .map_err(|source| Error::Write {
                table: schema::POLICIES,
                source,
            })?;
        Ok(())
    }
}

// =============================================================================
// Subscribers
// =============================================================================

/// A subscriber row. `sequence_number` and `ip_address` are owned by this
/// node and are never taken from a desired-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub imsi: String,
    pub ip_address: Option<String>,
    pub sequence_number: String,
    pub permanent_key: String,
    pub opc: String,
    pub policy_id: i64,
}

const SUBSCRIBER_COLUMNS: &str = "SELECT id, imsi, ip_address, sequence_number, permanent_key, opc, policy_id FROM subscribers";

impl Subscriber {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            imsi: row.get(1)?,
            ip_address: row.get(2)?,
            sequence_number: row.get(3)?,
            permanent_key: row.get(4)?,
            opc: row.get(5)?,
            policy_id: row.get(6)?,
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>> {
        collect_rows(
            conn,
            schema::SUBSCRIBERS,
            &format!("{SUBSCRIBER_COLUMNS} ORDER BY id"),
            [],
            Self::from_row,
        )
    }

    pub fn by_imsi(conn: &Connection, imsi: &str) -> Result<Option<Self>> {
        conn.prepare_cached(&format!("{SUBSCRIBER_COLUMNS} WHERE imsi = ?1"))
            .and_then(|mut stmt| stmt.query_row([imsi], Self::from_row).optional())
            .map_err(Error::query(schema::SUBSCRIBERS))
    }

    pub fn insert(&self, conn: &Connection) -> Result<i64> {
        conn.prepare_cached(
            "INSERT INTO subscribers (imsi, ip_address, sequence_number, permanent_key, opc, policy_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .and_then(|mut stmt| {
            stmt.insert(params![
                self.imsi,
                self.ip_address,
                self.sequence_number,
                self.permanent_key,
                self.opc,
                self.policy_id,
            ])
        })
        .map_err(Error::write(schema::SUBSCRIBERS, &self.imsi))
    }

    /// Update the remotely owned fields only.
    pub fn update_remote_fields(&self, conn: &Connection, id: i64) -> Result<()> {
        conn.prepare_cached(
            "UPDATE subscribers SET permanent_key = ?1, opc = ?2, policy_id = ?3 WHERE id = ?4",
        )
        .and_then(|mut stmt| {
            stmt.execute(params![self.permanent_key, self.opc, self.policy_id, id])
        })
        .map_err(Error::write(schema::SUBSCRIBERS, &self.imsi))?;
        Ok(())
    }

    pub fn set_ip_address(conn: &Connection, imsi: &str, ip: Option<&str>) -> Result<()> {
        let changed = conn
            .execute(
                "UPDATE subscribers SET ip_address = ?1 WHERE imsi = ?2",
                params![ip, imsi],
            )
            .map_err(Error::write(schema::SUBSCRIBERS, imsi))?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "subscriber",
                key: imsi.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_sequence_number(conn: &Connection, imsi: &str, sqn: &str) -> Result<()> {
        let changed = conn
            .execute(
                "UPDATE subscribers SET sequence_number = ?1 WHERE imsi = ?2",
                params![sqn, imsi],
            )
            .map_err(Error::write(schema::SUBSCRIBERS, imsi))?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "subscriber",
                key: imsi.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM subscribers WHERE id = ?1", [id])
            .map_err(|source| Error::Write {
                table: schema::SUBSCRIBERS,
                source,
            })?;
        Ok(())
    }
}

// =============================================================================
// Routes
// =============================================================================

/// Egress interface of a static route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteInterface {
    N3,
    N6,
}

impl RouteInterface {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::N3 => "n3",
            Self::N6 => "n6",
        }
    }

    /// Only the exact string `n3` selects N3; any other fleet value is N6.
    #[must_use]
    pub fn from_fleet(name: &str) -> Self {
        if name == "n3" { Self::N3 } else { Self::N6 }
    }
}

impl fmt::Display for RouteInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteInterface {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "n3" => Ok(Self::N3),
            "n6" => Ok(Self::N6),
            other => Err(Error::Validation(format!("unknown route interface {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: i64,
    pub destination: String,
    pub gateway: String,
    pub interface: RouteInterface,
    pub metric: i32,
}

impl Route {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let interface: String = row.get(3)?;
        Ok(Self {
            id: row.get(0)?,
            destination: row.get(1)?,
            gateway: row.get(2)?,
            interface: interface.parse().map_err(|e: Error| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            metric: row.get(4)?,
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>> {
        collect_rows(
            conn,
            schema::ROUTES,
            "SELECT id, destination, gateway, interface, metric FROM routes ORDER BY id",
            [],
            Self::from_row,
        )
    }

    pub fn insert(&self, conn: &Connection) -> Result<i64> {
        conn.prepare_cached(
            "INSERT INTO routes (destination, gateway, interface, metric) VALUES (?1, ?2, ?3, ?4)",
        )
        .and_then(|mut stmt| {
            stmt.insert(params![
                self.destination,
                self.gateway,
                self.interface.as_str(),
                self.metric,
            ])
        })
        .map_err(Error::write(
            schema::ROUTES,
            format!("{} via {}", self.destination, self.gateway),
        ))
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM routes WHERE id = ?1", [id])
            .map_err(|source| Error::Write {
                table: schema::ROUTES,
                source,
            })?;
        Ok(())
    }
}
