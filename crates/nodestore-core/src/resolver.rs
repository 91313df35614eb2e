//! Natural-key lookups.
//!
//! Surrogate IDs never leave this process, so every cross-system reference
//! goes through a name or IMSI resolved here against the current rows.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::entities::{DataNetwork, Policy, Subscriber};
use crate::error::{Error, Result};
use crate::query::collect_rows;
use crate::schema;

/// Resolves natural keys against one connection (or open transaction).
#[derive(Clone, Copy)]
pub struct NaturalKeyResolver<'c> {
    conn: &'c Connection,
}

impl<'c> NaturalKeyResolver<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn data_network(&self, name: &str) -> Result<DataNetwork> {
        DataNetwork::by_name(self.conn, name)?.ok_or_else(|| Error::NotFound {
            entity: "data network",
            key: name.to_string(),
        })
    }

    pub fn policy(&self, name: &str) -> Result<Policy> {
        Policy::by_name(self.conn, name)?.ok_or_else(|| Error::NotFound {
            entity: "policy",
            key: name.to_string(),
        })
    }

    pub fn subscriber(&self, imsi: &str) -> Result<Subscriber> {
        Subscriber::by_imsi(self.conn, imsi)?.ok_or_else(|| Error::NotFound {
            entity: "subscriber",
            key: imsi.to_string(),
        })
    }

    /// Name → local ID for every data network.
    pub fn data_network_ids(&self) -> Result<HashMap<String, i64>> {
        self.name_index(schema::DATA_NETWORKS, "SELECT name, id FROM data_networks")
    }

    /// Name → local ID for every policy.
    pub fn policy_ids(&self) -> Result<HashMap<String, i64>> {
        self.name_index(schema::POLICIES, "SELECT name, id FROM policies")
    }

    fn name_index(&self, table: &'static str, sql: &str) -> Result<HashMap<String, i64>> {
        let pairs = collect_rows(self.conn, table, sql, [], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(pairs.into_iter().collect())
    }
}
