//! Shared SQLite handle.
//!
//! One [`Store`] owns the single writer connection. Every operation locks it
//! for its duration, which is the single implicit transaction; multi-statement
//! work runs through [`Store::with_transaction`]. Share it behind an `Arc`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::entities::{
    self, DataNetwork, INITIAL_SEQUENCE_NUMBER, Operator, Policy, Route, Subscriber,
};
use crate::error::{Error, Result};
use crate::resolver::NaturalKeyResolver;
use crate::retention::{self, RetentionCategory};
use crate::schema;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Values seeded by [`Store::initialize`] on a fresh database.
pub mod defaults {
    pub const MCC: &str = "001";
    pub const MNC: &str = "01";
    pub const SST: i32 = 1;
    pub const SD: [u8; 3] = [0x10, 0x20, 0x30];
    pub const TAC: &str = "000001";
    pub const DATA_NETWORK_NAME: &str = "internet";
    pub const DATA_NETWORK_IP_POOL: &str = "10.45.0.0/22";
    pub const DATA_NETWORK_DNS: &str = "8.8.8.8";
    pub const DATA_NETWORK_MTU: i32 = 1400;
    pub const POLICY_NAME: &str = "default";
    pub const POLICY_BITRATE: &str = "200 Mbps";
    pub const POLICY_VAR5QI: i32 = 9;
    pub const POLICY_ARP: i32 = 1;
}

/// Thread-safe handle to the control-plane database.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database file and apply pragmas and schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path.as_ref(), DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_config(config: &DatabaseConfig) -> Result<Self> {
        Self::open_with_timeout(
            &config.path,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        Self::prepare(conn, None, DEFAULT_BUSY_TIMEOUT)
    }

    fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path).map_err(|source| Error::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::prepare(conn, Some(path.to_path_buf()), busy_timeout)
    }

    fn prepare(conn: Connection, path: Option<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let shown = path
            .as_ref()
            .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string());
        let open_err = |source| Error::Open {
            path: shown.clone(),
            source,
        };
        conn.busy_timeout(busy_timeout).map_err(open_err)?;
        conn.execute_batch(schema::PRAGMAS_SQL).map_err(open_err)?;
        conn.execute_batch(schema::SCHEMA_SQL).map_err(open_err)?;
        debug!(path = %shown, "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file path, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the connection as one implicit transaction.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside an explicit transaction. Commits on `Ok`; any `Err`
    /// rolls back every statement `f` issued.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(|source| Error::Transaction {
            op: "begin",
            source,
        })?;
        let value = f(&tx)?;
        tx.commit().map_err(|source| Error::Transaction {
            op: "commit",
            source,
        })?;
        Ok(value)
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Whether the operator row has been seeded.
    pub fn is_initialized(&self) -> Result<bool> {
        self.with_conn(|conn| Ok(Operator::load(conn)?.is_some()))
    }

    /// Seed default configuration on a fresh database. Existing rows are left
    /// alone; returns whether anything was seeded.
    pub fn initialize(&self) -> Result<bool> {
        self.with_transaction(|tx| {
            let mut seeded = false;
            if Operator::load(tx)?.is_none() {
                default_operator().upsert(tx)?;
                seeded = true;
            }
            if entities::load_nat_enabled(tx)?.is_none() {
                entities::upsert_nat_enabled(tx, true)?;
                seeded = true;
            }
            let dn_id = match DataNetwork::by_name(tx, defaults::DATA_NETWORK_NAME)? {
                Some(dn) => dn.id,
                None => {
                    seeded = true;
                    DataNetwork {
                        id: 0,
                        name: defaults::DATA_NETWORK_NAME.to_string(),
                        ip_pool: defaults::DATA_NETWORK_IP_POOL.to_string(),
                        dns: defaults::DATA_NETWORK_DNS.to_string(),
                        mtu: defaults::DATA_NETWORK_MTU,
                    }
                    .insert(tx)?
                }
            };
            if Policy::by_name(tx, defaults::POLICY_NAME)?.is_none() {
                Policy {
                    id: 0,
                    name: defaults::POLICY_NAME.to_string(),
                    bitrate_uplink: defaults::POLICY_BITRATE.to_string(),
                    bitrate_downlink: defaults::POLICY_BITRATE.to_string(),
                    var5qi: defaults::POLICY_VAR5QI,
                    arp: defaults::POLICY_ARP,
                    data_network_id: dn_id,
                }
                .insert(tx)?;
                seeded = true;
            }
            let policies_seeded = retention::initialize_defaults(tx)?;
            if seeded || policies_seeded > 0 {
                info!(retention_policies = policies_seeded, "store initialized with defaults");
            }
            Ok(seeded || policies_seeded > 0)
        })
    }

    // =========================================================================
    // Configuration reads
    // =========================================================================

    pub fn operator(&self) -> Result<Operator> {
        self.with_conn(|conn| {
            Operator::load(conn)?.ok_or_else(|| Error::NotFound {
                entity: "operator",
                key: "1".to_string(),
            })
        })
    }

    pub fn nat_enabled(&self) -> Result<bool> {
        self.with_conn(|conn| Ok(entities::load_nat_enabled(conn)?.unwrap_or(true)))
    }

    pub fn n3_external_address(&self) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(entities::load_n3_external_address(conn)?.filter(|a| !a.is_empty()))
        })
    }

    pub fn data_network(&self, name: &str) -> Result<DataNetwork> {
        self.with_conn(|conn| NaturalKeyResolver::new(conn).data_network(name))
    }

    pub fn data_networks(&self) -> Result<Vec<DataNetwork>> {
        self.with_conn(DataNetwork::list)
    }

    pub fn policy(&self, name: &str) -> Result<Policy> {
        self.with_conn(|conn| NaturalKeyResolver::new(conn).policy(name))
    }

    pub fn policies(&self) -> Result<Vec<Policy>> {
        self.with_conn(Policy::list)
    }

    pub fn subscriber(&self, imsi: &str) -> Result<Subscriber> {
        self.with_conn(|conn| NaturalKeyResolver::new(conn).subscriber(imsi))
    }

    pub fn subscribers(&self) -> Result<Vec<Subscriber>> {
        self.with_conn(Subscriber::list)
    }

    pub fn routes(&self) -> Result<Vec<Route>> {
        self.with_conn(Route::list)
    }

    /// Record the address allocated to a subscriber's session.
    pub fn set_subscriber_ip_address(&self, imsi: &str, ip: Option<&str>) -> Result<()> {
        self.with_conn(|conn| Subscriber::set_ip_address(conn, imsi, ip))
    }

    /// Persist the authentication sequence number after a run of AKA.
    pub fn set_subscriber_sequence_number(&self, imsi: &str, sqn: &str) -> Result<()> {
        if sqn.len() != INITIAL_SEQUENCE_NUMBER.len() {
            return Err(Error::Validation(format!(
                "sequence number must be {} hex digits",
                INITIAL_SEQUENCE_NUMBER.len()
            )));
        }
        self.with_conn(|conn| Subscriber::set_sequence_number(conn, imsi, sqn))
    }

    /// Configured retention days for every category.
    pub fn retention_overview(&self) -> Result<Vec<(RetentionCategory, u32)>> {
        self.with_conn(|conn| {
            RetentionCategory::ALL
                .iter()
                .map(|&c| Ok((c, retention::retention_days(conn, c)?)))
                .collect()
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

fn default_operator() -> Operator {
    Operator {
        mcc: defaults::MCC.to_string(),
        mnc: defaults::MNC.to_string(),
        operator_code: hex::encode(rand::random::<[u8; 16]>()),
        supported_tacs: vec![defaults::TAC.to_string()],
        sst: defaults::SST,
        sd: Some(defaults::SD.to_vec()),
        home_network_private_key: hex::encode(rand::random::<[u8; 32]>()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_seeds_once() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.is_initialized().unwrap());
        assert!(store.initialize().unwrap());
        assert!(store.is_initialized().unwrap());

        let op = store.operator().unwrap();
        assert_eq!(op.mcc, "001");
        assert_eq!(op.operator_code.len(), 32);
        assert_eq!(op.home_network_private_key.len(), 64);
        assert_eq!(op.sd, Some(vec![0x10, 0x20, 0x30]));

        let policy = store.policy("default").unwrap();
        let dn = store.data_network("internet").unwrap();
        assert_eq!(policy.data_network_id, dn.id);
        assert!(store.nat_enabled().unwrap());

        assert!(!store.initialize().unwrap());
        assert_eq!(store.operator().unwrap().operator_code, op.operator_code);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<()> = store.with_transaction(|tx| {
            entities::upsert_nat_enabled(tx, false)?;
            Err(Error::Validation("abort".into()))
        });
        assert!(result.is_err());
        store
            .with_conn(|conn| {
                assert_eq!(entities::load_nat_enabled(conn)?, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn opens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.db");
        {
            let store = Store::open(&path).unwrap();
            store.initialize().unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(store.is_initialized().unwrap());
    }

    #[test]
    fn sequence_number_length_checked() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .set_subscriber_sequence_number("001010100007487", "1")
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn retention_overview_lists_every_category() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| retention::set_retention_days(conn, RetentionCategory::Audit, 30))
            .unwrap();
        let overview = store.retention_overview().unwrap();
        assert_eq!(overview.len(), RetentionCategory::ALL.len());
        assert!(overview.contains(&(RetentionCategory::Audit, 30)));
        assert!(overview.contains(&(RetentionCategory::Radio, 7)));
        assert!(overview.contains(&(RetentionCategory::Usage, 365)));
    }

    #[test]
    fn missing_operator_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.operator().unwrap_err().is_not_found());
    }
}
