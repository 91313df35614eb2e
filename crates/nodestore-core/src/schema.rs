//! SQLite schema and fixed table names.
//!
//! Every statement in the crate names its table through these constants or
//! through literal SQL; no caller-supplied string is ever spliced into query
//! text.

pub const OPERATOR: &str = "operator";
pub const NAT_SETTINGS: &str = "nat_settings";
pub const N3_SETTINGS: &str = "n3_settings";
pub const DATA_NETWORKS: &str = "data_networks";
pub const POLICIES: &str = "policies";
pub const SUBSCRIBERS: &str = "subscribers";
pub const ROUTES: &str = "routes";
pub const DAILY_USAGE: &str = "daily_usage";
pub const FLOW_REPORTS: &str = "flow_reports";
pub const RADIO_EVENTS: &str = "radio_events";
pub const NETWORK_LOGS: &str = "network_logs";
pub const SUBSCRIBER_LOGS: &str = "subscriber_logs";
pub const AUDIT_LOGS: &str = "audit_logs";
pub const RETENTION_POLICIES: &str = "retention_policies";
pub const FLEET_SYNC: &str = "fleet_sync";

/// Connection pragmas applied on every open. `busy_timeout` is set separately
/// from configuration.
pub const PRAGMAS_SQL: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
";

pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS operator (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    mcc TEXT NOT NULL,
    mnc TEXT NOT NULL,
    operator_code TEXT NOT NULL,
    supported_tacs TEXT NOT NULL DEFAULT '[]',
    sst INTEGER NOT NULL,
    sd BLOB,
    home_network_private_key TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nat_settings (
    singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
    enabled BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS n3_settings (
    singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
    external_address TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS fleet_sync (
    singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
    config_revision INTEGER NOT NULL DEFAULT 0,
    last_sync_at TEXT
);

CREATE TABLE IF NOT EXISTS data_networks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    ip_pool TEXT NOT NULL,
    dns TEXT NOT NULL,
    mtu INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    bitrate_uplink TEXT NOT NULL,
    bitrate_downlink TEXT NOT NULL,
    var5qi INTEGER NOT NULL,
    arp INTEGER NOT NULL,
    data_network_id INTEGER NOT NULL,
    FOREIGN KEY (data_network_id) REFERENCES data_networks (id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS subscribers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    imsi TEXT NOT NULL UNIQUE
        CHECK (length(imsi) BETWEEN 6 AND 15 AND imsi NOT GLOB '*[^0-9]*'),
    ip_address TEXT UNIQUE,
    sequence_number TEXT NOT NULL CHECK (length(sequence_number) = 12),
    permanent_key TEXT NOT NULL CHECK (length(permanent_key) = 32),
    opc TEXT NOT NULL CHECK (length(opc) = 32),
    policy_id INTEGER NOT NULL,
    FOREIGN KEY (policy_id) REFERENCES policies (id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS routes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    destination TEXT NOT NULL,
    gateway TEXT NOT NULL,
    interface TEXT NOT NULL CHECK (interface IN ('n3', 'n6')),
    metric INTEGER NOT NULL,
    UNIQUE (destination, gateway, interface, metric)
);

CREATE TABLE IF NOT EXISTS daily_usage (
    epoch_day INTEGER NOT NULL,
    imsi TEXT NOT NULL,
    bytes_uplink INTEGER NOT NULL DEFAULT 0 CHECK (bytes_uplink >= 0),
    bytes_downlink INTEGER NOT NULL DEFAULT 0 CHECK (bytes_downlink >= 0),
    PRIMARY KEY (epoch_day, imsi),
    FOREIGN KEY (imsi) REFERENCES subscribers (imsi) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS flow_reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subscriber_id TEXT NOT NULL,
    source_ip TEXT NOT NULL,
    destination_ip TEXT NOT NULL,
    source_port INTEGER NOT NULL DEFAULT 0,
    destination_port INTEGER NOT NULL DEFAULT 0,
    protocol INTEGER NOT NULL,
    packets INTEGER NOT NULL DEFAULT 0,
    bytes INTEGER NOT NULL DEFAULT 0,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    FOREIGN KEY (subscriber_id) REFERENCES subscribers (imsi) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_flow_reports_end_time ON flow_reports (end_time);
CREATE INDEX IF NOT EXISTS idx_flow_reports_subscriber ON flow_reports (subscriber_id);

CREATE TABLE IF NOT EXISTS radio_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    protocol TEXT NOT NULL,
    message_type TEXT NOT NULL,
    direction TEXT NOT NULL,
    local_address TEXT NOT NULL DEFAULT '',
    remote_address TEXT NOT NULL DEFAULT '',
    raw BLOB NOT NULL,
    details TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_radio_events_timestamp ON radio_events (timestamp);

CREATE TABLE IF NOT EXISTS network_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    protocol TEXT NOT NULL,
    message_type TEXT NOT NULL,
    direction TEXT NOT NULL,
    local_address TEXT NOT NULL DEFAULT '',
    remote_address TEXT NOT NULL DEFAULT '',
    raw BLOB NOT NULL,
    details TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_network_logs_timestamp ON network_logs (timestamp);

CREATE TABLE IF NOT EXISTS subscriber_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    imsi TEXT NOT NULL,
    event TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_subscriber_logs_timestamp ON subscriber_logs (timestamp);

CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    ip TEXT NOT NULL DEFAULT '',
    details TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs (timestamp);

CREATE TABLE IF NOT EXISTS retention_policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL UNIQUE,
    retention_days INTEGER NOT NULL CHECK (retention_days >= 1)
);
";
