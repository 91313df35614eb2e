//! Applies a fleet desired-state snapshot to the local store.
//!
//! One pass runs inside one transaction. Upserts go in dependency order
//! (operator, NAT, N3, data networks, policies, subscribers, routes); deletes
//! go last in reverse order so no `ON DELETE CASCADE` ever fires mid-pass.
//! Any error rolls the whole pass back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::desired::DesiredState;
use crate::entities::{
    DataNetwork, INITIAL_SEQUENCE_NUMBER, Operator, Policy, Route, RouteInterface, Subscriber,
};
use crate::error::{Error, Result};
use crate::metrics::{MetricRegistry, names};
use crate::remap::IdRemapper;
use crate::schema;
use crate::storage::Store;
use crate::sync::{N3Setting, NatSetting, SyncCounts, SyncEntity, plan, sync_singleton};
use crate::timestamp;

/// What one reconciliation pass wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub operator_updated: bool,
    pub nat_updated: bool,
    pub n3_updated: bool,
    pub data_networks: SyncCounts,
    pub policies: SyncCounts,
    pub subscribers: SyncCounts,
    pub routes: SyncCounts,
}

impl ReconcileReport {
    /// True when the pass changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.total_writes() == 0
    }

    #[must_use]
    pub fn total_writes(&self) -> usize {
        usize::from(self.operator_updated)
            + usize::from(self.nat_updated)
            + usize::from(self.n3_updated)
            + self.data_networks.writes()
            + self.policies.writes()
            + self.subscribers.writes()
            + self.routes.writes()
    }
}

/// Last fleet revision applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub config_revision: i64,
    pub last_sync_at: Option<String>,
}

/// Drives reconciliation passes against a shared [`Store`].
pub struct Reconciler {
    store: Arc<Store>,
    metrics: Arc<MetricRegistry>,
}

impl Reconciler {
    #[must_use]
    pub fn new(store: Arc<Store>, metrics: Arc<MetricRegistry>) -> Self {
        Self { store, metrics }
    }

    /// Make local configuration match `desired`, all or nothing.
    pub fn apply(&self, desired: &DesiredState) -> Result<ReconcileReport> {
        let _span = info_span!("reconcile").entered();
        let result = self.store.with_transaction(|tx| reconcile(tx, desired));
        self.finish(result)
    }

    /// Apply `desired` and record `revision` as the last applied fleet
    /// revision in the same transaction.
    pub fn apply_revision(&self, desired: &DesiredState, revision: i64) -> Result<ReconcileReport> {
        let _span = info_span!("reconcile", revision).entered();
        let now = Utc::now();
        let result = self.store.with_transaction(|tx| {
            let report = reconcile(tx, desired)?;
            record_sync(tx, revision, now).map_err(|e| e.in_step("fleet_sync"))?;
            Ok(report)
        });
        self.finish(result)
    }

    pub fn sync_status(&self) -> Result<Option<SyncStatus>> {
        self.store.with_conn(load_sync_status)
    }

    fn finish(&self, result: Result<ReconcileReport>) -> Result<ReconcileReport> {
        match &result {
            Ok(report) => {
                self.metrics.increment_counter(names::RECONCILE_PASSES);
                if report.is_noop() {
                    debug!("desired state already applied");
                } else {
                    info!(
                        writes = report.total_writes(),
                        operator = report.operator_updated,
                        nat = report.nat_updated,
                        n3 = report.n3_updated,
                        data_networks = ?report.data_networks,
                        policies = ?report.policies,
                        subscribers = ?report.subscribers,
                        routes = ?report.routes,
                        "desired state applied"
                    );
                }
            }
            Err(err) => {
                self.metrics.increment_counter(names::RECONCILE_FAILURES);
                warn!(error = %err, "reconcile rolled back");
            }
        }
        result
    }
}

/// Run one pass against an open transaction (or bare connection in tests).
pub fn reconcile(conn: &Connection, desired: &DesiredState) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut remap = IdRemapper::new(desired).map_err(|e| e.in_step("fleet_ids"))?;

    report.operator_updated =
        sync_singleton(conn, &desired_operator(desired)).map_err(|e| e.in_step("operator"))?;
    report.nat_updated = sync_singleton(conn, &NatSetting(desired.networking.nat))
        .map_err(|e| e.in_step("nat"))?;
    report.n3_updated = sync_singleton(
        conn,
        &N3Setting(
            desired
                .networking
                .network_interfaces
                .n3_external_address
                .clone(),
        ),
    )
    .map_err(|e| e.in_step("n3"))?;

    let data_networks = stage("data_networks", conn, desired_data_networks(desired))?;
    report.data_networks = data_networks.upserts;
    remap
        .bind_data_networks(conn)
        .map_err(|e| e.in_step("data_networks"))?;

    let policies = desired_policies(desired, &remap).map_err(|e| e.in_step("policies"))?;
    let policies = stage("policies", conn, policies)?;
    report.policies = policies.upserts;
    remap
        .bind_policies(conn)
        .map_err(|e| e.in_step("policies"))?;

    let subscribers =
        desired_subscribers(desired, &remap).map_err(|e| e.in_step("subscribers"))?;
    let subscribers = stage("subscribers", conn, subscribers)?;
    report.subscribers = subscribers.upserts;

    let routes = stage("routes", conn, desired_routes(desired))?;
    report.routes = routes.upserts;

    report.routes.deleted = routes.finish(conn)?;
    report.subscribers.deleted = subscribers.finish(conn)?;
    report.policies.deleted = policies.finish(conn)?;
    report.data_networks.deleted = data_networks.finish(conn)?;

    Ok(report)
}

/// A synchronizer whose upserts are applied and whose deletes are pending.
struct Stage<T: SyncEntity> {
    step: &'static str,
    plan: crate::sync::SyncPlan<T>,
    upserts: SyncCounts,
}

impl<T: SyncEntity> Stage<T> {
    fn finish(self, conn: &Connection) -> Result<usize> {
        self.plan
            .apply_deletes(conn)
            .map_err(|e| e.in_step(self.step))
    }
}

fn stage<T: SyncEntity>(step: &'static str, conn: &Connection, desired: Vec<T>) -> Result<Stage<T>> {
    let run = || -> Result<Stage<T>> {
        let existing = T::load_all(conn)?;
        let plan = plan(existing, desired)?;
        let upserts = plan.apply_upserts(conn)?;
        Ok(Stage {
            step,
            plan,
            upserts,
        })
    };
    let stage = run().map_err(|e| e.in_step(step))?;
    debug!(
        step,
        created = stage.upserts.created,
        updated = stage.upserts.updated,
        pending_deletes = stage.plan.deletes.len(),
        "stage planned"
    );
    Ok(stage)
}

fn desired_operator(desired: &DesiredState) -> Operator {
    let op = &desired.operator;
    Operator {
        mcc: op.id.mcc.clone(),
        mnc: op.id.mnc.clone(),
        operator_code: op.operator_code.clone(),
        supported_tacs: op.tracking.supported_tacs.clone(),
        sst: op.slice.sst,
        sd: op.slice.sd.clone(),
        home_network_private_key: op.home_network.private_key.clone(),
    }
}

fn desired_data_networks(desired: &DesiredState) -> Vec<DataNetwork> {
    desired
        .networking
        .data_networks
        .iter()
        .map(|d| DataNetwork {
            id: 0,
            name: d.name.clone(),
            ip_pool: d.ip_pool.clone(),
            dns: d.dns.clone(),
            mtu: d.mtu,
        })
        .collect()
}

fn desired_policies(desired: &DesiredState, remap: &IdRemapper) -> Result<Vec<Policy>> {
    desired
        .policies
        .iter()
        .map(|p| {
            Ok(Policy {
                id: 0,
                name: p.name.clone(),
                bitrate_uplink: p.bitrate_uplink.clone(),
                bitrate_downlink: p.bitrate_downlink.clone(),
                var5qi: p.var5qi,
                arp: p.arp,
                data_network_id: remap.data_network_id(&p.name, p.data_network_id)?,
            })
        })
        .collect()
}

fn desired_subscribers(desired: &DesiredState, remap: &IdRemapper) -> Result<Vec<Subscriber>> {
    desired
        .subscribers
        .iter()
        .map(|s| {
            Ok(Subscriber {
                id: 0,
                imsi: s.imsi.clone(),
                ip_address: None,
                sequence_number: INITIAL_SEQUENCE_NUMBER.to_string(),
                permanent_key: s.permanent_key.clone(),
                opc: s.opc.clone(),
                policy_id: remap.policy_id(&s.imsi, s.policy_id)?,
            })
        })
        .collect()
}

fn desired_routes(desired: &DesiredState) -> Vec<Route> {
    desired
        .networking
        .routes
        .iter()
        .map(|r| Route {
            id: 0,
            destination: r.destination.clone(),
            gateway: r.gateway.clone(),
            interface: RouteInterface::from_fleet(&r.interface),
            metric: r.metric,
        })
        .collect()
}

fn record_sync(conn: &Connection, revision: i64, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO fleet_sync (singleton, config_revision, last_sync_at) VALUES (TRUE, ?1, ?2)
         ON CONFLICT(singleton) DO UPDATE SET
            config_revision = excluded.config_revision,
            last_sync_at = excluded.last_sync_at",
        rusqlite::params![revision, timestamp::to_storage(now)],
    )
    .map_err(|source| Error::Write {
        table: schema::FLEET_SYNC,
        source,
    })?;
    Ok(())
}

fn load_sync_status(conn: &Connection) -> Result<Option<SyncStatus>> {
    conn.query_row(
        "SELECT config_revision, last_sync_at FROM fleet_sync",
        [],
        |row| {
            Ok(SyncStatus {
                config_revision: row.get(0)?,
                last_sync_at: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(Error::query(schema::FLEET_SYNC))
}
