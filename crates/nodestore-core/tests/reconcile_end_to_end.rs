//! End-to-end reconciliation against an on-disk store.
//!
//! Verified properties:
//!
//! A. A subscriber's fleet policy ID resolves to the local policy's surrogate ID
//! B. Removing a subscriber from the next snapshot deletes exactly that row
//! C. Removing a policy and its subscribers in one snapshot never cascades into
//!    rows the snapshot keeps, and keeps usage of surviving subscribers
//! C2. Removing a data network together with the policy that references it
//!    succeeds in one pass
//! D. A dangling fleet reference rolls the whole pass back
//! E. Revisions survive reopening the database

use std::sync::Arc;

use nodestore_core::desired::{
    DesiredDataNetwork, DesiredOperator, DesiredPolicy, DesiredState, DesiredSubscriber,
    HomeNetwork, OperatorId, Slice, Tracking,
};
use nodestore_core::usage::DailyUsage;
use nodestore_core::{DayRange, Error, MetricRegistry, Reconciler, Store, UsageAggregator};

const IMSI: &str = "001010100007487";

fn key(c: char) -> String {
    std::iter::repeat_n(c, 32).collect()
}

fn base_snapshot() -> DesiredState {
    let mut desired = DesiredState {
        operator: DesiredOperator {
            id: OperatorId {
                mcc: "001".into(),
                mnc: "01".into(),
            },
            slice: Slice {
                sst: 1,
                sd: Some(vec![0x10, 0x20, 0x30]),
            },
            operator_code: key('a'),
            tracking: Tracking {
                supported_tacs: vec!["000001".into()],
            },
            home_network: HomeNetwork {
                private_key: "c09c17bddf23357f614f492075b970d825767718114f59554ce2f345cf8c4b6a".into(),
            },
        },
        ..DesiredState::default()
    };
    desired.networking.nat = true;
    desired.networking.data_networks = vec![DesiredDataNetwork {
        id: 100,
        name: "internet".into(),
        ip_pool: "10.45.0.0/22".into(),
        dns: "8.8.8.8".into(),
        mtu: 1400,
    }];
    desired.policies = vec![policy(200, "default")];
    desired
}

fn policy(id: i64, name: &str) -> DesiredPolicy {
    DesiredPolicy {
        id,
        name: name.into(),
        bitrate_uplink: "200 Mbps".into(),
        bitrate_downlink: "200 Mbps".into(),
        var5qi: 9,
        arp: 1,
        data_network_id: 100,
    }
}

fn subscriber(id: i64, imsi: &str, policy_id: i64) -> DesiredSubscriber {
    DesiredSubscriber {
        id,
        imsi: imsi.into(),
        sequence_number: "000000000042".into(),
        permanent_key: key('1'),
        opc: key('2'),
        policy_id,
    }
}

fn open(dir: &tempfile::TempDir) -> (Arc<Store>, Reconciler) {
    let store = Arc::new(Store::open(dir.path().join("core.db")).unwrap());
    let reconciler = Reconciler::new(Arc::clone(&store), Arc::new(MetricRegistry::new()));
    (store, reconciler)
}

#[test]
fn subscriber_added_then_removed() {
    let dir = tempfile::tempdir().unwrap();
    let (store, reconciler) = open(&dir);

    reconciler.apply(&base_snapshot()).unwrap();
    let mut with_sub = base_snapshot();
    with_sub.subscribers = vec![subscriber(300, IMSI, 200)];
    let report = reconciler.apply(&with_sub).unwrap();
    assert_eq!(report.subscribers.created, 1);

    let local_policy = store.policy("default").unwrap();
    let sub = store.subscriber(IMSI).unwrap();
    assert_eq!(sub.policy_id, local_policy.id);
    assert_eq!(sub.sequence_number, "000000000000");

    let before_dns = store.data_networks().unwrap();
    let report = reconciler.apply(&base_snapshot()).unwrap();
    assert_eq!(report.subscribers.deleted, 1);
    assert_eq!(report.total_writes(), 1);
    assert!(store.subscribers().unwrap().is_empty());
    assert_eq!(store.policies().unwrap(), vec![local_policy]);
    assert_eq!(store.data_networks().unwrap(), before_dns);
}

#[test]
fn policy_removal_keeps_surviving_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (store, reconciler) = open(&dir);
    let keep = "001010100000001";
    let gone = "001010100000002";

    let mut first = base_snapshot();
    first.policies.push(policy(201, "legacy"));
    first.subscribers = vec![subscriber(300, keep, 201), subscriber(301, gone, 201)];
    reconciler.apply(&first).unwrap();

    store.set_subscriber_ip_address(keep, Some("10.45.0.7")).unwrap();
    let usage = UsageAggregator::new(Arc::clone(&store), Arc::new(MetricRegistry::new()));
    usage
        .increment_daily_usage(&DailyUsage {
            epoch_day: 20741,
            imsi: keep.into(),
            bytes_uplink: 1000,
            bytes_downlink: 2000,
        })
        .unwrap();

    // `keep` moves to `default`; `legacy` and `gone` disappear.
    let mut second = base_snapshot();
    second.subscribers = vec![subscriber(300, keep, 200)];
    let report = reconciler.apply(&second).unwrap();
    assert_eq!(report.policies.deleted, 1);
    assert_eq!(report.subscribers.deleted, 1);
    assert_eq!(report.subscribers.updated, 1);

    let kept = store.subscriber(keep).unwrap();
    assert_eq!(kept.policy_id, store.policy("default").unwrap().id);
    assert_eq!(kept.ip_address.as_deref(), Some("10.45.0.7"));
    assert!(matches!(store.subscriber(gone), Err(Error::NotFound { .. })));
    assert!(matches!(store.policy("legacy"), Err(Error::NotFound { .. })));

    let totals = usage
        .usage_per_subscriber(DayRange::single(20741), None)
        .unwrap();
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].total(), 3000);
}

#[test]
fn data_network_removed_with_its_policy() {
    let dir = tempfile::tempdir().unwrap();
    let (store, reconciler) = open(&dir);

    let mut first = base_snapshot();
    first.networking.data_networks.push(DesiredDataNetwork {
        id: 101,
        name: "iot".into(),
        ip_pool: "10.46.0.0/22".into(),
        dns: "1.1.1.1".into(),
        mtu: 1400,
    });
    first.policies.push(DesiredPolicy {
        data_network_id: 101,
        ..policy(201, "iot-sensors")
    });
    let report = reconciler.apply(&first).unwrap();
    assert_eq!(report.data_networks.created, 2);
    assert_eq!(report.policies.created, 2);
    let iot = store.data_network("iot").unwrap();
    assert_eq!(store.policy("iot-sensors").unwrap().data_network_id, iot.id);

    let report = reconciler.apply(&base_snapshot()).unwrap();
    assert_eq!(report.policies.deleted, 1);
    assert_eq!(report.data_networks.deleted, 1);

    let dns: Vec<_> = store.data_networks().unwrap().into_iter().map(|d| d.name).collect();
    assert_eq!(dns, vec!["internet".to_string()]);
    let policies: Vec<_> = store.policies().unwrap().into_iter().map(|p| p.name).collect();
    assert_eq!(policies, vec!["default".to_string()]);
    assert_eq!(
        store.policy("default").unwrap().data_network_id,
        store.data_network("internet").unwrap().id
    );
}

#[test]
fn dangling_reference_leaves_state_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (store, reconciler) = open(&dir);
    let mut first = base_snapshot();
    first.subscribers = vec![subscriber(300, IMSI, 200)];
    reconciler.apply(&first).unwrap();
    let before = store.subscribers().unwrap();

    let mut bad = base_snapshot();
    bad.policies.push(policy(202, "gold"));
    bad.subscribers = vec![subscriber(301, "001010100000009", 999)];
    let err = reconciler.apply(&bad).unwrap_err();
    assert!(err.is_dangling_reference(), "unexpected error: {err}");

    assert_eq!(store.subscribers().unwrap(), before);
    assert!(matches!(store.policy("gold"), Err(Error::NotFound { .. })));
}

#[test]
fn revision_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (_, reconciler) = open(&dir);
        reconciler.apply_revision(&base_snapshot(), 17).unwrap();
    }
    let (store, reconciler) = open(&dir);
    let status = reconciler.sync_status().unwrap().unwrap();
    assert_eq!(status.config_revision, 17);
    assert!(store.nat_enabled().unwrap());
    assert!(reconciler.apply(&base_snapshot()).unwrap().is_noop());
}
