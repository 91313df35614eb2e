//! Generic natural-key diff.
//!
//! For an entity type keyed by a natural key, [`plan`] compares the desired
//! set against the existing rows and yields creates, updates and deletes. The
//! plan is pure; [`SyncPlan::apply_upserts`] and [`SyncPlan::apply_deletes`]
//! execute it so the reconciler can run deletes after every dependent stage.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::entities::{
    self, DataNetwork, Operator, Policy, Route, RouteInterface, Subscriber,
};
use crate::error::{Error, Result};

/// An entity the reconciler can diff by natural key.
pub trait SyncEntity: Sized {
    type Key: Eq + Hash + Clone + fmt::Debug;

    /// Entity name used in errors and logs.
    const KIND: &'static str;

    fn natural_key(&self) -> Self::Key;

    /// Whether `self` (desired) differs from `current` in any remotely owned
    /// field.
    fn differs_from(&self, current: &Self) -> bool;

    fn load_all(conn: &Connection) -> Result<Vec<Self>>;

    fn insert(&self, conn: &Connection) -> Result<()>;

    fn update(&self, current: &Self, conn: &Connection) -> Result<()>;

    /// Delete the stored row `self`.
    fn delete(&self, conn: &Connection) -> Result<()>;
}

/// Row counts written by one synchronizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl SyncCounts {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Pending writes for one entity type.
#[derive(Debug)]
pub struct SyncPlan<T> {
    pub creates: Vec<T>,
    /// `(current, desired)` pairs.
    pub updates: Vec<(T, T)>,
    pub deletes: Vec<T>,
}

impl<T> Default for SyncPlan<T> {
    fn default() -> Self {
        Self {
            creates: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        }
    }
}

impl<T: SyncEntity> SyncPlan<T> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn apply_upserts(&self, conn: &Connection) -> Result<SyncCounts> {
        for item in &self.creates {
            item.insert(conn)?;
        }
        for (current, desired) in &self.updates {
            desired.update(current, conn)?;
        }
        Ok(SyncCounts {
            created: self.creates.len(),
            updated: self.updates.len(),
            deleted: 0,
        })
    }

    pub fn apply_deletes(&self, conn: &Connection) -> Result<usize> {
        for item in &self.deletes {
            item.delete(conn)?;
        }
        Ok(self.deletes.len())
    }
}

/// Diff `desired` against `existing` by natural key.
///
/// Deletes keep the order in which `existing` was loaded. A natural key
/// repeated within `desired` is rejected before anything is written.
pub fn plan<T: SyncEntity>(existing: Vec<T>, desired: Vec<T>) -> Result<SyncPlan<T>> {
    let index: HashMap<T::Key, usize> = existing
        .iter()
        .enumerate()
        .map(|(i, row)| (row.natural_key(), i))
        .collect();
    let mut matched = vec![false; existing.len()];
    let mut seen = HashSet::with_capacity(desired.len());
    let mut creates = Vec::new();
    let mut pending_updates = Vec::new();

    for item in desired {
        let key = item.natural_key();
        if !seen.insert(key.clone()) {
            return Err(Error::AlreadyExists {
                entity: T::KIND,
                key: format!("{key:?}"),
            });
        }
        match index.get(&key) {
            Some(&i) => {
                matched[i] = true;
                if item.differs_from(&existing[i]) {
                    pending_updates.push((i, item));
                }
            }
            None => creates.push(item),
        }
    }

    let mut slots: Vec<Option<T>> = existing.into_iter().map(Some).collect();
    let updates = pending_updates
        .into_iter()
        .filter_map(|(i, item)| slots[i].take().map(|current| (current, item)))
        .collect();
    let deletes = slots
        .into_iter()
        .zip(matched)
        .filter_map(|(slot, kept)| if kept { None } else { slot })
        .collect();

    Ok(SyncPlan {
        creates,
        updates,
        deletes,
    })
}

// =============================================================================
// Singletons
// =============================================================================

/// A one-row table that is only ever upserted.
pub trait SingletonEntity: Sized + PartialEq {
    const KIND: &'static str;

    fn load(conn: &Connection) -> Result<Option<Self>>;

    fn store(&self, conn: &Connection) -> Result<()>;
}

/// Upsert `desired` if the stored row is absent or different. Returns whether
/// a write happened.
pub fn sync_singleton<T: SingletonEntity>(conn: &Connection, desired: &T) -> Result<bool> {
    if T::load(conn)?.as_ref() == Some(desired) {
        return Ok(false);
    }
    desired.store(conn)?;
    Ok(true)
}

impl SingletonEntity for Operator {
    const KIND: &'static str = "operator";

    fn load(conn: &Connection) -> Result<Option<Self>> {
        Operator::load(conn)
    }

    fn store(&self, conn: &Connection) -> Result<()> {
        self.upsert(conn)
    }
}

/// NAT enabled flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatSetting(pub bool);

impl SingletonEntity for NatSetting {
    const KIND: &'static str = "nat";

    fn load(conn: &Connection) -> Result<Option<Self>> {
        Ok(entities::load_nat_enabled(conn)?.map(NatSetting))
    }

    fn store(&self, conn: &Connection) -> Result<()> {
        entities::upsert_nat_enabled(conn, self.0)
    }
}

/// N3 external address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct N3Setting(pub String);

impl SingletonEntity for N3Setting {
    const KIND: &'static str = "n3";

    fn load(conn: &Connection) -> Result<Option<Self>> {
        Ok(entities::load_n3_external_address(conn)?.map(N3Setting))
    }

    fn store(&self, conn: &Connection) -> Result<()> {
        entities::upsert_n3_external_address(conn, &self.0)
    }
}

// =============================================================================
// Collections
// =============================================================================

impl SyncEntity for DataNetwork {
    type Key = String;
    const KIND: &'static str = "data network";

    fn natural_key(&self) -> String {
        self.name.clone()
    }

    fn differs_from(&self, current: &Self) -> bool {
        self.ip_pool != current.ip_pool || self.dns != current.dns || self.mtu != current.mtu
    }

    fn load_all(conn: &Connection) -> Result<Vec<Self>> {
        DataNetwork::list(conn)
    }

    fn insert(&self, conn: &Connection) -> Result<()> {
        DataNetwork::insert(self, conn).map(|_| ())
    }

    fn update(&self, current: &Self, conn: &Connection) -> Result<()> {
        DataNetwork::update(self, conn, current.id)
    }

    fn delete(&self, conn: &Connection) -> Result<()> {
        DataNetwork::delete(conn, self.id)
    }
}

impl SyncEntity for Policy {
    type Key = String;
    const KIND: &'static str = "policy";

    fn natural_key(&self) -> String {
        self.name.clone()
    }

    fn differs_from(&self, current: &Self) -> bool {
        self.bitrate_uplink != current.bitrate_uplink
            || self.bitrate_downlink != current.bitrate_downlink
            || self.var5qi != current.var5qi
            || self.arp != current.arp
            || self.data_network_id != current.data_network_id
    }

    fn load_all(conn: &Connection) -> Result<Vec<Self>> {
        Policy::list(conn)
    }

    fn insert(&self, conn: &Connection) -> Result<()> {
        Policy::insert(self, conn).map(|_| ())
    }

    fn update(&self, current: &Self, conn: &Connection) -> Result<()> {
        Policy::update(self, conn, current.id)
    }

    fn delete(&self, conn: &Connection) -> Result<()> {
        Policy::delete(conn, self.id)
    }
}

impl SyncEntity for Subscriber {
    type Key = String;
    const KIND: &'static str = "subscriber";

    fn natural_key(&self) -> String {
        self.imsi.clone()
    }

    // sequence_number and ip_address are local; never compared.
    fn differs_from(&self, current: &Self) -> bool {
        self.permanent_key != current.permanent_key
            || self.opc != current.opc
            || self.policy_id != current.policy_id
    }

    fn load_all(conn: &Connection) -> Result<Vec<Self>> {
        Subscriber::list(conn)
    }

    fn insert(&self, conn: &Connection) -> Result<()> {
        Subscriber::insert(self, conn).map(|_| ())
    }

    fn update(&self, current: &Self, conn: &Connection) -> Result<()> {
        self.update_remote_fields(conn, current.id)
    }

    fn delete(&self, conn: &Connection) -> Result<()> {
        Subscriber::delete(conn, self.id)
    }
}

impl SyncEntity for Route {
    type Key = (String, String, RouteInterface, i32);
    const KIND: &'static str = "route";

    fn natural_key(&self) -> Self::Key {
        (
            self.destination.clone(),
            self.gateway.clone(),
            self.interface,
            self.metric,
        )
    }

    // Every field is part of the key.
    fn differs_from(&self, _current: &Self) -> bool {
        false
    }

    fn load_all(conn: &Connection) -> Result<Vec<Self>> {
        Route::list(conn)
    }

    fn insert(&self, conn: &Connection) -> Result<()> {
        Route::insert(self, conn).map(|_| ())
    }

    fn update(&self, _current: &Self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    fn delete(&self, conn: &Connection) -> Result<()> {
        Route::delete(conn, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::tests::test_db;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        key: u8,
        value: u8,
    }

    impl SyncEntity for Item {
        type Key = u8;
        const KIND: &'static str = "item";

        fn natural_key(&self) -> u8 {
            self.key
        }

        fn differs_from(&self, current: &Self) -> bool {
            self.value != current.value
        }

        fn load_all(_conn: &Connection) -> Result<Vec<Self>> {
            Ok(Vec::new())
        }

        fn insert(&self, _conn: &Connection) -> Result<()> {
            Ok(())
        }

        fn update(&self, _current: &Self, _conn: &Connection) -> Result<()> {
            Ok(())
        }

        fn delete(&self, _conn: &Connection) -> Result<()> {
            Ok(())
        }
    }

    fn items(pairs: &[(u8, u8)]) -> Vec<Item> {
        pairs
            .iter()
            .map(|&(key, value)| Item { key, value })
            .collect()
    }

    #[test]
    fn plan_classifies_create_update_delete() {
        let plan = plan(items(&[(1, 1), (2, 2), (3, 3)]), items(&[(2, 2), (3, 9), (4, 4)])).unwrap();
        assert_eq!(plan.creates, items(&[(4, 4)]));
        assert_eq!(plan.updates, vec![(Item { key: 3, value: 3 }, Item { key: 3, value: 9 })]);
        assert_eq!(plan.deletes, items(&[(1, 1)]));
    }

    #[test]
    fn identical_sets_plan_nothing() {
        let set = items(&[(1, 1), (2, 2)]);
        assert!(plan(set.clone(), set).unwrap().is_empty());
    }

    #[test]
    fn duplicate_desired_key_rejected() {
        let err = plan(Vec::new(), items(&[(1, 1), (1, 2)])).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { entity: "item", .. }));
    }

    #[test]
    fn route_never_updates() {
        let route = Route {
            id: 4,
            destination: "10.0.0.0/8".into(),
            gateway: "10.1.1.1".into(),
            interface: RouteInterface::N3,
            metric: 5,
        };
        let plan = plan(vec![route.clone()], vec![Route { id: 0, ..route }]).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn singleton_write_only_on_change() {
        let conn = test_db();
        assert!(sync_singleton(&conn, &NatSetting(true)).unwrap());
        assert!(!sync_singleton(&conn, &NatSetting(true)).unwrap());
        assert!(sync_singleton(&conn, &NatSetting(false)).unwrap());
        assert!(sync_singleton(&conn, &N3Setting("192.0.2.1".into())).unwrap());
        assert!(!sync_singleton(&conn, &N3Setting("192.0.2.1".into())).unwrap());
    }

    proptest! {
        #[test]
        fn plan_partitions_keys(
            existing in proptest::collection::btree_map(any::<u8>(), any::<u8>(), 0..20),
            desired in proptest::collection::btree_map(any::<u8>(), any::<u8>(), 0..20),
        ) {
            let to_items = |m: &std::collections::BTreeMap<u8, u8>| {
                m.iter().map(|(&key, &value)| Item { key, value }).collect::<Vec<_>>()
            };
            let plan = plan(to_items(&existing), to_items(&desired)).unwrap();

            for item in &plan.creates {
                prop_assert!(!existing.contains_key(&item.key));
            }
            for (current, wanted) in &plan.updates {
                prop_assert_eq!(current.key, wanted.key);
                prop_assert_ne!(current.value, wanted.value);
            }
            for item in &plan.deletes {
                prop_assert!(!desired.contains_key(&item.key));
            }
            let expected_deletes = existing.keys().filter(|k| !desired.contains_key(k)).count();
            prop_assert_eq!(plan.deletes.len(), expected_deletes);
            let expected_creates = desired.keys().filter(|k| !existing.contains_key(k)).count();
            prop_assert_eq!(plan.creates.len(), expected_creates);
        }
    }
}
