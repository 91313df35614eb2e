//! Fleet ID → local ID translation.
//!
//! The fleet numbers its rows independently of this database. A reference is
//! resolved in two hops: fleet ID → natural key (from the snapshot itself),
//! then natural key → local surrogate ID (from storage). Either hop missing is
//! a [`Error::DanglingReference`]; nothing is skipped or defaulted.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::desired::DesiredState;
use crate::error::{Error, Result};
use crate::resolver::NaturalKeyResolver;

#[derive(Debug)]
struct ReferenceMap {
    target: &'static str,
    fleet_to_name: HashMap<i64, String>,
    name_to_local: HashMap<String, i64>,
}

impl ReferenceMap {
    fn new(target: &'static str, fleet_to_name: HashMap<i64, String>) -> Self {
        Self {
            target,
            fleet_to_name,
            name_to_local: HashMap::new(),
        }
    }

    fn resolve(&self, owner: &'static str, owner_key: &str, fleet_id: i64) -> Result<i64> {
        let Some(name) = self.fleet_to_name.get(&fleet_id) else {
            return Err(Error::DanglingReference {
                entity: owner,
                key: owner_key.to_string(),
                reference: format!("unknown fleet {} id {fleet_id}", self.target),
            });
        };
        self.name_to_local
            .get(name)
            .copied()
            .ok_or_else(|| Error::DanglingReference {
                entity: owner,
                key: owner_key.to_string(),
                reference: format!("{} {name:?} which does not exist locally", self.target),
            })
    }
}

/// Per-pass translator for the two cross-entity references in a snapshot.
///
/// The fleet side is fixed at construction. The local side is bound from
/// storage after the stage that creates the referenced rows, so references
/// to rows created earlier in the same pass resolve.
#[derive(Debug)]
pub struct IdRemapper {
    data_networks: ReferenceMap,
    policies: ReferenceMap,
}

fn fleet_index<'a>(
    entity: &'static str,
    rows: impl Iterator<Item = (i64, &'a str)>,
) -> Result<HashMap<i64, String>> {
    let mut index = HashMap::new();
    for (fleet_id, name) in rows {
        if index.insert(fleet_id, name.to_string()).is_some() {
            return Err(Error::AlreadyExists {
                entity,
                key: format!("fleet id {fleet_id}"),
            });
        }
    }
    Ok(index)
}

impl IdRemapper {
    /// Index the snapshot's fleet IDs. Two rows sharing a fleet ID make every
    /// reference to it ambiguous, so that is rejected.
    pub fn new(desired: &DesiredState) -> Result<Self> {
        let dn = fleet_index(
            "data network",
            desired
                .networking
                .data_networks
                .iter()
                .map(|d| (d.id, d.name.as_str())),
        )?;
        let policies = fleet_index(
            "policy",
            desired.policies.iter().map(|p| (p.id, p.name.as_str())),
        )?;
        Ok(Self {
            data_networks: ReferenceMap::new("data network", dn),
            policies: ReferenceMap::new("policy", policies),
        })
    }

    /// Load local data network IDs by name.
    pub fn bind_data_networks(&mut self, conn: &Connection) -> Result<()> {
        self.data_networks.name_to_local = NaturalKeyResolver::new(conn).data_network_ids()?;
        Ok(())
    }

    /// Load local policy IDs by name.
    pub fn bind_policies(&mut self, conn: &Connection) -> Result<()> {
        self.policies.name_to_local = NaturalKeyResolver::new(conn).policy_ids()?;
        Ok(())
    }

    /// Local data network ID for a policy's fleet reference.
    pub fn data_network_id(&self, policy_name: &str, fleet_id: i64) -> Result<i64> {
        self.data_networks.resolve("policy", policy_name, fleet_id)
    }

    /// Local policy ID for a subscriber's fleet reference.
    pub fn policy_id(&self, imsi: &str, fleet_id: i64) -> Result<i64> {
        self.policies.resolve("subscriber", imsi, fleet_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::{DesiredDataNetwork, DesiredPolicy};
    use crate::entities::DataNetwork;
    use crate::entities::tests::test_db;

    fn snapshot() -> DesiredState {
        let mut state = DesiredState::default();
        state.networking.data_networks.push(DesiredDataNetwork {
            id: 100,
            name: "internet".into(),
            ip_pool: "10.45.0.0/22".into(),
            dns: "8.8.8.8".into(),
            mtu: 1400,
        });
        state.policies.push(DesiredPolicy {
            id: 200,
            name: "default".into(),
            bitrate_uplink: "200 Mbps".into(),
            bitrate_downlink: "200 Mbps".into(),
            var5qi: 9,
            arp: 1,
            data_network_id: 100,
        });
        state
    }

    #[test]
    fn resolves_through_natural_key() {
        let conn = test_db();
        // Burn a row so local IDs diverge from fleet IDs.
        conn.execute_batch(
            "INSERT INTO data_networks (name, ip_pool, dns, mtu) VALUES ('tmp', 'x', 'y', 1);
             DELETE FROM data_networks;",
        )
        .unwrap();
        let local = DataNetwork {
            id: 0,
            name: "internet".into(),
            ip_pool: "10.45.0.0/22".into(),
            dns: "8.8.8.8".into(),
            mtu: 1400,
        }
        .insert(&conn)
        .unwrap();
        assert_ne!(local, 100);

        let mut remap = IdRemapper::new(&snapshot()).unwrap();
        remap.bind_data_networks(&conn).unwrap();
        assert_eq!(remap.data_network_id("default", 100).unwrap(), local);
    }

    #[test]
    fn unknown_fleet_id_is_dangling() {
        let remap = IdRemapper::new(&snapshot()).unwrap();
        let err = remap.data_network_id("gold", 7).unwrap_err();
        match err {
            Error::DanglingReference {
                entity,
                key,
                reference,
            } => {
                assert_eq!(entity, "policy");
                assert_eq!(key, "gold");
                assert!(reference.contains("fleet data network id 7"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unbound_name_is_dangling() {
        let conn = test_db();
        let mut remap = IdRemapper::new(&snapshot()).unwrap();
        remap.bind_policies(&conn).unwrap();
        let err = remap.policy_id("001010100007487", 200).unwrap_err();
        assert!(err.to_string().contains("does not exist locally"));
    }

    #[test]
    fn duplicate_fleet_id_rejected() {
        let mut state = snapshot();
        let mut shadow = state.policies[0].clone();
        shadow.name = "gold".into();
        state.policies.push(shadow);
        let err = IdRemapper::new(&state).unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyExists { entity: "policy", ref key } if key == "fleet id 200"
        ));

        let mut state = snapshot();
        let mut shadow = state.networking.data_networks[0].clone();
        shadow.name = "iot".into();
        state.networking.data_networks.push(shadow);
        assert!(matches!(
            IdRemapper::new(&state),
            Err(Error::AlreadyExists { entity: "data network", .. })
        ));
    }
}
