//! Desired-state snapshot pushed by the fleet controller.
//!
//! Every `id` in here is fleet-scoped. Cross references (`data_network_id`,
//! `policy_id`) point at other fleet IDs in the same snapshot and must be
//! translated through [`crate::remap::IdRemapper`] before they touch storage.

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredState {
    pub operator: DesiredOperator,
    pub networking: DesiredNetworking,
    pub policies: Vec<DesiredPolicy>,
    pub subscribers: Vec<DesiredSubscriber>,
}

impl DesiredState {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredOperator {
    pub id: OperatorId,
    pub slice: Slice,
    pub operator_code: String,
    pub tracking: Tracking,
    pub home_network: HomeNetwork,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorId {
    pub mcc: String,
    pub mnc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Slice {
    pub sst: i32,
    /// Slice differentiator bytes, base64 on the wire.
    #[serde(with = "base64_opt")]
    pub sd: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tracking {
    pub supported_tacs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeNetwork {
    pub private_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredNetworking {
    pub data_networks: Vec<DesiredDataNetwork>,
    pub routes: Vec<DesiredRoute>,
    pub nat: bool,
    pub network_interfaces: NetworkInterfaces,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterfaces {
    pub n3_external_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredDataNetwork {
    pub id: i64,
    pub name: String,
    pub ip_pool: String,
    pub dns: String,
    pub mtu: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredRoute {
    #[serde(default)]
    pub id: i64,
    pub destination: String,
    pub gateway: String,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub metric: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredPolicy {
    pub id: i64,
    pub name: String,
    pub bitrate_uplink: String,
    pub bitrate_downlink: String,
    pub var5qi: i32,
    pub arp: i32,
    pub data_network_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSubscriber {
    pub id: i64,
    pub imsi: String,
    /// Carried by the fleet for completeness; the local value always wins.
    #[serde(default)]
    pub sequence_number: String,
    pub permanent_key: String,
    pub opc: String,
    pub policy_id: i64,
}

pub(crate) mod base64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .filter(|s| !s.is_empty())
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
