//! Shared types between atlas agents and the central config server
//!
//! This crate defines the wire form of the rule-synchronization protocol:
//! - `Rule`: one (node IP, public port) -> container mapping
//! - `SyncRequest` / `SyncResponse`: the init and update exchanges
//! - `Response`: the envelope the config server wraps every answer in
//!
//! Field names are camelCase on the wire.

mod rule_map;

pub use rule_map::{RuleMap, RuleValue};

use serde::{Deserialize, Serialize};

/// Key of a rule: a port published on a node
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleKey {
    pub node_ip: String,
    pub public_port: u32,
}

impl RuleKey {
    pub fn new(node_ip: impl Into<String>, public_port: u32) -> Self {
        Self {
            node_ip: node_ip.into(),
            public_port,
        }
    }
}

/// The container a published port forwards to
///
/// `is_deleted` marks a removal: applying such a rule drops the key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerNetInfo {
    pub container_id: String,
    pub private_port: u32,
    #[serde(default)]
    pub is_deleted: bool,
}

impl ContainerNetInfo {
    pub fn new(container_id: impl Into<String>, private_port: u32) -> Self {
        Self {
            container_id: container_id.into(),
            private_port,
            is_deleted: false,
        }
    }

    /// A removal marker for whatever is currently published on a key
    pub fn deleted() -> Self {
        Self {
            is_deleted: true,
            ..Default::default()
        }
    }
}

/// One rule as exchanged with the config server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub key: RuleKey,
    pub container: ContainerNetInfo,
}

impl Rule {
    pub fn new(key: RuleKey, container: ContainerNetInfo) -> Self {
        Self { key, container }
    }

    /// A rule removing `key`
    pub fn deletion(key: RuleKey) -> Self {
        Self {
            key,
            container: ContainerNetInfo::deleted(),
        }
    }
}

/// Request body of both the init and the update exchange
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub host_ip: String,
    #[serde(default)]
    pub update_rule: Vec<Rule>,
    pub last_update_timestamp: i64,
}

/// Payload of a successful exchange
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub results: Vec<Rule>,
    pub need_init: bool,
    pub update_timestamp: i64,
}

/// Envelope wrapping every config server answer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response<T> {
    pub msg: String,
    pub code: i32,
    pub data: T,
}

/// Envelope code of a successful answer
pub const CODE_OK: i32 = 200;

impl<T> Response<T> {
    pub fn ok(data: T) -> Self {
        Self {
            msg: "success".to_string(),
            code: CODE_OK,
            data,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Default HTTP paths of the two exchanges
pub mod endpoints {
    pub const INIT: &str = "/dsf/init";
    pub const UPDATE: &str = "/dsf/update";
}
