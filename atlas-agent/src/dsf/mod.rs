//! Distributed port-forwarding (DSF) rules
//!
//! Each agent publishes the host ports its own containers are reachable on
//! and learns everyone else's through the central config server, so traffic
//! addressed to `node_ip:public_port` anywhere in the cluster can be traced
//! back to a container.

mod client;
mod rule_map;
mod sync;

pub use client::{ConfigServer, HttpConfigServer};
pub use rule_map::{DsfRuleMap, RuleQueue, RuleTarget, RuleUpdate};
pub use sync::RuleSynchronizer;
