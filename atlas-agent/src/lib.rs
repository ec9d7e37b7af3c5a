//! Node agent for atlas (DaemonSet)
//!
//! Responsibilities:
//! - Watch Kubernetes nodes, ReplicaSets, services and pods
//! - Resolve container ids and network addresses to pods and workloads
//! - Keep entries of deleted pods around for a grace period
//! - Publish this node's port-forwarding rules and learn every other node's
//!   through the central config server

pub mod agent;
pub mod config;
pub mod dsf;
pub mod error;
pub mod metadata;
pub mod reconcile;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod watch;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use store::MetadataStore;
