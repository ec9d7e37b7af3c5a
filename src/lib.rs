//! atlas: resolve cluster network addresses to Kubernetes workloads
//!
//! - [`common`]: rule-synchronization wire types
//! - [`agent`]: the per-node metadata cache and rule map
//! - [`server`]: the central config server

pub use atlas_common as common;

#[cfg(feature = "agent")]
pub use atlas_agent as agent;

#[cfg(feature = "server")]
pub use atlas_server as server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
