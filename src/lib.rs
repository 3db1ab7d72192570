//! Minimal bridge CNI plugin
//!
//! This implementation provides a pure Rust bridge CNI plugin that:
//! - Allocates container addresses from a subnet, recorded in a locked on-disk ledger
//! - Creates or reconciles a host bridge carrying the gateway address
//! - Wires each container to the bridge through a veth pair
//! - Releases everything again on container deletion

pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod ipam;
pub mod link;
pub mod netns;
pub mod plugin;
pub mod types;
pub mod veth;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::{NetConf, PluginConfig};
pub use error::{Error, Result};
pub use plugin::BridgePlugin;
