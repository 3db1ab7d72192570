use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipam;
use crate::link::validate_ifname;
use crate::types::SUPPORTED_VERSIONS;

/// Bridge used when the network configuration names none.
pub const DEFAULT_BRIDGE: &str = "mccni0";
pub const DEFAULT_MTU: u32 = 1500;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// File name of the reservation ledger inside a network's data directory.
pub const LEDGER_FILE: &str = "reserved_ips";

const MIN_MTU: u32 = 68;
const MAX_MTU: u32 = 65535;

/// Node-wide settings shared by the plugin and `minicni-ctl`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Path to the CNI bin directory
    pub cni_bin_dir: PathBuf,
    /// Path to the CNI config directory
    pub cni_conf_dir: PathBuf,
    /// Root of the per-network reservation ledgers
    pub data_dir: PathBuf,
    /// Bridge name used when the network config leaves it empty
    pub default_bridge: String,
    /// MTU used when the network config leaves it unset or zero
    pub default_mtu: u32,
    /// Upper bound for each device operation
    pub command_timeout_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            cni_bin_dir: PathBuf::from("/opt/cni/bin"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            data_dir: PathBuf::from("/var/lib/cni/minicni"),
            default_bridge: DEFAULT_BRIDGE.to_string(),
            default_mtu: DEFAULT_MTU,
            command_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl PluginConfig {
    /// Ledger path of network `name` under `data_dir`.
    pub fn ledger_path(data_dir: &Path, name: &str) -> PathBuf {
        data_dir.join(name).join(LEDGER_FILE)
    }
}

/// Network configuration read from stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Bridge to attach containers to; empty means the default bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    /// Interface MTU; zero means the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Subnet CIDR the container addresses come from
    pub subnet: String,
    /// Directory holding reservation ledgers
    #[serde(rename = "dataDir", default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Seconds allowed for each device operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Pod subnets of the other nodes (validated, not used for routing)
    #[serde(rename = "nodeSubnets", default, skip_serializing_if = "Vec::is_empty")]
    pub node_subnets: Vec<String>,
    /// Addresses of the other nodes (validated, not used for routing)
    #[serde(rename = "nodeAddresses", default, skip_serializing_if = "Vec::is_empty")]
    pub node_addresses: Vec<String>,
}

fn validate_network_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(Error::Config(format!("invalid network name {name:?}")));
    }
    Ok(())
}

impl NetConf {
    /// Parse and validate NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| Error::Config(format!("failed to parse network configuration: {e}")))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.cni_version.as_str()) {
            return Err(Error::Config(format!(
                "unsupported cniVersion {:?}",
                self.cni_version
            )));
        }
        validate_network_name(&self.name)?;

        // fails for malformed subnets and ones too small for a gateway and a container
        ipam::gateway(&self.subnet)?;

        if let Some(bridge) = self.bridge.as_deref().filter(|b| !b.is_empty()) {
            validate_ifname(bridge)?;
        }

        if let Some(mtu) = self.mtu.filter(|m| *m != 0) {
            if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
                return Err(Error::Config(format!(
                    "MTU {mtu} out of range {MIN_MTU}-{MAX_MTU}"
                )));
            }
        }

        if self.timeout == Some(0) {
            return Err(Error::Config("timeout must be at least one second".to_string()));
        }

        for subnet in &self.node_subnets {
            ipam::parse_subnet(subnet)?;
        }
        for addr in &self.node_addresses {
            addr.parse::<std::net::Ipv4Addr>()
                .map_err(|e| Error::Config(format!("invalid node address {addr:?}: {e}")))?;
        }

        Ok(())
    }

    /// Configured bridge, or the default when absent or empty.
    pub fn bridge_name<'a>(&'a self, defaults: &'a PluginConfig) -> &'a str {
        match self.bridge.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &defaults.default_bridge,
        }
    }

    pub fn mtu(&self, defaults: &PluginConfig) -> u32 {
        match self.mtu {
            Some(mtu) if mtu != 0 => mtu,
            _ => defaults.default_mtu,
        }
    }

    pub fn timeout(&self, defaults: &PluginConfig) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(defaults.command_timeout_secs))
    }

    pub fn ledger_path(&self, defaults: &PluginConfig) -> PathBuf {
        let data_dir = self.data_dir.as_deref().unwrap_or(&defaults.data_dir);
        PluginConfig::ledger_path(data_dir, &self.name)
    }

    /// Create a default configuration for a subnet
    pub fn new_default(name: &str, subnet: &str, bridge: Option<&str>, mtu: Option<u32>) -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            name: name.to_string(),
            plugin_type: "minicni".to_string(),
            bridge: bridge.map(str::to_string),
            mtu,
            subnet: subnet.to_string(),
            data_dir: None,
            timeout: None,
            node_subnets: Vec::new(),
            node_addresses: Vec::new(),
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write network config to {}", path.display()))?;
        Ok(())
    }
}

/// Installer for the plugin's directories and default network config
pub struct Installer {
    config: PluginConfig,
}

impl Installer {
    /// Create a new installer
    pub fn new(config: PluginConfig) -> Self {
        Self { config }
    }

    /// Create the CNI directories and write a network config for `subnet`.
    ///
    /// Returns the path of the written config.
    pub fn install(&self, name: &str, subnet: &str) -> anyhow::Result<PathBuf> {
        for dir in [
            &self.config.cni_bin_dir,
            &self.config.cni_conf_dir,
            &self.config.data_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let mut conf = NetConf::new_default(name, subnet, Some(&self.config.default_bridge), None);
        conf.data_dir = Some(self.config.data_dir.clone());
        conf.validate()?;

        let config_path = self.config.cni_conf_dir.join(format!("10-{name}.conf"));
        conf.save(&config_path)?;

        Ok(config_path)
    }
}
