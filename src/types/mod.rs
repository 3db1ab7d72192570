use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// CNI version this plugin reports results in
pub const CNI_VERSION: &str = "1.0.0";
/// CNI versions this plugin accepts
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path, absent for DEL after the namespace is gone
    pub netns: Option<String>,
    /// Interface name inside the container
    pub ifname: Option<String>,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// ADD result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// Address handed to the container
    pub ips: IPConfig,
}

/// Interface information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IPConfig {
    /// Address family, always "IPv4"
    pub version: String,
    /// Interface index this IP is assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway with prefix length
    pub gateway: String,
}

impl IPConfig {
    pub fn v4(address: String, gateway: String) -> Self {
        Self {
            version: "IPv4".to_string(),
            interface: None,
            address,
            gateway,
        }
    }
}

impl Result {
    /// Create a result carrying one IPv4 configuration
    pub fn new(cni_version: &str, ips: IPConfig) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
            ips,
        }
    }

    /// Add an interface to the result, returning its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}

/// VERSION result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: CNI_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl VersionInfo {
    pub fn print(&self) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(self)?);
        Ok(())
    }
}

/// Error payload reported on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

impl ErrorResult {
    /// Build the payload for `err`, using the plugin's error code when it is one of ours.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let code = err
            .downcast_ref::<crate::Error>()
            .map_or(999, crate::Error::code);
        Self {
            cni_version: CNI_VERSION.to_string(),
            code,
            msg: err.to_string(),
            details: err.chain().skip(1).map(|c| c.to_string()).collect::<Vec<_>>().join(": "),
        }
    }
}
