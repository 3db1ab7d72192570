//! Network device and namespace operations the plugin depends on.
//!
//! Every operation acts on the network namespace of the calling thread.

pub mod iproute;

#[cfg(test)]
pub(crate) mod fake;

use ipnetwork::Ipv4Network;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

pub use iproute::{IpRoute, NetnsHandle};

/// Longest interface name the kernel accepts.
pub const MAX_IFNAME_LEN: usize = libc::IFNAMSIZ - 1;

/// Reject names the kernel would refuse before touching any device.
pub fn validate_ifname(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(Error::Config(format!(
            "interface name {name:?} must be 1-{MAX_IFNAME_LEN} bytes"
        )));
    }
    if name == "." || name == ".." || name.chars().any(|c| c == '/' || c.is_whitespace()) {
        return Err(Error::Config(format!("invalid interface name {name:?}")));
    }
    Ok(())
}

/// Whether `err` says the device is not there (anymore).
pub fn is_missing_device(err: &Error) -> bool {
    match err {
        Error::InterfaceNotFound(_) => true,
        Error::Command { stderr, .. } => {
            stderr.contains("does not exist") || stderr.contains("Cannot find device")
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Veth,
    Other(String),
}

impl LinkKind {
    pub fn from_info_kind(kind: Option<&str>) -> Self {
        match kind {
            Some("bridge") => LinkKind::Bridge,
            Some("veth") => LinkKind::Veth,
            Some(other) => LinkKind::Other(other.to_string()),
            None => LinkKind::Other("device".to_string()),
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Bridge => f.write_str("bridge"),
            LinkKind::Veth => f.write_str("veth"),
            LinkKind::Other(kind) => f.write_str(kind),
        }
    }
}

/// Snapshot of one network device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub kind: LinkKind,
    pub up: bool,
    pub mtu: u32,
    /// Bridge this device is enslaved to, if any
    pub master: Option<String>,
}

/// Device and namespace primitives.
pub trait LinkOps {
    /// An open network namespace the calling thread can switch into.
    type Netns;

    fn current_netns(&self) -> Result<Self::Netns>;
    fn open_netns(&self, path: &Path) -> Result<Self::Netns>;
    /// Move the calling thread into `ns`.
    fn enter_netns(&self, ns: &Self::Netns) -> Result<()>;

    /// `Ok(None)` when no device is called `name`.
    fn link_by_name(&self, name: &str) -> Result<Option<Link>>;
    fn add_bridge(&self, name: &str, mtu: u32) -> Result<()>;
    fn add_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()>;
    fn delete_link(&self, name: &str) -> Result<()>;
    fn set_link_up(&self, name: &str) -> Result<()>;
    fn set_link_master(&self, name: &str, master: &str) -> Result<()>;
    fn move_link_to_netns(&self, name: &str, ns: &Self::Netns) -> Result<()>;

    /// IPv4 addresses configured on `name`.
    fn addr_list(&self, name: &str) -> Result<Vec<Ipv4Network>>;
    fn addr_add(&self, name: &str, addr: &Ipv4Network) -> Result<()>;
    fn addr_del(&self, name: &str, addr: &Ipv4Network) -> Result<()>;
}
