//! Node-local bridge reconciliation.
//!
//! Concurrent ADDs for different containers all try to (re)create the same
//! bridge, so [`create_or_update`] converges on one state no matter how often
//! it runs: a bridge device, up, carrying exactly the gateway address.

use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::link::{LinkKind, LinkOps};

/// The shared bridge as configured for this network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    pub name: String,
    pub gateway: Ipv4Network,
    pub mtu: u32,
}

/// Ensure bridge `name` exists, is up, and carries only `gateway`.
pub fn create_or_update<L: LinkOps>(
    ops: &L,
    name: &str,
    gateway: &Ipv4Network,
    mtu: u32,
) -> Result<Bridge> {
    let bridge = Bridge {
        name: name.to_string(),
        gateway: *gateway,
        mtu,
    };

    let Some(link) = ops.link_by_name(name)? else {
        info!("Creating bridge {} with gateway {}", name, gateway);
        ops.add_bridge(name, mtu)?;
        ops.addr_add(name, gateway)?;
        ops.set_link_up(name)?;
        return Ok(bridge);
    };

    if link.kind != LinkKind::Bridge {
        return Err(Error::DeviceTypeConflict {
            name: name.to_string(),
            kind: link.kind.to_string(),
            expected: LinkKind::Bridge.to_string(),
        });
    }
    if link.mtu != 0 && link.mtu != mtu {
        debug!("Bridge {} keeps existing MTU {} (requested {})", name, link.mtu, mtu);
    }

    let addrs = ops.addr_list(name)?;
    match addrs.as_slice() {
        [] => {
            info!("Assigning gateway {} to existing bridge {}", gateway, name);
            ops.addr_add(name, gateway)?;
        }
        [current] if current == gateway => {
            debug!("Bridge {} already carries gateway {}", name, gateway);
        }
        [current] => {
            warn!("Replacing address {} on bridge {} with {}", current, name, gateway);
            ops.addr_del(name, current)?;
            ops.addr_add(name, gateway)?;
        }
        _ => {
            return Err(Error::AmbiguousBridgeState {
                name: name.to_string(),
                count: addrs.len(),
            })
        }
    }

    if !link.up {
        ops.set_link_up(name)?;
    }

    Ok(bridge)
}

/// Verify a bridge is in the state [`create_or_update`] leaves it in, without changing it.
pub fn verify<L: LinkOps>(ops: &L, name: &str, gateway: &Ipv4Network) -> Result<()> {
    let link = ops
        .link_by_name(name)?
        .ok_or_else(|| Error::Inconsistent(format!("bridge {name} does not exist")))?;

    if link.kind != LinkKind::Bridge {
        return Err(Error::Inconsistent(format!(
            "{name} is a {} device, not a bridge",
            link.kind
        )));
    }
    if !link.up {
        return Err(Error::Inconsistent(format!("bridge {name} is down")));
    }

    let addrs = ops.addr_list(name)?;
    if addrs.as_slice() != [*gateway] {
        return Err(Error::Inconsistent(format!(
            "bridge {name} carries {addrs:?}, expected only {gateway}"
        )));
    }
    Ok(())
}
