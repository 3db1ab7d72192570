//! Veth wiring between a container namespace and the host bridge.

use ipnetwork::Ipv4Network;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::link::{is_missing_device, LinkKind, LinkOps};
use crate::netns::{with_netns, NetnsGuard};

/// Prefix of generated host-side interface names.
pub const HOST_VETH_PREFIX: &str = "veth";

const NAME_ATTEMPTS: usize = 8;

/// Both ends of a wired veth pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub container_if: String,
    pub host_if: String,
    pub address: Ipv4Network,
}

/// `veth` followed by 8 random hex digits.
pub fn random_peer_name() -> Result<String> {
    let mut suffix = [0u8; 4];
    SystemRandom::new()
        .fill(&mut suffix)
        .map_err(|_| Error::Namespace("failed to generate random veth name".to_string()))?;
    let hex: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("{HOST_VETH_PREFIX}{hex}"))
}

/// Pick a random host-side name not used by any device in the current namespace.
fn unique_peer_name<L: LinkOps>(ops: &L) -> Result<String> {
    for _ in 0..NAME_ATTEMPTS {
        let name = random_peer_name()?;
        if ops.link_by_name(&name)?.is_none() {
            return Ok(name);
        }
        debug!("Generated veth name {} is taken, retrying", name);
    }
    Err(Error::Namespace(format!(
        "could not find a free host veth name after {NAME_ATTEMPTS} attempts"
    )))
}

fn remove_quietly<L: LinkOps>(ops: &L, name: &str) {
    match ops.delete_link(name) {
        Ok(()) => info!("Rolled back interface {}", name),
        Err(e) => warn!("Failed to roll back interface {}: {}", name, e),
    }
}

fn configure_container_end<L: LinkOps>(
    ops: &L,
    if_name: &str,
    peer: &str,
    address: &Ipv4Network,
    host_ns: &L::Netns,
) -> Result<()> {
    ops.addr_add(if_name, address)?;
    ops.set_link_up(if_name)?;
    ops.move_link_to_netns(peer, host_ns)
}

fn attach_host_end<L: LinkOps>(ops: &L, peer: &str, bridge: &Bridge) -> Result<()> {
    if ops.link_by_name(peer)?.is_none() {
        return Err(Error::InterfaceNotFound(peer.to_string()));
    }
    ops.set_link_up(peer)?;
    ops.set_link_master(peer, &bridge.name)
}

/// Create a veth pair inside `netns`, give the container end `address`, and
/// plug the host end into `bridge`.
///
/// Must be called from the host namespace. The caller's namespace is restored
/// on every path, and interfaces created here are removed again if a later
/// step fails.
pub fn setup_veth<L: LinkOps>(
    ops: &L,
    netns: &L::Netns,
    bridge: &Bridge,
    if_name: &str,
    address: &Ipv4Network,
    mtu: u32,
) -> Result<VethPair> {
    let peer = unique_peer_name(ops)?;

    let guard = NetnsGuard::enter(ops, netns)?;
    info!("Creating veth pair {} <-> {} in container namespace", if_name, peer);
    ops.add_veth(if_name, &peer, mtu)?;

    if let Err(e) = configure_container_end(ops, if_name, &peer, address, guard.original()) {
        // both ends are still in the container namespace unless the move itself succeeded
        remove_quietly(ops, if_name);
        return Err(e);
    }
    guard.leave()?;

    if let Err(e) = attach_host_end(ops, &peer, bridge) {
        remove_quietly(ops, &peer);
        return Err(e);
    }
    info!(
        "Attached {} to bridge {}, container end {} has {}",
        peer, bridge.name, if_name, address
    );

    Ok(VethPair {
        container_if: if_name.to_string(),
        host_if: peer,
        address: *address,
    })
}

/// The single IPv4 address of veth `if_name` in the current namespace.
fn veth_address<L: LinkOps>(ops: &L, if_name: &str) -> Result<Ipv4Network> {
    let link = ops
        .link_by_name(if_name)?
        .ok_or_else(|| Error::InterfaceNotFound(if_name.to_string()))?;
    if link.kind != LinkKind::Veth {
        return Err(Error::DeviceTypeConflict {
            name: if_name.to_string(),
            kind: link.kind.to_string(),
            expected: LinkKind::Veth.to_string(),
        });
    }

    let addrs = ops.addr_list(if_name)?;
    match addrs.as_slice() {
        [] => Err(Error::NoAddress(if_name.to_string())),
        [addr] => Ok(*addr),
        _ => Err(Error::AmbiguousAddress {
            name: if_name.to_string(),
            count: addrs.len(),
        }),
    }
}

/// Read the address assigned to `if_name` inside `netns`.
pub fn address_in_netns<L: LinkOps>(
    ops: &L,
    netns: &L::Netns,
    if_name: &str,
) -> Result<Ipv4Network> {
    with_netns(ops, netns, |_| veth_address(ops, if_name))
}

/// Like [`address_in_netns`], but also requires the interface to be up.
pub fn verify_in_netns<L: LinkOps>(
    ops: &L,
    netns: &L::Netns,
    if_name: &str,
) -> Result<Ipv4Network> {
    with_netns(ops, netns, |_| {
        let addr = veth_address(ops, if_name)?;
        match ops.link_by_name(if_name)? {
            Some(link) if link.up => Ok(addr),
            _ => Err(Error::Inconsistent(format!("interface {if_name} is down"))),
        }
    })
}

/// Remove the container end of the pair (the kernel drops the host end with it)
/// and return the address it carried, if readable.
///
/// A missing interface is not an error. A device with that name that is not a
/// veth belongs to someone else and is left alone.
pub fn teardown_veth<L: LinkOps>(
    ops: &L,
    netns: &L::Netns,
    if_name: &str,
) -> Result<Option<Ipv4Network>> {
    with_netns(ops, netns, |_| {
        let address = match veth_address(ops, if_name) {
            Ok(addr) => Some(addr),
            Err(Error::InterfaceNotFound(_)) => {
                debug!("Interface {} already gone", if_name);
                return Ok(None);
            }
            Err(e @ Error::DeviceTypeConflict { .. }) => {
                warn!("Leaving {} in place: {}", if_name, e);
                return Ok(None);
            }
            Err(e @ (Error::NoAddress(_) | Error::AmbiguousAddress { .. })) => {
                warn!("Could not recover address of {}: {}", if_name, e);
                None
            }
            Err(e) => return Err(e),
        };
        match ops.delete_link(if_name) {
            Ok(()) => info!("Deleted interface {} from container namespace", if_name),
            Err(e) if is_missing_device(&e) => {
                debug!("Interface {} vanished before it was deleted", if_name)
            }
            Err(e) => return Err(e),
        }
        Ok(address)
    })
}
