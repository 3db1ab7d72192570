use std::path::Path;
use tracing::{debug, info, warn};

use crate::bridge;
use crate::config::{NetConf, PluginConfig};
use crate::error::{Error, Result};
use crate::ipam::{self, Owner, Reservation, ReservationStore};
use crate::link::{validate_ifname, LinkOps};
use crate::types::{CmdArgs, IPConfig, Interface, Result as CniResult};
use crate::veth::{self, VethPair};

/// Bridge plugin implementation
pub struct BridgePlugin<L: LinkOps> {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    /// Node-wide defaults
    defaults: PluginConfig,
    ops: L,
    store: ReservationStore,
}

fn required<'a>(value: &'a Option<String>, var: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Environment(format!("{var} is required")))
}

/// Turn "the attachment is not what we expect" errors into a CHECK failure.
fn inconsistent(err: Error) -> Error {
    match err {
        Error::InterfaceNotFound(_)
        | Error::NoAddress(_)
        | Error::AmbiguousAddress { .. }
        | Error::DeviceTypeConflict { .. }
        | Error::Namespace(_) => Error::Inconsistent(err.to_string()),
        other => other,
    }
}

impl<L: LinkOps> BridgePlugin<L> {
    /// Create a new bridge plugin
    pub fn new(config: NetConf, args: CmdArgs, defaults: PluginConfig, ops: L) -> Self {
        let store = ReservationStore::new(config.ledger_path(&defaults));
        Self {
            config,
            args,
            defaults,
            ops,
            store,
        }
    }

    pub fn store(&self) -> &ReservationStore {
        &self.store
    }

    /// Allocate an address, wire the container to the bridge, and record the reservation.
    ///
    /// Runs inside one ledger transaction, so nothing is recorded unless every step succeeded.
    pub fn add_network(&self) -> Result<CniResult> {
        let netns_path = required(&self.args.netns, "CNI_NETNS")?;
        let ifname = required(&self.args.ifname, "CNI_IFNAME")?;
        validate_ifname(ifname)?;

        let subnet = &self.config.subnet;
        let gateway = ipam::gateway(subnet)?;
        let bridge_name = self.config.bridge_name(&self.defaults);
        let mtu = self.config.mtu(&self.defaults);
        let owner = Owner::new(&self.args.container_id, ifname);

        let netns = self.ops.open_netns(Path::new(netns_path))?;

        let mut wired: Option<VethPair> = None;
        let outcome = self.store.transaction(|reservations| {
            let address = ipam::allocate(subnet, reservations)?;
            info!(
                "Allocated {} to container {} ({} reserved)",
                address,
                self.args.container_id,
                reservations.len()
            );

            let bridge = bridge::create_or_update(&self.ops, bridge_name, &gateway, mtu)?;
            let pair = veth::setup_veth(&self.ops, &netns, &bridge, ifname, &address, mtu)?;
            wired = Some(pair.clone());

            reservations.insert(Reservation::new(address, Some(owner)));
            Ok(pair)
        });

        let pair = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                // the ledger write failed after the pair was wired
                if wired.is_some() {
                    warn!("Rolling back {} after failed reservation: {}", ifname, e);
                    if let Err(cleanup) = veth::teardown_veth(&self.ops, &netns, ifname) {
                        warn!("Failed to roll back {}: {}", ifname, cleanup);
                    }
                }
                return Err(e);
            }
        };

        let mut result = CniResult::new(
            &self.config.cni_version,
            IPConfig::v4(pair.address.to_string(), gateway.to_string()),
        );
        result.add_interface(Interface {
            name: pair.host_if,
            mac: None,
            sandbox: None,
        });
        let idx = result.add_interface(Interface {
            name: pair.container_if,
            mac: None,
            sandbox: Some(netns_path.to_string()),
        });
        result.ips.interface = Some(idx);

        Ok(result)
    }

    /// Remove the container interface and release its address.
    ///
    /// Succeeds when the namespace or the interface is already gone, and when
    /// called again for the same container.
    pub fn del_network(&self) -> Result<()> {
        let container_id = &self.args.container_id;
        let ifname = self.args.ifname.as_deref().filter(|i| !i.is_empty());
        let netns_path = self.args.netns.as_deref().filter(|n| !n.is_empty());

        let recovered = match (netns_path, ifname) {
            (Some(path), Some(ifname)) => {
                // a stale bind mount still opens but can no longer be entered
                let torn_down = self
                    .ops
                    .open_netns(Path::new(path))
                    .and_then(|netns| veth::teardown_veth(&self.ops, &netns, ifname));
                match torn_down {
                    Ok(addr) => addr,
                    Err(e @ (Error::Namespace(_) | Error::InterfaceNotFound(_))) => {
                        info!("Namespace {} unavailable, releasing by owner: {}", path, e);
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => {
                debug!("No namespace or interface given for {}, releasing by owner", container_id);
                None
            }
        };

        self.store.transaction(|reservations| {
            if let Some(addr) = recovered {
                let ours = reservations
                    .get(addr.ip())
                    .map(|r| r.owner.as_ref().map_or(true, |o| &o.container_id == container_id));
                match ours {
                    Some(true) => {
                        ipam::release(addr.ip(), reservations);
                        info!("Released {} from container {}", addr, container_id);
                    }
                    Some(false) => warn!(
                        "Address {} found on {} is reserved by another container, keeping it",
                        addr, container_id
                    ),
                    None => debug!("Address {} was not reserved", addr),
                }
            }

            let released = match ifname {
                Some(ifname) => reservations.release_owner(&Owner::new(container_id, ifname)),
                None => reservations.release_container(container_id),
            };
            for r in &released {
                info!("Released {} held by {}", r.address, container_id);
            }
            Ok(())
        })
    }

    /// Verify the live attachment still matches the configuration.
    pub fn check_network(&self) -> Result<()> {
        let netns_path = required(&self.args.netns, "CNI_NETNS")?;
        let ifname = required(&self.args.ifname, "CNI_IFNAME")?;

        let subnet = ipam::parse_subnet(&self.config.subnet)?;
        let gateway = ipam::gateway(&self.config.subnet)?;
        let bridge_name = self.config.bridge_name(&self.defaults);

        bridge::verify(&self.ops, bridge_name, &gateway)?;

        let netns = self
            .ops
            .open_netns(Path::new(netns_path))
            .map_err(inconsistent)?;
        let addr = veth::verify_in_netns(&self.ops, &netns, ifname).map_err(inconsistent)?;

        if addr.prefix() != subnet.prefix() || !subnet.contains(addr.ip()) {
            return Err(Error::Inconsistent(format!(
                "{ifname} carries {addr}, outside subnet {subnet}"
            )));
        }
        if addr == gateway {
            return Err(Error::Inconsistent(format!("{ifname} carries the gateway address")));
        }

        let reservations = self.store.snapshot()?;
        let reservation = reservations.get(addr.ip()).ok_or_else(|| {
            Error::Inconsistent(format!("{addr} on {ifname} is not reserved"))
        })?;
        if let Some(owner) = &reservation.owner {
            if owner != &Owner::new(&self.args.container_id, ifname) {
                return Err(Error::Inconsistent(format!(
                    "{addr} is reserved by {owner}, not {}/{ifname}",
                    self.args.container_id
                )));
            }
        }

        debug!("Attachment of {} in {} is consistent", ifname, netns_path);
        Ok(())
    }
}
